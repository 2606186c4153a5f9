//! Cryptographic audit chain (spec §4.G "Audit chain").
//!
//! Each event hashes the previous event (SHA-256) into a tamper-evident
//! chain and is signed with the node's Ed25519 key. `workflow_id`/
//! `instruction_id` are plain strings rather than a protobuf-generated type,
//! since the interpreter here runs against `llmir_core::IrInstruction`.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: String,
    pub node_id: String,
    pub workflow_id: String,
    pub workflow_version: Option<u32>,
    pub instruction_id: Option<String>,
    pub event_type: String,
    pub input_hash: String,
    pub output_hash: String,
    pub duration_ms: u64,
    pub details: Option<serde_json::Value>,
    pub previous_event_hash: String,
    pub self_hash: String,
    pub signature: String,
    pub public_key_hex: String,
}

pub struct AuditChain {
    node_id: String,
    chain: VecDeque<AuditEvent>,
    signing_key: SigningKey,
    verifying_key_hex: String,
}

impl AuditChain {
    /// `signing_key` is generated ephemerally by the caller (config layer) when
    /// no persistent key material is configured; this type just signs with it.
    pub fn new(node_id: String, signing_key: Option<SigningKey>) -> Self {
        let signing_key = signing_key.unwrap_or_else(|| {
            warn!("[AuditChain] no signing key configured — using ephemeral key pair");
            SigningKey::generate(&mut OsRng)
        });
        let verifying_key_hex = hex::encode(signing_key.verifying_key().as_bytes());
        Self { node_id, chain: VecDeque::new(), signing_key, verifying_key_hex }
    }

    pub fn append(
        &mut self,
        workflow_id: impl Into<String>,
        workflow_version: Option<u32>,
        instruction_id: Option<impl Into<String>>,
        event_type: impl Into<String>,
        input: Option<&serde_json::Value>,
        output: Option<&serde_json::Value>,
        duration_ms: u64,
        details: Option<serde_json::Value>,
    ) -> AuditEvent {
        let previous_event_hash = self.chain.back().map(Self::sha256_of).unwrap_or_else(|| "0".repeat(64));

        let event_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let workflow_id = workflow_id.into();
        let instruction_id = instruction_id.map(Into::into);
        let event_type = event_type.into();

        let input_hash = Self::sha256_json(input);
        let output_hash = Self::sha256_json(output);

        let body = serde_json::json!({
            "eventId": event_id,
            "timestamp": timestamp,
            "nodeId": self.node_id,
            "workflowId": workflow_id,
            "workflowVersion": workflow_version,
            "instructionId": instruction_id,
            "eventType": event_type,
            "inputHash": input_hash,
            "outputHash": output_hash,
            "durationMs": duration_ms,
            "details": details,
            "previousEventHash": previous_event_hash,
        });

        let self_hash = Self::sha256_str(&body.to_string());
        let signature = self.sign(&self_hash);

        let event = AuditEvent {
            event_id,
            timestamp,
            node_id: self.node_id.clone(),
            workflow_id,
            workflow_version,
            instruction_id,
            event_type,
            input_hash,
            output_hash,
            duration_ms,
            details,
            previous_event_hash,
            self_hash,
            signature,
            public_key_hex: self.verifying_key_hex.clone(),
        };

        debug!(
            "[AuditChain] {} on {} -> #{} hash:{}...",
            event.event_type,
            event.workflow_id,
            self.chain.len() + 1,
            &event.self_hash[..12]
        );

        self.chain.push_back(event.clone());
        event
    }

    pub fn drain(&mut self) -> Vec<AuditEvent> {
        self.chain.drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.chain.iter().cloned().collect()
    }

    /// Replay the chain's self-hash and linkage checks, returning the number
    /// of verified events or the index of the first break.
    pub fn verify(&self) -> Result<usize> {
        for (i, ev) in self.chain.iter().enumerate() {
            let body = serde_json::json!({
                "eventId": ev.event_id,
                "timestamp": ev.timestamp,
                "nodeId": ev.node_id,
                "workflowId": ev.workflow_id,
                "workflowVersion": ev.workflow_version,
                "instructionId": ev.instruction_id,
                "eventType": ev.event_type,
                "inputHash": ev.input_hash,
                "outputHash": ev.output_hash,
                "durationMs": ev.duration_ms,
                "details": ev.details,
                "previousEventHash": ev.previous_event_hash,
            });
            let expected = Self::sha256_str(&body.to_string());
            if expected != ev.self_hash {
                return Err(anyhow!("event #{i} self_hash mismatch (tampering detected)"));
            }
            if i > 0 {
                let prev = &self.chain[i - 1];
                if ev.previous_event_hash != Self::sha256_of(prev) {
                    return Err(anyhow!("event #{i} previous_event_hash broken (insertion/deletion detected)"));
                }
            }
        }
        Ok(self.chain.len())
    }

    fn sha256_str(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn sha256_json(value: Option<&serde_json::Value>) -> String {
        let s = serde_json::to_string(value.unwrap_or(&serde_json::Value::Null)).unwrap_or_else(|_| "null".to_owned());
        Self::sha256_str(&s)
    }

    fn sha256_of(event: &AuditEvent) -> String {
        Self::sha256_str(&serde_json::to_string(event).unwrap_or_default())
    }

    fn sign(&self, data: &str) -> String {
        let sig: Signature = self.signing_key.sign(data.as_bytes());
        hex::encode(sig.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_and_verifies() {
        let mut chain = AuditChain::new("node-1".into(), None);
        chain.append("wf-1", Some(1), Some("i0"), "CALL_SERVICE", None, None, 10, None);
        chain.append("wf-1", Some(1), Some("i1"), "CALL_SERVICE", None, None, 20, None);
        assert_eq!(chain.verify().unwrap(), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let mut chain = AuditChain::new("node-1".into(), None);
        chain.append("wf-1", Some(1), Some("i0"), "CALL_SERVICE", None, None, 10, None);
        chain.chain[0].output_hash = "tampered".into();
        assert!(chain.verify().is_err());
    }
}
