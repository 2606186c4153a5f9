//! Stage E (spec "Stage 6") — deterministic encoding and Ed25519 sealing.
//!
//! Uses `llmir_core::wire` for the magic/version/length/signature framing
//! and `llmir_core::encoding` for the byte-stable payload.

use ed25519_dalek::{SigningKey, VerifyingKey};
use llmir_core::{encoding, wire, Artifact};

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("wire error: {0}")]
    Wire(#[from] wire::WireError),
}

/// The IR format major version this compiler emits (spec §6 "IR version compatibility").
pub const FORMAT_VERSION: u8 = 1;

/// Deterministically encode and sign `artifact`, returning the on-wire bytes.
pub fn seal(artifact: &Artifact, signing_key: &SigningKey) -> Result<Vec<u8>, SealError> {
    let payload = encoding::to_canonical_bytes(artifact)?;
    Ok(wire::seal(&payload, FORMAT_VERSION, signing_key))
}

/// Verify and deserialize a sealed artifact buffer. Deserialization never
/// happens before verification succeeds (spec §4.E invariant).
pub fn open(buf: &[u8], verifying_key: &VerifyingKey, accepted_major: u8) -> Result<Artifact, SealError> {
    let parsed = wire::verify(buf, verifying_key)?;
    wire::check_ir_version(parsed.format_version, accepted_major)?;
    let artifact: Artifact = serde_json::from_slice(&parsed.payload)?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmir_core::{ArtifactMetadata, Opcode};
    use rand::rngs::OsRng;
    use std::collections::BTreeMap;

    fn sample_artifact() -> Artifact {
        let mut instructions = BTreeMap::new();
        let mut ret = llmir_core::IrInstruction::new(0, Opcode::Return);
        ret.src = vec![0];
        instructions.insert(0, ret);
        Artifact {
            instructions,
            instruction_order: vec![0],
            dependency_graph: BTreeMap::new(),
            resource_table: BTreeMap::new(),
            parallel_groups: Vec::new(),
            schemas: BTreeMap::new(),
            input_registers: Vec::new(),
            output_register: 0,
            distribution_plan: None,
            metadata: ArtifactMetadata {
                compiled_at: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc),
                compiler_version: "0.1.0".into(),
                workflow_id: "wf-seal".into(),
                workflow_version: 1,
                source: "test".into(),
            },
        }
    }

    #[test]
    fn seal_then_open_round_trips() {
        let key = SigningKey::generate(&mut OsRng);
        let artifact = sample_artifact();
        let sealed = seal(&artifact, &key).unwrap();
        let opened = open(&sealed, &key.verifying_key(), FORMAT_VERSION).unwrap();
        assert_eq!(opened.metadata.workflow_id, "wf-seal");
    }

    #[test]
    fn tampered_artifact_fails_to_open() {
        let key = SigningKey::generate(&mut OsRng);
        let artifact = sample_artifact();
        let mut sealed = seal(&artifact, &key).unwrap();
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xFF;
        assert!(open(&sealed, &key.verifying_key(), FORMAT_VERSION).is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = SigningKey::generate(&mut OsRng);
        let other_key = SigningKey::generate(&mut OsRng);
        let artifact = sample_artifact();
        let sealed = seal(&artifact, &key).unwrap();
        assert!(open(&sealed, &other_key.verifying_key(), FORMAT_VERSION).is_err());
    }
}
