//! WebSocket node client — spec §6 "External Interfaces" (dispatcher link).
//!
//! Manages the persistent connection between this node and the distribution
//! planner's dispatcher, JSON-framed over WebSocket:
//!
//!   Dispatcher → Node:
//!     { "type": "IR_DISTRIBUTION", "payload": { "artifact": <base64> } }
//!     { "type": "PING" }
//!     { "type": "CONFIG_UPDATE", "payload": {...} }
//!
//!   Node → Dispatcher:
//!     { "type": "REGISTER", "payload": { nodeId, tier, capabilities } }
//!     { "type": "RESULT", "payload": <execution summary> }
//!     { "type": "PONG" }
//!     { "type": "AUDIT_FLUSH", "payload": [BufferedEvent, ...] }
//!
//! Binary frames carry the sealed artifact's raw bytes directly (no base64
//! overhead); the response is still sent back as a JSON "RESULT" text frame.
//!
//! The wire format is `llmir_core::wire`'s signed-JSON envelope, and IR
//! execution goes through `llmir_svm::DistributedExecutor`.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use llmir_core::{wire, Artifact};
use llmir_svm::collab::{
    BufferingAuditSink, HttpNodeDispatcher, HttpRemoteSliceDispatcher, InMemoryApprovalGate, InMemoryCancellationBus, NodeRegistry,
};
use llmir_svm::{AuditChain, Config, DistributedExecutor, HealthState, Interpreter, OfflineBuffer, VaultClient};

pub struct NodeClient {
    config: Config,
    executor: DistributedExecutor,
    audit_sink: Arc<BufferingAuditSink>,
    health: Arc<HealthState>,
    // Kept only to hold the node's signing key material alive; each
    // instruction-level audit event mints its own scratch chain (see
    // `Interpreter::event` in llmir-svm), so this chain never itself appends.
    _audit: AuditChain,
}

impl NodeClient {
    pub fn new(config: Config, audit: AuditChain, offline: OfflineBuffer, health: Arc<HealthState>) -> Self {
        let http = reqwest::Client::new();
        let audit_sink = Arc::new(BufferingAuditSink::new(offline));

        let vault = VaultClient::new(http.clone(), config.vault_addr.clone(), config.vault_token.clone(), config.vault_namespace.clone());
        let secrets = Arc::new(std::sync::Mutex::new(vault));
        let dispatcher = Arc::new(HttpNodeDispatcher::new(http.clone(), config.dispatcher_http_url.clone(), config.node_id.clone()));
        let cancellation = Arc::new(InMemoryCancellationBus::default());
        let approvals = Arc::new(InMemoryApprovalGate::default());

        let interp = Interpreter::new(
            http.clone(),
            config.dispatcher_http_url.clone(),
            config.node_id.clone(),
            secrets,
            audit_sink.clone() as Arc<dyn llmir_svm::collab::AuditSink>,
            dispatcher,
            cancellation,
            approvals,
        );

        // This node only ever dispatches further when it is itself the
        // distribution plan's CENTRAL node; node_urls is populated lazily
        // from manifests the registry already knows about a peer's address
        // under (a simplification noted in DESIGN.md — a production fleet
        // resolves node URLs from the dispatcher's own directory, not the
        // service registry).
        let remote_dispatcher = Arc::new(HttpRemoteSliceDispatcher::new(http, Default::default()));
        let node_registry: Arc<dyn NodeRegistry> = Arc::new(llmir_registry::ServiceRegistry::new());

        let executor = DistributedExecutor::new(interp, remote_dispatcher, node_registry);

        Self { config, executor, audit_sink, health, _audit: audit }
    }

    /// Connect → register → read messages; on disconnect, persist the
    /// offline buffer and retry after `reconnect_interval_secs` forever.
    /// Any events persisted from a previous crash are already loaded by the
    /// caller (`main.rs`) before the buffer is handed to this client.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            info!("[Node] connecting to {}", self.config.dispatcher_ws_url);

            match self.connect_and_run().await {
                Ok(()) => info!("[Node] connection closed gracefully"),
                Err(e) => error!("[Node] connection error: {e}"),
            }

            self.health.set_link_connected(false);
            {
                let mut buf = self.audit_sink.buffer().lock().expect("offline buffer mutex poisoned");
                buf.notify_connected(false);
                self.health.set_offline_depth(buf.len());
                if let Err(e) = buf.persist().await {
                    warn!("[Node] failed to persist offline buffer: {e}");
                }
            }

            let wait = Duration::from_secs(self.config.reconnect_interval_secs);
            info!("[Node] reconnecting in {wait:?}");
            sleep(wait).await;
        }
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        let (ws_stream, _resp) = connect_async(&self.config.dispatcher_ws_url).await.map_err(|e| anyhow!("WebSocket handshake failed: {e}"))?;
        let (mut write, mut read) = ws_stream.split();

        {
            let mut buf = self.audit_sink.buffer().lock().expect("offline buffer mutex poisoned");
            buf.notify_connected(true);
        }
        self.health.set_link_connected(true);

        let reg = json!({
            "type": "REGISTER",
            "payload": {
                "nodeId": self.config.node_id,
                "tier": format!("{:?}", self.config.node_tier).to_uppercase(),
                "capabilities": self.build_capabilities(),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        write.send(Message::Text(reg.to_string())).await?;
        info!("[Node] registered as {} (tier={:?})", self.config.node_id, self.config.node_tier);

        self.flush_offline_events(&mut write).await;

        while let Some(msg) = read.next().await {
            let msg = msg?;
            match msg {
                Message::Text(text) => {
                    if let Err(e) = self.handle_text_message(&text, &mut write).await {
                        warn!("[Node] message handler error: {e}");
                    }
                }
                Message::Binary(data) => {
                    if let Err(e) = self.handle_binary_message(&data, &mut write).await {
                        warn!("[Node] binary message handler error: {e}");
                    }
                }
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => {
                    info!("[Node] dispatcher closed connection");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn handle_text_message(
        &mut self,
        text: &str,
        write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<()> {
        let frame: Value = serde_json::from_str(text)?;
        let msg_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
        debug!("[Node] <- {msg_type}");

        match msg_type {
            "IR_DISTRIBUTION" => {
                let b64 = frame
                    .get("payload")
                    .and_then(|p| p.get("artifact"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("IR_DISTRIBUTION missing payload.artifact"))?;
                let sealed = B64.decode(b64).map_err(|e| anyhow!("base64 decode error: {e}"))?;
                let result = self.execute_sealed_artifact(&sealed).await;
                let result_frame = json!({ "type": "RESULT", "payload": result_to_json(result) });
                write.send(Message::Text(result_frame.to_string())).await?;
            }
            "PING" => write.send(Message::Text(json!({"type": "PONG"}).to_string())).await?,
            "CONFIG_UPDATE" => info!("[Node] CONFIG_UPDATE received (live reconfiguration not applied)"),
            other => debug!("[Node] unrecognised message type: {other}"),
        }
        Ok(())
    }

    async fn handle_binary_message(
        &mut self,
        data: &[u8],
        write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<()> {
        let result = self.execute_sealed_artifact(data).await;
        let result_frame = json!({ "type": "RESULT", "payload": result_to_json(result) });
        write.send(Message::Text(result_frame.to_string())).await?;
        Ok(())
    }

    /// Verify, decode, and run a sealed artifact end to end (spec §4.E
    /// "Deserialisation requires prior successful verification", §4.G
    /// "Entry" IR-version gate).
    async fn execute_sealed_artifact(&mut self, sealed: &[u8]) -> Result<Value> {
        let signed = match self.config.artifact_verifying_key() {
            Some(verifying_key) => wire::verify(sealed, &verifying_key).map_err(|e| anyhow!("signature verification failed: {e}"))?,
            None => {
                warn!("[Node] SVM_ARTIFACT_VERIFYING_KEY_HEX unset — accepting an unverified artifact (dev mode only)");
                let format_version = sealed.get(4).copied().unwrap_or(self.config.ir_version_major);
                wire::SignedArtifact { format_version, payload: sealed_payload_only(sealed), signature: [0u8; wire::SIG_LEN] }
            }
        };

        match wire::check_ir_version(signed.format_version, self.config.ir_version_major) {
            Ok(_warn_minor) => {}
            Err(e) => {
                error!("[Node] IR format version refused: {e}");
                let alert_url = format!("{}/api/nodes/security-alert", self.config.dispatcher_http_url);
                let _ = reqwest::Client::new()
                    .post(&alert_url)
                    .json(&json!({
                        "type": "IR_VERSION_INCOMPATIBLE",
                        "nodeId": self.config.node_id,
                        "error": e.to_string(),
                    }))
                    .send()
                    .await;
                return Err(anyhow!(e));
            }
        }

        let artifact: Artifact = serde_json::from_slice(&signed.payload)?;
        let workflow_id = artifact.metadata.workflow_id.clone();
        let start = std::time::Instant::now();

        match self.executor.execute(&artifact).await {
            Ok((regs, elapsed_ms)) => {
                self.health.record_execution(elapsed_ms, true);
                let output: serde_json::Map<String, Value> = regs.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
                Ok(json!({ "workflowId": workflow_id, "status": "SUCCESS", "outputRegisters": output, "durationMs": elapsed_ms }))
            }
            Err(e) => {
                self.health.record_execution(start.elapsed().as_millis() as u64, false);
                error!("[Node] execution of workflow={workflow_id} failed: {e}");
                let mut buf = self.audit_sink.buffer().lock().expect("offline buffer mutex poisoned");
                self.health.set_offline_depth(buf.len());
                if buf.is_buffering() {
                    buf.enqueue_execution_result(json!({"workflowId": workflow_id, "status": "FAILED", "error": e.to_string()}));
                }
                Err(e)
            }
        }
    }

    async fn flush_offline_events(&mut self, write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin)) {
        let events = {
            let mut buf = self.audit_sink.buffer().lock().expect("offline buffer mutex poisoned");
            if buf.is_empty() {
                return;
            }
            info!("[Node] flushing {} offline event(s)", buf.len());
            buf.drain_for_flush()
        };

        let frame = json!({ "type": "AUDIT_FLUSH", "payload": events });
        match write.send(Message::Text(frame.to_string())).await {
            Ok(()) => {
                info!("[Node] offline flush sent");
                let buf = self.audit_sink.buffer().lock().expect("offline buffer mutex poisoned");
                if let Err(e) = buf.clear_disk().await {
                    warn!("[Node] failed to clear offline disk: {e}");
                }
            }
            Err(e) => {
                warn!("[Node] offline flush send failed: {e} — re-enqueuing");
                let mut buf = self.audit_sink.buffer().lock().expect("offline buffer mutex poisoned");
                for ev in events {
                    match ev {
                        llmir_svm::BufferedEvent::AuditEvent { payload, .. } => buf.enqueue_audit_event(payload),
                        llmir_svm::BufferedEvent::ExecutionResult { payload, .. } => buf.enqueue_execution_result(payload),
                        llmir_svm::BufferedEvent::TriggerFire { payload, .. } => buf.enqueue_trigger_fire(payload),
                    }
                }
            }
        }
    }

    fn build_capabilities(&self) -> Value {
        json!({
            "opcodes": [
                "LOAD_RESOURCE", "STORE_MEMORY", "VALIDATE", "BRANCH", "LOOP", "JUMP",
                "CALL_SERVICE", "CALL_ACTION", "CALL_TOOL", "TRANSFORM", "AGGREGATE", "FILTER",
                "PARALLEL_SPAWN", "PARALLEL_MERGE", "LLM_CALL", "TRIGGER", "RETURN",
            ],
            "serviceFormats": ["HTTP", "CONNECTOR", "TOOL_PROTOCOL", "LLM_CALL"],
            "aarch64": cfg!(target_arch = "aarch64"),
            "x86_64": cfg!(target_arch = "x86_64"),
        })
    }
}

fn result_to_json(result: Result<Value>) -> Value {
    match result {
        Ok(v) => v,
        Err(e) => json!({ "status": "FAILED", "error": e.to_string() }),
    }
}

fn sealed_payload_only(sealed: &[u8]) -> Vec<u8> {
    const HEADER_LEN: usize = 4 + 1 + 4;
    if sealed.len() < HEADER_LEN {
        return Vec::new();
    }
    let payload_len = u32::from_be_bytes([sealed[5], sealed[6], sealed[7], sealed[8]]) as usize;
    sealed.get(HEADER_LEN..HEADER_LEN + payload_len).map(<[u8]>::to_vec).unwrap_or_default()
}
