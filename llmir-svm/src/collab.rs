//! Collaborator traits the interpreter depends on (spec §4.G "Interpreter
//! collaborators"). Each trait has one concrete implementation backed by an
//! existing type in this crate, plus an in-memory test double used by
//! `interp.rs`'s unit tests.
//!
//! Named deliberately apart from the concrete structs they wrap
//! (`SecretResolver` vs. `vault::VaultClient`, `AuditSink` vs.
//! `audit::AuditChain`) so the interpreter can be exercised against a test
//! double without colliding on a type name.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use llmir_core::ServiceManifest;

use crate::audit::AuditEvent;
use crate::vault::{SecretValue, VaultClient};

/// Resolves a vault path to a secret value. Implemented by `VaultClient`;
/// tests substitute a fixed in-memory map.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn fetch_secret(&self, path: &str) -> Result<SecretValue>;
}

#[async_trait]
impl SecretResolver for Mutex<VaultClient> {
    async fn fetch_secret(&self, path: &str) -> Result<SecretValue> {
        let mut guard = self.lock().expect("vault client mutex poisoned");
        guard.fetch_secret(path).await
    }
}

pub struct InMemorySecretResolver {
    secrets: std::collections::HashMap<String, String>,
}

impl InMemorySecretResolver {
    pub fn new(secrets: std::collections::HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretResolver for InMemorySecretResolver {
    async fn fetch_secret(&self, path: &str) -> Result<SecretValue> {
        self.secrets
            .get(path)
            .cloned()
            .map(|value| SecretValue { value, source: crate::vault::SecretSource::EnvVar })
            .ok_or_else(|| anyhow::anyhow!("no secret configured for \"{path}\""))
    }
}

/// Records audit events somewhere durable. Implemented by a sink that
/// appends to the audit chain and buffers offline when the chain cannot be
/// flushed upstream; tests substitute an in-memory collector.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

pub struct BufferingAuditSink {
    buffer: Mutex<crate::offline::OfflineBuffer>,
}

impl BufferingAuditSink {
    pub fn new(buffer: crate::offline::OfflineBuffer) -> Self {
        Self { buffer: Mutex::new(buffer) }
    }

    /// Direct access to the backing buffer, used by the node client to flush
    /// and persist it around reconnects (the sink itself only ever enqueues).
    pub fn buffer(&self) -> &Mutex<crate::offline::OfflineBuffer> {
        &self.buffer
    }
}

#[async_trait]
impl AuditSink for BufferingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.buffer.lock().expect("offline buffer mutex poisoned").enqueue_audit_event(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn recorded(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().expect("mutex poisoned").push(event);
        Ok(())
    }
}

/// Reports execution outcomes and recompile requests upstream. Implemented
/// by an HTTP client against the dispatcher; tests substitute an in-memory
/// recorder.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn report_execution_result(&self, workflow_id: &str, result: &Value) -> Result<()>;
    async fn request_recompile(&self, workflow_id: &str, reason: &str) -> Result<()>;
}

pub struct HttpNodeDispatcher {
    http: reqwest::Client,
    dispatcher_http_url: String,
    node_id: String,
}

impl HttpNodeDispatcher {
    pub fn new(http: reqwest::Client, dispatcher_http_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self { http, dispatcher_http_url: dispatcher_http_url.into(), node_id: node_id.into() }
    }
}

#[async_trait]
impl NodeDispatcher for HttpNodeDispatcher {
    async fn report_execution_result(&self, workflow_id: &str, result: &Value) -> Result<()> {
        let url = format!("{}/api/nodes/execution-result", self.dispatcher_http_url);
        self.http
            .post(&url)
            .json(&serde_json::json!({"workflowId": workflow_id, "nodeId": self.node_id, "result": result}))
            .send()
            .await?;
        Ok(())
    }

    async fn request_recompile(&self, workflow_id: &str, reason: &str) -> Result<()> {
        let url = format!("{}/api/nodes/recompile-request", self.dispatcher_http_url);
        self.http
            .post(&url)
            .json(&serde_json::json!({"workflowId": workflow_id, "nodeId": self.node_id, "reason": reason}))
            .send()
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryNodeDispatcher {
    pub results: Mutex<Vec<(String, Value)>>,
    pub recompile_requests: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl NodeDispatcher for InMemoryNodeDispatcher {
    async fn report_execution_result(&self, workflow_id: &str, result: &Value) -> Result<()> {
        self.results.lock().expect("mutex poisoned").push((workflow_id.to_owned(), result.clone()));
        Ok(())
    }

    async fn request_recompile(&self, workflow_id: &str, reason: &str) -> Result<()> {
        self.recompile_requests.lock().expect("mutex poisoned").push((workflow_id.to_owned(), reason.to_owned()));
        Ok(())
    }
}

/// Tracks workflow cancellation requests so a running physical action with a
/// cancellation window can abort before an irreversible effect fires
/// (spec §4.D "REV-001").
pub trait CancellationBus: Send + Sync {
    fn cancel(&self, workflow_id: &str);
    fn is_cancelled(&self, workflow_id: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryCancellationBus {
    cancelled: Mutex<HashSet<String>>,
}

impl CancellationBus for InMemoryCancellationBus {
    fn cancel(&self, workflow_id: &str) {
        self.cancelled.lock().expect("mutex poisoned").insert(workflow_id.to_owned());
    }

    fn is_cancelled(&self, workflow_id: &str) -> bool {
        self.cancelled.lock().expect("mutex poisoned").contains(workflow_id)
    }
}

/// Gates a physical action behind an operator's explicit approval
/// (spec §4.D "REV-001" human-confirmation requirement). `approve` is
/// called out-of-band (an operator console, a chat command); the physical
/// action handler only ever calls `is_approved`.
pub trait ApprovalGate: Send + Sync {
    fn approve(&self, workflow_id: &str, instruction_index: u32);
    fn is_approved(&self, workflow_id: &str, instruction_index: u32) -> bool;
}

#[derive(Default)]
pub struct InMemoryApprovalGate {
    approved: Mutex<HashSet<(String, u32)>>,
}

impl ApprovalGate for InMemoryApprovalGate {
    fn approve(&self, workflow_id: &str, instruction_index: u32) {
        self.approved.lock().expect("mutex poisoned").insert((workflow_id.to_owned(), instruction_index));
    }

    fn is_approved(&self, workflow_id: &str, instruction_index: u32) -> bool {
        self.approved.lock().expect("mutex poisoned").contains(&(workflow_id.to_owned(), instruction_index))
    }
}

/// Looks up a service's manifest for dispatch at runtime, and tracks fleet
/// liveness. Implemented by `llmir_registry::ServiceRegistry` for lookup;
/// `mark_offline` (spec §4.G "Remote-slice failure fallback") is a
/// best-effort liveness signal the distributed executor calls when a
/// dispatch to a node fails outright.
pub trait NodeRegistry: Send + Sync {
    fn find(&self, service_id: &str) -> Option<Arc<ServiceManifest>>;
    fn mark_offline(&self, node_id: &str);
}

impl NodeRegistry for llmir_registry::ServiceRegistry {
    fn find(&self, service_id: &str) -> Option<Arc<ServiceManifest>> {
        llmir_registry::ServiceRegistry::find(self, service_id)
    }

    fn mark_offline(&self, node_id: &str) {
        tracing::warn!("[NodeRegistry] node \"{node_id}\" marked offline (no-op: registry carries no fleet liveness state)");
    }
}

#[derive(Default)]
pub struct InMemoryNodeRegistry {
    manifests: std::collections::HashMap<String, Arc<ServiceManifest>>,
    offline_nodes: Mutex<HashSet<String>>,
}

impl InMemoryNodeRegistry {
    pub fn insert(&mut self, manifest: ServiceManifest) {
        self.manifests.insert(manifest.id.clone(), Arc::new(manifest));
    }

    pub fn is_offline(&self, node_id: &str) -> bool {
        self.offline_nodes.lock().expect("mutex poisoned").contains(node_id)
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn find(&self, service_id: &str) -> Option<Arc<ServiceManifest>> {
        self.manifests.get(service_id).cloned()
    }

    fn mark_offline(&self, node_id: &str) {
        self.offline_nodes.lock().expect("mutex poisoned").insert(node_id.to_owned());
    }
}

/// Dispatches a slice to a remote node and awaits its result (spec §6
/// `NodeDispatcher.dispatch(node-id, SliceDispatchPayload) -> SliceResultPayload`).
/// Implemented over the same WebSocket/HTTP channel a node uses to register
/// with the fleet; tests substitute an in-memory stub that can be told to
/// succeed, fail, or hang past a deadline.
#[async_trait]
pub trait RemoteSliceDispatcher: Send + Sync {
    async fn dispatch(&self, node_id: &str, payload: llmir_core::SliceDispatchPayload) -> Result<llmir_core::SliceResultPayload>;
}

pub struct HttpRemoteSliceDispatcher {
    http: reqwest::Client,
    /// node_id -> base URL of that node's inbound dispatch endpoint.
    node_urls: std::collections::HashMap<String, String>,
}

impl HttpRemoteSliceDispatcher {
    pub fn new(http: reqwest::Client, node_urls: std::collections::HashMap<String, String>) -> Self {
        Self { http, node_urls }
    }
}

#[async_trait]
impl RemoteSliceDispatcher for HttpRemoteSliceDispatcher {
    async fn dispatch(&self, node_id: &str, payload: llmir_core::SliceDispatchPayload) -> Result<llmir_core::SliceResultPayload> {
        let base = self.node_urls.get(node_id).ok_or_else(|| anyhow::anyhow!("no dispatch URL configured for node \"{node_id}\""))?;
        let url = format!("{base}/dispatch");
        let resp = self
            .http
            .post(&url)
            .timeout(std::time::Duration::from_millis(payload.timeout_ms.max(1)))
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("slice dispatch to \"{node_id}\" -> HTTP {}", resp.status()));
        }
        Ok(resp.json().await?)
    }
}

/// Test double: every node has a canned outcome (success with registers,
/// or failure) fixed up-front by `set_outcome`.
#[derive(Default)]
pub struct InMemoryRemoteSliceDispatcher {
    outcomes: Mutex<std::collections::HashMap<String, Result<llmir_core::SliceResultPayload, String>>>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryRemoteSliceDispatcher {
    pub fn set_success(&self, node_id: impl Into<String>, result: llmir_core::SliceResultPayload) {
        self.outcomes.lock().expect("mutex poisoned").insert(node_id.into(), Ok(result));
    }

    pub fn set_failure(&self, node_id: impl Into<String>, error: impl Into<String>) {
        self.outcomes.lock().expect("mutex poisoned").insert(node_id.into(), Err(error.into()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl RemoteSliceDispatcher for InMemoryRemoteSliceDispatcher {
    async fn dispatch(&self, node_id: &str, _payload: llmir_core::SliceDispatchPayload) -> Result<llmir_core::SliceResultPayload> {
        self.calls.lock().expect("mutex poisoned").push(node_id.to_owned());
        match self.outcomes.lock().expect("mutex poisoned").get(node_id) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(e)) => Err(anyhow::anyhow!(e.clone())),
            None => Err(anyhow::anyhow!("no stubbed outcome for node \"{node_id}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_audit_sink_records_events() {
        let sink = InMemoryAuditSink::default();
        let mut chain = crate::audit::AuditChain::new("n1".into(), None);
        let ev = chain.append("wf-1", Some(1), Some("i0"), "CALL_SERVICE", None, None, 5, None);
        sink.record(ev).await.unwrap();
        assert_eq!(sink.recorded().len(), 1);
    }

    #[test]
    fn cancellation_bus_tracks_distinct_workflows() {
        let bus = InMemoryCancellationBus::default();
        bus.cancel("wf-1");
        assert!(bus.is_cancelled("wf-1"));
        assert!(!bus.is_cancelled("wf-2"));
    }

    #[test]
    fn approval_gate_is_keyed_by_workflow_and_instruction() {
        let gate = InMemoryApprovalGate::default();
        assert!(!gate.is_approved("wf-1", 3));
        gate.approve("wf-1", 3);
        assert!(gate.is_approved("wf-1", 3));
        assert!(!gate.is_approved("wf-1", 4));
    }
}
