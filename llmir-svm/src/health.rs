//! Health and metrics HTTP endpoint (spec §4.G "Health monitor"). A minimal
//! HTTP/1.1 server built directly on `tokio::net::TcpListener`, exposing:
//!
//! - `GET /health`  JSON status snapshot
//! - `GET /metrics` Prometheus text exposition format
//! - `GET /ready`   200 if healthy, 503 otherwise (k8s readiness probe)
//!
//! Prometheus metric names use the `llmir_*` namespace.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared, lock-free health state updated by the interpreter, the node
/// dispatcher, and the offline buffer from any task.
#[derive(Debug)]
pub struct HealthState {
    pub link_connected: AtomicBool,
    pub offline_depth: AtomicUsize,
    pub executions_total: AtomicU64,
    pub executions_failed: AtomicU64,
    pub exec_duration_ms_total: AtomicU64,
    start_ts: u64,
    pub node_id: String,
    pub node_tier: String,
}

impl HealthState {
    pub fn new(node_id: &str, node_tier: &str) -> Arc<Self> {
        Arc::new(Self {
            link_connected: AtomicBool::new(false),
            offline_depth: AtomicUsize::new(0),
            executions_total: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            exec_duration_ms_total: AtomicU64::new(0),
            start_ts: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
            node_id: node_id.to_owned(),
            node_tier: node_tier.to_owned(),
        })
    }

    pub fn set_link_connected(&self, connected: bool) {
        self.link_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_offline_depth(&self, depth: usize) {
        self.offline_depth.store(depth, Ordering::Relaxed);
    }

    /// `ok = false` records a fault after all fallback strategies exhausted.
    pub fn record_execution(&self, elapsed_ms: u64, ok: bool) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        self.exec_duration_ms_total.fetch_add(elapsed_ms, Ordering::Relaxed);
        if !ok {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0).saturating_sub(self.start_ts)
    }

    pub fn avg_exec_ms(&self) -> u64 {
        let total = self.executions_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.exec_duration_ms_total.load(Ordering::Relaxed) / total
    }

    pub fn is_healthy(&self) -> bool {
        self.link_connected.load(Ordering::Relaxed) && self.offline_depth.load(Ordering::Relaxed) < 1000
    }

    pub fn to_json(&self) -> String {
        let connected = self.link_connected.load(Ordering::Relaxed);
        let offline = self.offline_depth.load(Ordering::Relaxed);
        let total = self.executions_total.load(Ordering::Relaxed);
        let failed = self.executions_failed.load(Ordering::Relaxed);
        let avg_ms = self.avg_exec_ms();
        let uptime = self.uptime_secs();
        let status = if self.is_healthy() { "ok" } else { "degraded" };

        format!(
            r#"{{"status":"{status}","node_id":"{node_id}","tier":"{tier}","uptime_secs":{uptime},"link_connected":{connected},"offline_depth":{offline},"executions":{{"total":{total},"failed":{failed},"avg_ms":{avg_ms}}}}}"#,
            status = status,
            node_id = self.node_id,
            tier = self.node_tier,
            uptime = uptime,
            connected = connected,
            offline = offline,
            total = total,
            failed = failed,
            avg_ms = avg_ms,
        )
    }

    pub fn to_prometheus(&self) -> String {
        let connected = if self.link_connected.load(Ordering::Relaxed) { 1 } else { 0 };
        let offline = self.offline_depth.load(Ordering::Relaxed);
        let total = self.executions_total.load(Ordering::Relaxed);
        let failed = self.executions_failed.load(Ordering::Relaxed);
        let avg_ms = self.avg_exec_ms();
        let uptime = self.uptime_secs();
        let healthy = if self.is_healthy() { 1 } else { 0 };
        let node_id = &self.node_id;
        let tier = &self.node_tier;

        format!(
            "# HELP llmir_node_healthy 1 if node is healthy\n\
             # TYPE llmir_node_healthy gauge\n\
             llmir_node_healthy{{node_id=\"{node_id}\",tier=\"{tier}\"}} {healthy}\n\
             # HELP llmir_node_uptime_seconds Node uptime in seconds\n\
             # TYPE llmir_node_uptime_seconds counter\n\
             llmir_node_uptime_seconds{{node_id=\"{node_id}\"}} {uptime}\n\
             # HELP llmir_link_connected 1 if the dispatcher link is up\n\
             # TYPE llmir_link_connected gauge\n\
             llmir_link_connected{{node_id=\"{node_id}\"}} {connected}\n\
             # HELP llmir_offline_buffer_depth Events queued in offline buffer\n\
             # TYPE llmir_offline_buffer_depth gauge\n\
             llmir_offline_buffer_depth{{node_id=\"{node_id}\"}} {offline}\n\
             # HELP llmir_executions_total Total IR instruction executions\n\
             # TYPE llmir_executions_total counter\n\
             llmir_executions_total{{node_id=\"{node_id}\"}} {total}\n\
             # HELP llmir_executions_failed Total failed IR instruction executions\n\
             # TYPE llmir_executions_failed counter\n\
             llmir_executions_failed{{node_id=\"{node_id}\"}} {failed}\n\
             # HELP llmir_execution_avg_ms Average IR instruction execution duration (ms)\n\
             # TYPE llmir_execution_avg_ms gauge\n\
             llmir_execution_avg_ms{{node_id=\"{node_id}\"}} {avg_ms}\n",
        )
    }
}

/// Serve `/health`, `/metrics`, `/ready` on `0.0.0.0:{port}` until the
/// process exits. No framework — a request line is parsed by hand since
/// only the path matters.
pub async fn run(state: Arc<HealthState>, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("[Health] HTTP server listening on http://{addr}");

    loop {
        match listener.accept().await {
            Ok((mut socket, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    let n = match socket.read(&mut buf).await {
                        Ok(n) if n > 0 => n,
                        _ => return,
                    };

                    let req = std::str::from_utf8(&buf[..n]).unwrap_or("");
                    let path = req.lines().next().and_then(|l| l.split_whitespace().nth(1)).unwrap_or("/health");

                    let (status, content_type, body) = match path {
                        "/metrics" => ("200 OK", "text/plain; version=0.0.4; charset=utf-8", state.to_prometheus()),
                        "/ready" => {
                            if state.is_healthy() {
                                ("200 OK", "application/json", r#"{"ready":true}"#.into())
                            } else {
                                ("503 Service Unavailable", "application/json", r#"{"ready":false}"#.into())
                            }
                        }
                        _ => ("200 OK", "application/json", state.to_json()),
                    };

                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: {ct}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
                        status = status,
                        ct = content_type,
                        len = body.len(),
                        body = body,
                    );

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("[Health] write error for {peer}: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("[Health] accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_requires_link_and_shallow_offline_depth() {
        let state = HealthState::new("n1", "LINUX");
        assert!(!state.is_healthy());
        state.set_link_connected(true);
        assert!(state.is_healthy());
        state.set_offline_depth(2000);
        assert!(!state.is_healthy());
    }

    #[test]
    fn record_execution_tracks_averages_and_failures() {
        let state = HealthState::new("n1", "LINUX");
        state.record_execution(100, true);
        state.record_execution(300, false);
        assert_eq!(state.avg_exec_ms(), 200);
        assert_eq!(state.executions_failed.load(Ordering::Relaxed), 1);
    }
}
