/// LLM-IR SVM node — entry point (spec §6, §8)
///
/// Start-up sequence:
///   1. Parse Config from environment variables.
///   2. Initialise structured logging (RUST_LOG / SVM_LOG_LEVEL).
///   3. Restore any persisted offline buffer (NDJSON file).
///   4. Build AuditChain with Ed25519 signing key.
///   5. Build the interpreter's collaborators.
///   6. Enter NodeClient.run() — reconnect loop with exponential back-off.
mod client;

use anyhow::Result;
use llmir_svm::offline::ensure_parent;
use llmir_svm::{AuditChain, Config, OfflineBuffer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Config ────────────────────────────────────────────────────────────
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    // ── 2. Logging ───────────────────────────────────────────────────────────
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).compact().init();

    info!("llmir-node v{} starting (node_id={}, tier={:?})", env!("CARGO_PKG_VERSION"), config.node_id, config.node_tier);

    // ── 3. Offline buffer ────────────────────────────────────────────────────
    let buf_path = std::path::PathBuf::from(&config.offline_buffer_path);
    ensure_parent(&buf_path).await?;
    let mut offline = OfflineBuffer::new(&buf_path, config.offline_buffer_max);
    if let Err(e) = offline.load().await {
        tracing::warn!("[Node] failed to load offline buffer: {e}");
    }

    // ── 4. Audit chain ───────────────────────────────────────────────────────
    let audit = AuditChain::new(config.node_id.clone(), Some(config.signing_key()));

    // ── 4b. HealthMonitor ────────────────────────────────────────────────────
    let health_state = llmir_svm::HealthState::new(&config.node_id, &format!("{:?}", config.node_tier));
    let health_port = config.health_port;
    {
        let hs = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = llmir_svm::run_health_server(hs, health_port).await {
                tracing::error!("[Health] server exited: {e}");
            }
        });
    }
    info!("[Health] HealthMonitor started on port {health_port}");

    // ── 5+6. Node client — runs forever ──────────────────────────────────────
    let mut node_client = client::NodeClient::new(config, audit, offline, health_state);
    node_client.run().await
}
