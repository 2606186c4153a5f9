//! Node configuration, loaded from environment variables / a `.env` file
//! (spec §4.G "Configuration"). Signs with an Ed25519 keypair parsed from
//! hex rather than PEM; an ephemeral key is generated when none is
//! configured.

use ed25519_dalek::SigningKey;
use llmir_core::NodeTier;
use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    /// Node identifier, unique per deployment.
    pub node_id: String,
    pub node_tier: NodeTier,
    /// URL of the distribution planner's dispatcher (the node's upstream).
    pub dispatcher_ws_url: String,
    pub dispatcher_http_url: String,
    pub auth_token: String,
    /// Ed25519 signing key, hex-encoded 32-byte seed; `None` means an
    /// ephemeral key is generated at startup.
    pub signing_key_hex: Option<String>,
    pub offline_buffer_path: String,
    pub offline_buffer_max: usize,
    pub reconnect_interval_secs: u64,
    pub log_level: String,

    pub vault_addr: Option<String>,
    pub vault_token: Option<String>,
    pub vault_namespace: Option<String>,

    /// Accepted major version of the sealed-artifact wire format.
    pub ir_version_major: u8,

    /// TCP port for the `/health`, `/metrics`, `/ready` endpoints.
    pub health_port: u16,

    /// Hex-encoded Ed25519 public key the compiler signed artifacts with.
    /// Required to verify an incoming signed artifact before deserialising
    /// it (spec §4.E "Deserialisation requires prior successful
    /// verification"); `None` means verification is skipped with a warning,
    /// which must never happen in production.
    pub artifact_verifying_key_hex: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let node_id = env::var("SVM_NODE_ID").unwrap_or_else(|_| format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]));

        Config {
            node_id,
            node_tier: parse_node_tier(&env::var("SVM_NODE_TIER").unwrap_or_else(|_| "LINUX".into())),
            dispatcher_ws_url: env::var("DISPATCHER_WS_URL").unwrap_or_else(|_| "ws://localhost:3000/nodes".into()),
            dispatcher_http_url: env::var("DISPATCHER_HTTP_URL").unwrap_or_else(|_| "http://localhost:3000".into()),
            auth_token: env::var("SVM_AUTH_TOKEN").unwrap_or_default(),
            signing_key_hex: env::var("SVM_SIGNING_KEY_HEX").ok(),
            offline_buffer_path: env::var("OFFLINE_BUFFER_PATH").unwrap_or_else(|_| "/tmp/llmir_svm_offline.ndjson".into()),
            offline_buffer_max: env::var("OFFLINE_BUFFER_MAX").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000),
            reconnect_interval_secs: env::var("RECONNECT_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(15),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),

            vault_addr: env::var("VAULT_ADDR").ok(),
            vault_token: env::var("VAULT_TOKEN").ok(),
            vault_namespace: env::var("VAULT_NAMESPACE").ok(),

            ir_version_major: env::var("SVM_IR_VERSION_MAJOR").ok().and_then(|v| v.parse().ok()).unwrap_or(1),

            health_port: env::var("SVM_HEALTH_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9090),

            artifact_verifying_key_hex: env::var("SVM_ARTIFACT_VERIFYING_KEY_HEX").ok(),
        }
    }

    /// Parse the configured artifact-verifying public key, if any.
    pub fn artifact_verifying_key(&self) -> Option<ed25519_dalek::VerifyingKey> {
        let hex_key = self.artifact_verifying_key_hex.as_deref()?;
        let bytes = hex::decode(hex_key).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        ed25519_dalek::VerifyingKey::from_bytes(&arr).ok()
    }

    /// Load the configured signing key, or generate and log a warning that
    /// audit events will only be verifiable for this process's lifetime.
    pub fn signing_key(&self) -> SigningKey {
        if let Some(hex_seed) = &self.signing_key_hex {
            match hex::decode(hex_seed) {
                Ok(bytes) if bytes.len() == 32 => {
                    let mut seed = [0u8; 32];
                    seed.copy_from_slice(&bytes);
                    return SigningKey::from_bytes(&seed);
                }
                _ => warn!("[Config] SVM_SIGNING_KEY_HEX is not a valid 32-byte hex seed — generating ephemeral key"),
            }
        } else {
            warn!("[Config] no signing key configured — generating ephemeral key");
        }
        SigningKey::generate(&mut rand::rngs::OsRng)
    }
}

fn parse_node_tier(s: &str) -> NodeTier {
    match s.to_uppercase().as_str() {
        "CENTRAL" => NodeTier::Central,
        "LINUX" => NodeTier::Linux,
        "MCU" => NodeTier::Mcu,
        "ANY" => NodeTier::Any,
        other => {
            warn!("[Config] unrecognised SVM_NODE_TIER \"{other}\" — defaulting to LINUX");
            NodeTier::Linux
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_node_tier_is_case_insensitive() {
        assert_eq!(parse_node_tier("linux"), NodeTier::Linux);
        assert_eq!(parse_node_tier("MCU"), NodeTier::Mcu);
        assert_eq!(parse_node_tier("bogus"), NodeTier::Linux);
    }

    #[test]
    fn signing_key_falls_back_to_ephemeral_when_unset() {
        let cfg = Config { signing_key_hex: None, ..Config::from_env() };
        let _ = cfg.signing_key();
    }
}
