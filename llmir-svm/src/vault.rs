//! Vault secret resolution (spec §4.G "Vault secret resolution"):
//! HashiCorp Vault KV v2 → `VAULT_SECRET_<UPPER_SNAKE>` env var → raw env key,
//! with a 30-second TTL cache so a busy slice doesn't hammer Vault.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

pub struct VaultClient {
    http: reqwest::Client,
    vault_addr: Option<String>,
    vault_token: Option<String>,
    vault_namespace: Option<String>,
    cache: HashMap<String, CacheEntry>,
    cache_ttl: Duration,
}

#[derive(Debug)]
pub struct SecretValue {
    pub value: String,
    pub source: SecretSource,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SecretSource {
    HashiCorpVault,
    EnvVar,
    RawEnvKey,
}

#[derive(Deserialize)]
struct VaultResponse {
    data: VaultData,
}
#[derive(Deserialize)]
struct VaultData {
    data: HashMap<String, serde_json::Value>,
}

impl VaultClient {
    pub fn new(http: reqwest::Client, vault_addr: Option<String>, vault_token: Option<String>, vault_namespace: Option<String>) -> Self {
        Self { http, vault_addr, vault_token, vault_namespace, cache: HashMap::new(), cache_ttl: Duration::from_secs(30) }
    }

    /// Fetch a secret by vault path (e.g. "sap/api_key"). The value is only
    /// valid for the instruction's lifetime; callers must not persist it.
    pub async fn fetch_secret(&mut self, path: &str) -> Result<SecretValue> {
        if let Some(entry) = self.cache.get(path) {
            if entry.expires_at > Instant::now() {
                debug!("[Vault] cache hit for \"{path}\"");
                return Ok(SecretValue { value: entry.value.clone(), source: SecretSource::HashiCorpVault });
            }
            self.cache.remove(path);
        }

        if let (Some(addr), Some(token)) = (&self.vault_addr, &self.vault_token) {
            match self.fetch_from_hashicorp(addr, token, path).await {
                Ok(value) => {
                    self.cache.insert(path.to_owned(), CacheEntry { value: value.clone(), expires_at: Instant::now() + self.cache_ttl });
                    return Ok(SecretValue { value, source: SecretSource::HashiCorpVault });
                }
                Err(e) => warn!("[Vault] HashiCorp fetch failed for \"{path}\": {e} — falling back to env var"),
            }
        }

        let env_key = path_to_env_key(path);
        if let Ok(value) = std::env::var(&env_key) {
            debug!("[Vault] using env var {env_key} for \"{path}\"");
            return Ok(SecretValue { value, source: SecretSource::EnvVar });
        }

        let raw_key = path.to_uppercase().replace('/', "_").replace('-', "_");
        if let Ok(value) = std::env::var(&raw_key) {
            debug!("[Vault] using raw env key {raw_key} for \"{path}\"");
            return Ok(SecretValue { value, source: SecretSource::RawEnvKey });
        }

        Err(anyhow!("secret \"{path}\" not found in HashiCorp Vault, env var {env_key}, or raw env key {raw_key}"))
    }

    async fn fetch_from_hashicorp(&self, addr: &str, token: &str, secret_path: &str) -> Result<String> {
        let parts: Vec<&str> = secret_path.splitn(2, '/').collect();
        let (mount, key) = if parts.len() == 2 { (parts[0], parts[1]) } else { ("secret", secret_path) };
        let url = format!("{}/v1/{}/data/{}", addr.trim_end_matches('/'), mount, key);

        let mut req = self.http.get(&url).header("X-Vault-Token", token);
        if let Some(ns) = &self.vault_namespace {
            req = req.header("X-Vault-Namespace", ns);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Vault HTTP {}: {}", resp.status(), url));
        }
        let body: VaultResponse = resp.json().await.map_err(|e| anyhow!("Vault response parse error: {e}"))?;
        let kv_key = secret_path.rsplit('/').next().unwrap_or(secret_path);
        body.data
            .data
            .get(kv_key)
            .or_else(|| body.data.data.values().next())
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| anyhow!("Vault KV key \"{kv_key}\" not found at {url}"))
    }
}

fn path_to_env_key(path: &str) -> String {
    let normalized = path.to_uppercase().replace('/', "_").replace('-', "_").replace('.', "_");
    format!("VAULT_SECRET_{normalized}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_to_env_key_upper_snakes() {
        assert_eq!(path_to_env_key("sap/api_key"), "VAULT_SECRET_SAP_API_KEY");
        assert_eq!(path_to_env_key("db/password"), "VAULT_SECRET_DB_PASSWORD");
    }
}
