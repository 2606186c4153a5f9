//! Five-strategy runtime fallback engine (spec §4.G "Runtime fallback
//! engine"): FAIL_SAFE, DEGRADED_MODE, RETRY_WITH_BACKOFF, LLM_REASONING
//! (max 3 attempts, degrades to FAIL_SAFE), SUPERVISED_RECOMPILE.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackStrategy {
    FailSafe,
    DegradedMode,
    RetryWithBackoff,
    LlmReasoning,
    SupervisedRecompile,
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self::FailSafe
    }
}

impl std::fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FailSafe => "FAIL_SAFE",
            Self::DegradedMode => "DEGRADED_MODE",
            Self::RetryWithBackoff => "RETRY_WITH_BACKOFF",
            Self::LlmReasoning => "LLM_REASONING",
            Self::SupervisedRecompile => "SUPERVISED_RECOMPILE",
        };
        write!(f, "{s}")
    }
}

impl FallbackStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().replace('-', "_").as_str() {
            "FAIL_SAFE" => Self::FailSafe,
            "DEGRADED_MODE" => Self::DegradedMode,
            "RETRY_WITH_BACKOFF" => Self::RetryWithBackoff,
            "LLM_REASONING" => Self::LlmReasoning,
            "SUPERVISED_RECOMPILE" => Self::SupervisedRecompile,
            _ => Self::FailSafe,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstructionFallbackConfig {
    #[serde(default)]
    pub strategy: Option<String>,
    pub safe_default: Option<Value>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2_000
}

pub struct FallbackEngine {
    http: reqwest::Client,
    central_http_url: String,
    node_id: String,
}

#[derive(Debug)]
pub enum FallbackResult {
    Recovered(Value),
    Abort(anyhow::Error),
}

impl FallbackEngine {
    pub fn new(http: reqwest::Client, central_http_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self { http, central_http_url: central_http_url.into(), node_id: node_id.into() }
    }

    /// Decode the strategy and config an instruction carries in its operands.
    pub fn strategy_for(operands: &Value) -> (FallbackStrategy, InstructionFallbackConfig) {
        let cfg: InstructionFallbackConfig = serde_json::from_value(operands.clone()).unwrap_or_default();
        let strategy = cfg.strategy.as_deref().map(FallbackStrategy::from_str).unwrap_or_default();
        (strategy, cfg)
    }

    pub async fn apply<F, Fut>(
        &self,
        strategy: FallbackStrategy,
        cfg: &InstructionFallbackConfig,
        error: anyhow::Error,
        workflow_id: &str,
        service_id: &str,
        execute: F,
    ) -> FallbackResult
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        info!("[Fallback] applying strategy={strategy} for service={service_id} error=\"{error}\"");

        match strategy {
            FallbackStrategy::FailSafe => {
                let default_val = cfg.safe_default.clone().unwrap_or(Value::Null);
                warn!("[Fallback] FAIL_SAFE: returning safe_default={default_val} for service={service_id}");
                FallbackResult::Recovered(default_val)
            }

            FallbackStrategy::DegradedMode => {
                warn!("[Fallback] DEGRADED_MODE: skipping service={service_id} — pipeline continues with null register");
                FallbackResult::Recovered(Value::Null)
            }

            FallbackStrategy::RetryWithBackoff => {
                let max = cfg.max_attempts.max(1) as usize;
                let base_ms = cfg.backoff_base_ms;
                for attempt in 1..=max {
                    let wait_ms = base_ms * (1u64 << (attempt - 1).min(6));
                    debug!("[Fallback] RETRY_WITH_BACKOFF attempt={attempt}/{max} wait={wait_ms}ms service={service_id}");
                    sleep(Duration::from_millis(wait_ms)).await;
                    match execute().await {
                        Ok(v) => {
                            info!("[Fallback] RETRY_WITH_BACKOFF recovered after {attempt} attempt(s) for service={service_id}");
                            return FallbackResult::Recovered(v);
                        }
                        Err(e) => {
                            if attempt == max {
                                warn!("[Fallback] RETRY_WITH_BACKOFF exhausted ({max} attempts) for service={service_id}: {e}");
                                return FallbackResult::Abort(e);
                            }
                        }
                    }
                }
                FallbackResult::Abort(error)
            }

            FallbackStrategy::LlmReasoning => {
                let url = format!("{}/api/fallback/llm-reasoning", self.central_http_url);
                for attempt in 1u32..=3 {
                    let payload = serde_json::json!({
                        "workflowId": workflow_id,
                        "serviceId": service_id,
                        "error": error.to_string(),
                        "attempt": attempt,
                        "nodeId": self.node_id,
                    });
                    match self.http.post(&url).json(&payload).send().await {
                        Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                            Ok(body) => {
                                info!("[Fallback] LLM_REASONING recovered (attempt={attempt}) service={service_id}");
                                let result = body.get("result").cloned().unwrap_or(cfg.safe_default.clone().unwrap_or(Value::Null));
                                return FallbackResult::Recovered(result);
                            }
                            Err(e) => warn!("[Fallback] LLM_REASONING response decode error (attempt={attempt}): {e}"),
                        },
                        Ok(resp) => warn!("[Fallback] LLM_REASONING HTTP {} (attempt={attempt})", resp.status()),
                        Err(e) => warn!("[Fallback] LLM_REASONING request failed (attempt={attempt}): {e}"),
                    }
                    if attempt < 3 {
                        sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    }
                }
                warn!("[Fallback] LLM_REASONING: all 3 attempts failed — falling back to FAIL_SAFE for service={service_id}");
                FallbackResult::Recovered(cfg.safe_default.clone().unwrap_or(Value::Null))
            }

            FallbackStrategy::SupervisedRecompile => {
                let url = format!("{}/api/nodes/recompile-request", self.central_http_url);
                let payload = serde_json::json!({
                    "workflowId": workflow_id,
                    "serviceId": service_id,
                    "error": error.to_string(),
                    "nodeId": self.node_id,
                    "requestedAt": chrono::Utc::now().to_rfc3339(),
                });
                match self.http.post(&url).json(&payload).send().await {
                    Ok(resp) => info!("[Fallback] SUPERVISED_RECOMPILE notification sent (HTTP {}) for workflow={workflow_id}", resp.status()),
                    Err(e) => error!("[Fallback] SUPERVISED_RECOMPILE notification failed: {e}"),
                }
                FallbackResult::Recovered(cfg.safe_default.clone().unwrap_or(Value::Null))
            }
        }
    }

    /// Apply a strategy with no retry executor; RETRY_WITH_BACKOFF degrades to FAIL_SAFE.
    pub async fn apply_simple(&self, strategy: FallbackStrategy, cfg: &InstructionFallbackConfig, error: anyhow::Error, workflow_id: &str, service_id: &str) -> Result<Value> {
        let effective = if strategy == FallbackStrategy::RetryWithBackoff {
            warn!("[Fallback] apply_simple called with RETRY_WITH_BACKOFF — no retry executor provided, degrading to FAIL_SAFE");
            FallbackStrategy::FailSafe
        } else {
            strategy
        };
        match self.apply(effective, cfg, error, workflow_id, service_id, || async { Err::<Value, _>(anyhow!("no retry executor")) }).await {
            FallbackResult::Recovered(v) => Ok(v),
            FallbackResult::Abort(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_from_str_is_case_insensitive() {
        assert_eq!(FallbackStrategy::from_str("fail_safe"), FallbackStrategy::FailSafe);
        assert_eq!(FallbackStrategy::from_str("RETRY_WITH_BACKOFF"), FallbackStrategy::RetryWithBackoff);
        assert_eq!(FallbackStrategy::from_str("unknown"), FallbackStrategy::FailSafe);
    }

    #[test]
    fn strategy_for_reads_explicit_config() {
        let operands = serde_json::json!({"strategy": "RETRY_WITH_BACKOFF", "maxAttempts": 5, "backoffBaseMs": 1000});
        let (strategy, cfg) = FallbackEngine::strategy_for(&operands);
        assert_eq!(strategy, FallbackStrategy::RetryWithBackoff);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.backoff_base_ms, 1000);
    }
}
