//! Compilation and runtime error taxonomy — spec §6 "Exit codes / errors", §7.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from a compilation stage (registry lookup, resolver, verifier).
/// Aggregated across the whole pass per spec §4.C/§4.D/§7.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{rule_id}] {message}")]
pub struct CompileError {
    pub rule_id: String,
    pub severity: Severity,
    #[serde(default)]
    pub instruction_index: Option<u32>,
    #[serde(default)]
    pub service_id: Option<String>,
    pub message: String,
    pub remediation: String,
}

impl CompileError {
    pub fn error(rule_id: &str, message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_owned(),
            severity: Severity::Error,
            instruction_index: None,
            service_id: None,
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn warning(rule_id: &str, message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_owned(),
            severity: Severity::Warning,
            instruction_index: None,
            service_id: None,
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn at_instruction(mut self, idx: u32) -> Self {
        self.instruction_index = Some(idx);
        self
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }
}

/// Aggregated result of a compilation stage, or the whole pipeline (spec §7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileReport {
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CompileError>,
}

impl CompileReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push(&mut self, finding: CompileError) {
        match finding.severity {
            Severity::Error => self.errors.push(finding),
            Severity::Warning => self.warnings.push(finding),
        }
    }

    pub fn merge(&mut self, other: CompileReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Runtime error kinds (spec §6 exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeErrorCode {
    Timeout,
    BinaryNotFound,
    ChecksumMismatch,
    RuntimeError,
    NetworkError,
    AuthError,
    ContractViolation,
    UnsupportedPlatform,
    ConnectorError,
    Unknown,
}

impl RuntimeErrorCode {
    /// Whether the executor-registry retry policy applies (spec §7).
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            RuntimeErrorCode::Timeout | RuntimeErrorCode::NetworkError | RuntimeErrorCode::ConnectorError
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("runtime error {code:?} (retriable={retriable}){}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
pub struct RuntimeError {
    pub code: RuntimeErrorCode,
    pub retriable: bool,
    #[serde(default)]
    pub cause: Option<String>,
}

impl RuntimeError {
    pub fn new(code: RuntimeErrorCode, cause: impl Into<String>) -> Self {
        let retriable = code.is_retriable();
        Self { code, retriable, cause: Some(cause.into()) }
    }
}
