//! ServiceManifest and related types — spec §3 "ServiceManifest".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::descriptor::ExecutionDescriptor;

/// Node tier a service/instruction/descriptor can run on (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeTier {
    Central,
    Linux,
    Mcu,
    Any,
}

impl NodeTier {
    /// Whether `self` satisfies a required tier (ANY on either side always matches).
    pub fn satisfies(self, required: NodeTier) -> bool {
        self == required || self == NodeTier::Any || required == NodeTier::Any
    }
}

impl std::fmt::Display for NodeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeTier::Central => "CENTRAL",
            NodeTier::Linux => "LINUX",
            NodeTier::Mcu => "MCU",
            NodeTier::Any => "ANY",
        };
        write!(f, "{s}")
    }
}

/// Semantic type of a port (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Buffer,
    Stream,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: PortType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRequirements {
    pub tiers: Vec<NodeTier>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub needs_vault: bool,
    #[serde(default)]
    pub needs_internet: bool,
    #[serde(default)]
    pub physical_protocols: Vec<String>,
    #[serde(default)]
    pub required_connectors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviouralContract {
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub has_external_side_effects: bool,
    #[serde(default)]
    pub nominal_latency_ms: Option<u64>,
    pub hard_timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Safety constraint enforcement level (spec §4.D SAFE-<id>).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Warn,
    Error,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConstraint {
    pub id: String,
    pub level: SafetyLevel,
    /// A small boolean expression over literal operand values, e.g. "pressure < 10".
    pub predicate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormalPredicate {
    pub expression: String,
    #[serde(default)]
    pub strict_at_compile_time: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub id: String,
    pub version: semver::Version,
    pub category: String,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    /// Ordered by preference — first compatible descriptor wins (spec §4.A resolve_for_node).
    pub descriptors: Vec<ExecutionDescriptor>,
    pub node_requirements: NodeRequirements,
    pub contract: BehaviouralContract,
    #[serde(default)]
    pub preconditions: Vec<FormalPredicate>,
    #[serde(default)]
    pub postconditions: Vec<FormalPredicate>,
    #[serde(default)]
    pub safety_constraints: Vec<SafetyConstraint>,
    #[serde(default)]
    pub requires_human_confirmation: bool,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Matches spec kebab-case id grammar: `[a-z0-9-]+(\.[a-z0-9-]+)*`.
pub fn is_valid_service_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    id.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

impl ServiceManifest {
    /// Invariant checks from spec §3: ≥1 input, ≥1 output, ≥1 descriptor, valid id.
    pub fn validate_invariants(&self) -> Result<(), String> {
        if !is_valid_service_id(&self.id) {
            return Err(format!("manifest id '{}' is not kebab-case", self.id));
        }
        if self.inputs.is_empty() {
            return Err(format!("manifest '{}' has zero input ports", self.id));
        }
        if self.outputs.is_empty() {
            return Err(format!("manifest '{}' has zero output ports", self.id));
        }
        if self.descriptors.is_empty() {
            return Err(format!("manifest '{}' has zero execution descriptors", self.id));
        }
        Ok(())
    }

    pub fn key(&self) -> (String, semver::Version) {
        (self.id.clone(), self.version.clone())
    }
}

/// Manifests keyed by `(id, version)`, as described for the registry (spec §4.A).
pub type ManifestKey = (String, semver::Version);
pub type ManifestStore = BTreeMap<ManifestKey, std::sync::Arc<ServiceManifest>>;
