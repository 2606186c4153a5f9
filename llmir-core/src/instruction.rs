//! IR Instruction — spec §3 "IR Instruction".
//!
//! A hand-typed opcode enum shared by the compiler and the runtime, with
//! the exact opcode set and operand shapes spec §3 names.

use serde::{Deserialize, Serialize};

use crate::descriptor::ExecutionDescriptor;
use crate::manifest::{FormalPredicate, NodeTier, RetryPolicy, SafetyConstraint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    LoadResource,
    StoreMemory,
    Validate,
    Branch,
    Loop,
    Jump,
    CallService,
    CallAction,
    CallTool,
    Transform,
    Aggregate,
    Filter,
    ParallelSpawn,
    ParallelMerge,
    LlmCall,
    Trigger,
    Return,
}

/// Typed register kind (spec §3 "Registers are typed").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Int,
    Float,
    String,
    Buffer,
    Object,
    Any,
}

impl Opcode {
    /// Inferred destination register type for TYPE-001/002 (spec §4.D).
    pub fn inferred_dest_type(self) -> RegisterType {
        match self {
            Opcode::Transform
            | Opcode::Filter
            | Opcode::Aggregate
            | Opcode::CallService
            | Opcode::CallAction
            | Opcode::CallTool
            | Opcode::LlmCall => RegisterType::Object,
            Opcode::LoadResource => RegisterType::Any,
            Opcode::StoreMemory => RegisterType::Any,
            Opcode::Validate => RegisterType::Any,
            _ => RegisterType::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Exists,
    Truthy,
}

impl PredicateOperator {
    pub fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            "==" | "eq" => PredicateOperator::Eq,
            "!=" | "ne" => PredicateOperator::Ne,
            "<" => PredicateOperator::Lt,
            "<=" | "≤" => PredicateOperator::Le,
            ">" => PredicateOperator::Gt,
            ">=" | "≥" => PredicateOperator::Ge,
            "exists" => PredicateOperator::Exists,
            "truthy" => PredicateOperator::Truthy,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergencePredicate {
    pub register: u8,
    pub operator: PredicateOperator,
    pub value: serde_json::Value,
}

/// Mandatory LOOP operand block (spec §3 "LOOP operand is mandatory").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOperands {
    pub iterator_register: u8,
    pub max_iterations: u8,
    pub timeout_ms: u64,
    pub body_start_index: u32,
    pub exit_index: u32,
    #[serde(default)]
    pub convergence_predicate: Option<ConvergencePredicate>,
    #[serde(default)]
    pub fallback_instruction: Option<u32>,
}

/// The hard ceiling spec §3/§8 both name — no LOOP may exceed this.
pub const MAX_LOOP_ITERATIONS: u8 = 5;

impl LoopOperands {
    pub fn clamped_max_iterations(&self) -> u8 {
        self.max_iterations.min(MAX_LOOP_ITERATIONS)
    }
}

/// Five-level scheduling priority (spec §4.G "Priority arbitration").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityLevel {
    Critical = 0,
    High = 64,
    Normal = 128,
    Low = 192,
    Background = 255,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityPolicy {
    pub level: u8,
    pub preemptible: bool,
    pub max_wait_ms: u32,
}

impl PriorityPolicy {
    /// Compile-time assignment rule (spec §4.G priority table).
    pub fn derive(
        is_physical_control: bool,
        is_safety_critical_keyword: bool,
        criticality_high: bool,
        is_analytics: bool,
        criticality_low: bool,
        default_timeout_ms: u32,
    ) -> Self {
        if is_physical_control && (is_safety_critical_keyword || criticality_high) {
            return PriorityPolicy { level: PriorityLevel::Critical as u8, preemptible: false, max_wait_ms: 500 };
        }
        if is_physical_control || criticality_high {
            return PriorityPolicy { level: PriorityLevel::High as u8, preemptible: false, max_wait_ms: default_timeout_ms };
        }
        if is_analytics {
            return PriorityPolicy { level: PriorityLevel::Background as u8, preemptible: true, max_wait_ms: default_timeout_ms };
        }
        if criticality_low {
            return PriorityPolicy { level: PriorityLevel::Low as u8, preemptible: true, max_wait_ms: default_timeout_ms };
        }
        PriorityPolicy { level: PriorityLevel::Normal as u8, preemptible: true, max_wait_ms: default_timeout_ms }
    }
}

/// Attached to a service-calling instruction once stage C has resolved it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMetadata {
    pub selected_descriptor: ExecutionDescriptor,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub target_tier: NodeTier,
    pub service_id: String,
    pub service_version: semver::Version,
    #[serde(default)]
    pub credentials_vault_path: Option<String>,
    /// Carried over from the resolved manifest so the verifier (stage D, which
    /// only sees the artifact, not the registry) can still check SAFE-<id>/PRE-001.
    #[serde(default)]
    pub safety_constraints: Vec<SafetyConstraint>,
    #[serde(default)]
    pub preconditions: Vec<FormalPredicate>,
}

/// Physical-action operands for `CALL_ACTION` (spec §4.G "Physical-action handler").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// 1 = Monday .. 7 = Sunday (ISO 8601 weekday numbering).
    pub days: Vec<u8>,
    pub start: String,
    pub end: String,
    pub tz: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostconditionSpec {
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub expected_value: Option<serde_json::Value>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// Register the postcondition is evaluated against.
    pub register: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalActionOperands {
    pub target: String,
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub cancellation_window_ms: u64,
    #[serde(default)]
    pub postcondition: Option<PostconditionSpec>,
    #[serde(default)]
    pub requires_human_approval: bool,
    #[serde(default)]
    pub postcondition_fallback: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrInstruction {
    pub index: u32,
    pub opcode: Opcode,
    #[serde(default)]
    pub dest: Option<u8>,
    #[serde(default)]
    pub src: Vec<u8>,
    #[serde(default)]
    pub operands: serde_json::Value,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub service_version: Option<semver::Version>,
    #[serde(default)]
    pub dispatch_metadata: Option<DispatchMetadata>,
    #[serde(default)]
    pub target_instruction: Option<u32>,
    #[serde(default)]
    pub parallel_group_id: Option<u32>,
    #[serde(default)]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub required_tier: Option<NodeTier>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub slice_id: Option<String>,
    #[serde(default)]
    pub loop_operands: Option<LoopOperands>,
    #[serde(default)]
    pub priority_policy: Option<PriorityPolicy>,
}

impl IrInstruction {
    pub fn new(index: u32, opcode: Opcode) -> Self {
        Self {
            index,
            opcode,
            dest: None,
            src: Vec::new(),
            operands: serde_json::Value::Null,
            service_id: None,
            service_version: None,
            dispatch_metadata: None,
            target_instruction: None,
            parallel_group_id: None,
            target_node_id: None,
            required_tier: None,
            required_capabilities: Vec::new(),
            slice_id: None,
            loop_operands: None,
            priority_policy: None,
        }
    }

    /// Whether this instruction's opcode is one of the four service-calling kinds
    /// that stage C must resolve (spec §4.C).
    pub fn is_service_call(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::CallService | Opcode::CallAction | Opcode::CallTool | Opcode::LlmCall
        )
    }

    pub fn physical_action_operands(&self) -> Result<PhysicalActionOperands, serde_json::Error> {
        serde_json::from_value(self.operands.clone())
    }

    /// Look up a named literal value for a PRE-001/SAFE-<id> static check:
    /// checks `operands.<name>` directly, then `operands.payload.<name>` for
    /// `CALL_ACTION` instructions whose operands carry a nested payload.
    pub fn literal_operand(&self, name: &str) -> Option<&serde_json::Value> {
        if let Some(v) = self.operands.get(name) {
            return Some(v);
        }
        self.operands.get("payload").and_then(|p| p.get(name))
    }
}
