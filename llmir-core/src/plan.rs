//! DistributionPlan — spec §3 "DistributionPlan".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputBinding {
    FromSlice { from_slice: String, from_register: u8 },
    FromTrigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub slice_id: String,
    pub target_node_id: String,
    pub instructions: Vec<u32>,
    pub instruction_order: Vec<u32>,
    pub input_bindings: BTreeMap<u8, InputBinding>,
    pub output_bindings: Vec<u8>,
    pub is_root: bool,
    pub estimated_duration_ms: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnTimeout {
    Fail,
    Skip,
    UseDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFlow {
    pub from_node: String,
    pub from_register: u8,
    pub to_register: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPoint {
    pub sync_id: String,
    pub pause_before_instruction_index: u32,
    pub await_slice_ids: Vec<String>,
    pub inbound_flows: Vec<InboundFlow>,
    pub on_timeout: OnTimeout,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub plan_id: String,
    pub slices: Vec<Slice>,
    pub sync_points: Vec<SyncPoint>,
    pub is_distributed: bool,
    pub node_count: u32,
    pub estimated_total_latency_ms: u64,
}

impl DistributionPlan {
    pub fn central_slice(&self) -> Option<&Slice> {
        self.slices.iter().find(|s| s.is_root && s.target_node_id == "CENTRAL")
            .or_else(|| self.slices.iter().find(|s| s.is_root))
    }

    pub fn slice(&self, slice_id: &str) -> Option<&Slice> {
        self.slices.iter().find(|s| s.slice_id == slice_id)
    }
}
