//! Remote-slice dispatch payloads — spec §6 "Collaborators (outbound)",
//! `NodeDispatcher.dispatch(node-id, SliceDispatchPayload) -> SliceResultPayload`.
//!
//! These are the wire-level shapes the central SVM sends to a remote node and
//! gets back; they carry a plain instruction slice (not a whole `Artifact`)
//! since a slice only ever owns a subset of the instruction arena plus the
//! register snapshot the sync-point bindings resolved for it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::instruction::IrInstruction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceDispatchPayload {
    pub plan_id: String,
    pub slice_id: String,
    pub instructions: BTreeMap<u32, IrInstruction>,
    pub instruction_order: Vec<u32>,
    pub register_values: BTreeMap<u8, serde_json::Value>,
    pub timeout_ms: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SliceStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceResultPayload {
    pub plan_id: String,
    pub slice_id: String,
    pub node_id: String,
    pub status: SliceStatus,
    pub output_registers: BTreeMap<u8, serde_json::Value>,
    pub duration_ms: u64,
    #[serde(default)]
    pub audit_events: Vec<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}
