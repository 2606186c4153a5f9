//! IR artifact — spec §3 "IR artifact".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::instruction::IrInstruction;
use crate::plan::DistributionPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub compiled_at: chrono::DateTime<chrono::Utc>,
    pub compiler_version: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub source: String,
}

/// Owns the instruction arena; immutable after seal (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub instructions: BTreeMap<u32, IrInstruction>,
    /// Topological order over `instructions`.
    pub instruction_order: Vec<u32>,
    /// index -> predecessor indices.
    pub dependency_graph: BTreeMap<u32, Vec<u32>>,
    #[serde(default)]
    pub resource_table: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub parallel_groups: Vec<u32>,
    #[serde(default)]
    pub schemas: BTreeMap<String, serde_json::Value>,
    pub input_registers: Vec<u8>,
    pub output_register: u8,
    #[serde(default)]
    pub distribution_plan: Option<DistributionPlan>,
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    pub fn instruction(&self, idx: u32) -> Option<&IrInstruction> {
        self.instructions.get(&idx)
    }

    /// Successor indices per spec §4.D TERM-001:
    /// BRANCH -> {target, fall-through}; JUMP -> {target}; LOOP -> {body-start, exit};
    /// RETURN -> {}; everything else -> {next sequential instruction}.
    pub fn successors(&self, idx: u32) -> Vec<u32> {
        use crate::instruction::Opcode::*;
        let Some(instr) = self.instructions.get(&idx) else {
            return Vec::new();
        };
        let pos = self.instruction_order.iter().position(|&i| i == idx);
        let next_sequential = pos
            .and_then(|p| self.instruction_order.get(p + 1).copied());

        match instr.opcode {
            Branch => {
                let mut out = Vec::new();
                if let Some(t) = instr.target_instruction {
                    out.push(t);
                }
                if let Some(n) = next_sequential {
                    out.push(n);
                }
                out
            }
            Jump => instr.target_instruction.into_iter().collect(),
            Loop => {
                let mut out = Vec::new();
                if let Some(lo) = &instr.loop_operands {
                    out.push(lo.body_start_index);
                    out.push(lo.exit_index);
                }
                out
            }
            Return => Vec::new(),
            _ => next_sequential.into_iter().collect(),
        }
    }
}
