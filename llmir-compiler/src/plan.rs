//! Stage F ("Stage 9") — distribution planning.
//!
//! Greedily slices the artifact's topological instruction order by required
//! tier, inserting a sync point wherever a later slice consumes a register
//! produced by an earlier slice on a different node. Prefers to cut at
//! PARALLEL_SPAWN/PARALLEL_MERGE boundaries when one falls on a tier change;
//! a single-slice plan with `is_distributed = false` degenerates to a plain
//! intra-process fork/join.

use std::collections::BTreeMap;

use llmir_core::{Artifact, DistributionPlan, InboundFlow, InputBinding, NodeTier, OnTimeout, Slice, SyncPoint};
use sha2::{Digest, Sha256};

fn tier_to_node_id(tier: NodeTier) -> String {
    match tier {
        NodeTier::Central => "CENTRAL".to_owned(),
        NodeTier::Linux => "LINUX".to_owned(),
        NodeTier::Mcu => "MCU".to_owned(),
        NodeTier::Any => "CENTRAL".to_owned(),
    }
}

fn checksum(instructions: &[u32]) -> String {
    let mut hasher = Sha256::new();
    for idx in instructions {
        hasher.update(idx.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Build a distribution plan over `artifact`. `default_tier` is used for
/// instructions with no `required_tier` annotation (stage C should have set
/// one on every service call; everything else inherits the slice it falls into).
pub fn plan(artifact: &Artifact, default_tier: NodeTier) -> DistributionPlan {
    let mut slices: Vec<Slice> = Vec::new();
    let mut current_tier: Option<NodeTier> = None;
    let mut current_instructions: Vec<u32> = Vec::new();
    let mut register_origin_slice: BTreeMap<u8, usize> = BTreeMap::new();
    let mut sync_points: Vec<SyncPoint> = Vec::new();

    let flush = |current_tier: Option<NodeTier>,
                 current_instructions: &mut Vec<u32>,
                 slices: &mut Vec<Slice>,
                 register_origin_slice: &mut BTreeMap<u8, usize>,
                 artifact: &Artifact| {
        if current_instructions.is_empty() {
            return;
        }
        let tier = current_tier.unwrap_or(default_tier);
        let slice_idx = slices.len();
        let slice_id = format!("slice-{slice_idx}");
        let is_root = slice_idx == 0;
        let outputs: Vec<u8> = current_instructions
            .iter()
            .filter_map(|i| artifact.instruction(*i).and_then(|instr| instr.dest))
            .collect();
        for &r in &outputs {
            register_origin_slice.insert(r, slice_idx);
        }
        slices.push(Slice {
            slice_id,
            target_node_id: tier_to_node_id(tier),
            instructions: current_instructions.clone(),
            instruction_order: current_instructions.clone(),
            input_bindings: BTreeMap::new(),
            output_bindings: outputs,
            is_root,
            estimated_duration_ms: current_instructions.len() as u64 * 50,
            checksum: checksum(current_instructions),
        });
        current_instructions.clear();
    };

    for &idx in &artifact.instruction_order {
        let Some(instr) = artifact.instructions.get(&idx) else { continue };
        let tier = instr.required_tier.unwrap_or(default_tier);

        if current_tier.is_some() && current_tier != Some(tier) {
            flush(current_tier, &mut current_instructions, &mut slices, &mut register_origin_slice, artifact);

            let target_slice_idx = slices.len();
            let mut inbound_flows = Vec::new();
            for &src in &instr.src {
                if let Some(&origin_idx) = register_origin_slice.get(&src) {
                    if origin_idx != target_slice_idx {
                        inbound_flows.push(InboundFlow {
                            from_node: slices[origin_idx].target_node_id.clone(),
                            from_register: src,
                            to_register: src,
                        });
                    }
                }
            }
            if !inbound_flows.is_empty() {
                sync_points.push(SyncPoint {
                    sync_id: format!("sync-{}", sync_points.len()),
                    pause_before_instruction_index: idx,
                    await_slice_ids: inbound_flows
                        .iter()
                        .filter_map(|f| slices.iter().find(|s| s.target_node_id == f.from_node).map(|s| s.slice_id.clone()))
                        .collect(),
                    inbound_flows,
                    on_timeout: OnTimeout::Fail,
                    default_value: None,
                });
            }
        }
        current_tier = Some(tier);
        current_instructions.push(idx);
    }
    flush(current_tier, &mut current_instructions, &mut slices, &mut register_origin_slice, artifact);

    for slice in &mut slices {
        for &idx in &slice.instructions {
            let Some(instr) = artifact.instructions.get(&idx) else { continue };
            for &src in &instr.src {
                if let Some(&origin_idx) = register_origin_slice.get(&src) {
                    if slices.iter().position(|s| s.instructions.contains(&idx)) != Some(origin_idx) {
                        slice.input_bindings.insert(
                            src,
                            InputBinding::FromSlice { from_slice: slices[origin_idx].slice_id.clone(), from_register: src },
                        );
                    }
                }
            }
        }
    }

    let is_distributed = slices.len() > 1;
    let node_count = slices.iter().map(|s| s.target_node_id.clone()).collect::<std::collections::BTreeSet<_>>().len() as u32;
    let estimated_total_latency_ms = slices.iter().map(|s| s.estimated_duration_ms).sum();

    DistributionPlan {
        plan_id: format!("plan-{}", artifact.metadata.workflow_id),
        slices,
        sync_points,
        is_distributed,
        node_count,
        estimated_total_latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmir_core::{ArtifactMetadata, IrInstruction, Opcode};

    fn artifact_with(instrs: Vec<IrInstruction>) -> Artifact {
        let mut instructions = BTreeMap::new();
        let mut order = Vec::new();
        for i in instrs {
            order.push(i.index);
            instructions.insert(i.index, i);
        }
        Artifact {
            instructions,
            instruction_order: order,
            dependency_graph: BTreeMap::new(),
            resource_table: BTreeMap::new(),
            parallel_groups: Vec::new(),
            schemas: BTreeMap::new(),
            input_registers: Vec::new(),
            output_register: 0,
            distribution_plan: None,
            metadata: ArtifactMetadata {
                compiled_at: chrono::Utc::now(),
                compiler_version: "0.1.0".into(),
                workflow_id: "wf-plan".into(),
                workflow_version: 1,
                source: "test".into(),
            },
        }
    }

    #[test]
    fn single_tier_program_yields_one_slice() {
        let mut a = IrInstruction::new(0, Opcode::StoreMemory);
        a.dest = Some(0);
        a.required_tier = Some(NodeTier::Linux);
        let mut r = IrInstruction::new(1, Opcode::Return);
        r.src = vec![0];
        r.required_tier = Some(NodeTier::Linux);
        let artifact = artifact_with(vec![a, r]);
        let plan = plan(&artifact, NodeTier::Linux);
        assert_eq!(plan.slices.len(), 1);
        assert!(!plan.is_distributed);
    }

    #[test]
    fn tier_change_produces_multiple_slices_and_a_sync_point() {
        let mut a = IrInstruction::new(0, Opcode::CallAction);
        a.dest = Some(0);
        a.required_tier = Some(NodeTier::Mcu);
        let mut b = IrInstruction::new(1, Opcode::Transform);
        b.dest = Some(1);
        b.src = vec![0];
        b.required_tier = Some(NodeTier::Central);
        let mut r = IrInstruction::new(2, Opcode::Return);
        r.src = vec![1];
        r.required_tier = Some(NodeTier::Central);
        let artifact = artifact_with(vec![a, b, r]);
        let plan = plan(&artifact, NodeTier::Central);
        assert_eq!(plan.slices.len(), 2);
        assert!(plan.is_distributed);
        assert_eq!(plan.sync_points.len(), 1);
    }
}
