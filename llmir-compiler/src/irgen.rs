//! Stage B — lowers an intent tree into a flat, register-allocated IR artifact.
//!
//! The register-file model and instruction vocabulary match exactly what
//! the interpreter in `llmir-svm` consumes, so the generator and the
//! interpreter agree on every operand by construction.

use std::collections::BTreeMap;

use llmir_core::{Artifact, ArtifactMetadata, IrInstruction, Opcode};
use serde_json::Value;

/// The pre-compilation intent tree a user-facing planner hands to the compiler.
/// Each node allocates its own destination register(s); children reference
/// parent registers by position.
#[derive(Debug, Clone)]
pub enum IntentNode {
    Sequence(Vec<IntentNode>),
    LoadResource { service_id: String, operands: Value },
    StoreMemory { value: Value },
    CallService { service_id: String, service_version: semver::Version, input: Box<IntentNode>, operands: Value },
    /// `operands` carries the literal `PhysicalActionOperands` JSON (target,
    /// command, payload, time_window, cancellation_window_ms, postcondition,
    /// requires_human_approval, postcondition_fallback — spec §4.G).
    CallAction { service_id: String, service_version: semver::Version, input: Box<IntentNode>, operands: Value },
    CallTool { service_id: String, service_version: semver::Version, input: Box<IntentNode>, operands: Value },
    LlmCall { service_id: String, service_version: semver::Version, input: Box<IntentNode>, operands: Value },
    Transform { input: Box<IntentNode>, operands: Value },
    Validate { input: Box<IntentNode>, schema: Value },
    Aggregate { inputs: Vec<IntentNode>, operands: Value },
    Filter { input: Box<IntentNode>, operands: Value },
    Branch { condition: Box<IntentNode>, if_true: Box<IntentNode>, if_false: Box<IntentNode> },
    Loop { iterator: Box<IntentNode>, body: Box<IntentNode>, max_iterations: u8, timeout_ms: u64 },
    Parallel(Vec<IntentNode>),
    Register(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum IrGenError {
    #[error("intent tree references undefined register r{0}")]
    UndefinedRegister(u8),
    #[error("empty sequence has no output register")]
    EmptySequence,
}

struct Generator {
    next_register: u8,
    next_index: u32,
    instructions: BTreeMap<u32, IrInstruction>,
    order: Vec<u32>,
    deps: BTreeMap<u32, Vec<u32>>,
    parallel_groups: Vec<u32>,
}

impl Generator {
    fn new() -> Self {
        Self {
            next_register: 0,
            next_index: 0,
            instructions: BTreeMap::new(),
            order: Vec::new(),
            deps: BTreeMap::new(),
            parallel_groups: Vec::new(),
        }
    }

    fn alloc_register(&mut self) -> u8 {
        let r = self.next_register;
        self.next_register = self.next_register.saturating_add(1);
        r
    }

    fn push(&mut self, mut instr: IrInstruction, predecessors: Vec<u32>) -> u32 {
        let idx = self.next_index;
        self.next_index += 1;
        instr.index = idx;
        self.instructions.insert(idx, instr);
        self.order.push(idx);
        self.deps.insert(idx, predecessors);
        idx
    }

    /// Lower a node, returning the register holding its result.
    fn lower(&mut self, node: &IntentNode) -> Result<u8, IrGenError> {
        match node {
            IntentNode::Register(r) => Ok(*r),

            IntentNode::Sequence(nodes) => {
                let mut last = None;
                for n in nodes {
                    last = Some(self.lower(n)?);
                }
                last.ok_or(IrGenError::EmptySequence)
            }

            IntentNode::LoadResource { service_id, operands } => {
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, Opcode::LoadResource);
                instr.dest = Some(dest);
                instr.service_id = Some(service_id.clone());
                instr.operands = operands.clone();
                self.push(instr, Vec::new());
                Ok(dest)
            }

            IntentNode::StoreMemory { value } => {
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, Opcode::StoreMemory);
                instr.dest = Some(dest);
                instr.operands = value.clone();
                self.push(instr, Vec::new());
                Ok(dest)
            }

            IntentNode::CallService { service_id, service_version, input, operands }
            | IntentNode::CallAction { service_id, service_version, input, operands }
            | IntentNode::CallTool { service_id, service_version, input, operands }
            | IntentNode::LlmCall { service_id, service_version, input, operands } => {
                let opcode = match node {
                    IntentNode::CallService { .. } => Opcode::CallService,
                    IntentNode::CallAction { .. } => Opcode::CallAction,
                    IntentNode::CallTool { .. } => Opcode::CallTool,
                    IntentNode::LlmCall { .. } => Opcode::LlmCall,
                    _ => unreachable!(),
                };
                let src_reg = self.lower(input)?;
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, opcode);
                instr.dest = Some(dest);
                instr.src = vec![src_reg];
                instr.service_id = Some(service_id.clone());
                instr.service_version = Some(service_version.clone());
                instr.operands = operands.clone();
                let pred = self.predecessor_of(src_reg);
                self.push(instr, pred.into_iter().collect());
                Ok(dest)
            }

            IntentNode::Transform { input, operands } => {
                let src_reg = self.lower(input)?;
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, Opcode::Transform);
                instr.dest = Some(dest);
                instr.src = vec![src_reg];
                instr.operands = operands.clone();
                let pred = self.predecessor_of(src_reg);
                self.push(instr, pred.into_iter().collect());
                Ok(dest)
            }

            IntentNode::Validate { input, schema } => {
                let src_reg = self.lower(input)?;
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, Opcode::Validate);
                instr.dest = Some(dest);
                instr.src = vec![src_reg];
                instr.operands = schema.clone();
                let pred = self.predecessor_of(src_reg);
                self.push(instr, pred.into_iter().collect());
                Ok(dest)
            }

            IntentNode::Aggregate { inputs, operands } => {
                let mut src_regs = Vec::with_capacity(inputs.len());
                for n in inputs {
                    src_regs.push(self.lower(n)?);
                }
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, Opcode::Aggregate);
                instr.dest = Some(dest);
                instr.src = src_regs.clone();
                instr.operands = operands.clone();
                let preds = src_regs.iter().filter_map(|r| self.predecessor_of(*r)).collect();
                self.push(instr, preds);
                Ok(dest)
            }

            IntentNode::Filter { input, operands } => {
                let src_reg = self.lower(input)?;
                let dest = self.alloc_register();
                let mut instr = IrInstruction::new(0, Opcode::Filter);
                instr.dest = Some(dest);
                instr.src = vec![src_reg];
                instr.operands = operands.clone();
                let pred = self.predecessor_of(src_reg);
                self.push(instr, pred.into_iter().collect());
                Ok(dest)
            }

            IntentNode::Branch { condition, if_true, if_false } => {
                let cond_reg = self.lower(condition)?;
                let dest = self.alloc_register();

                let mut branch_instr = IrInstruction::new(0, Opcode::Branch);
                branch_instr.src = vec![cond_reg];
                let pred = self.predecessor_of(cond_reg);
                let branch_idx = self.push(branch_instr, pred.into_iter().collect());

                let true_reg = self.lower(if_true)?;
                let mut copy_true = IrInstruction::new(0, Opcode::StoreMemory);
                copy_true.dest = Some(dest);
                copy_true.src = vec![true_reg];
                let true_copy_idx = self.push(copy_true, vec![branch_idx]);

                let mut jump_over = IrInstruction::new(0, Opcode::Jump);
                let jump_idx = self.push(jump_over, vec![true_copy_idx]);

                let false_branch_target = self.next_index;
                let false_reg = self.lower(if_false)?;
                let mut copy_false = IrInstruction::new(0, Opcode::StoreMemory);
                copy_false.dest = Some(dest);
                copy_false.src = vec![false_reg];
                let false_copy_idx = self.push(copy_false, vec![branch_idx]);

                let after = self.next_index;
                self.instructions.get_mut(&branch_idx).unwrap().target_instruction = Some(false_branch_target);
                self.instructions.get_mut(&jump_idx).unwrap().target_instruction = Some(after);
                let _ = false_copy_idx;
                Ok(dest)
            }

            IntentNode::Loop { iterator, body, max_iterations, timeout_ms } => {
                let iter_reg = self.lower(iterator)?;
                let dest = self.alloc_register();

                let mut loop_instr = IrInstruction::new(0, Opcode::Loop);
                loop_instr.dest = Some(dest);
                let pred = self.predecessor_of(iter_reg);
                let loop_idx = self.push(loop_instr, pred.into_iter().collect());

                let body_start = self.next_index;
                let body_reg = self.lower(body)?;
                let mut copy_body = IrInstruction::new(0, Opcode::StoreMemory);
                copy_body.dest = Some(dest);
                copy_body.src = vec![body_reg];
                self.push(copy_body, vec![loop_idx]);

                let exit_index = self.next_index;
                self.instructions.get_mut(&loop_idx).unwrap().loop_operands = Some(llmir_core::LoopOperands {
                    iterator_register: iter_reg,
                    max_iterations: *max_iterations,
                    timeout_ms: *timeout_ms,
                    body_start_index: body_start,
                    exit_index,
                    convergence_predicate: None,
                    fallback_instruction: None,
                });
                Ok(dest)
            }

            IntentNode::Parallel(branches) => {
                let mut spawn = IrInstruction::new(0, Opcode::ParallelSpawn);
                let group_id = self.next_index;
                spawn.parallel_group_id = Some(group_id);
                let spawn_idx = self.push(spawn, Vec::new());
                self.parallel_groups.push(spawn_idx);

                let mut branch_regs = Vec::with_capacity(branches.len());
                for b in branches {
                    branch_regs.push(self.lower(b)?);
                }

                let dest = self.alloc_register();
                let mut merge = IrInstruction::new(0, Opcode::ParallelMerge);
                merge.dest = Some(dest);
                merge.src = branch_regs.clone();
                merge.parallel_group_id = Some(group_id);
                let preds = branch_regs.iter().filter_map(|r| self.predecessor_of(*r)).collect();
                self.push(merge, preds);
                Ok(dest)
            }
        }
    }

    fn predecessor_of(&self, register: u8) -> Option<u32> {
        self.instructions
            .values()
            .rev()
            .find(|i| i.dest == Some(register))
            .map(|i| i.index)
    }
}

/// Lower an intent tree into an unresolved `Artifact` (service resolution,
/// verification, sealing and planning are separate pipeline stages).
pub fn generate(
    root: &IntentNode,
    workflow_id: impl Into<String>,
    workflow_version: u32,
    source: impl Into<String>,
    compiler_version: impl Into<String>,
    compiled_at: chrono::DateTime<chrono::Utc>,
) -> Result<Artifact, IrGenError> {
    let mut gen = Generator::new();
    let output_register = gen.lower(root)?;

    let mut return_instr = IrInstruction::new(0, Opcode::Return);
    return_instr.src = vec![output_register];
    gen.push(return_instr, Vec::new());

    Ok(Artifact {
        instructions: gen.instructions,
        instruction_order: gen.order,
        dependency_graph: gen.deps,
        resource_table: BTreeMap::new(),
        parallel_groups: gen.parallel_groups,
        schemas: BTreeMap::new(),
        input_registers: Vec::new(),
        output_register,
        distribution_plan: None,
        metadata: ArtifactMetadata {
            compiled_at,
            compiler_version: compiler_version.into(),
            workflow_id: workflow_id.into(),
            workflow_version,
            source: source.into(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc)
    }

    #[test]
    fn sequence_of_service_calls_lowers_in_order() {
        let tree = IntentNode::Sequence(vec![
            IntentNode::LoadResource { service_id: "core.http-notify".into(), operands: Value::Null },
            IntentNode::CallService {
                service_id: "core.http-notify".into(),
                service_version: semver::Version::new(1, 0, 0),
                input: Box::new(IntentNode::Register(0)),
                operands: Value::Null,
            },
        ]);
        let artifact = generate(&tree, "wf-1", 1, "test", "0.1.0", fixed_time()).unwrap();
        assert_eq!(artifact.instruction_order.len(), 3); // load, call_service, return
        assert_eq!(artifact.instructions[&2].opcode, Opcode::Return);
    }

    #[test]
    fn branch_emits_both_arms_and_a_merge_jump() {
        let tree = IntentNode::Branch {
            condition: Box::new(IntentNode::StoreMemory { value: Value::Bool(true) }),
            if_true: Box::new(IntentNode::StoreMemory { value: Value::from(1) }),
            if_false: Box::new(IntentNode::StoreMemory { value: Value::from(2) }),
        };
        let artifact = generate(&tree, "wf-2", 1, "test", "0.1.0", fixed_time()).unwrap();
        let branch_count = artifact.instructions.values().filter(|i| i.opcode == Opcode::Branch).count();
        assert_eq!(branch_count, 1);
    }

    #[test]
    fn loop_emits_mandatory_loop_operands() {
        let tree = IntentNode::Loop {
            iterator: Box::new(IntentNode::StoreMemory { value: Value::from(0) }),
            body: Box::new(IntentNode::StoreMemory { value: Value::from(1) }),
            max_iterations: 3,
            timeout_ms: 1_000,
        };
        let artifact = generate(&tree, "wf-3", 1, "test", "0.1.0", fixed_time()).unwrap();
        let loop_instr = artifact.instructions.values().find(|i| i.opcode == Opcode::Loop).unwrap();
        assert!(loop_instr.loop_operands.is_some());
    }
}
