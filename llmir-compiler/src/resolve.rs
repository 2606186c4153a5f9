//! Stage C ("Stage 7") — resolves every service-calling instruction
//! against the registry, attaching `dispatch_metadata` and the selected
//! descriptor's compatible tier.
//!
//! Uses the registry's `resolve_for_node` (picks the first compatible
//! descriptor) and propagates the vault path the interpreter's credential
//! injection expects to find already sitting on
//! `dispatch_metadata.credentials_vault_path` by the time the SVM runs it.

use llmir_core::{Artifact, CompileError, CompileReport, DispatchMetadata, NodeTier};
use llmir_registry::ServiceRegistry;

/// Resolve every `is_service_call()` instruction in `artifact` against `registry`.
/// Errors are aggregated into the returned report rather than short-circuiting,
/// so a single compile pass surfaces every unresolved service at once.
pub fn resolve(artifact: &mut Artifact, registry: &ServiceRegistry, default_tier: NodeTier) -> CompileReport {
    let mut report = CompileReport::default();
    let indices: Vec<u32> = artifact.instruction_order.clone();

    for idx in indices {
        let Some(instr) = artifact.instructions.get(&idx) else { continue };
        if !instr.is_service_call() {
            continue;
        }
        let Some(service_id) = instr.service_id.clone() else {
            report.push(
                CompileError::error(
                    "RESOLVE-001",
                    "service-calling instruction has no service_id",
                    "set service_id on the CALL_SERVICE/CALL_ACTION/CALL_TOOL/LLM_CALL instruction",
                )
                .at_instruction(idx),
            );
            continue;
        };

        let tier = instr.required_tier.unwrap_or(default_tier);
        match registry.resolve_for_node(&service_id, tier) {
            Ok((manifest, descriptor_idx)) => {
                let descriptor = manifest.descriptors[descriptor_idx].clone();
                let target_tier = descriptor
                    .compatible_tiers()
                    .iter()
                    .copied()
                    .find(|t| t.satisfies(tier))
                    .unwrap_or(tier);

                let vault_path = match &descriptor {
                    llmir_core::ExecutionDescriptor::LlmCall { vault_path, .. } => Some(vault_path.clone()),
                    llmir_core::ExecutionDescriptor::Http { auth: Some(auth), .. } => auth.vault_path.clone(),
                    _ => None,
                };

                let dm = DispatchMetadata {
                    selected_descriptor: descriptor,
                    timeout_ms: manifest.contract.hard_timeout_ms,
                    retry_policy: manifest.contract.retry_policy.clone(),
                    target_tier,
                    service_id: manifest.id.clone(),
                    service_version: manifest.version.clone(),
                    credentials_vault_path: vault_path,
                    safety_constraints: manifest.safety_constraints.clone(),
                    preconditions: manifest.preconditions.clone(),
                };

                if let Some(instr) = artifact.instructions.get_mut(&idx) {
                    instr.dispatch_metadata = Some(dm);
                    instr.required_tier = Some(target_tier);
                    if manifest.requires_human_confirmation {
                        instr.required_capabilities.push("requires_human_confirmation".to_owned());
                    }
                }
            }
            Err(e) => {
                report.push(
                    CompileError::error("RESOLVE-002", format!("resolution failed: {e}"), "register a compatible service manifest or retarget the instruction's required_tier")
                        .at_instruction(idx)
                        .with_service(service_id),
                );
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmir_core::{ArtifactMetadata, IrInstruction, Opcode};
    use std::collections::BTreeMap;

    fn empty_artifact() -> Artifact {
        Artifact {
            instructions: BTreeMap::new(),
            instruction_order: Vec::new(),
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
                workflow_id: "wf".into(),
                workflow_version: 1,
                source: "test".into(),
            },
        }
    }

    #[test]
    fn resolves_known_service_and_attaches_dispatch_metadata() {
        let registry = ServiceRegistry::new();
        let mut artifact = empty_artifact();
        let mut instr = IrInstruction::new(0, Opcode::CallService);
        instr.service_id = Some("core.http-notify".to_owned());
        instr.dest = Some(0);
        artifact.instructions.insert(0, instr);
        artifact.instruction_order.push(0);

        let report = resolve(&mut artifact, &registry, NodeTier::Linux);
        assert!(report.passed());
        assert!(artifact.instructions[&0].dispatch_metadata.is_some());
    }

    #[test]
    fn unknown_service_produces_compile_error() {
        let registry = ServiceRegistry::new();
        let mut artifact = empty_artifact();
        let mut instr = IrInstruction::new(0, Opcode::CallService);
        instr.service_id = Some("nonexistent.service".to_owned());
        artifact.instructions.insert(0, instr);
        artifact.instruction_order.push(0);

        let report = resolve(&mut artifact, &registry, NodeTier::Linux);
        assert!(!report.passed());
        assert_eq!(report.errors[0].rule_id, "RESOLVE-002");
    }
}
