//! The compiler pipeline: intent tree -> resolved, verified, sealed,
//! distribution-planned artifact (spec Components B through F).

pub mod irgen;
pub mod plan;
pub mod resolve;
pub mod seal;
pub mod verify;

pub use irgen::{generate, IntentNode, IrGenError};
pub use plan::plan as distribution_plan;
pub use resolve::resolve;
pub use seal::{open, seal, SealError, FORMAT_VERSION};
pub use verify::verify;

use ed25519_dalek::SigningKey;
use llmir_core::{Artifact, CompileReport, NodeTier, SafetyLevel};
use llmir_registry::ServiceRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("IR generation failed: {0}")]
    Generation(#[from] IrGenError),
    #[error("compilation failed with {} error(s)", .0.errors.len())]
    Compile(CompileReport),
    #[error("sealing failed: {0}")]
    Seal(#[from] seal::SealError),
}

/// Run resolution, verification, and planning over an already-generated
/// artifact, then seal it. Stops at the first stage that fails with errors
/// (warnings never block the pipeline).
pub fn compile(
    mut artifact: Artifact,
    registry: &ServiceRegistry,
    default_tier: NodeTier,
    signing_key: &SigningKey,
) -> Result<(Artifact, Vec<u8>, CompileReport), PipelineError> {
    let mut report = resolve::resolve(&mut artifact, registry, default_tier);
    if !report.passed() {
        return Err(PipelineError::Compile(report));
    }

    let verify_report = verify::verify(&artifact, SafetyLevel::Error);
    report.merge(verify_report);
    if !report.passed() {
        return Err(PipelineError::Compile(report));
    }

    artifact.distribution_plan = Some(plan::plan(&artifact, default_tier));
    let sealed = seal::seal(&artifact, signing_key)?;
    Ok((artifact, sealed, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn fixed_time() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc)
    }

    #[test]
    fn end_to_end_pipeline_on_a_trivial_program() {
        let tree = IntentNode::Sequence(vec![
            IntentNode::LoadResource { service_id: "core.http-notify".into(), operands: serde_json::Value::Null },
            IntentNode::CallService {
                service_id: "core.http-notify".into(),
                service_version: semver::Version::new(1, 0, 0),
                input: Box::new(IntentNode::Register(0)),
                operands: serde_json::Value::Null,
            },
        ]);
        let artifact = generate(&tree, "wf-e2e", 1, "test", "0.1.0", fixed_time()).unwrap();
        let registry = ServiceRegistry::new();
        let key = SigningKey::generate(&mut OsRng);
        let (compiled, sealed, report) = compile(artifact, &registry, NodeTier::Linux, &key).unwrap();
        assert!(report.passed());
        assert!(compiled.distribution_plan.is_some());

        let reopened = open(&sealed, &key.verifying_key(), FORMAT_VERSION).unwrap();
        assert_eq!(reopened.metadata.workflow_id, "wf-e2e");
    }

    #[test]
    fn pipeline_rejects_a_physical_action_that_violates_a_block_level_safety_constraint() {
        use llmir_core::{
            BehaviouralContract, ExecutionDescriptor, NodeRequirements, Port, PortType, RetryPolicy, SafetyConstraint,
            SafetyLevel as ManifestSafetyLevel, ServiceManifest,
        };

        let manifest = ServiceManifest {
            id: "plant.close-valve".into(),
            version: semver::Version::new(1, 0, 0),
            category: "action".into(),
            inputs: vec![Port { name: "pressure".into(), semantic_type: PortType::Number, required: true, default: None }],
            outputs: vec![Port { name: "state".into(), semantic_type: PortType::Boolean, required: true, default: None }],
            descriptors: vec![ExecutionDescriptor::EmbeddedScript {
                code: "close_valve(3)".into(),
                allowed_modules: vec!["valves".into()],
                hard_timeout_ms: 500,
                compatible_tiers: vec![NodeTier::Mcu, NodeTier::Linux],
            }],
            node_requirements: NodeRequirements { tiers: vec![NodeTier::Linux, NodeTier::Mcu], ..Default::default() },
            contract: BehaviouralContract {
                deterministic: true,
                idempotent: false,
                has_external_side_effects: true,
                nominal_latency_ms: Some(50),
                hard_timeout_ms: 500,
                retry_policy: RetryPolicy { max_attempts: 1, backoff_base_ms: 0 },
            },
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            safety_constraints: vec![SafetyConstraint {
                id: "pressure-safety".into(),
                level: ManifestSafetyLevel::Block,
                predicate: "pressure < 10".into(),
            }],
            requires_human_confirmation: true,
            reversible: false,
            trusted: true,
            signature: None,
        };

        let registry = ServiceRegistry::new();
        registry.register(manifest).unwrap();

        let tree = IntentNode::Sequence(vec![
            IntentNode::StoreMemory { value: serde_json::json!({"pressure": 12}) },
            IntentNode::CallAction {
                service_id: "plant.close-valve".into(),
                service_version: semver::Version::new(1, 0, 0),
                input: Box::new(IntentNode::Register(0)),
                operands: serde_json::json!({"pressure": 12}),
            },
        ]);
        let artifact = generate(&tree, "wf-safety", 1, "test", "0.1.0", fixed_time()).unwrap();
        let key = SigningKey::generate(&mut OsRng);

        let err = compile(artifact, &registry, NodeTier::Linux, &key).unwrap_err();
        match err {
            PipelineError::Compile(report) => {
                assert!(report.errors.iter().any(|e| e.rule_id == "SAFE-pressure-safety"));
            }
            other => panic!("expected a compile-stage rejection, got {other:?}"),
        }
    }
}
