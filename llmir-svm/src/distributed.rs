//! Distributed execution path (spec §4.F/§4.G "Distributed path"). Drives
//! the central slice's instructions one at a time via [`Interpreter::step`],
//! dispatching remote slices to other nodes as each sync point is reached
//! and merging their output registers back before resuming.
//!
//! A sealed artifact with no `distribution_plan`, or one whose
//! `is_distributed` is `false`, degenerates to exactly the monolithic
//! `Interpreter::execute` path — the single-slice case is just an
//! intra-process fork/join.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use llmir_core::{Artifact, DistributionPlan, OnTimeout, Slice, SliceDispatchPayload, SliceResultPayload, SliceStatus, SyncPoint};

use crate::collab::{NodeRegistry, RemoteSliceDispatcher};
use crate::interp::{Interpreter, Registers};

pub struct DistributedExecutor {
    interp: Interpreter,
    dispatcher: Arc<dyn RemoteSliceDispatcher>,
    node_registry: Arc<dyn NodeRegistry>,
}

impl DistributedExecutor {
    pub fn new(interp: Interpreter, dispatcher: Arc<dyn RemoteSliceDispatcher>, node_registry: Arc<dyn NodeRegistry>) -> Self {
        Self { interp, dispatcher, node_registry }
    }

    /// Run `artifact` to completion, taking the central slice through its
    /// own instruction order and draining every sync point it crosses.
    pub async fn execute(&self, artifact: &Artifact) -> Result<(Registers, u64)> {
        let Some(plan) = artifact.distribution_plan.as_ref().filter(|p| p.is_distributed) else {
            return self.interp.execute(artifact).await;
        };

        let central = plan.central_slice().ok_or_else(|| anyhow!("distribution plan \"{}\" has no central slice", plan.plan_id))?;
        info!(
            "[Distributed] plan={} slices={} nodes={} central_slice={}",
            plan.plan_id,
            plan.slices.len(),
            plan.node_count,
            central.slice_id
        );

        let workflow_id = artifact.metadata.workflow_id.clone();
        let mut regs: Registers = HashMap::new();
        let start = Instant::now();
        let order = &central.instruction_order;
        let mut drained: HashSet<String> = HashSet::new();
        let mut ip = 0usize;

        while ip < order.len() {
            let idx = order[ip];

            for sync_point in &plan.sync_points {
                if sync_point.pause_before_instruction_index == idx && drained.insert(sync_point.sync_id.clone()) {
                    self.drain_sync_point(artifact, plan, sync_point, &mut regs).await?;
                }
            }

            ip = self.interp.step(artifact, order, ip, &mut regs).await?;
        }

        let elapsed = start.elapsed().as_millis() as u64;
        info!("[Distributed] workflow={workflow_id} plan={} done in {elapsed}ms", plan.plan_id);
        Ok((regs, elapsed))
    }

    async fn drain_sync_point(&self, artifact: &Artifact, plan: &DistributionPlan, sync_point: &SyncPoint, regs: &mut Registers) -> Result<()> {
        for slice_id in &sync_point.await_slice_ids {
            let Some(slice) = plan.slice(slice_id) else {
                warn!("[Distributed] sync point \"{}\" awaits unknown slice \"{slice_id}\"", sync_point.sync_id);
                continue;
            };

            let payload = self.build_payload(&plan.plan_id, slice, artifact, regs);
            let deadline = Duration::from_millis(slice.estimated_duration_ms.max(1) * 3);

            match tokio::time::timeout(deadline, self.dispatcher.dispatch(&slice.target_node_id, payload)).await {
                Ok(Ok(result)) => self.merge_result(sync_point, slice, &result, regs),
                Ok(Err(e)) => {
                    warn!(
                        "[Distributed] dispatch of slice \"{}\" to \"{}\" failed: {e} — re-executing locally",
                        slice.slice_id, slice.target_node_id
                    );
                    self.node_registry.mark_offline(&slice.target_node_id);
                    self.run_slice_locally(artifact, slice, regs).await?;
                }
                Err(_elapsed) => {
                    warn!(
                        "[Distributed] slice \"{}\" on \"{}\" exceeded its {deadline:?} deadline",
                        slice.slice_id, slice.target_node_id
                    );
                    self.apply_timeout(sync_point, regs)?;
                }
            }
        }
        Ok(())
    }

    fn build_payload(&self, plan_id: &str, slice: &Slice, artifact: &Artifact, regs: &Registers) -> SliceDispatchPayload {
        let instructions = slice
            .instructions
            .iter()
            .filter_map(|idx| artifact.instructions.get(idx).map(|instr| (*idx, instr.clone())))
            .collect();
        let register_values = slice.input_bindings.keys().filter_map(|&r| regs.get(&r).map(|v| (r, v.clone()))).collect();

        SliceDispatchPayload {
            plan_id: plan_id.to_owned(),
            slice_id: slice.slice_id.clone(),
            instructions,
            instruction_order: slice.instruction_order.clone(),
            register_values,
            timeout_ms: slice.estimated_duration_ms.max(1) * 3,
            checksum: slice.checksum.clone(),
        }
    }

    /// Copy a successful remote result's output registers back into the
    /// central register file, per the sync point's inbound flows.
    fn merge_result(&self, sync_point: &SyncPoint, slice: &Slice, result: &SliceResultPayload, regs: &mut Registers) {
        if result.status == SliceStatus::Failure {
            warn!("[Distributed] slice \"{}\" reported failure: {:?}", slice.slice_id, result.error);
        }
        for flow in &sync_point.inbound_flows {
            if flow.from_node == slice.target_node_id {
                if let Some(v) = result.output_registers.get(&flow.from_register) {
                    regs.insert(flow.to_register, v.clone());
                }
            }
        }
    }

    /// Remote-slice failure fallback (spec §4.G): re-execute the slice's own
    /// instructions against the shared register file on this node, using
    /// the same `Interpreter::step` the slice would have run remotely — no
    /// register remapping is needed since a local run writes straight into
    /// the destinations the sync point's inbound flows would have targeted.
    async fn run_slice_locally(&self, artifact: &Artifact, slice: &Slice, regs: &mut Registers) -> Result<()> {
        let mut ip = 0usize;
        while ip < slice.instruction_order.len() {
            ip = self.interp.step(artifact, &slice.instruction_order, ip, regs).await?;
        }
        Ok(())
    }

    fn apply_timeout(&self, sync_point: &SyncPoint, regs: &mut Registers) -> Result<()> {
        match sync_point.on_timeout {
            OnTimeout::Fail => Err(anyhow!("sync point \"{}\" timed out awaiting a remote slice", sync_point.sync_id)),
            OnTimeout::Skip => Ok(()),
            OnTimeout::UseDefault => {
                let default = sync_point.default_value.clone().unwrap_or(serde_json::Value::Null);
                for flow in &sync_point.inbound_flows {
                    regs.insert(flow.to_register, default.clone());
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{
        InMemoryApprovalGate, InMemoryAuditSink, InMemoryCancellationBus, InMemoryNodeDispatcher, InMemoryNodeRegistry, InMemoryRemoteSliceDispatcher,
        InMemorySecretResolver,
    };
    use llmir_core::{ArtifactMetadata, InboundFlow, InputBinding, IrInstruction, Opcode};
    use std::collections::BTreeMap;

    fn interpreter() -> Interpreter {
        Interpreter::new(
            reqwest::Client::new(),
            "http://localhost:9999",
            "central",
            Arc::new(InMemorySecretResolver::new(Default::default())),
            Arc::new(InMemoryAuditSink::default()),
            Arc::new(InMemoryNodeDispatcher::default()),
            Arc::new(InMemoryCancellationBus::default()),
            Arc::new(InMemoryApprovalGate::default()),
        )
    }

    /// Builds a two-slice artifact: central computes register 0, a LINUX
    /// slice (instruction #1) is meant to double it into register 1, and
    /// central returns register 1.
    fn two_slice_artifact() -> (Artifact, DistributionPlan) {
        let mut load = IrInstruction::new(0, Opcode::LoadResource);
        load.operands = serde_json::json!(21);
        load.dest = Some(0);

        let mut remote = IrInstruction::new(1, Opcode::StoreMemory);
        remote.src = vec![0];
        remote.dest = Some(1);

        let mut ret = IrInstruction::new(2, Opcode::Return);
        ret.src = vec![1];

        let mut instructions = BTreeMap::new();
        instructions.insert(0, load);
        instructions.insert(1, remote);
        instructions.insert(2, ret);

        let artifact_order = vec![0, 1, 2];

        let central_slice = Slice {
            slice_id: "slice-0".into(),
            target_node_id: "CENTRAL".into(),
            instructions: vec![0, 2],
            instruction_order: vec![0, 2],
            input_bindings: BTreeMap::new(),
            output_bindings: vec![0],
            is_root: true,
            estimated_duration_ms: 10,
            checksum: "a".into(),
        };
        let remote_slice = Slice {
            slice_id: "slice-1".into(),
            target_node_id: "LINUX".into(),
            instructions: vec![1],
            instruction_order: vec![1],
            input_bindings: BTreeMap::from([(0, InputBinding::FromSlice { from_slice: "slice-0".into(), from_register: 0 })]),
            output_bindings: vec![1],
            is_root: false,
            estimated_duration_ms: 10,
            checksum: "b".into(),
        };

        let sync_point = SyncPoint {
            sync_id: "sync-0".into(),
            pause_before_instruction_index: 2,
            await_slice_ids: vec!["slice-1".into()],
            inbound_flows: vec![InboundFlow { from_node: "LINUX".into(), from_register: 1, to_register: 1 }],
            on_timeout: OnTimeout::Fail,
            default_value: None,
        };

        let plan = DistributionPlan {
            plan_id: "plan-test".into(),
            slices: vec![central_slice, remote_slice],
            sync_points: vec![sync_point],
            is_distributed: true,
            node_count: 2,
            estimated_total_latency_ms: 20,
        };

        let artifact = Artifact {
            instructions,
            instruction_order: artifact_order,
            dependency_graph: BTreeMap::new(),
            resource_table: BTreeMap::new(),
            parallel_groups: Vec::new(),
            schemas: BTreeMap::new(),
            input_registers: Vec::new(),
            output_register: 1,
            distribution_plan: Some(plan.clone()),
            metadata: ArtifactMetadata {
                compiled_at: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc),
                compiler_version: "0.1.0".into(),
                workflow_id: "wf-distributed".into(),
                workflow_version: 1,
                source: "test".into(),
            },
        };

        (artifact, plan)
    }

    #[tokio::test]
    async fn remote_slice_success_merges_output_register_into_central() {
        let (artifact, _plan) = two_slice_artifact();
        let dispatcher = Arc::new(InMemoryRemoteSliceDispatcher::default());
        dispatcher.set_success(
            "LINUX",
            SliceResultPayload {
                plan_id: "plan-test".into(),
                slice_id: "slice-1".into(),
                node_id: "LINUX".into(),
                status: SliceStatus::Success,
                output_registers: BTreeMap::from([(1, serde_json::json!(42))]),
                duration_ms: 5,
                audit_events: vec![],
                error: None,
            },
        );
        let registry = Arc::new(InMemoryNodeRegistry::default());
        let executor = DistributedExecutor::new(interpreter(), dispatcher.clone(), registry);

        let (regs, _elapsed) = executor.execute(&artifact).await.unwrap();
        assert_eq!(regs.get(&1), Some(&serde_json::json!(42)));
        assert_eq!(dispatcher.calls(), vec!["LINUX".to_owned()]);
    }

    #[tokio::test]
    async fn remote_dispatch_failure_falls_back_to_local_execution_and_marks_node_offline() {
        let (artifact, _plan) = two_slice_artifact();
        let dispatcher = Arc::new(InMemoryRemoteSliceDispatcher::default());
        dispatcher.set_failure("LINUX", "connection refused");
        let registry = Arc::new(InMemoryNodeRegistry::default());
        let executor = DistributedExecutor::new(interpreter(), dispatcher, registry.clone());

        let (regs, _elapsed) = executor.execute(&artifact).await.unwrap();
        // Locally re-executing instruction #1 (Transform on register 0 = 21)
        // writes register 1 directly, bypassing the inbound-flow merge.
        assert_eq!(regs.get(&1), Some(&serde_json::json!(21)));
        assert!(registry.is_offline("LINUX"));
    }

    #[tokio::test]
    async fn dispatcher_with_no_stubbed_outcome_is_treated_as_a_dispatch_failure_not_a_timeout() {
        let (artifact, _plan) = two_slice_artifact();
        // no outcome configured for "LINUX" -> dispatch() returns Err immediately,
        // which the executor recovers from via local re-execution rather than
        // the sync point's on_timeout policy.
        let dispatcher = Arc::new(InMemoryRemoteSliceDispatcher::default());
        let registry = Arc::new(InMemoryNodeRegistry::default());
        let executor = DistributedExecutor::new(interpreter(), dispatcher, registry.clone());
        let (regs, _elapsed) = executor.execute(&artifact).await.unwrap();
        assert_eq!(regs.get(&1), Some(&serde_json::json!(21)));
        assert!(registry.is_offline("LINUX"));
    }

    #[test]
    fn use_default_policy_fills_inbound_registers_with_the_configured_default() {
        let (_artifact, plan) = two_slice_artifact();
        let mut sync_point = plan.sync_points[0].clone();
        sync_point.on_timeout = OnTimeout::UseDefault;
        sync_point.default_value = Some(serde_json::json!("n/a"));

        let dispatcher = Arc::new(InMemoryRemoteSliceDispatcher::default());
        let registry = Arc::new(InMemoryNodeRegistry::default());
        let executor = DistributedExecutor::new(interpreter(), dispatcher, registry);

        let mut regs: Registers = HashMap::new();
        executor.apply_timeout(&sync_point, &mut regs).unwrap();
        assert_eq!(regs.get(&1), Some(&serde_json::json!("n/a")));
    }
}
