//! Shared LLM-IR data model: manifests, descriptors, instructions, artifacts,
//! distribution plans, the deterministic wire format, and the error taxonomy
//! that every other crate in this workspace (registry, compiler, svm, node,
//! mcu) builds on.

pub mod artifact;
pub mod descriptor;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod instruction;
pub mod manifest;
pub mod plan;
pub mod wire;

pub use artifact::{Artifact, ArtifactMetadata};
pub use descriptor::{DynamicSlot, ExecutionDescriptor, FewShotExample, HttpAuth, PlatformBinary, ServiceFormat};
pub use dispatch::{SliceDispatchPayload, SliceResultPayload, SliceStatus};
pub use error::{CompileError, CompileReport, RuntimeError, RuntimeErrorCode, Severity};
pub use instruction::{
    ConvergencePredicate, DispatchMetadata, IrInstruction, LoopOperands, Opcode, PhysicalActionOperands,
    PostconditionSpec, PredicateOperator, PriorityLevel, PriorityPolicy, RegisterType, TimeWindow,
};
pub use manifest::{
    is_valid_service_id, BehaviouralContract, FormalPredicate, NodeRequirements, NodeTier, Port, PortType,
    RetryPolicy, SafetyConstraint, SafetyLevel, ServiceManifest,
};
pub use plan::{DistributionPlan, InboundFlow, InputBinding, OnTimeout, Slice, SyncPoint};
pub use wire::{SignedArtifact, WireError};
