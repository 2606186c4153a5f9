//! Register-based Semantic Virtual Machine (spec Component G): the
//! interpreter a CENTRAL/LINUX/MCU node runs an `llmir_core::Artifact`
//! through, plus the ambient stack around it — audit chain, vault client,
//! fallback engine, offline buffer, health monitor, priority arbitration,
//! and the physical-action handler.
//!
//! One interpreter, parameterized by node tier and the collaborator traits
//! in [`collab`], rather than a separate binary per tier.

pub mod audit;
pub mod collab;
pub mod config;
pub mod distributed;
pub mod fallback;
pub mod health;
pub mod interp;
pub mod offline;
pub mod physical;
pub mod priority;
pub mod vault;

pub use audit::{AuditChain, AuditEvent};
pub use config::Config;
pub use distributed::DistributedExecutor;
pub use fallback::{FallbackEngine, FallbackResult, FallbackStrategy, InstructionFallbackConfig};
pub use health::{run as run_health_server, HealthState};
pub use interp::{Interpreter, Registers};
pub use offline::{BufferedEvent, OfflineBuffer};
pub use physical::{evaluate_postcondition, time_window_allows, PhysicalActionHandler, PhysicalOutcome};
pub use priority::PriorityArbiter;
pub use vault::{SecretSource, SecretValue, VaultClient};
