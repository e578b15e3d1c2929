//! Project lifecycle orchestration over a container engine.
//!
//! The engine is the only source of truth: every read rebuilds state from labeled
//! resources, and every mutating operation runs under a per-project lease.

pub mod config;
pub mod context;
pub mod labels;
pub mod notifier;
pub mod orchestrator;
pub mod serializer;
pub mod state;

pub use kibutsu_common as common;
pub use kibutsu_engine as engine;

pub use config::OrchestratorConfig;
pub use context::OperationContext;
pub use labels::ResourceIdentity;
pub use notifier::ChangeNotifier;
pub use orchestrator::{LogsOptions, Orchestrator};
pub use serializer::{OperationSerializer, ProjectLease};
pub use state::{ProjectReader, ProjectSnapshot};
