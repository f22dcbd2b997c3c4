//! Bookkeeper Core
//!
//! Data model shared by the Bookkeeper state backend and its command line:
//! stack checkpoints and deployments, resource URNs, update records, the
//! engine and secrets seams, project discovery and the versioned registry.

pub mod deployment;
pub mod engine;
pub mod project;
pub mod registry;
pub mod secrets;
pub mod tokens;
pub mod update;

pub use deployment::{
    Checkpoint, CheckpointError, ResourceState, SecretsProviders, Snapshot, UntypedDeployment,
};
pub use engine::{Engine, EngineError, EngineOutput, UpdateContext, UpdateOptions};
pub use project::{Project, ProjectError, ProjectLoader, WorkspaceProjectLoader};
pub use tokens::Urn;
pub use update::{UpdateInfo, UpdateKind, UpdateResult};
