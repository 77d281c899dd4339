//! Lattice Core - Composite Build Execution Engine
//!
//! Features:
//! - Cross-build task requests with at-most-once execution per invocation
//! - Enqueue-all-then-await-all so independent builds run in parallel
//! - Worker leases released while a task waits on another build
//! - Cyclic cross-build requests rejected before they deadlock
//! - Up-to-date checks over normalized BLAKE3 input/output snapshots
//! - Previous-execution state persisted in sled
//! - Parallel file hashing with Rayon

pub mod artifact;
pub mod build;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod hasher;
pub mod identity;
pub mod lease;
pub mod registry;
pub mod scope;
pub mod snapshot;
pub mod store;
pub mod uptodate;

pub use artifact::{ArtifactBuilder, ComponentArtifact};
pub use build::{blocking, BuildDefinition, TaskAction, TaskContext, TaskDefinition};
pub use config::{
    default_state_dir, get_config_path, load_config, save_config, FailurePolicy, SchedulerConfig,
};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{BuildDefinitionError, ConfigError, CoordinatorError, FailureCause, SnapshotError, TaskFailure};
pub use executor::{BuildExecutor, LocalExecutor, TaskWork};
pub use hasher::Blake3Hasher;
pub use identity::{BuildIdentifier, TaskReference};
pub use lease::{ParkedLease, WorkerLease, WorkerPool};
pub use registry::{TaskRegistry, TaskState, TaskStatus};
pub use snapshot::{
    ContentNormalization, NormalizationStrategy, NormalizedSnapshot, PathNormalization, ResourceSpec,
    SnapshotHasher, TaskSnapshot,
};
pub use store::{MemorySnapshotStore, SledSnapshotStore, SnapshotStore};
pub use uptodate::{Decision, RunReason, UpToDateEvaluator};
