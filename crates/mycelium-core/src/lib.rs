pub mod config;
pub mod events;
pub mod fingerprint;
pub mod manifest;
pub mod types;

pub use config::{ConfigError, ProjectConfig};
pub use fingerprint::compute_fingerprint;
pub use manifest::{TaskManifest, TaskSpec, TaskStage, TddMode};
pub use types::{
    BatchRecord, BatchStatus, CanaryOutcome, CheckpointCommit, ContainerDisposition,
    DoctorTrigger, EnforcementMode, HumanReview, LedgerEntry, LedgerStatus, RunId, RunState,
    RunStatus, StopInfo, StopReason, TaskId, TaskState, TaskStatus, UsageTotals, ValidatorResult,
    ValidatorStatus,
};
