pub mod checkpoint;
pub mod controller;
pub mod hooks;
pub mod kernel;
pub mod navigator;
pub mod registry;
pub mod run_log;
pub mod services;
pub mod status;
pub mod work_unit;

pub use checkpoint::{select_checkpoint_algorithm, ItemCheckpoint, ItemTimeCheckpoint, TimeCheckpoint};
pub use controller::{Controller, CurrentController, ElementStatus, JobController, StepFailure};
pub use hooks::{run_hooks, ShellHookListener};
pub use kernel::BatchKernel;
pub use navigator::{glob_matches, Navigator, Transition};
pub use registry::ArtifactRegistry;
pub use run_log::{RunLogger, RunTarget};
pub use services::ExecutionServices;
pub use status::JobStatusManager;
pub use work_unit::{CompletedWork, WorkUnit};
