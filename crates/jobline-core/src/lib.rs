pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod graph;
pub mod records;
pub mod status;
pub mod traits;

pub use config::AppConfig;
pub use context::{JobContext, StepContext};
pub use error::{BatchError, Result};
pub use event::{BatchEvent, EventBus};
pub use graph::{
    CheckpointPolicy, ChunkConfig, Decision, ExecutionElement, Flow, JobDefinition, Split, Step,
    TransitionAction, TransitionRule,
};
pub use records::{JobExecution, JobInstance, JobStatus, Metrics, StepExecution, StepStatus};
pub use status::BatchStatus;
