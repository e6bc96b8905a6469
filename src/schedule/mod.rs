pub mod error;
pub mod events;
pub mod pipeline;
pub mod processors;
pub mod scheduler;
pub mod source;
pub mod stats;
pub mod types;
pub mod workspace;

#[cfg(test)]
mod tests;

pub use error::TaskError;
pub use events::EventLog;
pub use pipeline::{CancelFlag, PipelineRunner, RunOutcome};
pub use processors::{default_stages, Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess};
pub use scheduler::{TaskManager, TaskScheduler};
pub use stats::StatsAggregator;
pub use types::{
    EventType, Progress, StatusCounts, Step, Task, TaskEvent, TaskMetrics, TaskPatch, TaskQuery, TaskStats,
    TaskStatus,
};
pub use workspace::Workspace;
