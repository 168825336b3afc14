pub mod config;
pub mod control;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod metrics;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod testing;
pub mod work;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use control::{
    AddSubmissionRequest, BatchAnalytics, CreateBatchRequest, CreateJobRequest, EngineError,
    Page, ProviderBreakdown, WorkController, WorkQuery,
};
pub use events::{
    create_event_system, EngineEvent, EventEnvelope, EventError, EventFilter, EventHandle,
    EventRecord, EventStore, EventSubject, EventWriter, SqliteEventStore,
};
pub use executor::{
    ErrorKind, ExecutionError, ExecutionOutput, ExecutionRequest, Executor, ExecutorBackend,
    ExecutorConfig, HttpExecutor, HttpExecutorConfig,
};
pub use lifecycle::{Action, EntityKind, SubmissionStatus, TransitionError, WorkStatus};
pub use progress::ProgressAggregator;
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
pub use scheduler::{LaneConfig, Scheduler, SchedulerConfig, SchedulerError, SchedulerStatus};
pub use work::{
    Batch, BatchFilter, Job, JobFilter, Progress, SqliteWorkStore, StoreError, Submission,
    SubmissionError, SubmissionFilter, WorkStore,
};
