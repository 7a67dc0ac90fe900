//! Umbrella crate: re-exports the queue core and its transports under one
//! name for applications that embed the whole runtime.

pub use relay_api as api;
pub use relay_database as database;
pub use relay_graceful_shutdown as graceful_shutdown;
pub use relay_queues as queues;

pub use relay_queues::{
    Client, EnqueueOptions, Error, HandlerError, JobContext, JobHandler, JobRecord, JobRef,
    JobStatus, QueueConfig, QueueRuntime, ReplaceMode, RetryPolicy, ScheduleSpec, ScheduleTrigger,
    Scheduler, Worker,
};
