//! Pluggable job-queue runtime: one Client / Worker / Scheduler /
//! JobContext contract over a PostgreSQL, SQLite or Redis substrate, with a
//! push waitlist instead of hot polling and multi-stage progress reporting.

pub mod backoff;
pub mod config;
pub mod contract;
pub mod db;
pub mod events;
pub mod redis;
pub mod scheduler;
pub mod stage;
pub mod util;
pub mod waitlist;

mod client;
mod context;
mod error;
mod job;
mod runtime;
mod worker;

pub use self::backoff::RetryPolicy;
pub use self::client::Client;
pub use self::config::{BackendSelector, QueueConfig, RetentionConfig, ServiceRole};
pub use self::context::JobContext;
pub use self::contract::{
    Capabilities, CompletionUpdate, EnqueueDisposition, EnqueueOutcome, EnqueueRequest,
    FailDisposition, FailureKind, FailureReport, ProgressUpdate, QueueBackend, QueueStats,
    RetentionReport, ScheduleStore, UnsupportedScheduleStore,
};
pub use self::error::{Error, HandlerError};
pub use self::events::{EventBus, JobEvent, JobEventKind};
pub use self::job::{EnqueueOptions, JobRecord, JobRef, JobStatus, LastError, ReplaceMode};
pub use self::runtime::QueueRuntime;
pub use self::scheduler::{ScheduleRecord, ScheduleSpec, ScheduleTrigger, Scheduler};
pub use self::stage::{Stage, StageSet, StageStatus};
pub use self::waitlist::Waitlist;
pub use self::worker::{handler_fn, FnHandler, JobHandler, Worker};
