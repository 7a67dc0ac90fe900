//! HTTP transport for the queue contract: actix-web routes under `/jobs`
//! on the storage side, and a reqwest-backed remote backend that lets a
//! worker process run against them from another machine.

pub mod error;
pub mod remote;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use remote::{connect_remote_runtime, RemoteBackend};
pub use routes::ApiState;
