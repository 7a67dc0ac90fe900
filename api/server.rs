use std::net::TcpListener;
use std::sync::Arc;

use actix_web::{dev::Server, web, App, HttpServer};
use tracing::{event, Level};
use tracing_actix_web::TracingLogger;

use relay_queues::{QueueBackend, QueueConfig, Waitlist};

use crate::error::ApiError;
use crate::routes::{self, ApiState};

pub struct Config {
    pub bind_address: Option<String>,
    pub bind_port: u16,
}

/// Bind the transport server. Returns the server future plus the actual
/// address, which matters when the caller asked for port 0.
pub fn start(
    config: Config,
    backend: Arc<dyn QueueBackend>,
    waitlist: Waitlist,
    queue_config: QueueConfig,
) -> Result<(Server, String, u16), ApiError> {
    let bind_address = config
        .bind_address
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let listener = TcpListener::bind(format!("{}:{}", bind_address, config.bind_port))
        .map_err(|e| ApiError::Validation(format!("failed to bind {}: {}", bind_address, e)))?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| ApiError::Validation(e.to_string()))?
        .port();

    event!(Level::INFO, address = %bind_address, port = bound_port, "Starting queue transport server");

    let state = web::Data::new(ApiState {
        backend,
        waitlist,
        config: queue_config,
    });

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .listen(listener)
    .map_err(|e| ApiError::Validation(format!("failed to listen: {}", e)))?
    .run();

    Ok((server, bind_address, bound_port))
}
