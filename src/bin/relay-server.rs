use std::time::Duration;

use relay_graceful_shutdown::GracefulShutdown;
use relay_queues::{BackendSelector, QueueConfig, QueueRuntime, ServiceRole};
use structopt::StructOpt;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "relay-server", about = "Queue storage, transport and scheduler host")]
struct Args {
    /// Address to bind the HTTP transport to. Falls back to BIND_ADDR.
    #[structopt(long)]
    bind_address: Option<String>,

    /// Port for the HTTP transport. Falls back to BIND_PORT, then 6652.
    #[structopt(long)]
    bind_port: Option<u16>,

    /// Interval between retention sweeps, in seconds.
    #[structopt(long, default_value = "60")]
    retention_interval: u64,
}

/// Exit codes: 0 clean shutdown, 1 configuration/validation failure,
/// 2 unhandled runtime error.
#[actix_web::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::from_args();
    match run(args).await {
        Ok(()) => {}
        Err(RunError::Config(msg)) => {
            eprintln!("configuration error: {}", msg);
            std::process::exit(1);
        }
        Err(RunError::Runtime(err)) => {
            eprintln!("fatal: {:#}", err);
            std::process::exit(2);
        }
    }
}

enum RunError {
    Config(String),
    Runtime(anyhow::Error),
}

async fn run(args: Args) -> Result<(), RunError> {
    let role = ServiceRole::from_env().map_err(|e| RunError::Config(e.to_string()))?;
    if !role.serves_http() {
        // Worker processes embed the library with their handlers; this
        // binary hosts the storage-facing half.
        return Err(RunError::Config(
            "SERVICE_ROLE=worker runs inside the consuming application; \
             relay-server hosts the api plane"
                .to_string(),
        ));
    }

    let selector = BackendSelector::from_env().map_err(|e| RunError::Config(e.to_string()))?;
    let config = QueueConfig::from_env();

    let mut shutdown = GracefulShutdown::new();
    let runtime = QueueRuntime::connect(selector, config.clone(), shutdown.consumer())
        .await
        .map_err(|e| RunError::Runtime(anyhow::anyhow!(e)))?;

    let scheduler = runtime.scheduler();
    scheduler.start();
    let retention = runtime.start_retention_loop(Duration::from_secs(args.retention_interval));

    let bind_address = args
        .bind_address
        .or_else(|| std::env::var("BIND_ADDR").ok());
    let bind_port = args
        .bind_port
        .or_else(|| std::env::var("BIND_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(6652);

    let (server, address, port) = relay_api::server::start(
        relay_api::server::Config {
            bind_address,
            bind_port,
        },
        runtime.backend(),
        runtime.waitlist(),
        config,
    )
    .map_err(|e| RunError::Config(e.to_string()))?;

    event!(Level::INFO, %address, port, "relay-server ready");

    let result = server.await;

    event!(Level::INFO, "Shutting down");
    shutdown.shutdown();
    scheduler.stop().await;
    retention.abort();

    result.map_err(|e| RunError::Runtime(anyhow::anyhow!(e)))
}
