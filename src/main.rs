//! kvhttp: a tiny in-memory key-value store over HTTP
//!
//! Clients drive the store through the request line alone:
//! - `POST /?a=4&b=5` stores `a` and `b`
//! - `GET /?a` reads `a`
//! - `DELETE /?a` removes `a` and returns its last value
//!
//! Responses are JSON objects. SIGINT (or SIGTERM) stops the server after
//! the connection being served, if any, completes.

mod config;
mod http;
mod server;
mod shutdown;
mod storage;

use config::Config;
use server::{Server, ServerError};
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        concurrent = config.concurrent,
        workers = ?config.workers,
        max_request_size = config.max_request_size,
        "Starting kvhttp server"
    );

    let runtime = build_runtime(&config)?;
    if let Err(e) = runtime.block_on(serve(config)) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    info!("Exiting server");
    Ok(())
}

/// Sequential mode runs everything on the calling thread
fn build_runtime(config: &Config) -> std::io::Result<Runtime> {
    if config.concurrent {
        let mut builder = Builder::new_multi_thread();
        if let Some(workers) = config.workers {
            builder.worker_threads(workers);
        }
        builder.enable_all().build()
    } else {
        Builder::new_current_thread().enable_all().build()
    }
}

async fn serve(config: Config) -> Result<(), ServerError> {
    let server = Server::new(config);
    let listener = server.bind()?;

    let handle = server.shutdown_handle(&listener)?;
    tokio::spawn(async move {
        if let Err(e) = shutdown::watch_signals(handle).await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    server.run(listener).await
}
