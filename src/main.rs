use std::{process, sync::Arc};

use oss_gateway::{
    config::AppConfig,
    server::{shutdown_signal, Server},
    telemetry,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

fn main() {
    telemetry::init_tracing();

    info!("Loading application configuration");
    let config = Arc::new(AppConfig::new());
    debug!(
        "Configuration loaded: port={}, host={}, worker_threads={}",
        config.port, config.host, config.worker_threads
    );

    info!(
        "Configuring tokio runtime with {} worker threads",
        config.worker_threads
    );
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            process::exit(1);
        }
    };

    runtime.block_on(run(config));
}

async fn run(config: Arc<AppConfig>) {
    let server = match Server::new(config.clone()) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create HTTP client: {}", e);
            process::exit(1);
        }
    };

    let addr = config.listen_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start server on {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("OSS gateway listening on {}", addr);
    info!("OSS origin: {}", config.base_url);
    info!("Health check: http://localhost:{}/health", config.port);

    if let Err(e) = server.serve(listener, shutdown_signal()).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
