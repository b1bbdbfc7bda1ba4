//! Listener loop and per-connection setup.
//!
//! axum's own `serve` has no knobs for connection timeouts, so connections are
//! driven through hyper-util's auto builder. The axum `Router` serves as the
//! per-request service.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::connect_info::ConnectInfo, middleware::from_fn_with_state, routing::any, Router,
};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto::Builder as ConnBuilder,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::{config::AppConfig, handlers, proxy::OssProxy, telemetry};

pub mod timeouts;

use timeouts::ConnectionActivity;

pub struct Server {
    config: Arc<AppConfig>,
    app: Router,
}

impl Server {
    pub fn new(config: Arc<AppConfig>) -> reqwest::Result<Self> {
        let proxy = Arc::new(OssProxy::new(&config)?);
        let app = build_router(proxy, config.write_timeout);
        Ok(Self { config, app })
    }

    /// Accepts connections until `shutdown` resolves, then asks every open
    /// connection to close once its in-flight request is done and waits for
    /// them.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr()?;
        info!(address = %addr, "OSS gateway accepting connections");

        let builder = Arc::new(self.connection_builder());
        let idle_timeout = self.config.idle_timeout;
        let (close_tx, close_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "Shutdown signal received, draining connections");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    tasks.spawn(serve_connection(
                        Arc::clone(&builder),
                        self.app.clone(),
                        stream,
                        peer,
                        idle_timeout,
                        close_rx.clone(),
                    ));
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        let _ = close_tx.send(true);
        while tasks.join_next().await.is_some() {}

        info!("OSS gateway stopped");
        Ok(())
    }

    fn connection_builder(&self) -> ConnBuilder<TokioExecutor> {
        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_timeout);
        builder.http2().timer(TokioTimer::new());
        builder
    }
}

fn build_router(proxy: Arc<OssProxy>, write_timeout: Duration) -> Router {
    Router::new()
        .route("/health", any(handlers::health_check))
        .fallback(handlers::proxy_request)
        .with_state(proxy)
        .layer(from_fn_with_state(write_timeout, timeouts::write_deadline))
        .layer(TraceLayer::new_for_http().make_span_with(telemetry::make_request_span))
}

async fn serve_connection(
    builder: Arc<ConnBuilder<TokioExecutor>>,
    app: Router,
    stream: TcpStream,
    peer: SocketAddr,
    idle_timeout: Duration,
    mut close: watch::Receiver<bool>,
) {
    let activity = Arc::new(ConnectionActivity::new());

    let svc = {
        let activity = Arc::clone(&activity);
        service_fn(move |mut request: hyper::Request<Incoming>| {
            activity.touch();
            request.extensions_mut().insert(ConnectInfo(peer));
            app.clone().oneshot(request)
        })
    };

    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let idle = activity.idle_for(idle_timeout);
    tokio::pin!(idle);
    let mut closing = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, "Connection error: {}", e);
                }
                break;
            }
            () = &mut idle, if !closing => {
                debug!(peer = %peer, "Closing idle connection");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = close.changed(), if !closing => {
                debug!(peer = %peer, "Closing connection for shutdown");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            debug!("CTRL+C signal received");
        },
        _ = terminate => {
            debug!("Terminate signal received");
        },
    }
    info!("Shutdown signal received, starting graceful shutdown");
}
