//! HTTP/1 accept loop with graceful connection draining, shared by every binary

use crate::http::HttpResponse;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::tokio::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Accept connections and serve them with `handler` until `shutdown` resolves.
///
/// The listener is closed on return; connections already accepted keep running
/// and are tracked by the returned `GracefulShutdown`.
pub async fn accept_until<H, Fut, S>(listener: TcpListener, handler: H, shutdown: S) -> GracefulShutdown
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
    S: Future<Output = ()>,
{
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let handler = handler.clone();
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Error serving connection from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    graceful
}

/// Wait for in-flight connections to finish, up to `grace`
pub async fn drain(graceful: GracefulShutdown, grace: Duration) {
    match tokio::time::timeout(grace, graceful.shutdown()).await {
        Ok(()) => info!("All connections drained"),
        Err(_) => warn!("Grace period of {:?} elapsed with connections still open", grace),
    }
}

/// Serve until `shutdown` resolves, then drain for at most `grace`
pub async fn serve<H, Fut, S>(listener: TcpListener, handler: H, shutdown: S, grace: Duration)
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
    S: Future<Output = ()>,
{
    let graceful = accept_until(listener, handler, shutdown).await;
    drain(graceful, grace).await;
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
