//! A single worker: one listener, one copy of the service.

use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use tokio::net::{TcpListener, TcpSocket};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::info;
use warp::Filter;

use crate::{auth::Auth, config::ServerConfig, routes::build_routes};

/// Bind `addr` so that several processes can listen on it at once; the kernel
/// spreads incoming connections across them.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;

    socket.bind(addr)?;
    socket.listen(1024)
}

/// Serve every endpoint on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    auth: Auth,
    allowed_origin: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) {
    let cors = warp::cors()
        .allow_origin(allowed_origin)
        .allow_methods(vec!["GET", "POST"])
        .allow_headers(vec!["content-type", "authorization"]);

    let routes = build_routes(&auth)
        .with(cors)
        .with(warp::trace::request());

    warp::serve(routes)
        .serve_incoming_with_graceful_shutdown(TcpListenerStream::new(listener), shutdown)
        .await;
}

/// Run one worker process to completion.
pub async fn run_worker(config: &ServerConfig, worker_id: usize) -> Result<()> {
    let auth = Auth::new(config.auth_config()?);
    auth.warm_up().await?;

    let listener = bind_listener(SocketAddr::new(config.host, config.port))?;

    info!(
        worker_id,
        pid = std::process::id(),
        "server running on {}",
        listener.local_addr()?
    );

    serve(listener, auth, &config.allowed_origin, shutdown_signal()).await;

    info!(worker_id, "server stopped");

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
