//! HTTP server implementation.

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::response;
use super::status::{admission_status, health};
use crate::error::{BouncerError, Result};
use crate::runtime::Bouncer;

/// Routes served by the binary, with admission control in front.
pub fn router(bouncer: &Bouncer) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/admission/status", get(admission_status))
        .fallback(|| async { response::not_found() })
        .with_state(bouncer.chain().clone())
        .layer(bouncer.layer())
        .layer(TraceLayer::new_for_http())
}

/// HTTP server fronted by the admission chain.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, bouncer: &Bouncer) -> Self {
        Self {
            addr,
            router: router(bouncer),
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            BouncerError::Io(e)
        })
    }
}
