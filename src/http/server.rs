//! Network-facing server for a downgrade-wrapped RPC handler.
//!
//! # Responsibilities
//! - Accept TCP connections through the bounded [`Listener`]
//! - Optional TLS with the pure-RPC ALPN token offered alongside `h2`
//! - Serve HTTP/1.1 and HTTP/2 on the same port
//! - Stop accepting on shutdown, then drain in-flight connections

use std::convert::Infallible;
use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use http::{Request, Response};
use tower_http::trace::TraceLayer;

use crate::http::serve::ConnectionServer;
use crate::lifecycle::Shutdown;
use crate::net::alpn::{AlpnNegotiator, ServerTlsSettings};
use crate::net::listener::Listener;
use crate::net::tls::TlsAcceptor;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wrap `service` in an axum router with request tracing.
pub fn traced<S>(service: S) -> Router
where
    S: tower::Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    Router::new()
        .fallback_service(service)
        .layer(TraceLayer::new_for_http())
}

/// Serves `S` (usually a [`DowngradeHandler`](crate::downgrade::DowngradeHandler)).
pub struct DowngradeServer<S> {
    service: S,
    tls: Option<ServerTlsSettings>,
    drain_timeout: Duration,
}

impl<S> DowngradeServer<S>
where
    S: tower::Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    pub fn new(service: S) -> Self {
        Self {
            service,
            tls: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Terminate TLS, advertising `negotiator`'s protocols on every config
    /// `settings` can produce.
    pub fn with_tls(mut self, settings: ServerTlsSettings, negotiator: &AlpnNegotiator) -> Self {
        self.tls = Some(negotiator.server_settings(&settings));
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Serve until `shutdown` fires, then wait (bounded) for connections to finish.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            tls = self.tls.is_some(),
            max_connections = listener.max_connections(),
            "Downgrade server starting"
        );

        let mut server = ConnectionServer::new(traced(self.service));
        if let Some(settings) = self.tls {
            server = server.with_tls(TlsAcceptor::new(settings));
        }
        let tracker = server.tracker().clone();
        server.run(listener, shutdown).await;

        let active = tracker.active_count();
        if active > 0 {
            tracing::info!(active_connections = active, "Draining connections");
        }
        if tokio::time::timeout(self.drain_timeout, tracker.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                active_connections = tracker.active_count(),
                "Drain timeout elapsed, dropping remaining connections"
            );
        }

        tracing::info!("Downgrade server stopped");
        Ok(())
    }
}
