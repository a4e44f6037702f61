//! Startup orchestration.
//!
//! # Responsibilities
//! - Turn a validated configuration into running components
//! - Bind listeners only after everything they serve is built
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently

use std::convert::Infallible;
use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use http::{Request, Response};

use crate::config::BridgeConfig;
use crate::downgrade::{ClientError, ClientOptions};
use crate::http::serve::{ConnectionServer, FlushPolicy};
use crate::http::server::{traced, DowngradeServer};
use crate::lifecycle::Shutdown;
use crate::net::alpn::{AlpnNegotiator, ServerTlsSettings};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{load_server_config, TlsError};

/// Errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("server failed: {0}")]
    Io(#[from] io::Error),
}

/// Run the Client Downgrade Proxy on a local TCP port until `shutdown` fires.
///
/// Any native RPC client pointed at `client.local_bind_address` reaches
/// `client.endpoint` through the downgrade path.
pub async fn run_client_proxy(config: &BridgeConfig, shutdown: Shutdown) -> Result<(), StartupError> {
    let options = ClientOptions::from_config(config)?;
    let proxy = options.reverse_proxy()?;

    let listener = Listener::bind(&config.client.local_bind_address, config.client.max_connections).await?;
    tracing::info!(
        local_address = %config.client.local_bind_address,
        endpoint = %config.client.endpoint,
        tls = options.tls.is_some(),
        "Client proxy ready"
    );

    ConnectionServer::new(traced(proxy))
        .with_flush_policy(FlushPolicy::Immediate)
        .run(listener, shutdown)
        .await;

    tracing::info!("Client proxy stopped");
    Ok(())
}

/// Serve `service` (usually a `DowngradeHandler`) as configured under
/// `[server]` until `shutdown` fires.
pub async fn run_server<S>(config: &BridgeConfig, service: S, shutdown: Shutdown) -> Result<(), StartupError>
where
    S: tower::Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    let mut server = DowngradeServer::new(service);
    if let Some(tls) = &config.server.tls {
        let server_config = load_server_config(Path::new(&tls.cert_path), Path::new(&tls.key_path))?;
        let negotiator = AlpnNegotiator::new(config.alpn.pure_grpc_token.clone());
        server = server.with_tls(ServerTlsSettings::new(Arc::new(server_config)), &negotiator);
    }

    let listener = Listener::bind(&config.server.bind_address, config.server.max_connections).await?;
    server.run(listener, shutdown).await?;
    Ok(())
}
