//! Client Downgrade Proxy.
//!
//! # Data Flow
//! ```text
//! tonic client (HTTP/2, native framing)
//!     → DowngradeChannel → in-process pipe
//!     → local proxy server (hyper-util auto, flush on every write)
//!     → ReverseProxy (director, HTTP/1.1 or negotiated HTTP/2)
//!     → network → server-side DowngradeHandler
//! ```
//!
//! The RPC runtime never sees the network. When TLS is configured, the
//! side-channel shim proves the endpoint's identity once and attaches it to
//! every pipe connection.
//!
//! Dropping the last [`DowngradeChannel`] clone (or calling
//! [`DowngradeChannel::close`]) stops the local proxy server.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_util::sync::DropGuard;
use tonic::transport::{Channel, Endpoint};

use crate::config::BridgeConfig;
use crate::credentials::tls::server_name_for;
use crate::credentials::{EndpointIdentity, HandshakeError, RustlsCredentials, SideChannelCredentials};
use crate::grpcweb::DEFAULT_MAX_FRAME_LEN;
use crate::http::proxy::ReverseProxy;
use crate::http::serve::{ConnectionServer, FlushPolicy};
use crate::lifecycle::Shutdown;
use crate::net::alpn::AlpnNegotiator;
use crate::net::pipe;
use crate::net::tls::{load_client_config, TlsError};
use crate::net::transport::{ClientTls, ForwardConnector, ProtocolTable};

type Credentials = SideChannelCredentials<RustlsCredentials>;

/// Errors from building or connecting a downgrade client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("RPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// TLS towards the real endpoint.
#[derive(Clone)]
pub struct ClientTlsOptions {
    /// Base config; ALPN preferences are added on top of it.
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Everything needed to reach one endpoint through the downgrade proxy.
#[derive(Clone)]
pub struct ClientOptions {
    /// `host:port` of the real endpoint.
    pub endpoint: String,
    pub tls: Option<ClientTlsOptions>,
    pub negotiator: AlpnNegotiator,
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
}

impl ClientOptions {
    /// Plaintext options with defaults.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls: None,
            negotiator: AlpnNegotiator::default(),
            connect_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_tls(mut self, config: rustls::ClientConfig, server_name: ServerName<'static>) -> Self {
        self.tls = Some(ClientTlsOptions {
            config: Arc::new(config),
            server_name,
        });
        self
    }

    pub fn with_negotiator(mut self, negotiator: AlpnNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build options from configuration, loading TLS material from disk.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ClientError> {
        let client = &config.client;
        let mut options = Self::new(client.endpoint.clone())
            .with_negotiator(AlpnNegotiator::new(config.alpn.pure_grpc_token.clone()))
            .with_connect_timeout(Duration::from_secs(client.connect_timeout_secs));
        options.max_frame_len = config.codec.max_frame_bytes;

        if client.tls.enabled {
            let ca_path = client
                .tls
                .ca_path
                .as_deref()
                .ok_or_else(|| TlsError::NoCertificates("client.tls.ca_path".to_string()))?;
            let identity = client
                .tls
                .client_cert_path
                .as_deref()
                .zip(client.tls.client_key_path.as_deref())
                .map(|(cert, key)| (Path::new(cert), Path::new(key)));
            let tls_config = load_client_config(Path::new(ca_path), identity)?;
            let server_name = server_name_for(&client.endpoint, client.tls.server_name.as_deref())?;
            options = options.with_tls(tls_config, server_name);
        }
        Ok(options)
    }

    fn augmented_tls(&self) -> Option<(Arc<rustls::ClientConfig>, ServerName<'static>)> {
        self.tls.as_ref().map(|tls| {
            (
                Arc::new(self.negotiator.client_config(&tls.config)),
                tls.server_name.clone(),
            )
        })
    }

    /// The network-facing half of the proxy.
    pub fn reverse_proxy(&self) -> Result<ReverseProxy, ClientError> {
        let tls = self
            .augmented_tls()
            .map(|(config, server_name)| ClientTls::new(config, server_name));
        let connector = ForwardConnector::new(tls, ProtocolTable::new(&self.negotiator), self.connect_timeout);
        ReverseProxy::new(connector, &self.endpoint, self.tls.is_some(), self.max_frame_len).map_err(|e| {
            ClientError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn side_channel(&self) -> Option<Arc<Credentials>> {
        self.augmented_tls().map(|(config, server_name)| {
            let credentials = RustlsCredentials::new(config, server_name);
            Arc::new(
                SideChannelCredentials::new(credentials, self.endpoint.clone())
                    .with_dial_timeout(self.connect_timeout),
            )
        })
    }
}

/// Connects RPC clients to an endpoint through a local downgrade proxy.
pub struct DowngradeClient {
    options: ClientOptions,
}

impl DowngradeClient {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    /// Start the local proxy and connect a channel to it.
    ///
    /// With TLS configured, the endpoint's identity is established before
    /// this returns; handshake and transport errors surface here.
    pub async fn connect(&self) -> Result<DowngradeChannel, ClientError> {
        let proxy = self.options.reverse_proxy()?;
        let credentials = self.options.side_channel();
        if let Some(credentials) = &credentials {
            credentials.client_handshake(()).await?;
        }

        let (listener, dialer) = pipe::listen();
        let shutdown = Shutdown::new();
        let server = ConnectionServer::new(proxy).with_flush_policy(FlushPolicy::Immediate);
        let endpoint = self.options.endpoint.clone();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                server.run(listener, shutdown).await;
                tracing::debug!(endpoint = %endpoint, "Local proxy stopped");
            }
        });
        // Anything failing below drops this and stops the proxy again.
        let guard = shutdown.trigger_on_drop();

        let connector_credentials = credentials.clone();
        let connector = tower::service_fn(move |_: Uri| {
            let dialer = dialer.clone();
            let credentials = connector_credentials.clone();
            async move {
                let conn = dialer.dial().await?;
                let conn = match credentials {
                    Some(credentials) => {
                        let (conn, identity) = credentials
                            .client_handshake(conn)
                            .await
                            .map_err(io::Error::other)?;
                        tracing::trace!(endpoint = %identity.endpoint, "Pipe connection authenticated");
                        conn
                    }
                    None => conn,
                };
                Ok::<_, io::Error>(TokioIo::new(conn))
            }
        });

        let channel = Endpoint::from_shared(format!("http://{}", self.options.endpoint))
            .map_err(|e| ClientError::InvalidEndpoint {
                endpoint: self.options.endpoint.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.options.connect_timeout)
            .connect_with_connector(connector)
            .await?;

        tracing::info!(
            endpoint = %self.options.endpoint,
            tls = self.options.tls.is_some(),
            "Downgrade client connected"
        );
        Ok(DowngradeChannel {
            channel,
            lifecycle: Arc::new(Lifecycle {
                shutdown,
                _guard: guard,
                credentials,
            }),
        })
    }
}

struct Lifecycle {
    shutdown: Shutdown,
    _guard: DropGuard,
    credentials: Option<Arc<Credentials>>,
}

/// A tonic-compatible channel whose traffic goes through the local proxy.
#[derive(Clone)]
pub struct DowngradeChannel {
    channel: Channel,
    lifecycle: Arc<Lifecycle>,
}

impl DowngradeChannel {
    /// Identity proven by the side-channel handshake, when TLS is used.
    pub fn peer_identity(&self) -> Option<EndpointIdentity> {
        self.lifecycle.credentials.as_ref()?.identity().cloned()
    }

    /// Stop the local proxy for every clone of this channel. In-flight
    /// requests are allowed to finish.
    pub fn close(&self) {
        self.lifecycle.shutdown.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.shutdown.is_triggered()
    }
}

impl tower::Service<http::Request<tonic::body::Body>> for DowngradeChannel {
    type Response = <Channel as tower::Service<http::Request<tonic::body::Body>>>::Response;
    type Error = <Channel as tower::Service<http::Request<tonic::body::Body>>>::Error;
    type Future = <Channel as tower::Service<http::Request<tonic::body::Body>>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        tower::Service::poll_ready(&mut self.channel, cx)
    }

    fn call(&mut self, request: http::Request<tonic::body::Body>) -> Self::Future {
        tower::Service::call(&mut self.channel, request)
    }
}
