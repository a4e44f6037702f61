//! Transport credentials.
//!
//! # Data Flow
//! ```text
//! RPC runtime dials the local pipe
//!     → side_channel.rs: first call only
//!         → dial endpoint over real TCP
//!         → tls.rs handshake (RustlsCredentials)
//!         → capture AuthInfo, close the side connection
//!     → pipe connection returned unchanged with the cached EndpointIdentity
//! ```
//!
//! # Design Decisions
//! - The proxy's network hop is an HTTP client, not a raw TLS socket, so the
//!   identity proof is obtained on a throwaway connection
//! - One shim caches one identity for its whole lifetime

pub mod side_channel;
pub mod tls;

use std::future::Future;
use std::io;

use rustls::pki_types::CertificateDer;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

pub use side_channel::SideChannelCredentials;
pub use tls::RustlsCredentials;

/// What a handshake proved about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// "tls" or "insecure".
    pub security_protocol: &'static str,
    /// Negotiated ALPN id, if any.
    pub negotiated_protocol: Option<Vec<u8>>,
    pub tls_version: Option<String>,
    /// Peer chain, leaf first.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl AuthInfo {
    pub fn insecure() -> Self {
        Self {
            security_protocol: "insecure",
            negotiated_protocol: None,
            tls_version: None,
            peer_certificates: Vec::new(),
        }
    }
}

/// Identity established for an endpoint. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointIdentity {
    pub endpoint: String,
    pub auth_info: AuthInfo,
}

/// Handshake failures. Nothing is cached when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("side-channel dial to {endpoint} failed: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("side-channel dial to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
}

/// Credentials able to secure a raw connection to an endpoint.
pub trait TransportCredentials: Send + Sync + 'static {
    /// The secured stream; only used to close it again.
    type Stream: AsyncWrite + Unpin + Send;

    fn client_handshake(
        &self,
        authority: &str,
        conn: TcpStream,
    ) -> impl Future<Output = Result<(Self::Stream, AuthInfo), HandshakeError>> + Send;
}
