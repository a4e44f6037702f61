//! Outbound connections for the client proxy.
//!
//! # Responsibilities
//! - Dial the real endpoint over TCP, with a connect timeout
//! - Run the TLS handshake when configured, offering the pure-RPC token
//! - Report HTTP/2 to the HTTP client when the negotiated protocol calls for it
//!
//! The protocol-switch table maps negotiated ALPN ids to wire protocols; the
//! pure-RPC token is registered to behave exactly like `h2`.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::net::alpn::{AlpnNegotiator, H2, HTTP11};

/// Wire protocol spoken over a negotiated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Http1,
    Http2,
}

/// Maps negotiated ALPN ids to wire protocols.
#[derive(Debug, Clone)]
pub struct ProtocolTable {
    entries: HashMap<Vec<u8>, WireProtocol>,
}

impl ProtocolTable {
    /// Standard ids plus `negotiator`'s token registered as HTTP/2.
    pub fn new(negotiator: &AlpnNegotiator) -> Self {
        let mut entries = HashMap::new();
        entries.insert(H2.to_vec(), WireProtocol::Http2);
        entries.insert(HTTP11.to_vec(), WireProtocol::Http1);
        entries.insert(negotiator.token().to_vec(), WireProtocol::Http2);
        Self { entries }
    }

    /// Unknown or absent ids fall back to HTTP/1.1.
    pub fn lookup(&self, alpn: Option<&[u8]>) -> WireProtocol {
        alpn.and_then(|id| self.entries.get(id).copied())
            .unwrap_or(WireProtocol::Http1)
    }
}

/// TLS settings for outbound connections.
#[derive(Clone)]
pub struct ClientTls {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl ClientTls {
    /// Build from a config that has already been ALPN-augmented.
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            server_name,
        }
    }
}

/// `tower::Service<Uri>` connector used by the proxy's HTTP client.
#[derive(Clone)]
pub struct ForwardConnector {
    tls: Option<ClientTls>,
    protocols: Arc<ProtocolTable>,
    connect_timeout: Duration,
}

impl ForwardConnector {
    pub fn new(tls: Option<ClientTls>, protocols: ProtocolTable, connect_timeout: Duration) -> Self {
        Self {
            tls,
            protocols: Arc::new(protocols),
            connect_timeout,
        }
    }

    async fn connect(self, uri: Uri) -> io::Result<ForwardStream> {
        let host = uri
            .host()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URI has no host"))?;
        let port = uri
            .port_u16()
            .unwrap_or(if self.tls.is_some() { 443 } else { 80 });
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        tcp.set_nodelay(true)?;

        let Some(tls) = self.tls else {
            return Ok(ForwardStream::Plain(TokioIo::new(tcp)));
        };
        let stream = tls.connector.connect(tls.server_name.clone(), tcp).await?;
        let protocol = self.protocols.lookup(stream.get_ref().1.alpn_protocol());
        tracing::debug!(host, port, ?protocol, "Upstream TLS established");
        Ok(ForwardStream::Tls(TokioIo::new(stream), protocol))
    }
}

impl tower::Service<Uri> for ForwardConnector {
    type Response = ForwardStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<ForwardStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// A connection to the real endpoint, plain or TLS.
pub enum ForwardStream {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>, WireProtocol),
}

impl Connection for ForwardStream {
    fn connected(&self) -> Connected {
        match self {
            ForwardStream::Tls(_, WireProtocol::Http2) => Connected::new().negotiated_h2(),
            _ => Connected::new(),
        }
    }
}

impl Read for ForwardStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ForwardStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ForwardStream::Tls(s, _) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl Write for ForwardStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ForwardStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ForwardStream::Tls(s, _) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ForwardStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ForwardStream::Tls(s, _) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ForwardStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ForwardStream::Tls(s, _) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
