//! Side-channel credential shim.
//!
//! The RPC runtime believes it is handshaking with the far endpoint when it
//! is actually talking to an in-process pipe. The shim performs one real
//! handshake against the endpoint on a separate connection, remembers what it
//! learned, and hands every pipe connection back untouched with that
//! identity attached.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

use super::{EndpointIdentity, HandshakeError, TransportCredentials};
use crate::observability::metrics;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SideChannelCredentials<C> {
    inner: C,
    endpoint: String,
    dial_timeout: Duration,
    identity: OnceCell<EndpointIdentity>,
}

impl<C: TransportCredentials> SideChannelCredentials<C> {
    pub fn new(inner: C, endpoint: impl Into<String>) -> Self {
        Self {
            inner,
            endpoint: endpoint.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            identity: OnceCell::new(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The cached identity, if a side-channel handshake has succeeded.
    pub fn identity(&self) -> Option<&EndpointIdentity> {
        self.identity.get()
    }

    /// Attach the endpoint identity to `conn` without touching it.
    ///
    /// Concurrent first callers share a single side-channel handshake. A
    /// failed handshake is not cached; the next call tries again.
    pub async fn client_handshake<T>(
        &self,
        conn: T,
    ) -> Result<(T, EndpointIdentity), HandshakeError> {
        let identity = self
            .identity
            .get_or_try_init(|| self.side_channel_handshake())
            .await?;
        Ok((conn, identity.clone()))
    }

    async fn side_channel_handshake(&self) -> Result<EndpointIdentity, HandshakeError> {
        let result = self.dial_and_handshake().await;
        match &result {
            Ok(identity) => {
                metrics::record_handshake("success");
                tracing::info!(
                    endpoint = %self.endpoint,
                    protocol = identity.auth_info.security_protocol,
                    "Side-channel handshake complete"
                );
            }
            Err(e) => {
                metrics::record_handshake("failure");
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Side-channel handshake failed");
            }
        }
        result
    }

    async fn dial_and_handshake(&self) -> Result<EndpointIdentity, HandshakeError> {
        let tcp = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| HandshakeError::Timeout {
                endpoint: self.endpoint.clone(),
            })?
            .map_err(|source| HandshakeError::Dial {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let (mut secured, auth_info) = self.inner.client_handshake(&self.endpoint, tcp).await?;

        if let Err(e) = secured.shutdown().await {
            tracing::debug!(endpoint = %self.endpoint, error = %e, "Failed to close side-channel connection");
        }

        Ok(EndpointIdentity {
            endpoint: self.endpoint.clone(),
            auth_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::credentials::AuthInfo;

    /// Accepts plain TCP as "secured", failing the first `fail_first` calls.
    struct CountingCredentials {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl TransportCredentials for CountingCredentials {
        type Stream = TcpStream;

        async fn client_handshake(
            &self,
            _authority: &str,
            conn: TcpStream,
        ) -> Result<(TcpStream, AuthInfo), HandshakeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(HandshakeError::Tls(std::io::Error::other("refused")));
            }
            Ok((conn, AuthInfo::insecure()))
        }
    }

    async fn endpoint() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((_stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (addr, accepted)
    }

    fn shim(addr: String, fail_first: usize) -> (SideChannelCredentials<CountingCredentials>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let creds = CountingCredentials {
            calls: calls.clone(),
            fail_first,
        };
        (SideChannelCredentials::new(creds, addr), calls)
    }

    #[tokio::test]
    async fn handshakes_once_and_returns_conn_unchanged() {
        let (addr, _) = endpoint().await;
        let (shim, calls) = shim(addr.clone(), 0);
        assert!(shim.identity().is_none());

        let (conn, first) = shim.client_handshake("pipe-1").await.unwrap();
        assert_eq!(conn, "pipe-1");
        let (conn, second) = shim.client_handshake("pipe-2").await.unwrap();
        assert_eq!(conn, "pipe-2");

        assert_eq!(first, second);
        assert_eq!(first.endpoint, addr);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shim.identity(), Some(&first));
    }

    #[tokio::test]
    async fn concurrent_first_calls_share_one_handshake() {
        let (addr, _) = endpoint().await;
        let (shim, calls) = shim(addr, 0);
        let shim = Arc::new(shim);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let shim = shim.clone();
                tokio::spawn(async move { shim.client_handshake(i).await.map(|(c, _)| c) })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (addr, _) = endpoint().await;
        let (shim, calls) = shim(addr, 1);

        assert!(matches!(
            shim.client_handshake(()).await,
            Err(HandshakeError::Tls(_))
        ));
        assert!(shim.identity().is_none());

        shim.client_handshake(()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(shim.identity().is_some());
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (shim, calls) = shim(addr, 0);
        let err = shim.client_handshake(()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Dial { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn real_tls_handshake_dials_once() {
        use std::path::Path;

        use rustls::pki_types::ServerName;

        use crate::credentials::RustlsCredentials;
        use crate::net::alpn::{AlpnNegotiator, ServerTlsSettings};
        use crate::net::tls::{load_client_config, load_server_config, TlsAcceptor};

        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let negotiator = AlpnNegotiator::default();
        let server = load_server_config(&fixtures.join("server.pem"), &fixtures.join("server.key")).unwrap();
        let acceptor = TlsAcceptor::new(negotiator.server_settings(&ServerTlsSettings::new(Arc::new(server))));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dials = Arc::new(AtomicUsize::new(0));
        tokio::spawn({
            let dials = dials.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    dials.fetch_add(1, Ordering::SeqCst);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let _ = acceptor.accept(stream).await;
                    });
                }
            }
        });

        let client = load_client_config(&fixtures.join("ca.pem"), None).unwrap();
        let credentials = RustlsCredentials::new(
            Arc::new(negotiator.client_config(&client)),
            ServerName::try_from("localhost").unwrap(),
        );
        let shim = SideChannelCredentials::new(credentials, addr.clone());

        for conn in ["a", "b", "c"] {
            let (returned, identity) = shim.client_handshake(conn).await.unwrap();
            assert_eq!(returned, conn);
            assert_eq!(identity.endpoint, addr);
            assert_eq!(identity.auth_info.negotiated_protocol.as_deref(), Some(&b"pure-grpc"[..]));
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }
}
