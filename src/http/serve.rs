//! Connection serving shared by the local proxy and the downgrade server.
//!
//! # Responsibilities
//! - Abstract over where connections come from ([`Accept`]: TCP or pipe)
//! - Optional TLS handshake per connection
//! - Auto-detect HTTP/1.1 vs HTTP/2 (with upgrades) via hyper-util
//! - Flush after every write when the policy asks for it
//! - Graceful connection shutdown when the [`Shutdown`] signal fires

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::ServiceExt;
use tracing::Instrument;

use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::pipe::{PipeConnection, PipeListener};
use crate::net::tls::TlsAcceptor;
use crate::observability::metrics;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A source of inbound connections.
pub trait Accept: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// Held for as long as the connection is served.
    type Guard: Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Conn, Self::Guard)>> + Send;

    /// Whether `error` means no further connections will ever arrive.
    fn is_terminal(&self, error: &io::Error) -> bool;
}

impl Accept for PipeListener {
    type Conn = PipeConnection;
    type Guard = ();

    async fn accept(&self) -> io::Result<(PipeConnection, ())> {
        let conn = PipeListener::accept(self).await?;
        Ok((conn, ()))
    }

    // The only pipe accept error is the listener closing.
    fn is_terminal(&self, _error: &io::Error) -> bool {
        true
    }
}

/// When writes reach the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Leave flushing to the HTTP implementation.
    #[default]
    Deferred,
    /// Flush after every write so each frame leaves immediately.
    Immediate,
}

/// IO wrapper applying a [`FlushPolicy`].
#[derive(Debug)]
pub struct FlushOnWrite<T> {
    inner: T,
    policy: FlushPolicy,
    flush_pending: bool,
}

impl<T> FlushOnWrite<T> {
    pub fn new(inner: T, policy: FlushPolicy) -> Self {
        Self {
            inner,
            policy,
            flush_pending: false,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncWrite + Unpin> FlushOnWrite<T> {
    fn poll_pending_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.flush_pending {
            ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
            self.flush_pending = false;
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for FlushOnWrite<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for FlushOnWrite<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_pending_flush(cx))?;
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if this.policy == FlushPolicy::Immediate && n > 0 {
            this.flush_pending = true;
            // Pending here is fine: the next write or flush finishes it.
            if let Poll::Ready(Err(e)) = this.poll_pending_flush(cx) {
                return Poll::Ready(Err(e));
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.flush_pending = false;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_pending_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Serves an HTTP service on every connection an [`Accept`] yields.
pub struct ConnectionServer<S> {
    service: S,
    tls: Option<Arc<TlsAcceptor>>,
    flush: FlushPolicy,
    tracker: ConnectionTracker,
}

impl<S: Clone> Clone for ConnectionServer<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            tls: self.tls.clone(),
            flush: self.flush,
            tracker: self.tracker.clone(),
        }
    }
}

impl<S> ConnectionServer<S>
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
            flush: FlushPolicy::default(),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Run a TLS handshake on each accepted connection before serving it.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(Arc::new(acceptor));
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush = policy;
        self
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept and serve connections until `shutdown` fires or the listener
    /// reports a terminal error. Connections already being served are told
    /// to shut down gracefully; this does not wait for them.
    pub async fn run<A: Accept>(self, listener: A, shutdown: Shutdown) {
        loop {
            let (conn, guard) = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if listener.is_terminal(&e) => {
                        tracing::debug!(error = %e, "Listener closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _guard = guard;
                server.serve_connection(conn, shutdown).await;
            });
        }
        tracing::debug!(
            active_connections = self.tracker.active_count(),
            "Accept loop stopped"
        );
    }

    async fn serve_connection<C>(&self, conn: C, shutdown: Shutdown)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.tracker.track();
        let id = guard.id();
        metrics::record_connection();

        let span = tracing::debug_span!("connection", connection_id = %id);
        async move {
            match &self.tls {
                Some(tls) => match tls.accept(conn).await {
                    Ok(stream) => self.serve_io(stream, id, shutdown).await,
                    Err(e) => tracing::debug!(error = %e, "TLS handshake failed"),
                },
                None => self.serve_io(conn, id, shutdown).await,
            }
            drop(guard);
        }
        .instrument(span)
        .await
    }

    async fn serve_io<I>(&self, io: I, id: ConnectionId, shutdown: Shutdown)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(FlushOnWrite::new(io, self.flush));
        let service = self.service.clone();
        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            service.clone().oneshot(req.map(Body::new))
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection_with_upgrades(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.wait() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        match result {
            Ok(()) => tracing::trace!(connection_id = %id, "Connection closed"),
            Err(e) => tracing::debug!(connection_id = %id, error = %e, "Connection ended with error"),
        }
    }
}
