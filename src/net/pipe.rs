//! In-process duplex connections.
//!
//! [`listen`] returns a [`PipeListener`] and a [`PipeDialer`]. A `dial` and an
//! `accept` rendezvous: both return together, each holding one end of a fresh
//! connected pair. No OS sockets are involved.
//!
//! Neither side has a timeout of its own; bound `dial`/`accept` with
//! `tokio::time::timeout` (or drop the future) if needed.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// In-memory capacity of each direction of a pipe connection.
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Errors from the pipe listener and dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// The listener has been closed.
    #[error("pipe listener closed")]
    Closed,

    /// `close` was called on an already closed listener.
    #[error("pipe listener already closed")]
    AlreadyClosed,
}

impl From<PipeError> for io::Error {
    fn from(e: PipeError) -> Self {
        io::Error::new(io::ErrorKind::NotConnected, e)
    }
}

/// Create a connected listener/dialer pair.
pub fn listen() -> (PipeListener, PipeDialer) {
    let (tx, rx) = mpsc::channel(1);
    let closed = CancellationToken::new();
    let listener = PipeListener {
        incoming: Mutex::new(rx),
        closed: closed.clone(),
        close_called: AtomicBool::new(false),
    };
    let dialer = PipeDialer { tx, closed };
    (listener, dialer)
}

struct PendingDial {
    conn: PipeConnection,
    accepted: oneshot::Sender<()>,
}

/// Accepting side of an in-process pipe.
pub struct PipeListener {
    incoming: Mutex<mpsc::Receiver<PendingDial>>,
    closed: CancellationToken,
    close_called: AtomicBool,
}

impl PipeListener {
    /// Wait for a dialer. Fails with [`PipeError::Closed`] once the listener
    /// is closed, including for callers already waiting.
    pub async fn accept(&self) -> Result<PipeConnection, PipeError> {
        let mut incoming = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(PipeError::Closed),
            guard = self.incoming.lock() => guard,
        };
        loop {
            let pending = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(PipeError::Closed),
                pending = incoming.recv() => pending.ok_or(PipeError::Closed)?,
            };
            // A dialer that gave up has dropped its receiver; skip it.
            if pending.accepted.send(()).is_ok() {
                return Ok(pending.conn);
            }
        }
    }

    /// Close the listener, releasing every blocked `accept` and `dial`.
    pub fn close(&self) -> Result<(), PipeError> {
        if self.close_called.swap(true, Ordering::SeqCst) {
            return Err(PipeError::AlreadyClosed);
        }
        self.closed.cancel();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Dialing side of an in-process pipe. Cheap to clone.
#[derive(Clone)]
pub struct PipeDialer {
    tx: mpsc::Sender<PendingDial>,
    closed: CancellationToken,
}

impl PipeDialer {
    /// Connect to the listener, waiting until an `accept` picks this dial up.
    pub async fn dial(&self) -> Result<PipeConnection, PipeError> {
        if self.closed.is_cancelled() {
            return Err(PipeError::Closed);
        }
        let (local, remote) = PipeConnection::pair();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let pending = PendingDial {
            conn: remote,
            accepted: accepted_tx,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(PipeError::Closed),
            sent = self.tx.send(pending) => sent.map_err(|_| PipeError::Closed)?,
        }
        tokio::select! {
            biased;
            accepted = accepted_rx => accepted.map_err(|_| PipeError::Closed)?,
            _ = self.closed.cancelled() => return Err(PipeError::Closed),
        }
        Ok(local)
    }
}

/// One end of an in-process connection.
///
/// Shutting down or dropping one end makes the peer read EOF once buffered
/// data is drained; writes after that fail.
#[derive(Debug)]
pub struct PipeConnection {
    inner: DuplexStream,
}

impl PipeConnection {
    fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        (Self { inner: a }, Self { inner: b })
    }
}

impl AsyncRead for PipeConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept_pair_up() {
        let (listener, dialer) = listen();
        let (accepted, dialed) = tokio::join!(listener.accept(), dialer.dial());
        let mut server = accepted.unwrap();
        let mut client = dialed.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn concurrent_dials_pair_one_to_one() {
        const N: usize = 8;
        let (listener, dialer) = listen();
        let listener = Arc::new(listener);

        let mut accepts = Vec::new();
        for _ in 0..N {
            let listener = Arc::clone(&listener);
            accepts.push(tokio::spawn(async move {
                let mut conn = listener.accept().await.unwrap();
                let mut id = [0u8; 1];
                conn.read_exact(&mut id).await.unwrap();
                let mut rest = Vec::new();
                conn.read_to_end(&mut rest).await.unwrap();
                (id[0], rest)
            }));
        }

        let mut dials = Vec::new();
        for i in 0..N {
            let dialer = dialer.clone();
            dials.push(tokio::spawn(async move {
                let mut conn = dialer.dial().await.unwrap();
                conn.write_all(&[i as u8]).await.unwrap();
                for chunk in 0..4u8 {
                    conn.write_all(&[i as u8, chunk]).await.unwrap();
                }
                conn.shutdown().await.unwrap();
            }));
        }
        for dial in dials {
            dial.await.unwrap();
        }

        let mut seen = Vec::new();
        for accept in accepts {
            let (id, rest) = accept.await.unwrap();
            let expected: Vec<u8> = (0..4u8).flat_map(|c| [id, c]).collect();
            assert_eq!(rest, expected);
            seen.push(id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..N as u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_releases_blocked_callers() {
        let (listener, dialer) = listen();
        let listener = Arc::new(listener);

        let blocked = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        listener.close().unwrap();
        assert_eq!(blocked.await.unwrap().unwrap_err(), PipeError::Closed);
        assert_eq!(listener.accept().await.unwrap_err(), PipeError::Closed);
        assert_eq!(dialer.dial().await.unwrap_err(), PipeError::Closed);
        assert_eq!(listener.close().unwrap_err(), PipeError::AlreadyClosed);
    }

    #[tokio::test]
    async fn close_releases_blocked_dial() {
        let (listener, dialer) = listen();
        let blocked = tokio::spawn(async move { dialer.dial().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        listener.close().unwrap();
        assert_eq!(blocked.await.unwrap().unwrap_err(), PipeError::Closed);
    }

    #[tokio::test]
    async fn peer_sees_eof_after_close() {
        let (listener, dialer) = listen();
        let (accepted, dialed) = tokio::join!(listener.accept(), dialer.dial());
        let mut server = accepted.unwrap();
        let mut client = dialed.unwrap();

        client.write_all(b"last words").await.unwrap();
        drop(client);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"last words");
        assert!(server.write_all(b"anyone?").await.is_err());
    }

    #[tokio::test]
    async fn zero_length_write_is_noop() {
        let (listener, dialer) = listen();
        let (_server, dialed) = tokio::join!(listener.accept(), dialer.dial());
        let mut client = dialed.unwrap();
        assert_eq!(client.write(&[]).await.unwrap(), 0);
    }
}
