//! Bidirectional store-and-forward relay.
//!
//! One [`Relay`] serves one connection pair. Each direction runs a
//! read-then-write loop over a single working buffer; the first
//! failure — I/O error or clean end-of-stream, both treated alike —
//! trips a shared cancellation token and the opposite direction
//! stops at its next read. Byte counters are bumped on the writer
//! side and are meaningful once both loops have returned.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 0xffff;

/// Anything the relay can move bytes across.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Boxed connection endpoint, plain TCP or TLS.
pub type IoStream = Box<dyn Stream>;

/// Copy direction relative to the accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted side towards the dialed side; counts as sent.
    Outbound,
    /// Dialed side back to the accepted side; counts as received.
    Inbound,
}

pub struct Relay {
    buffer_size: usize,
    token: CancellationToken,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Relay {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Relay {
            buffer_size,
            token: CancellationToken::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Trip the shared teardown latch. Safe to call from either
    /// direction any number of times; only the first has an effect.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the teardown latch has been tripped.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    /// Final `(bytes_sent, bytes_received)` tally. Stable once both
    /// copy loops have returned.
    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }

    /// Credit bytes written outside the copy loops (first-buffer
    /// edits happen before a direction enters [`run`](Self::run)).
    pub fn count(&self, direction: Direction, n: u64) {
        match direction {
            Direction::Outbound => self.bytes_sent.fetch_add(n, Ordering::Relaxed),
            Direction::Inbound => self.bytes_received.fetch_add(n, Ordering::Relaxed),
        };
    }

    /// Copy `src` into `dst` until end-of-stream, an I/O error, or
    /// the other direction trips the latch. Always leaves the latch
    /// tripped and the destination's write side shut down on return.
    pub async fn run<R, W>(&self, mut src: R, mut dst: W, direction: Direction)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let n = tokio::select! {
                _ = self.token.cancelled() => break,
                read = src.read(&mut buffer) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("{direction:?} read failed: {e}");
                        break;
                    }
                },
            };
            if let Err(e) = dst.write_all(&buffer[..n]).await {
                debug!("{direction:?} write failed: {e}");
                break;
            }
            self.count(direction, n as u64);
        }
        self.shutdown();
        let _ = dst.shutdown().await;
    }

    /// Plain full-duplex relay between two endpoints; returns the
    /// final byte tally once both directions have stopped.
    pub async fn pipe(&self, accepted: IoStream, dialed: IoStream) -> (u64, u64) {
        let (ar, aw) = tokio::io::split(accepted);
        let (dr, dw) = tokio::io::split(dialed);
        tokio::join!(
            self.run(ar, dw, Direction::Outbound),
            self.run(dr, aw, Direction::Inbound),
        );
        self.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pipes_bytes_both_ways_unmodified() {
        let (mut client, client_side) = duplex(64);
        let (backend_side, mut backend) = duplex(64);

        let relay = Relay::new(DEFAULT_BUFFER_SIZE);
        let worker = {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay
                    .pipe(Box::new(client_side), Box::new(backend_side))
                    .await
            })
        };

        client.write_all(b"hello backend").await.unwrap();
        let mut buf = [0u8; 13];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello backend");

        backend.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        drop(client);
        let (sent, received) = worker.await.unwrap();
        assert_eq!(sent, 13);
        assert_eq!(received, 12);
    }

    #[tokio::test]
    async fn eof_on_one_side_tears_down_both() {
        let (client, client_side) = duplex(64);
        let (backend_side, mut backend) = duplex(64);

        let relay = Relay::new(DEFAULT_BUFFER_SIZE);
        let worker = {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay
                    .pipe(Box::new(client_side), Box::new(backend_side))
                    .await
            })
        };

        drop(client);
        worker.await.unwrap();

        // The surviving peer observes end-of-stream promptly.
        let mut buf = [0u8; 1];
        assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
        assert!(relay.is_shut_down());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let relay = Relay::new(16);
        relay.shutdown();
        relay.shutdown();
        assert!(relay.is_shut_down());
    }

    #[tokio::test]
    async fn tripped_latch_stops_a_fresh_direction() {
        let (_a, a_side) = duplex(64);
        let (b_side, _b) = duplex(64);

        let relay = Relay::new(16);
        relay.shutdown();

        let (ar, _aw) = tokio::io::split(a_side);
        let (_br, bw) = tokio::io::split(b_side);
        // Returns immediately instead of blocking on the idle reader.
        relay.run(ar, bw, Direction::Outbound).await;
        assert_eq!(relay.bytes(), (0, 0));
    }
}
