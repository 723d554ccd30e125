//! Framed connections: typed send/receive over one TCP stream.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! codec output. The ceiling applies in both directions: oversized outgoing
//! messages are rejected before anything is written, and an oversized
//! incoming header ends the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::Codec;
use crate::error::NetworkError;
use crate::hub::HubClient;

const HEADER_LEN: usize = 4;

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Largest encoded message, in bytes.
    pub max_frame_size: usize,
    /// Deadline for writing one frame.
    pub write_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 1024,
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// One TCP stream paired with a codec.
///
/// Reads and writes go through separate halves so a broadcast can write to a
/// connection while its receive loop is parked in `read()`.
pub struct Connection<T> {
    id: u64,
    name: String,
    peer_addr: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    codec: Arc<dyn Codec<T>>,
    limits: ConnectionLimits,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl<T> Connection<T> {
    /// Wrap an established stream.
    ///
    /// `closed` is cancelled when the connection closes. Passing a child of
    /// a server-wide token lets the server force-close every connection at
    /// once, including ones accepted while it was shutting down.
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        codec: Arc<dyn Codec<T>>,
        limits: ConnectionLimits,
        closed: CancellationToken,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY for {peer_addr}: {e}");
        }
        let (reader, writer) = stream.into_split();
        Self {
            id,
            name: format!("Client #{id}"),
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            codec,
            limits,
            closing: AtomicBool::new(false),
            closed,
        }
    }

    /// Replace the derived display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.closed.is_cancelled()
    }

    /// Encode and write one message.
    ///
    /// A write that fails or misses its deadline may have left half a frame
    /// on the wire, so the connection is closed before the error returns.
    pub async fn send(&self, msg: &T) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let payload = self.codec.encode(msg)?;
        if payload.len() > self.limits.max_frame_size {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: self.limits.max_frame_size,
            });
        }

        let timeout = self.limits.write_timeout;
        let written = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &payload).await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.close().await;
                Err(NetworkError::Transport(format!(
                    "Write to {} failed: {e}",
                    self.name
                )))
            }
            Err(_) => {
                self.close().await;
                Err(NetworkError::WriteTimeout(timeout))
            }
        }
    }

    /// Read and decode the next message.
    ///
    /// Returns [`NetworkError::Decode`] for a frame that arrived intact but
    /// did not decode; the stream is still usable afterwards. Every other
    /// error means the connection is finished.
    pub async fn read(&self) -> Result<T, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(NetworkError::Closed),
            frame = read_frame(&mut *reader, self.limits.max_frame_size) => frame?,
        };
        drop(reader);

        self.codec.decode(&frame)
    }

    /// Close the connection. Only the first call does anything; it returns
    /// `true`, every later or concurrent call returns `false`.
    pub async fn close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {e}", self.name);
        }
        debug!("Closed connection {} ({})", self.name, self.peer_addr);
        true
    }
}

#[async_trait]
impl<T> HubClient<T> for Connection<T>
where
    T: Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn addr(&self) -> String {
        self.peer_addr.to_string()
    }

    async fn send(&self, msg: &T) -> Result<(), NetworkError> {
        Connection::send(self, msg).await
    }

    async fn read(&self) -> Result<T, NetworkError> {
        Connection::read(self).await
    }

    async fn close(&self) -> bool {
        Connection::close(self).await
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame longer than u32"))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame of at most `max` payload bytes.
///
/// EOF before a header starts is reported as [`NetworkError::Closed`].
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(NetworkError::Closed),
        Err(e) => return Err(NetworkError::Io(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(NetworkError::MessageTooLarge { size: len, max });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetworkError::Transport(format!("Truncated frame: {e}")))?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use tokio::net::TcpListener;

    async fn raw_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer_addr) = listener.accept().await.unwrap();
        (dialed, accepted, peer_addr)
    }

    fn wrap(stream: TcpStream, addr: SocketAddr, limits: ConnectionLimits) -> Connection<String> {
        Connection::new(
            1,
            stream,
            addr,
            Arc::new(JsonCodec::<String>::new()),
            limits,
            CancellationToken::new(),
        )
    }

    async fn conn_pair() -> (Connection<String>, Connection<String>) {
        let (a, b, addr) = raw_pair().await;
        let limits = ConnectionLimits::default();
        (wrap(a, addr, limits), wrap(b, addr, limits))
    }

    #[tokio::test]
    async fn test_send_and_read() {
        let (a, b) = conn_pair().await;
        a.send(&"hello".to_string()).await.unwrap();
        a.send(&"world".to_string()).await.unwrap();

        assert_eq!(b.read().await.unwrap(), "hello");
        assert_eq!(b.read().await.unwrap(), "world");
    }

    #[tokio::test]
    async fn test_default_name() {
        let (a, _b) = conn_pair().await;
        assert_eq!(a.name(), "Client #1");
        let renamed = a.with_name("relay");
        assert_eq!(renamed.name(), "relay");
    }

    #[tokio::test]
    async fn test_oversized_send_rejected_before_write() {
        let (a, b, addr) = raw_pair().await;
        let limits = ConnectionLimits {
            max_frame_size: 16,
            ..ConnectionLimits::default()
        };
        let a = wrap(a, addr, limits);
        let b = wrap(b, addr, limits);

        let err = a.send(&"x".repeat(64)).await.unwrap_err();
        assert!(matches!(err, NetworkError::MessageTooLarge { max: 16, .. }));
        assert!(!a.is_closed());

        let nothing = tokio::time::timeout(Duration::from_millis(100), b.read()).await;
        assert!(nothing.is_err(), "no bytes should have been written");

        a.send(&"ok".to_string()).await.unwrap();
        assert_eq!(b.read().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_connection() {
        let (mut raw, accepted, addr) = raw_pair().await;
        let conn = wrap(accepted, addr, ConnectionLimits::default());

        write_frame(&mut raw, b"{not json").await.unwrap();
        write_frame(&mut raw, b"\"fine\"").await.unwrap();

        assert!(matches!(conn.read().await, Err(NetworkError::Decode(_))));
        assert_eq!(conn.read().await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_is_fatal() {
        let (mut raw, accepted, addr) = raw_pair().await;
        let conn = wrap(accepted, addr, ConnectionLimits::default());

        raw.write_all(&(4096u32).to_be_bytes()).await.unwrap();
        let err = conn.read().await.unwrap_err();
        assert!(matches!(err, NetworkError::MessageTooLarge { size: 4096, .. }));
        assert!(err.is_fatal_to_connection());
    }

    #[tokio::test]
    async fn test_remote_eof_reads_as_closed() {
        let (raw, accepted, addr) = raw_pair().await;
        let conn = wrap(accepted, addr, ConnectionLimits::default());
        drop(raw);

        assert!(matches!(conn.read().await, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_close_runs_once() {
        let (a, b) = conn_pair().await;
        let a = Arc::new(a);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let a = Arc::clone(&a);
            handles.push(tokio::spawn(async move { a.close().await }));
        }

        let mut performed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert!(a.is_closed());
        assert!(matches!(a.send(&"late".to_string()).await, Err(NetworkError::Closed)));
        assert!(matches!(b.read().await, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (a, _b) = conn_pair().await;
        let a = Arc::new(a);

        let reader = Arc::clone(&a);
        let pending = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(a.close().await);
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read should wake up")
            .unwrap();
        assert!(matches!(result, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_parent_token_closes_connection() {
        let (a, b, addr) = raw_pair().await;
        let parent = CancellationToken::new();
        let conn = Connection::<String>::new(
            3,
            b,
            addr,
            Arc::new(JsonCodec::<String>::new()),
            ConnectionLimits::default(),
            parent.child_token(),
        );

        parent.cancel();
        assert!(conn.is_closed());
        assert!(matches!(conn.read().await, Err(NetworkError::Closed)));
        // The stream itself still gets shut down exactly once.
        assert!(conn.close().await);
        drop(a);
    }

    #[tokio::test]
    async fn test_frames_survive_coalescing() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"one").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        write_frame(&mut client, b"three").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), b"one");
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), b"");
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), b"three");
        assert!(matches!(
            read_frame(&mut server, 1024).await,
            Err(NetworkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_hits_write_timeout() {
        let (a, _unread, addr) = raw_pair().await;
        let limits = ConnectionLimits::default();
        let a = wrap(a, addr, limits);
        let payload = "x".repeat(990);

        let mut last_ok = tokio::time::Instant::now();
        let mut failure = None;
        for _ in 0..100_000 {
            match a.send(&payload).await {
                Ok(()) => last_ok = tokio::time::Instant::now(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let stalled_for = last_ok.elapsed();

        let err = failure.expect("socket buffers never filled");
        assert!(matches!(err, NetworkError::WriteTimeout(t) if t == limits.write_timeout));
        assert!(stalled_for >= Duration::from_millis(900), "{stalled_for:?}");
        assert!(stalled_for < Duration::from_secs(3), "{stalled_for:?}");
        assert!(a.is_closed());
        assert!(matches!(a.send(&"late".to_string()).await, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server, 1024).await,
            Err(NetworkError::Transport(_))
        ));
    }
}
