//! TCP server: accepts connections, registers them with a hub, and runs one
//! receive loop per connection.
//!
//! The server never looks inside messages; everything it reads is handed to
//! a [`Handler`]. Stamping sender ids, broadcasting, or forwarding to the UI
//! all happen in the handler.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::config::NetworkConfig;
use crate::connection::{Connection, ConnectionLimits};
use crate::error::NetworkError;
use crate::hub::{ClientRef, Hub};

/// Receives every decoded message together with the client it came from.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, client: ClientRef<T>, msg: T);
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(ClientRef<T>, T) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, client: ClientRef<T>, msg: T) {
        self(client, msg).await
    }
}

type ConnectionTable<T> = Arc<Mutex<HashMap<u64, Arc<Connection<T>>>>>;

/// A TCP server bound to one listener.
pub struct TcpServer<T> {
    hub: Arc<dyn Hub<T>>,
    handler: Arc<dyn Handler<T>>,
    codec: Arc<dyn Codec<T>>,
    limits: ConnectionLimits,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    next_id: AtomicU64,
    closing: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    conns: ConnectionTable<T>,
}

impl<T> TcpServer<T>
where
    T: Send + Sync + 'static,
{
    /// Bind the listener. A bind failure is the only server-wide error.
    pub async fn bind(
        addr: SocketAddr,
        hub: Arc<dyn Hub<T>>,
        handler: Arc<dyn Handler<T>>,
        codec: Arc<dyn Codec<T>>,
        limits: ConnectionLimits,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            NetworkError::Transport(format!("Failed to start listener on {addr}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;
        info!("Server bound to {local_addr}");

        Ok(Self {
            hub,
            handler,
            codec,
            limits,
            listener: Mutex::new(Some(listener)),
            local_addr,
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            conns: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Bind using the listen address and limits from `config`.
    pub async fn bind_with_config(
        config: &NetworkConfig,
        hub: Arc<dyn Hub<T>>,
        handler: Arc<dyn Handler<T>>,
        codec: Arc<dyn Codec<T>>,
    ) -> Result<Self, NetworkError> {
        Self::bind(config.listen_addr, hub, handler, codec, config.limits()).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(&self) -> Result<(), NetworkError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(NetworkError::AlreadyServing)?;

        // Counts as a tracked task so shutdown also waits for this loop.
        let _running = self.tasks.token();
        info!("Accepting connections on {}", self.local_addr);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if self.closing.load(Ordering::Acquire) {
                        break;
                    }
                    self.spawn_connection(stream, peer_addr);
                }
                Err(e) => {
                    if self.closing.load(Ordering::Acquire) {
                        break;
                    }
                    error!("Error accepting connection: {e}");
                }
            }
        }

        debug!("Accept loop on {} stopped", self.local_addr);
        Ok(())
    }

    /// Stop accepting, force-close every connection, and wait until all
    /// receive loops have exited.
    pub async fn shutdown(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("Shutting down server on {}", self.local_addr);
            self.shutdown.cancel();
            // Drops the listener if serve() was never called.
            self.listener.lock().take();

            let open: Vec<Arc<Connection<T>>> = self.conns.lock().values().cloned().collect();
            for conn in open {
                conn.close().await;
            }
            self.tasks.close();
        }

        self.tasks.wait().await;
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            id,
            stream,
            peer_addr,
            Arc::clone(&self.codec),
            self.limits,
            self.shutdown.child_token(),
        ));
        self.conns.lock().insert(id, Arc::clone(&conn));
        debug!("Accepted {} from {peer_addr}", conn.name());

        self.tasks.spawn(run_connection(
            conn,
            Arc::clone(&self.hub),
            Arc::clone(&self.handler),
            Arc::clone(&self.conns),
        ));
    }
}

/// Register, read until the stream ends, then unregister.
async fn run_connection<T>(
    conn: Arc<Connection<T>>,
    hub: Arc<dyn Hub<T>>,
    handler: Arc<dyn Handler<T>>,
    conns: ConnectionTable<T>,
) where
    T: Send + Sync + 'static,
{
    let id = conn.id();
    let client: ClientRef<T> = conn.clone();

    if let Err(e) = hub.add_client(Arc::clone(&client)).await {
        warn!("Error adding {} to hub: {e}", conn.name());
        conn.close().await;
        conns.lock().remove(&id);
        return;
    }
    info!("Client connected: {} ({})", conn.name(), conn.peer_addr());

    loop {
        match conn.read().await {
            Ok(msg) => handler.handle(Arc::clone(&client), msg).await,
            Err(NetworkError::Closed) => break,
            Err(e) if !e.is_fatal_to_connection() => {
                warn!("Skipping message from {}: {e}", conn.name());
            }
            Err(e) => {
                warn!("Error reading from {}: {e}", conn.name());
                break;
            }
        }
    }

    conn.close().await;
    if let Err(e) = hub.remove_client(&client).await {
        warn!("Error removing {} from hub: {e}", conn.name());
    }
    conns.lock().remove(&id);
    info!("Client disconnected: {}", conn.name());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::connection::write_frame;
    use crate::hub::InMemoryHub;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    async fn start(
        hub: Arc<InMemoryHub<String>>,
        handler: Arc<dyn Handler<String>>,
    ) -> Arc<TcpServer<String>> {
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            hub,
            handler,
            Arc::new(JsonCodec::<String>::new()),
            ConnectionLimits::default(),
        )
        .await
        .unwrap();
        let server = Arc::new(server);
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve().await });
        server
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    fn forwarding_handler() -> (Arc<dyn Handler<String>>, mpsc::Receiver<(u64, String)>) {
        let (tx, rx) = mpsc::channel(16);
        let handler = move |client: ClientRef<String>, msg: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((client.id(), msg)).await;
            }
        };
        (Arc::new(handler), rx)
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_hub_tracks_clients() {
        let hub = Arc::new(InMemoryHub::new(8, 4));
        let (handler, mut rx) = forwarding_handler();
        let server = start(Arc::clone(&hub), handler).await;

        let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut first, b"\"one\"").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (1, "one".to_string()));

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut second, b"\"two\"").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (2, "two".to_string()));
        assert_eq!(hub.client_ids(), vec![1, 2]);

        // Ids are not reused after a disconnect.
        drop(first);
        wait_for(|| !hub.contains(1)).await;
        let mut third = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut third, b"\"three\"").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (3, "three".to_string()));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_decode_error_skips_message() {
        let hub = Arc::new(InMemoryHub::new(8, 4));
        let (handler, mut rx) = forwarding_handler();
        let server = start(Arc::clone(&hub), handler).await;

        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut raw, b"garbage").await.unwrap();
        write_frame(&mut raw, b"\"after\"").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().1, "after");
        assert!(hub.contains(1));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_client() {
        let hub = Arc::new(InMemoryHub::new(8, 4));
        let (handler, _rx) = forwarding_handler();
        let server = start(Arc::clone(&hub), handler).await;

        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for(|| hub.contains(1)).await;
        raw.write_all(&(1u32 << 20).to_be_bytes()).await.unwrap();

        wait_for(|| hub.is_empty()).await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_receive_loops() {
        let hub = Arc::new(InMemoryHub::new(8, 4));
        let (handler, _rx) = forwarding_handler();
        let server = start(Arc::clone(&hub), handler).await;

        let _a = TcpStream::connect(server.local_addr()).await.unwrap();
        let _b = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for(|| hub.len() == 2).await;

        tokio::time::timeout(Duration::from_secs(3), server.shutdown())
            .await
            .expect("shutdown should finish");

        assert!(hub.is_empty());
        assert_eq!(server.connection_count(), 0);

        // A second shutdown is harmless.
        server.shutdown().await;
        assert!(TcpStream::connect(server.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let hub = Arc::new(InMemoryHub::new(8, 4));
        let (handler, _rx) = forwarding_handler();
        let server = start(hub, handler).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(server.serve().await, Err(NetworkError::AlreadyServing)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub: Arc<dyn Hub<String>> = Arc::new(InMemoryHub::new(1, 1));
        let (handler, _rx) = forwarding_handler();

        let result = TcpServer::bind(
            taken.local_addr().unwrap(),
            hub,
            handler,
            Arc::new(JsonCodec::<String>::new()),
            ConnectionLimits::default(),
        )
        .await;
        assert!(matches!(result, Err(NetworkError::Transport(_))));
    }
}
