//! Outbound client: one connection to a remote server or peer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::NetworkConfig;
use crate::connection::{Connection, ConnectionLimits};
use crate::error::NetworkError;
use crate::hub::ClientRef;

/// Callback for messages arriving on an outbound connection.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn on_message(&self, msg: T);
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_message(&self, msg: T) {
        self(msg).await
    }
}

/// A dialed connection.
pub struct Client<T> {
    conn: Arc<Connection<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<T> Client<T>
where
    T: Send + Sync + 'static,
{
    /// Dial `addr`, giving up after `connect_timeout`.
    pub async fn connect(
        addr: &str,
        codec: Arc<dyn Codec<T>>,
        connect_timeout: Duration,
        limits: ConnectionLimits,
    ) -> Result<Self, NetworkError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectTimeout {
                addr: addr.to_string(),
                timeout: connect_timeout,
            })?
            .map_err(|e| NetworkError::Transport(format!("Failed to connect to {addr}: {e}")))?;
        let peer_addr: SocketAddr = stream.peer_addr()?;
        debug!("Connected to {peer_addr}");

        let conn = Connection::new(0, stream, peer_addr, codec, limits, CancellationToken::new())
            .with_name(addr.to_string());
        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    /// Dial using the timeout and limits from `config`.
    pub async fn connect_with_config(
        addr: &str,
        codec: Arc<dyn Codec<T>>,
        config: &NetworkConfig,
    ) -> Result<Self, NetworkError> {
        Self::connect(addr, codec, config.connect_timeout, config.limits()).await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn name(&self) -> &str {
        self.conn.name()
    }

    /// The connection as a hub client.
    pub fn as_client_ref(&self) -> ClientRef<T> {
        self.conn.clone()
    }

    pub async fn send(&self, msg: &T) -> Result<(), NetworkError> {
        self.conn.send(msg).await
    }

    /// Run the receive loop until the connection ends, then close it.
    ///
    /// Undecodable messages are skipped; any other read error ends the loop.
    pub async fn handle<H>(&self, handler: H)
    where
        H: MessageHandler<T>,
    {
        loop {
            match self.conn.read().await {
                Ok(msg) => handler.on_message(msg).await,
                Err(NetworkError::Closed) => break,
                Err(e) if !e.is_fatal_to_connection() => {
                    warn!("Skipping message from {}: {e}", self.conn.name());
                }
                Err(e) => {
                    warn!("Error reading from {}: {e}", self.conn.name());
                    break;
                }
            }
        }
        if self.conn.close().await {
            info!("Disconnected from {}", self.conn.name());
        }
    }

    /// Close the connection; `true` only for the call that closed it.
    pub async fn close(&self) -> bool {
        self.conn.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
