//! Hub: the registry of connected clients and the broadcast engine.
//!
//! [`InMemoryHub`] keeps connections in a lock-guarded map and fans messages
//! out through a counting semaphore, so a burst of concurrent broadcasts is
//! bounded instead of piling up writes. Decorators such as
//! [`SignalHub`](crate::signal::SignalHub) and
//! [`AuditHub`](crate::audit::AuditHub) wrap any other [`Hub`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// A connection as the hub sees it.
#[async_trait]
pub trait HubClient<T>: Send + Sync {
    /// Process-local id, unique for the lifetime of the server.
    fn id(&self) -> u64;
    /// Human-readable name.
    fn name(&self) -> String;
    /// Address other peers should use to reach this client.
    fn addr(&self) -> String;
    async fn send(&self, msg: &T) -> Result<(), NetworkError>;
    async fn read(&self) -> Result<T, NetworkError>;
    /// Close the underlying stream; `true` only for the call that did it.
    async fn close(&self) -> bool;
}

/// Shared handle to a registered client.
pub type ClientRef<T> = Arc<dyn HubClient<T>>;

/// Registry of connected clients supporting filtered fan-out.
#[async_trait]
pub trait Hub<T>: Send + Sync {
    async fn add_client(&self, client: ClientRef<T>) -> Result<(), NetworkError>;
    async fn remove_client(&self, client: &ClientRef<T>) -> Result<(), NetworkError>;
    /// Send `msg` to every client accepted by all `filters`.
    async fn broadcast(
        &self,
        msg: &T,
        filters: &[&dyn BroadcastFilter],
    ) -> Result<(), NetworkError>;
}

#[async_trait]
impl<T, H> Hub<T> for Arc<H>
where
    T: Send + Sync + 'static,
    H: Hub<T> + ?Sized,
{
    async fn add_client(&self, client: ClientRef<T>) -> Result<(), NetworkError> {
        (**self).add_client(client).await
    }

    async fn remove_client(&self, client: &ClientRef<T>) -> Result<(), NetworkError> {
        (**self).remove_client(client).await
    }

    async fn broadcast(
        &self,
        msg: &T,
        filters: &[&dyn BroadcastFilter],
    ) -> Result<(), NetworkError> {
        (**self).broadcast(msg, filters).await
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Decides whether a client takes part in a broadcast.
pub trait BroadcastFilter: Send + Sync {
    fn accepts(&self, client_id: u64) -> bool;
}

impl<F> BroadcastFilter for F
where
    F: Fn(u64) -> bool + Send + Sync,
{
    fn accepts(&self, client_id: u64) -> bool {
        self(client_id)
    }
}

/// Leaves one client out of a broadcast: usually the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcludeClient(pub u64);

impl BroadcastFilter for ExcludeClient {
    fn accepts(&self, client_id: u64) -> bool {
        client_id != self.0
    }
}

// ---------------------------------------------------------------------------
// In-memory hub
// ---------------------------------------------------------------------------

/// The base hub: a map of live clients plus a broadcast gate.
pub struct InMemoryHub<T> {
    clients: RwLock<HashMap<u64, ClientRef<T>>>,
    gate: Semaphore,
    gate_wait: Duration,
}

impl<T> InMemoryHub<T> {
    /// `max_broadcasts` of zero is treated as one.
    pub fn new(capacity: usize, max_broadcasts: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::with_capacity(capacity)),
            gate: Semaphore::new(max_broadcasts.max(1)),
            gate_wait: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.hub_capacity, config.broadcast_concurrency)
            .with_gate_wait(config.broadcast_wait)
    }

    /// How long a broadcast may wait for a free slot.
    pub fn with_gate_wait(mut self, wait: Duration) -> Self {
        self.gate_wait = wait;
        self
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.clients.read().contains_key(&client_id)
    }

    /// Ids of all registered clients, sorted.
    pub fn client_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Clients passing every filter. The read lock is released on return.
    fn select(&self, filters: &[&dyn BroadcastFilter]) -> Vec<ClientRef<T>> {
        let clients = self.clients.read();
        clients
            .values()
            .filter(|c| {
                let id = c.id();
                filters.iter().all(|f| f.accepts(id))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<T> Hub<T> for InMemoryHub<T>
where
    T: Send + Sync + 'static,
{
    async fn add_client(&self, client: ClientRef<T>) -> Result<(), NetworkError> {
        debug!("Hub: adding {} (#{})", client.name(), client.id());
        self.clients.write().insert(client.id(), client);
        Ok(())
    }

    async fn remove_client(&self, client: &ClientRef<T>) -> Result<(), NetworkError> {
        if self.clients.write().remove(&client.id()).is_some() {
            debug!("Hub: removed {} (#{})", client.name(), client.id());
        }
        Ok(())
    }

    async fn broadcast(
        &self,
        msg: &T,
        filters: &[&dyn BroadcastFilter],
    ) -> Result<(), NetworkError> {
        // The permit is dropped on every return path below.
        let _permit = tokio::time::timeout(self.gate_wait, self.gate.acquire())
            .await
            .map_err(|_| NetworkError::BroadcastBusy(self.gate_wait))?
            .map_err(|_| NetworkError::BroadcastBusy(self.gate_wait))?;

        let recipients = self.select(filters);
        debug!("Broadcasting to {} client(s)", recipients.len());

        for client in recipients {
            if let Err(e) = client.send(msg).await {
                warn!("Error sending to {} (#{}): {e}", client.name(), client.id());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
