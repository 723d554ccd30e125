//! Signal hub: the handshake gate in front of a signal server.
//!
//! A peer joining the signal server must first say who it is and where it
//! listens. Only then is it added to the wrapped hub and the peer table, and
//! every connected peer (the newcomer included) receives a fresh peer list.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::hub::{BroadcastFilter, ClientRef, Hub, HubClient};
use crate::message::{SignalCommon, SignalPeer};

/// Hub decorator that requires a handshake before admitting a client.
pub struct SignalHub<H> {
    inner: H,
    peers: Mutex<BTreeMap<u64, SignalPeer>>,
    handshake_timeout: Duration,
}

impl<H> SignalHub<H>
where
    H: Hub<SignalCommon>,
{
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            peers: Mutex::new(BTreeMap::new()),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(inner: H, config: &NetworkConfig) -> Self {
        Self::new(inner).with_handshake_timeout(config.handshake_timeout)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Current peer table, ordered by connection id.
    pub fn peers(&self) -> Vec<SignalPeer> {
        self.peers.lock().values().cloned().collect()
    }

    async fn await_handshake(
        &self,
        client: &ClientRef<SignalCommon>,
    ) -> Result<SignalPeer, NetworkError> {
        let first = tokio::time::timeout(self.handshake_timeout, client.read())
            .await
            .map_err(|_| {
                NetworkError::Handshake(format!(
                    "no handshake from {} within {:?}",
                    client.addr(),
                    self.handshake_timeout
                ))
            })?
            .map_err(|e| {
                NetworkError::Handshake(format!("reading handshake from {}: {e}", client.addr()))
            })?;

        let mut peer = first.handshake.ok_or_else(|| {
            NetworkError::Handshake(format!(
                "first message from {} is not a handshake",
                client.addr()
            ))
        })?;
        if peer.addr.is_empty() {
            return Err(NetworkError::Handshake(format!(
                "{} declared an empty address",
                client.addr()
            )));
        }
        if peer.name.is_empty() {
            peer.name = peer.addr.clone();
        }
        Ok(peer)
    }

    /// Push the current peer list to everyone. Failures are only logged.
    async fn notify(&self) {
        let snapshot = SignalCommon::peer_list(self.peers());
        if let Err(e) = self.inner.broadcast(&snapshot, &[]).await {
            warn!("Error broadcasting peer list: {e}");
        }
    }
}

#[async_trait]
impl<H> Hub<SignalCommon> for SignalHub<H>
where
    H: Hub<SignalCommon>,
{
    async fn add_client(&self, client: ClientRef<SignalCommon>) -> Result<(), NetworkError> {
        let peer = self.await_handshake(&client).await?;
        debug!("Handshake from {}: {} at {}", client.name(), peer.name, peer.addr);

        let named: ClientRef<SignalCommon> = Arc::new(NamedClient {
            inner: Arc::clone(&client),
            name: peer.name.clone(),
            addr: peer.addr.clone(),
        });
        self.inner.add_client(named).await?;

        info!("Peer joined: {} ({})", peer.name, peer.addr);
        self.peers.lock().insert(client.id(), peer);
        self.notify().await;
        Ok(())
    }

    async fn remove_client(&self, client: &ClientRef<SignalCommon>) -> Result<(), NetworkError> {
        self.inner.remove_client(client).await?;
        let removed = self.peers.lock().remove(&client.id());
        if let Some(peer) = removed {
            info!("Peer left: {} ({})", peer.name, peer.addr);
            self.notify().await;
        }
        Ok(())
    }

    async fn broadcast(
        &self,
        msg: &SignalCommon,
        filters: &[&dyn BroadcastFilter],
    ) -> Result<(), NetworkError> {
        self.inner.broadcast(msg, filters).await
    }
}

/// A client carrying the name and address it declared in its handshake.
struct NamedClient {
    inner: ClientRef<SignalCommon>,
    name: String,
    addr: String,
}

#[async_trait]
impl HubClient<SignalCommon> for NamedClient {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn send(&self, msg: &SignalCommon) -> Result<(), NetworkError> {
        self.inner.send(msg).await
    }

    async fn read(&self) -> Result<SignalCommon, NetworkError> {
        self.inner.read().await
    }

    async fn close(&self) -> bool {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::InMemoryHub;
    use tokio::sync::mpsc;

    struct Peer {
        id: u64,
        inbox: tokio::sync::Mutex<mpsc::Receiver<SignalCommon>>,
        received: Mutex<Vec<SignalCommon>>,
    }

    impl Peer {
        /// Returns the peer plus the sender feeding what it "reads".
        fn new(id: u64) -> (Arc<Self>, mpsc::Sender<SignalCommon>) {
            let (tx, rx) = mpsc::channel(4);
            let peer = Arc::new(Self {
                id,
                inbox: tokio::sync::Mutex::new(rx),
                received: Mutex::new(Vec::new()),
            });
            (peer, tx)
        }

        fn last_names(&self) -> Vec<String> {
            self.received
                .lock()
                .last()
                .and_then(|m| m.peers.as_ref())
                .map(|p| p.peers.iter().map(|p| p.name.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl HubClient<SignalCommon> for Peer {
        fn id(&self) -> u64 {
            self.id
        }

        fn name(&self) -> String {
            format!("Client #{}", self.id)
        }

        fn addr(&self) -> String {
            format!("10.0.0.1:{}", 5000 + self.id)
        }

        async fn send(&self, msg: &SignalCommon) -> Result<(), NetworkError> {
            self.received.lock().push(msg.clone());
            Ok(())
        }

        async fn read(&self) -> Result<SignalCommon, NetworkError> {
            self.inbox.lock().await.recv().await.ok_or(NetworkError::Closed)
        }

        async fn close(&self) -> bool {
            true
        }
    }

    fn hub() -> SignalHub<InMemoryHub<SignalCommon>> {
        SignalHub::new(InMemoryHub::new(8, 4)).with_handshake_timeout(Duration::from_millis(100))
    }

    async fn join(
        hub: &SignalHub<InMemoryHub<SignalCommon>>,
        id: u64,
        name: &str,
    ) -> Arc<Peer> {
        let (peer, tx) = Peer::new(id);
        tx.send(SignalCommon::handshake(name, format!("127.0.0.1:{}", 7000 + id)))
            .await
            .unwrap();
        hub.add_client(peer.clone()).await.unwrap();
        peer
    }

    #[tokio::test]
    async fn test_handshake_admits_and_announces() {
        let hub = hub();
        let alice = join(&hub, 1, "alice").await;
        assert_eq!(alice.last_names(), vec!["alice"]);

        let bob = join(&hub, 2, "bob").await;
        assert_eq!(alice.last_names(), vec!["alice", "bob"]);
        assert_eq!(bob.last_names(), vec!["alice", "bob"]);
        assert!(hub.inner().contains(2));

        assert_eq!(hub.peers()[1].addr, "127.0.0.1:7002");
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_id() {
        let hub = hub();
        join(&hub, 9, "zed").await;
        let first = join(&hub, 3, "amy").await;
        assert_eq!(first.last_names(), vec!["amy", "zed"]);
    }

    #[tokio::test]
    async fn test_silent_client_is_rejected() {
        let hub = hub();
        let (silent, _tx) = Peer::new(1);

        let err = hub.add_client(silent.clone()).await.unwrap_err();
        assert!(matches!(err, NetworkError::Handshake(_)));
        assert!(!hub.inner().contains(1));
        assert!(hub.peers().is_empty());
    }

    #[tokio::test]
    async fn test_non_handshake_first_message_is_rejected() {
        let hub = hub();
        let (peer, tx) = Peer::new(1);
        tx.send(SignalCommon::peer_list(Vec::new())).await.unwrap();

        let err = hub.add_client(peer).await.unwrap_err();
        assert!(matches!(err, NetworkError::Handshake(_)));
        assert!(hub.inner().is_empty());
    }

    #[tokio::test]
    async fn test_empty_address_is_rejected() {
        let hub = hub();
        let (peer, tx) = Peer::new(1);
        tx.send(SignalCommon::handshake("bob", "")).await.unwrap();

        assert!(matches!(
            hub.add_client(peer).await,
            Err(NetworkError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_before_handshake_is_rejected() {
        let hub = hub();
        let (peer, tx) = Peer::new(1);
        drop(tx);

        assert!(matches!(
            hub.add_client(peer).await,
            Err(NetworkError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_name_falls_back_to_address() {
        let hub = hub();
        let (peer, tx) = Peer::new(1);
        tx.send(SignalCommon::handshake("", "127.0.0.1:9000")).await.unwrap();
        hub.add_client(peer).await.unwrap();

        assert_eq!(hub.peers()[0].name, "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_remove_announces_remaining_peers() {
        let hub = hub();
        let alice = join(&hub, 1, "alice").await;
        let bob = join(&hub, 2, "bob").await;

        let gone: ClientRef<SignalCommon> = bob.clone();
        hub.remove_client(&gone).await.unwrap();

        assert_eq!(alice.last_names(), vec!["alice"]);
        assert!(!hub.inner().contains(2));

        // Removing twice sends nothing new.
        let before = alice.received.lock().len();
        hub.remove_client(&gone).await.unwrap();
        assert_eq!(alice.received.lock().len(), before);
    }
}
