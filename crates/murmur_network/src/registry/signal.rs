//! Discovery through a signal server.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Peer, Registry};
use crate::client::Client;
use crate::codec::{Codec, JsonCodec};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::message::SignalCommon;

/// [`Registry`] backed by a signal server link.
///
/// Each peer list the server pushes is authoritative: it replaces whatever
/// came before. Our own entry is dropped by name and every other peer gets a
/// fresh local id.
pub struct SignalRegistry {
    server_addr: String,
    codec: Arc<dyn Codec<SignalCommon>>,
    config: NetworkConfig,
    link: Option<(Client<SignalCommon>, JoinHandle<()>)>,
    tx: mpsc::Sender<Vec<Peer>>,
    rx: Option<mpsc::Receiver<Vec<Peer>>>,
}

impl SignalRegistry {
    pub fn new(server_addr: impl Into<String>, config: NetworkConfig) -> Self {
        let (tx, rx) = mpsc::channel(10);
        Self {
            server_addr: server_addr.into(),
            codec: Arc::new(JsonCodec::<SignalCommon>::new()),
            config,
            link: None,
            tx,
            rx: Some(rx),
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn is_registered(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|(client, _)| !client.is_closed())
    }
}

/// Turn a server peer list into a snapshot without `own_name`.
fn snapshot(msg: &SignalCommon, own_name: &str) -> Option<Vec<Peer>> {
    let list = msg.peers.as_ref()?;
    Some(
        list.peers
            .iter()
            .filter(|p| p.name != own_name)
            .map(|p| Peer::new(p.name.clone(), p.addr.clone()))
            .collect(),
    )
}

#[async_trait]
impl Registry for SignalRegistry {
    async fn register(&mut self, peer: Peer) -> Result<(), NetworkError> {
        if let Some((old, _)) = self.link.take() {
            old.close().await;
        }

        let client =
            Client::connect_with_config(&self.server_addr, Arc::clone(&self.codec), &self.config)
                .await
                .map_err(|e| {
                    NetworkError::Discovery(format!(
                        "Failed to reach signal server {}: {e}",
                        self.server_addr
                    ))
                })?;

        let receiver = client.clone();
        let tx = self.tx.clone();
        let own_name = peer.name.clone();
        let task = tokio::spawn(async move {
            receiver
                .handle(move |msg: SignalCommon| {
                    let tx = tx.clone();
                    let update = snapshot(&msg, &own_name);
                    async move {
                        if let Some(peers) = update {
                            debug!("Signal server reports {} peer(s)", peers.len());
                            if tx.send(peers).await.is_err() {
                                debug!("Peer stream dropped");
                            }
                        }
                    }
                })
                .await;
        });

        if let Err(e) = client
            .send(&SignalCommon::handshake(peer.name.clone(), peer.addr.clone()))
            .await
        {
            client.close().await;
            task.abort();
            return Err(NetworkError::Discovery(format!(
                "Failed to send handshake: {e}"
            )));
        }

        info!(
            "Registered {} ({}) with signal server {}",
            peer.name, peer.addr, self.server_addr
        );
        self.link = Some((client, task));
        Ok(())
    }

    async fn unregister(&mut self) -> Result<(), NetworkError> {
        if let Some((client, task)) = self.link.take() {
            client.close().await;
            if let Err(e) = task.await {
                warn!("Signal receive loop ended abnormally: {e}");
            }
            debug!("Unregistered from signal server {}", self.server_addr);
        }
        Ok(())
    }

    fn peers(&mut self) -> Result<mpsc::Receiver<Vec<Peer>>, NetworkError> {
        self.rx
            .take()
            .ok_or_else(|| NetworkError::Discovery("peer stream already taken".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SignalPeer;

    fn signal_peer(name: &str, addr: &str) -> SignalPeer {
        SignalPeer {
            name: name.into(),
            addr: addr.into(),
        }
    }

    #[test]
    fn test_snapshot_excludes_self_and_regenerates_ids() {
        let msg = SignalCommon::peer_list(vec![
            signal_peer("alice", "10.0.0.1:1"),
            signal_peer("bob", "10.0.0.2:1"),
        ]);

        let first = snapshot(&msg, "alice").unwrap();
        let second = snapshot(&msg, "alice").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "bob");
        assert_eq!(first[0].addr, "10.0.0.2:1");
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn test_snapshot_ignores_handshakes() {
        assert!(snapshot(&SignalCommon::handshake("x", "y:1"), "alice").is_none());
        assert_eq!(snapshot(&SignalCommon::peer_list(vec![]), "alice"), Some(vec![]));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut registry = SignalRegistry::new(addr, NetworkConfig::default());
        let err = registry
            .register(Peer::new("alice", "127.0.0.1:4000"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Discovery(_)));
        assert!(!registry.is_registered());
    }

    #[tokio::test]
    async fn test_peer_stream_taken_once() {
        let mut registry = SignalRegistry::new("127.0.0.1:1", NetworkConfig::default());
        assert!(registry.peers().is_ok());
        assert!(registry.peers().is_err());
    }
}
