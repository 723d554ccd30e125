//! Peer discovery.
//!
//! A [`Registry`] announces this process and yields a stream of peer-list
//! snapshots. Two transports are provided:
//!
//! - [`MulticastRegistry`]: LAN announce/query over IPv4 multicast.
//! - [`SignalRegistry`]: a link to a signal server that pushes peer lists.
//!
//! Each snapshot replaces the previous one entirely.

pub mod multicast;
pub mod signal;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NetworkError;

pub use multicast::MulticastRegistry;
pub use signal::SignalRegistry;

/// A peer as discovery reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Opaque id, generated by the process that discovered the peer.
    pub id: String,
    pub name: String,
    /// `host:port` of the peer's chat server.
    pub addr: String,
}

impl Peer {
    /// A peer with a freshly generated id.
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            addr: addr.into(),
        }
    }
}

/// Announce self, receive peer-list updates.
#[async_trait]
pub trait Registry: Send {
    /// Start announcing `peer` as this process.
    async fn register(&mut self, peer: Peer) -> Result<(), NetworkError>;

    /// Stop announcing.
    async fn unregister(&mut self) -> Result<(), NetworkError>;

    /// Stream of full peer-list snapshots. Can be taken once.
    fn peers(&mut self) -> Result<mpsc::Receiver<Vec<Peer>>, NetworkError>;
}

/// Split `host:port`, rejecting an empty host or a bad port.
pub(crate) fn split_host_port(addr: &str) -> Result<(&str, u16), NetworkError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::Discovery(format!("{addr:?} is not host:port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(NetworkError::Discovery(format!("{addr:?} has no host")));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| NetworkError::Discovery(format!("{addr:?} has a bad port: {e}")))?;
    Ok((host, port))
}
