//! LAN discovery over IPv4 multicast.
//!
//! Every registered peer runs a responder on the configured group/port. A
//! querier sends one query to the group, collects the unicast responses for
//! the query window, and publishes what it heard as one snapshot. Then it
//! starts over.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Peer, Registry, split_host_port};
use crate::config::MulticastConfig;
use crate::error::NetworkError;

const DATAGRAM_BUF: usize = 2048;

/// One discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Datagram {
    Query {
        service: String,
        domain: String,
    },
    Response {
        instance: String,
        service: String,
        domain: String,
        port: u16,
        /// `[id, name, addr]`
        info: Vec<String>,
    },
}

impl Datagram {
    fn query(config: &MulticastConfig) -> Self {
        Self::Query {
            service: config.service.clone(),
            domain: config.domain.clone(),
        }
    }
}

/// Multicast-based [`Registry`].
pub struct MulticastRegistry {
    config: MulticastConfig,
    this: Arc<Mutex<Option<Peer>>>,
    responder: Option<CancellationToken>,
    queries: CancellationToken,
    peers_taken: bool,
}

impl MulticastRegistry {
    pub fn new(config: MulticastConfig) -> Self {
        Self {
            config,
            this: Arc::new(Mutex::new(None)),
            responder: None,
            queries: CancellationToken::new(),
            peers_taken: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.responder.is_some()
    }
}

impl Drop for MulticastRegistry {
    fn drop(&mut self) {
        if let Some(token) = self.responder.take() {
            token.cancel();
        }
        self.queries.cancel();
    }
}

#[async_trait]
impl Registry for MulticastRegistry {
    async fn register(&mut self, peer: Peer) -> Result<(), NetworkError> {
        let (_, port) = split_host_port(&peer.addr)?;

        let socket = bind_group_socket(&self.config)?;
        if let Some(previous) = self.responder.take() {
            previous.cancel();
        }

        info!(
            "Announcing {} ({}) on {} as {}",
            peer.name,
            peer.addr,
            self.config.group_addr(),
            self.config.qualified_service()
        );
        *self.this.lock() = Some(peer.clone());

        let token = CancellationToken::new();
        tokio::spawn(run_responder(
            socket,
            self.config.clone(),
            peer,
            port,
            token.clone(),
        ));
        self.responder = Some(token);
        Ok(())
    }

    async fn unregister(&mut self) -> Result<(), NetworkError> {
        if let Some(token) = self.responder.take() {
            token.cancel();
            debug!("Multicast responder stopped");
        }
        Ok(())
    }

    fn peers(&mut self) -> Result<mpsc::Receiver<Vec<Peer>>, NetworkError> {
        if self.peers_taken {
            return Err(NetworkError::Discovery(
                "peer stream already taken".to_string(),
            ));
        }
        self.peers_taken = true;

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(run_queries(
            self.config.clone(),
            Arc::clone(&self.this),
            tx,
            self.queries.clone(),
        ));
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Bind the group port with address reuse so several peers can share a host.
fn bind_group_socket(config: &MulticastConfig) -> Result<UdpSocket, NetworkError> {
    let err = |what: &str, e: std::io::Error| NetworkError::Discovery(format!("{what}: {e}"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| err("Failed to create socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| err("Failed to set SO_REUSEADDR", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| err("Failed to set SO_REUSEPORT", e))?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| err("Failed to bind multicast port", e))?;
    socket
        .join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| err("Failed to join multicast group", e))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| err("Failed to enable multicast loopback", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| err("Failed to set non-blocking", e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| err("Failed to convert to tokio socket", e))
}

/// The response `peer` gives to `datagram`, if any.
fn answer(datagram: &Datagram, config: &MulticastConfig, peer: &Peer, port: u16) -> Option<Datagram> {
    match datagram {
        Datagram::Query { service, domain }
            if *service == config.service && *domain == config.domain =>
        {
            Some(Datagram::Response {
                instance: peer.id.clone(),
                service: config.service.clone(),
                domain: config.domain.clone(),
                port,
                info: vec![peer.id.clone(), peer.name.clone(), peer.addr.clone()],
            })
        }
        _ => None,
    }
}

async fn run_responder(
    socket: UdpSocket,
    config: MulticastConfig,
    peer: Peer,
    port: u16,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let (len, src) = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    warn!("Multicast responder recv error: {e}");
                    continue;
                }
            },
        };

        let datagram = match serde_json::from_slice::<Datagram>(&buf[..len]) {
            Ok(d) => d,
            Err(e) => {
                trace!("Ignoring datagram from {src}: {e}");
                continue;
            }
        };

        if let Some(response) = answer(&datagram, &config, &peer, port) {
            let bytes = match serde_json::to_vec(&response) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Cannot encode multicast response: {e}");
                    continue;
                }
            };
            match socket.send_to(&bytes, src).await {
                Ok(_) => trace!("Answered query from {src}"),
                Err(e) => debug!("Response to {src} failed: {e}"),
            }
        }
    }
    debug!("Multicast responder for {} exited", peer.name);
}

// ---------------------------------------------------------------------------
// Querier
// ---------------------------------------------------------------------------

/// Peers heard during one query window.
#[derive(Debug, Default)]
struct Snapshot {
    peers: Vec<Peer>,
}

impl Snapshot {
    /// Record a response unless it is foreign, malformed, ourselves or a repeat.
    fn accept(&mut self, datagram: Datagram, config: &MulticastConfig, self_id: Option<&str>) {
        let Datagram::Response {
            instance,
            service,
            domain,
            info,
            ..
        } = datagram
        else {
            return;
        };

        let record_name = format!("{instance}.{service}.{domain}");
        if !record_name.contains(&config.qualified_service()) {
            trace!("Dropping foreign record {record_name}");
            return;
        }

        let mut fields = info.into_iter();
        let (Some(id), Some(name), Some(addr)) = (fields.next(), fields.next(), fields.next())
        else {
            trace!("Dropping malformed record {record_name}");
            return;
        };

        if self_id == Some(id.as_str()) || self.peers.iter().any(|p| p.id == id) {
            return;
        }

        let name = if name.is_empty() { addr.clone() } else { name };
        self.peers.push(Peer { id, name, addr });
    }
}

async fn run_queries(
    config: MulticastConfig,
    this: Arc<Mutex<Option<Peer>>>,
    tx: mpsc::Sender<Vec<Peer>>,
    token: CancellationToken,
) {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot bind multicast query socket: {e}");
            return;
        }
    };
    if let Err(e) = socket.set_multicast_loop_v4(true) {
        debug!("Cannot enable multicast loopback: {e}");
    }

    let query = match serde_json::to_vec(&Datagram::query(&config)) {
        Ok(q) => q,
        Err(e) => {
            warn!("Cannot encode multicast query: {e}");
            return;
        }
    };
    let group = config.group_addr();
    let mut buf = vec![0u8; DATAGRAM_BUF];

    loop {
        if let Err(e) = socket.send_to(&query, group).await {
            debug!("Multicast query to {group} failed: {e}");
        }

        let deadline = Instant::now() + config.query_window;
        let self_id = this.lock().as_ref().map(|p| p.id.clone());
        let mut snapshot = Snapshot::default();

        loop {
            let received = tokio::select! {
                _ = token.cancelled() => return,
                r = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)) => r,
            };
            match received {
                Err(_) => break,
                Ok(Ok((len, src))) => match serde_json::from_slice::<Datagram>(&buf[..len]) {
                    Ok(datagram) => snapshot.accept(datagram, &config, self_id.as_deref()),
                    Err(e) => trace!("Ignoring datagram from {src}: {e}"),
                },
                Ok(Err(e)) => {
                    debug!("Multicast query recv error: {e}");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
            }
        }

        trace!("Multicast cycle found {} peer(s)", snapshot.peers.len());
        tokio::select! {
            _ = token.cancelled() => return,
            sent = tx.send(snapshot.peers) => {
                if sent.is_err() {
                    debug!("Peer stream dropped, stopping multicast queries");
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
