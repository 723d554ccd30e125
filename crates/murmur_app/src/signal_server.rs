//! `murmur signal`: introduces peers to each other.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use murmur_network::message::SignalCommon;
use murmur_network::{ClientRef, InMemoryHub, JsonCodec, NetworkConfig, SignalHub, TcpServer};

pub async fn run(addr: SocketAddr, config: &NetworkConfig) -> Result<()> {
    let hub = Arc::new(SignalHub::from_config(
        InMemoryHub::<SignalCommon>::from_config(config),
        config,
    ));

    // After the handshake peers have nothing to say to the server.
    let ignore = |client: ClientRef<SignalCommon>, _msg: SignalCommon| async move {
        debug!("Ignoring message from {}", client.name());
    };

    let server = TcpServer::bind(
        addr,
        hub,
        Arc::new(ignore),
        Arc::new(JsonCodec::<SignalCommon>::new()),
        config.limits(),
    )
    .await
    .with_context(|| format!("Failed to start signal server on {addr}"))?;
    info!("Signal server listening on {}", server.local_addr());

    crate::serve_until_interrupted(Arc::new(server)).await
}
