//! `murmur server`: a chat room relayed through one server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use murmur_network::message::Common;
use murmur_network::{
    AuditHub, ClientRef, Codec, ExcludeClient, Handler, Hub, InMemoryHub, NetworkConfig,
    TcpServer,
};

pub async fn run(
    addr: SocketAddr,
    audit_db: Option<&Path>,
    codec: Arc<dyn Codec<Common>>,
    config: &NetworkConfig,
) -> Result<()> {
    let base = InMemoryHub::<Common>::from_config(config);
    let hub: Arc<dyn Hub<Common>> = match audit_db {
        Some(path) => Arc::new(
            AuditHub::open(base, path)
                .with_context(|| format!("Failed to open audit database {}", path.display()))?,
        ),
        None => Arc::new(base),
    };

    let server = TcpServer::bind(addr, Arc::clone(&hub), relay_handler(hub), codec, config.limits())
        .await
        .with_context(|| format!("Failed to start relay server on {addr}"))?;
    info!("Relay server listening on {}", server.local_addr());

    crate::serve_until_interrupted(Arc::new(server)).await
}

/// Put the connection's identity on a message. The id is always the
/// server's; a name the sender chose is kept.
pub fn stamp(msg: &mut Common, client_id: u64, client_name: impl FnOnce() -> String) {
    if let Some(message) = msg.message.as_mut() {
        message.from.id = client_id;
        if message.from.name.is_empty() {
            message.from.name = client_name();
        }
    }
}

fn relay_handler(hub: Arc<dyn Hub<Common>>) -> Arc<dyn Handler<Common>> {
    Arc::new(move |client: ClientRef<Common>, mut msg: Common| {
        let hub = Arc::clone(&hub);
        async move {
            let id = client.id();
            stamp(&mut msg, id, || client.name());
            if let Some(message) = &msg.message {
                info!("New message from client {id}: {}", message.text);
            }

            if let Err(e) = hub.broadcast(&msg, &[&ExcludeClient(id)]).await {
                warn!("Error broadcasting message from client {id}: {e}");
            }
        }
    })
}
