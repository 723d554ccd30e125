//! Murmur Network: framed connections, hubs and peer discovery.
//!
//! This crate provides the networking layer for murmur, a peer-to-peer chat
//! overlay. Processes find each other through a discovery registry, connect
//! directly over TCP, and exchange JSON (optionally AES-GCM sealed) messages.
//!
//! # Architecture
//!
//! - **Connection**: length-prefixed frames over one TCP stream, typed
//!   through a pluggable [`Codec`].
//! - **Hub**: registry of live connections with filtered, rate-limited
//!   broadcast. Decorators add a handshake gate ([`SignalHub`]) or SQLite
//!   auditing ([`AuditHub`]).
//! - **Server / Client**: accept loop with one receive task per connection,
//!   and its outbound counterpart.
//! - **Registry**: LAN multicast or signal-server discovery behind one
//!   trait.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use murmur_network::{InMemoryHub, JsonCodec, NetworkConfig, TcpServer, message::Common};
//! use murmur_network::hub::ClientRef;
//!
//! # async fn example() -> Result<(), murmur_network::NetworkError> {
//! let config = NetworkConfig::default();
//! let hub = Arc::new(InMemoryHub::<Common>::from_config(&config));
//! let handler = |client: ClientRef<Common>, msg: Common| async move {
//!     tracing::info!("{} says {:?}", client.name(), msg);
//! };
//! let server = TcpServer::bind_with_config(
//!     &config,
//!     hub,
//!     Arc::new(handler),
//!     Arc::new(JsonCodec::<Common>::new()),
//! )
//! .await?;
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod registry;
pub mod server;
pub mod signal;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use audit::AuditHub;
pub use client::{Client, MessageHandler};
pub use codec::{Codec, EncryptedCodec, EncryptionKey, JsonCodec};
pub use config::{MulticastConfig, NetworkConfig};
pub use connection::{Connection, ConnectionLimits};
pub use error::NetworkError;
pub use hub::{BroadcastFilter, ClientRef, ExcludeClient, Hub, HubClient, InMemoryHub};
pub use registry::{MulticastRegistry, Peer, Registry, SignalRegistry};
pub use server::{Handler, TcpServer};
pub use signal::SignalHub;
