//! Network configuration shared by servers, clients, hubs and registries.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionLimits;

/// Configuration for the murmur networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the TCP server listens on.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Initial capacity of the hub's connection map.
    pub hub_capacity: usize,

    /// Maximum number of broadcasts allowed to run at the same time.
    pub broadcast_concurrency: usize,

    /// How long a broadcast waits for a free slot before giving up.
    #[serde(with = "duration_ms_serde")]
    pub broadcast_wait: Duration,

    /// Deadline for writing a single frame.
    #[serde(with = "duration_ms_serde")]
    pub write_timeout: Duration,

    /// Deadline for dialing a remote peer or server.
    #[serde(with = "duration_ms_serde")]
    pub connect_timeout: Duration,

    /// Window a signal-server client has to send its handshake.
    #[serde(with = "duration_ms_serde")]
    pub handshake_timeout: Duration,

    /// Largest encoded message accepted on the wire, in bytes.
    pub max_frame_size: usize,

    /// LAN multicast discovery settings.
    pub multicast: MulticastConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            hub_capacity: 100,
            broadcast_concurrency: 20,
            broadcast_wait: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_frame_size: 1024,
            multicast: MulticastConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Frame ceiling and write deadline applied to every connection.
    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_frame_size: self.max_frame_size,
            write_timeout: self.write_timeout,
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

/// Settings for LAN discovery over IPv4 multicast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// Multicast group queries are sent to.
    pub group: Ipv4Addr,
    /// UDP port responders listen on.
    pub port: u16,
    /// Service name advertised by every peer.
    pub service: String,
    /// Domain the service lives in.
    pub domain: String,
    /// How long one query cycle collects responses.
    #[serde(with = "duration_ms_serde")]
    pub query_window: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 70, 77),
            port: 9471,
            service: "_murmur".to_string(),
            domain: "p2p.local.".to_string(),
            query_window: Duration::from_secs(1),
        }
    }
}

impl MulticastConfig {
    /// Socket address of the multicast group.
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::from((self.group, self.port))
    }

    /// `<service>.<domain>`: the suffix every valid record name carries.
    pub fn qualified_service(&self) -> String {
        format!("{}.{}", self.service, self.domain)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
