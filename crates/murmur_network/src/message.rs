//! Wire envelopes: chat messages and signal-server control messages.
//!
//! Both envelopes are tagged unions expressed as structs of optional fields:
//! exactly one field is populated per message and absent fields are left out
//! of the wire form.

use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

// ---------------------------------------------------------------------------
// Chat envelope
// ---------------------------------------------------------------------------

/// Envelope exchanged between chat peers and the relay chat server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Common {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl Common {
    /// A plain text chat message.
    pub fn text(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message: Some(Message {
                from: Sender::named(from),
                text: text.into(),
                media: None,
            }),
        }
    }

    /// A chat message carrying a file attachment.
    pub fn media(from: impl Into<String>, media: Media) -> Self {
        Self {
            message: Some(Message {
                from: Sender::named(from),
                text: String::new(),
                media: Some(media),
            }),
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: Sender,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

/// Identity of a message's author.
///
/// `id` is zero until a relay server stamps the connection id it assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Sender {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
        }
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// A file attachment; `content` is the base64 text of the raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

impl Media {
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            content: STANDARD.encode(bytes),
        }
    }

    /// Package a file from disk. Only the final path component travels.
    pub fn from_file(path: &Path) -> Result<Self, NetworkError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                NetworkError::Encode(format!("{} does not name a file", path.display()))
            })?;
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(filename, &bytes))
    }

    /// Decode the attachment back into raw bytes.
    pub fn decode_content(&self) -> Result<Vec<u8>, NetworkError> {
        STANDARD
            .decode(self.content.as_bytes())
            .map_err(|e| NetworkError::Decode(format!("Invalid attachment content: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Signal envelope
// ---------------------------------------------------------------------------

/// Envelope exchanged between peers and the signal server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCommon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<SignalPeer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<SignalPeers>,
}

impl SignalCommon {
    /// The first message a peer sends after connecting.
    pub fn handshake(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            handshake: Some(SignalPeer {
                name: name.into(),
                addr: addr.into(),
            }),
            peers: None,
        }
    }

    /// A full peer-list snapshot pushed by the server.
    pub fn peer_list(peers: Vec<SignalPeer>) -> Self {
        Self {
            handshake: None,
            peers: Some(SignalPeers { peers }),
        }
    }
}

/// A peer as the signal server knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPeer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPeers {
    #[serde(default)]
    pub peers: Vec<SignalPeer>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
