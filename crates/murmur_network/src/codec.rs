//! Pluggable message codecs.
//!
//! A [`Codec`] turns a typed message into the bytes of one frame and back.
//! [`JsonCodec`] is the default; [`EncryptedCodec`] seals the same JSON with
//! AES-256-GCM so two peers sharing a key can talk over an untrusted LAN.

use std::fmt;
use std::marker::PhantomData;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::NetworkError;

const NONCE_LEN: usize = 12;

/// Encode/decode contract used by every connection.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, NetworkError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, NetworkError>;
}

/// Plain JSON encoding.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, NetworkError> {
        serde_json::to_vec(value).map_err(|e| NetworkError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, NetworkError> {
        serde_json::from_slice(bytes).map_err(|e| NetworkError::Decode(e.to_string()))
    }
}

/// A 256-bit symmetric key shared by every peer of one chat network.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// JSON sealed with AES-256-GCM.
///
/// Frame layout: 12-byte random nonce followed by the ciphertext and tag.
pub struct EncryptedCodec<T> {
    cipher: Aes256Gcm,
    inner: JsonCodec<T>,
}

impl<T> EncryptedCodec<T> {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
            inner: JsonCodec::new(),
        }
    }
}

impl<T> Codec<T> for EncryptedCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, NetworkError> {
        let plaintext = self.inner.encode(value)?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| NetworkError::Encode(format!("Encryption failed: {e}")))?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, NetworkError> {
        if bytes.len() < NONCE_LEN {
            return Err(NetworkError::Decode("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| NetworkError::Decode(format!("Decryption failed: {e}")))?;

        self.inner.decode(&plaintext)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Common, Media};

    fn sample() -> Common {
        let mut msg = Common::text("alice", "hello there");
        if let Some(m) = msg.message.as_mut() {
            m.from.id = 7;
            m.media = Some(Media::from_bytes("notes.txt", b"line one\nline two"));
        }
        msg
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec::<Common>::new();
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_json_decode_garbage() {
        let codec = JsonCodec::<Common>::new();
        let err = codec.decode(b"\x00\x01 not json").unwrap_err();
        assert!(matches!(err, NetworkError::Decode(_)));
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let codec = EncryptedCodec::<Common>::new(&EncryptionKey::generate());
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_encrypted_nonce_is_random() {
        let codec = EncryptedCodec::<Common>::new(&EncryptionKey::generate());
        let a = codec.encode(&sample()).unwrap();
        let b = codec.encode(&sample()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_encrypted_wrong_key_fails_decode() {
        let sender = EncryptedCodec::<Common>::new(&EncryptionKey::generate());
        let receiver = EncryptedCodec::<Common>::new(&EncryptionKey::generate());
        let bytes = sender.encode(&sample()).unwrap();
        assert!(matches!(receiver.decode(&bytes), Err(NetworkError::Decode(_))));
    }

    #[test]
    fn test_encrypted_short_input() {
        let codec = EncryptedCodec::<Common>::new(&EncryptionKey::from_bytes([9; 32]));
        assert!(matches!(codec.decode(&[1, 2, 3]), Err(NetworkError::Decode(_))));
    }

    #[test]
    fn test_key_debug_hides_material() {
        let key = EncryptionKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{key:?}"), "EncryptionKey(..)");
    }
}
