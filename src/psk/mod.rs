//! Pre-shared-key message protocol
//!
//! A named-key control channel: the connector names a key, proves it can
//! seal under it, and both sides then exchange AES-256-GCM messages with a
//! sequence-token discipline. Keys are derived from passwords with
//! PBKDF2-HMAC-SHA256.
//!
//! Wire format, framed with a big-endian u64 length prefix:
//! ```text
//! message := nonce[12] || tag_len[1] || tag || sealed
//! ```
//! The tag doubles as the AEAD associated data. Each side tracks two
//! tokens: inbound messages must carry the local token (incremented
//! big-endian per message), outbound messages are sealed against the
//! remote token. After the opening exchange the acceptor demands its own
//! fresh token echoed back through the sealed channel, so a replayed
//! transcript is rejected before the channel is handed to the caller.

use crate::secure::{EntropySource, SystemEntropy};
use bytes::{BufMut, Bytes, BytesMut};
use ring::aead::{Aad, LessSafeKey, Nonce as GcmNonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Length of an AES-GCM nonce in bytes
pub const GCM_NONCE_LEN: usize = 12;

/// Length of a sequence token in bytes
pub const TOKEN_LEN: usize = 4;

/// Upper bound on a single framed message
const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

const PBKDF2_ROUNDS: u32 = 4096;

/// PSK protocol errors
#[derive(Debug, Error)]
pub enum PskError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("message failed authenticated decryption")]
    CryptoIntegrity,

    #[error("unexpected sequence token")]
    ReplayOrTampered,

    #[error("malformed message")]
    ProtocolViolation,

    #[error("invalid key length")]
    InvalidKeyLength,
}

/// Derive a key of `len` bytes from a password.
pub fn derive_key(password: &str, len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ROUNDS).unwrap(),
        &[],
        password.as_bytes(),
        &mut key,
    );
    key
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub nonce: [u8; GCM_NONCE_LEN],
    pub tag: Bytes,
    pub data: Bytes,
}

impl Message {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(GCM_NONCE_LEN + 1 + self.tag.len() + self.data.len());
        buf.put_slice(&self.nonce);
        buf.put_u8(self.tag.len() as u8);
        buf.put_slice(&self.tag);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self, PskError> {
        if raw.len() < GCM_NONCE_LEN + 1 {
            return Err(PskError::ProtocolViolation);
        }
        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce.copy_from_slice(&raw[..GCM_NONCE_LEN]);
        let tag_len = raw[GCM_NONCE_LEN] as usize;
        let rest = &raw[GCM_NONCE_LEN + 1..];
        if rest.len() < tag_len {
            return Err(PskError::ProtocolViolation);
        }
        Ok(Self {
            nonce,
            tag: Bytes::copy_from_slice(&rest[..tag_len]),
            data: Bytes::copy_from_slice(&rest[tag_len..]),
        })
    }
}

/// Big-endian +1 with wrap, in place.
fn increment(token: &mut [u8]) {
    for i in (0..token.len()).rev() {
        if token[i] == 255 {
            token[i] = 0;
        } else {
            token[i] += 1;
            break;
        }
    }
}

/// An established pre-shared-key channel.
pub struct PskChannel<T> {
    io: T,
    key: LessSafeKey,
    local_token: Vec<u8>,
    remote_token: Vec<u8>,
    entropy: Arc<dyn EntropySource>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> PskChannel<T> {
    /// Connect side: name a key and open the channel.
    pub async fn connect(io: T, name: &str, key: &[u8]) -> Result<Self, PskError> {
        Self::connect_with(io, name, key, Arc::new(SystemEntropy)).await
    }

    pub async fn connect_with(
        io: T,
        name: &str,
        key: &[u8],
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Self, PskError> {
        let key = gcm_key(key)?;
        let mut local_token = vec![0u8; TOKEN_LEN];
        entropy.fill(&mut local_token);

        let mut channel = Self {
            io,
            key,
            local_token,
            remote_token: Vec::new(),
            entropy,
        };

        // Announce the key by name, sealing our token under it.
        let token = channel.local_token.clone();
        channel.write_tagged(&token, name.as_bytes()).await?;

        // The acceptor replies with its token, tagged with ours.
        let acceptor_token = channel.read().await?;
        channel.remote_token = acceptor_token.to_vec();

        // Prove liveness: echo the acceptor's fresh token back.
        let echo = acceptor_token.to_vec();
        channel.write(&echo).await?;

        Ok(channel)
    }

    /// Accept side: the first message names one of `keys`.
    pub async fn accept(io: T, keys: &HashMap<String, Vec<u8>>) -> Result<Self, PskError> {
        Self::accept_with(io, keys, Arc::new(SystemEntropy)).await
    }

    pub async fn accept_with(
        mut io: T,
        keys: &HashMap<String, Vec<u8>>,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Self, PskError> {
        let first = read_message(&mut io).await?;
        let name = String::from_utf8_lossy(&first.tag).to_string();
        let key_bytes = keys
            .get(&name)
            .ok_or_else(|| PskError::UnknownKey(name.clone()))?;
        let key = gcm_key(key_bytes)?;

        // The sealed payload is the connector's token; opening it under the
        // named key authenticates the connector's possession of that key.
        let mut data = first.data.to_vec();
        let nonce = GcmNonce::assume_unique_for_key(first.nonce);
        let remote_token = key
            .open_in_place(nonce, Aad::from(&first.tag), &mut data)
            .map_err(|_| PskError::CryptoIntegrity)?
            .to_vec();

        let mut local_token = vec![0u8; TOKEN_LEN];
        entropy.fill(&mut local_token);
        let fresh = local_token.clone();

        let mut channel = Self {
            io,
            key,
            local_token,
            remote_token,
            entropy,
        };
        channel.write(&fresh).await?;

        // A replayed transcript cannot echo a token generated just now.
        let echoed = channel.read().await?;
        if echoed[..] != fresh[..] {
            debug!(%name, "psk liveness echo mismatch");
            return Err(PskError::ReplayOrTampered);
        }

        Ok(channel)
    }

    /// Read the next message: its tag must be the expected sequence token.
    pub async fn read(&mut self) -> Result<Bytes, PskError> {
        let message = read_message(&mut self.io).await?;
        if message.tag[..] != self.local_token[..] {
            return Err(PskError::ReplayOrTampered);
        }
        increment(&mut self.local_token);
        let mut data = message.data.to_vec();
        let nonce = GcmNonce::assume_unique_for_key(message.nonce);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(&message.tag), &mut data)
            .map_err(|_| PskError::CryptoIntegrity)?;
        Ok(Bytes::copy_from_slice(plaintext))
    }

    /// Seal and write one message tagged with the peer's sequence token.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), PskError> {
        let tag = self.remote_token.clone();
        self.write_tagged(data, &tag).await?;
        increment(&mut self.remote_token);
        Ok(())
    }

    async fn write_tagged(&mut self, data: &[u8], tag: &[u8]) -> Result<(), PskError> {
        let mut nonce = [0u8; GCM_NONCE_LEN];
        self.entropy.fill(&mut nonce);
        let mut sealed = data.to_vec();
        self.key
            .seal_in_place_append_tag(
                GcmNonce::assume_unique_for_key(nonce),
                Aad::from(tag),
                &mut sealed,
            )
            .map_err(|_| PskError::CryptoIntegrity)?;
        let message = Message {
            nonce,
            tag: Bytes::copy_from_slice(tag),
            data: Bytes::from(sealed),
        };
        write_message(&mut self.io, &message).await
    }
}

fn gcm_key(key: &[u8]) -> Result<LessSafeKey, PskError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| PskError::InvalidKeyLength)?;
    Ok(LessSafeKey::new(unbound))
}

async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> Result<Message, PskError> {
    let len = io.read_u64().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(PskError::ProtocolViolation);
    }
    let mut raw = vec![0u8; len as usize];
    io.read_exact(&mut raw).await?;
    Message::unmarshal(&raw)
}

async fn write_message<T: AsyncWrite + Unpin>(io: &mut T, message: &Message) -> Result<(), PskError> {
    let raw = message.marshal();
    let mut buf = BytesMut::with_capacity(8 + raw.len());
    buf.put_u64(raw.len() as u64);
    buf.put_slice(&raw);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key("correct horse", 32);
        let b = derive_key("correct horse", 32);
        let c = derive_key("wrong horse", 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_message_marshal_roundtrip() {
        let message = Message {
            nonce: [3u8; GCM_NONCE_LEN],
            tag: Bytes::from_static(b"tag!"),
            data: Bytes::from_static(b"sealed bytes"),
        };
        let raw = message.marshal();
        assert_eq!(Message::unmarshal(&raw).unwrap(), message);
    }

    #[test]
    fn test_unmarshal_rejects_short_input() {
        assert!(matches!(
            Message::unmarshal(&[0u8; 5]),
            Err(PskError::ProtocolViolation)
        ));
    }

    #[test]
    fn test_increment_wraps() {
        let mut token = vec![0, 0, 0, 255];
        increment(&mut token);
        assert_eq!(token, vec![0, 0, 1, 0]);
        let mut token = vec![255, 255, 255, 255];
        increment(&mut token);
        assert_eq!(token, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let key = derive_key("hunter2", 32);
        let mut keys = HashMap::new();
        keys.insert("control".to_string(), key.clone());

        let acceptor = tokio::spawn(async move {
            let mut channel = PskChannel::accept(a, &keys).await.unwrap();
            let got = channel.read().await.unwrap();
            channel.write(b"pong").await.unwrap();
            got
        });

        let mut channel = PskChannel::connect(b, "control", &key).await.unwrap();
        channel.write(b"ping").await.unwrap();
        let reply = channel.read().await.unwrap();

        assert_eq!(&acceptor.await.unwrap()[..], b"ping");
        assert_eq!(&reply[..], b"pong");
    }

    #[tokio::test]
    async fn test_unknown_key_name_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let key = derive_key("hunter2", 32);
        let keys = HashMap::new();

        let acceptor = tokio::spawn(async move { PskChannel::accept(a, &keys).await });
        let _ = PskChannel::connect(b, "nosuch", &key).await;

        assert!(matches!(
            acceptor.await.unwrap(),
            Err(PskError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut keys = HashMap::new();
        keys.insert("control".to_string(), derive_key("hunter2", 32));

        let acceptor = tokio::spawn(async move { PskChannel::accept(a, &keys).await });
        let wrong = derive_key("hunter3", 32);
        let _ = PskChannel::connect(b, "control", &wrong).await;

        assert!(matches!(
            acceptor.await.unwrap(),
            Err(PskError::CryptoIntegrity)
        ));
    }
}
