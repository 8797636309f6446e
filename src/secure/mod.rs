//! Authenticated-encrypted session layer
//!
//! This module provides:
//! - X25519 key pairs with an allow-list of acceptable peers
//! - A mutually authenticated, replay-resistant session over any reliable
//!   byte transport (NaCl-box seal/open, strict +1 nonce discipline)
//! - A byte-stream adapter so higher layers can treat a session as an
//!   ordinary network connection

mod keys;
mod nonce;
mod session;
mod stream;

pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use nonce::Nonce;
pub use session::{Session, SessionConfig};
pub use stream::SecureStream;

use thiserror::Error;

/// Length of public and private keys in bytes
pub const KEY_LEN: usize = 32;

/// Length of a session nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of the replay-defeat handshake token in bytes
pub const TOKEN_LEN: usize = 16;

/// Session layer errors
#[derive(Debug, Error)]
pub enum SecureError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] crate::framing::FramingError),

    #[error("peer key not allowed: {0}")]
    AuthRejected(String),

    #[error("replayed or tampered frame")]
    ReplayOrTampered,

    #[error("message failed authenticated decryption")]
    CryptoIntegrity,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("key decode failed: {0}")]
    KeyDecode(String),
}

/// Source of randomness for nonces, tokens, stream ids, and key material.
///
/// Everything in this crate that needs entropy takes one of these, so tests
/// can substitute a deterministic source.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Default entropy source backed by the system CSPRNG.
pub struct SystemEntropy;

impl EntropySource for SystemEntropy {
    fn fill(&self, buf: &mut [u8]) {
        use ring::rand::{SecureRandom, SystemRandom};
        SystemRandom::new().fill(buf).expect("system rng failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_entropy_varies() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        SystemEntropy.fill(&mut a);
        SystemEntropy.fill(&mut b);
        assert_ne!(a, b);
    }
}
