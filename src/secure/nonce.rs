//! Session nonces
//!
//! A nonce must be unique per key and per direction. The first nonce a side
//! sends is seeded from time+random; every later frame advances it by
//! exactly one, big-endian. The receiving side adopts the first nonce it
//! sees and from then on requires the same +1 progression.

use super::{EntropySource, NONCE_LEN};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A 24-byte session nonce
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Seed a fresh nonce: unix-nanos timestamp followed by random bytes.
    pub fn generate(entropy: &dyn EntropySource) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        bytes[..8].copy_from_slice(&nanos.to_be_bytes());
        entropy.fill(&mut bytes[8..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// The next nonce, incremented big-endian with carry.
    pub fn next(&self) -> Self {
        let mut bytes = self.0;
        for i in (0..NONCE_LEN).rev() {
            bytes[i] = bytes[i].wrapping_add(1);
            if bytes[i] != 0 {
                break;
            }
        }
        Self(bytes)
    }
}

// Short hex prefix; full nonces are noise in logs.
impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "...)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::SystemEntropy;

    #[test]
    fn test_increment_carries() {
        let n = Nonce::from_bytes([0xff; NONCE_LEN]);
        let next = n.next();
        assert_eq!(next.as_bytes(), &[0u8; NONCE_LEN]);

        let mut bytes = [0u8; NONCE_LEN];
        bytes[NONCE_LEN - 1] = 0xff;
        let n = Nonce::from_bytes(bytes);
        let mut expected = [0u8; NONCE_LEN];
        expected[NONCE_LEN - 2] = 1;
        assert_eq!(n.next().as_bytes(), &expected);
    }

    #[test]
    fn test_increment_simple() {
        let n = Nonce::from_bytes([0u8; NONCE_LEN]);
        let mut expected = [0u8; NONCE_LEN];
        expected[NONCE_LEN - 1] = 1;
        assert_eq!(n.next().as_bytes(), &expected);
    }

    #[test]
    fn test_generated_nonces_differ() {
        let a = Nonce::generate(&SystemEntropy);
        let b = Nonce::generate(&SystemEntropy);
        assert_ne!(a, b);
    }
}
