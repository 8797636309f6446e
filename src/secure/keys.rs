//! Key management for secure sessions

use super::{EntropySource, SecureError, KEY_LEN};
use std::fmt;

/// X25519 key pair for the box-authenticated session
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a new key pair from the given entropy source.
    pub fn generate(entropy: &dyn EntropySource) -> Self {
        let mut seed = [0u8; KEY_LEN];
        entropy.fill(&mut seed);
        Self::from_private_bytes(seed)
    }

    /// Rebuild a key pair from private key bytes (derives the public key).
    pub fn from_private_bytes(private: [u8; KEY_LEN]) -> Self {
        let secret = crypto_box::SecretKey::from(private);
        let public = PublicKey(*secret.public_key().as_bytes());
        Self {
            public,
            private: PrivateKey(private),
        }
    }
}

/// X25519 public key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(pub(crate) [u8; KEY_LEN]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecureError> {
        if bytes.len() != KEY_LEN {
            return Err(SecureError::InvalidKeyLength);
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, SecureError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| SecureError::KeyDecode(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub(crate) fn to_box(&self) -> crypto_box::PublicKey {
        crypto_box::PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// X25519 private key (kept secret)
#[derive(Clone)]
pub struct PrivateKey(pub(crate) [u8; KEY_LEN]);

impl PrivateKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecureError> {
        if bytes.len() != KEY_LEN {
            return Err(SecureError::InvalidKeyLength);
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Encode as base64 (be careful with this!)
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, SecureError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| SecureError::KeyDecode(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub(crate) fn to_box(&self) -> crypto_box::SecretKey {
        crypto_box::SecretKey::from(self.0)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

// Zero out private key bytes on drop
impl Drop for PrivateKey {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}
