//! Stream multiplexer
//!
//! Carries many independent bidirectional byte streams over one underlying
//! reliable transport. Each stream is addressed by a 24-byte identifier;
//! frames are either DATA (length-prefixed payload) or CLOSE. This is a
//! pure demultiplexing layer: no windowing, no credits, no fairness. A
//! slow reader on one stream stalls dispatch for the whole multiplexer.

mod frame;
mod multiplexer;
mod stream;

pub use multiplexer::Multiplexer;
pub use stream::MuxStream;

use crate::secure::EntropySource;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of a stream identifier in bytes
pub const SID_LEN: usize = 24;

/// Upper bound on a single DATA payload (16 MiB)
pub(crate) const MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer closed")]
    Closed,

    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

/// Stream identifier: 24 opaque bytes, compared byte-wise.
///
/// The opening side picks one from a time+random generator; the accepting
/// side learns it from the first frame bearing it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid([u8; SID_LEN]);

impl Sid {
    pub(crate) fn generate(entropy: &dyn EntropySource) -> Self {
        let mut bytes = [0u8; SID_LEN];
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        bytes[..8].copy_from_slice(&nanos.to_be_bytes());
        entropy.fill(&mut bytes[8..]);
        Self(bytes)
    }

    pub(crate) fn from_bytes(bytes: [u8; SID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SID_LEN] {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::SystemEntropy;

    #[test]
    fn test_generated_sids_differ() {
        let a = Sid::generate(&SystemEntropy);
        let b = Sid::generate(&SystemEntropy);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_is_hex() {
        let sid = Sid::from_bytes([0xab; SID_LEN]);
        assert_eq!(sid.to_string(), "ab".repeat(SID_LEN));
    }
}
