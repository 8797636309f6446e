//! Socket-master routing core
//!
//! Downstream agents dial in, announce the public `(address, port)` they
//! want published, and switch their control connection into a multiplexed
//! session. The master binds (or reuses) the public listener, composes a
//! TLS configuration from whatever certificates the downstreams supply,
//! and routes each inbound connection back through a matching agent —
//! either as raw copied bytes or as individually routed HTTP/1.1 requests.

mod http;
mod server;
mod tls;

pub mod client;
pub mod protocol;

pub use protocol::{
    HandshakeRequest, HandshakeResponse, HttpDefinition, SocketDefinition, TlsDefinition,
};
pub use server::SocketMaster;

use thiserror::Error;

/// Socket master errors
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("no usable certificate in downstream TLS material")]
    NoCertificate,

    #[error(transparent)]
    Mux(#[from] crate::mux::MuxError),
}
