//! # sockmaster
//!
//! Network building blocks that compose into a reverse-proxying "socket
//! master": a daemon that accepts outbound-initiated downstream agent
//! connections, binds the public listeners those agents ask for, and routes
//! inbound traffic back through the originating agent over a multiplexed
//! tunnel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Socket master (master)               │
//! │   listener binding, TLS composition, HTTP routing    │
//! ├─────────────────────────────────────────────────────┤
//! │              Stream multiplexer (mux)                │
//! │        many byte streams over one transport          │
//! ├─────────────────────────────────────────────────────┤
//! │            Authenticated session (secure)            │
//! │    NaCl-box handshake, nonce discipline, sealing     │
//! ├─────────────────────────────────────────────────────┤
//! │          Framed message transport (framing)          │
//! │        nonce + length prefixed whole messages        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The JSON-RPC client/server (`rpc`) and the pre-shared-key message
//! protocol (`psk`) are control-plane collaborators carried alongside the
//! core stack. Every layer runs over anything implementing tokio's
//! `AsyncRead + AsyncWrite`, so a multiplexer can sit directly on TCP or on
//! top of a [`secure::SecureStream`].

pub mod framing;
pub mod master;
pub mod mux;
pub mod psk;
pub mod rpc;
pub mod secure;

pub use master::SocketMaster;
pub use mux::Multiplexer;
pub use secure::{KeyPair, PublicKey, Session};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] framing::FramingError),

    #[error("Secure session error: {0}")]
    Secure(#[from] secure::SecureError),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("RPC error: {0}")]
    Rpc(#[from] rpc::RpcError),

    #[error("PSK protocol error: {0}")]
    Psk(#[from] psk::PskError),

    #[error("Socket master error: {0}")]
    Master(#[from] master::MasterError),
}
