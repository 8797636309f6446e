//! Downstream agent side of the socket master
//!
//! An agent dials the master, asks it to publish a socket, and then accepts
//! multiplexed streams, one per inbound connection (or HTTP request) on the
//! public listener.

use super::protocol::{self, HandshakeRequest, SocketDefinition};
use super::MasterError;
use crate::mux::Multiplexer;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Connect to the socket master, bind a public socket, and return the
/// acceptor-side multiplexer carrying the published traffic.
pub async fn listen<A: ToSocketAddrs>(
    master_addr: A,
    definition: SocketDefinition,
) -> Result<Multiplexer, MasterError> {
    let mut conn = TcpStream::connect(master_addr).await?;

    protocol::write_handshake_request(
        &mut conn,
        &HandshakeRequest {
            socket_definition: definition,
        },
    )
    .await?;

    let response = protocol::read_handshake_response(&mut conn).await?;
    if !response.is_ok() {
        return Err(MasterError::Rejected(response.status));
    }
    debug!("socket registered with master");

    Ok(Multiplexer::new(conn))
}
