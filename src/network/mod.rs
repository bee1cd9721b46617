//! Network Module
//!
//! The legacy leader query protocol (codec, responder and client side) and
//! the client connection listener.

pub mod protocol;
mod responder;
mod listener;

pub use protocol::LeaderResponse;
pub use responder::{build_response, VoteResponder};
pub use listener::{ConnectionListener, StatusListener};

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use protocol::encode_request;
use crate::error::{Error, Result};

/// Largest datagram we bother reading
const MAX_DATAGRAM: usize = 64;

/// Ask one server who it believes the leader is.
///
/// Uses a fresh ephemeral socket; answers carrying a different xid are
/// discarded until the timeout expires.
pub async fn query_leader(target: SocketAddr, xid: u32, timeout: Duration) -> Result<LeaderResponse> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::Network(format!("Failed to bind query socket: {}", e)))?;

    socket.send_to(&encode_request(xid), target).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let deadline = Instant::now() + timeout;

    loop {
        let (len, src) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                return Err(Error::Network(format!("Query to {} failed: {}", target, e)));
            }
            Err(_) => {
                return Err(Error::Network(format!(
                    "No response from {} within {:?}",
                    target, timeout
                )));
            }
        };

        match LeaderResponse::decode(&buf[..len]) {
            Ok(response) if response.xid == xid => return Ok(response),
            Ok(response) => {
                tracing::debug!("Got bad xid {} from {} (expected {})", response.xid, src, xid);
            }
            Err(e) => {
                tracing::debug!("Ignoring response from {}: {}", src, e);
            }
        }
    }
}
