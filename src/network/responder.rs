//! Legacy Vote Responder
//!
//! Answers raw "who is the leader" datagrams on the quorum port. Only
//! started when the node runs the legacy UDP exchange election.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{decode_request, LeaderResponse, RESPONSE_LEN};
use crate::error::{Error, Result};
use crate::state::{PeerStatus, ServerState};

/// Build the answer to one request datagram.
///
/// Returns `Ok(None)` when no answer should be sent (observers keep to
/// themselves) and an error for malformed requests.
pub async fn build_response(status: &PeerStatus, request: &[u8]) -> Result<Option<LeaderResponse>> {
    let xid = decode_request(request)?;
    let my_id = status.my_id();
    let vote = status.vote().await;

    let response = match status.state() {
        ServerState::Looking => Some(LeaderResponse {
            xid,
            server_id: my_id,
            leader_id: vote.leader_id,
            zxid: Some(vote.leader_zxid),
        }),
        ServerState::Leading => {
            // No runner yet while the role is being set up
            let proposed = status.active_runner().await.and_then(|r| r.last_zxid());
            Some(LeaderResponse {
                xid,
                server_id: my_id,
                leader_id: my_id,
                zxid: proposed,
            })
        }
        ServerState::Following => {
            let synced = status.active_runner().await.and_then(|r| r.last_zxid());
            Some(LeaderResponse {
                xid,
                server_id: my_id,
                leader_id: vote.leader_id,
                zxid: synced,
            })
        }
        ServerState::Observing => None,
    };

    Ok(response)
}

/// Background datagram responder
pub struct VoteResponder {
    /// Bound address
    local_addr: SocketAddr,
    /// Stop signal
    shutdown: CancellationToken,
    /// Responder task
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VoteResponder {
    /// Bind the quorum port and start answering
    pub async fn bind(addr: SocketAddr, status: Arc<PeerStatus>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind responder on {}: {}", addr, e)))?;
        let local_addr = socket.local_addr()?;
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(respond_loop(socket, status, shutdown.clone()));
        tracing::info!("Vote responder listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Address the responder is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the responder and close its socket
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Vote responder task failed: {}", e);
            }
        }
    }
}

async fn respond_loop(socket: UdpSocket, status: Arc<PeerStatus>, shutdown: CancellationToken) {
    let mut buf = [0u8; RESPONSE_LEN];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, src) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Unexpected IO error in vote responder: {}", e);
                continue;
            }
        };

        match build_response(&status, &buf[..len]).await {
            Ok(Some(response)) => {
                if let Err(e) = socket.send_to(&response.encode(), src).await {
                    tracing::warn!("Failed to answer {}: {}", src, e);
                }
            }
            Ok(None) => {
                tracing::trace!("Observing, ignoring leader query from {}", src);
            }
            Err(e) => {
                tracing::warn!("Dropping packet from {}: {}", src, e);
            }
        }
    }

    tracing::warn!("Vote responder exited");
}
