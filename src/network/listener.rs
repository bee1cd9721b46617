//! Client Connection Listener
//!
//! The quorum peer starts and stops the client-facing listener. The
//! built-in [`StatusListener`] answers four-letter status commands.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::state::PeerStatus;

/// How long a client may take to send its command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-facing connection listener
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Bind and begin accepting; returns once ready
    async fn start(&self) -> Result<()>;

    /// Stop accepting connections
    async fn shutdown(&self);

    /// Bound address, once started
    fn local_address(&self) -> Option<SocketAddr>;

    /// Bound port, once started
    fn local_port(&self) -> Option<u16> {
        self.local_address().map(|a| a.port())
    }
}

/// TCP listener answering `ruok`, `srvr` and `stat`
pub struct StatusListener {
    /// Bind address
    bind_address: SocketAddr,
    /// Peer status to report
    status: Arc<PeerStatus>,
    /// Address actually bound
    local_addr: OnceLock<SocketAddr>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
    /// Accept loop
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatusListener {
    /// Create a new status listener
    pub fn new(bind_address: SocketAddr, status: Arc<PeerStatus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address,
            status,
            local_addr: OnceLock::new(),
            shutdown,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ConnectionListener for StatusListener {
    async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.bind_address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", self.bind_address, e)))?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);
        tracing::info!("Client listener on {}", local);

        let status = Arc::clone(&self.status);
        let mut shutdown_rx = self.shutdown.subscribe();

        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((socket, addr)) => {
                                let status = Arc::clone(&status);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(socket, status).await {
                                        tracing::debug!("Client {} error: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Client listener stopped");
        }));

        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

/// Answer one four-letter command and close
async fn handle_client(mut socket: TcpStream, status: Arc<PeerStatus>) -> Result<()> {
    let mut command = [0u8; 4];
    tokio::time::timeout(COMMAND_TIMEOUT, socket.read_exact(&mut command))
        .await
        .map_err(|_| Error::Network("Timed out waiting for command".into()))??;

    let reply = match &command {
        b"ruok" => "imok".to_string(),
        b"srvr" | b"stat" => server_report(&status).await,
        other => {
            tracing::debug!("Unknown command {:?}", String::from_utf8_lossy(other));
            return Ok(());
        }
    };

    socket.write_all(reply.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

/// Render the `srvr` report
pub(crate) async fn server_report(status: &PeerStatus) -> String {
    let state = status.state();
    let mode = if status.is_read_only() {
        "read-only"
    } else {
        state.mode()
    };
    let vote = status.vote().await;
    let zxid = status
        .active_runner()
        .await
        .and_then(|r| r.last_zxid())
        .unwrap_or(vote.leader_zxid);

    format!(
        "WolfQuorum version: {}\nServer id: {}\nZxid: 0x{:x}\nMode: {}\nState: {}\nVote: {}\n",
        env!("CARGO_PKG_VERSION"),
        status.my_id(),
        zxid,
        mode,
        state.stats_name(),
        vote
    )
}
