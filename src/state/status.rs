//! Peer Status
//!
//! The state a quorum peer shares with its observers: the current server
//! state, the vote it believes in, and the currently active role runner.
//! Only the role loop changes the server state and the active role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use super::view::ServerId;
use super::zxid::{Epoch, Zxid};
use crate::roles::{ActiveRole, RoleRunner};

/// Quorum role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerState {
    /// Searching for a leader
    Looking,
    /// Following an elected leader
    Following,
    /// Leading the ensemble
    Leading,
    /// Observing the leader without voting
    Observing,
}

impl ServerState {
    /// Name reported through quorum statistics
    pub fn stats_name(&self) -> &'static str {
        match self {
            ServerState::Looking => "leaderelection",
            ServerState::Following => "following",
            ServerState::Leading => "leading",
            ServerState::Observing => "observing",
        }
    }

    /// Name reported as the serving mode of a running role
    pub fn mode(&self) -> &'static str {
        match self {
            ServerState::Looking => "looking",
            ServerState::Following => "follower",
            ServerState::Leading => "leader",
            ServerState::Observing => "observer",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Looking => write!(f, "LOOKING"),
            ServerState::Following => write!(f, "FOLLOWING"),
            ServerState::Leading => write!(f, "LEADING"),
            ServerState::Observing => write!(f, "OBSERVING"),
        }
    }
}

/// What this node currently believes about the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub leader_id: ServerId,
    pub leader_zxid: Zxid,
    pub leader_epoch: Epoch,
}

impl Vote {
    pub fn new(leader_id: ServerId, leader_zxid: Zxid, leader_epoch: Epoch) -> Self {
        Self {
            leader_id,
            leader_zxid,
            leader_epoch,
        }
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(leader={}, zxid=0x{:x}, epoch=0x{:x})",
            self.leader_id, self.leader_zxid, self.leader_epoch
        )
    }
}

/// Shared status container for one peer
pub struct PeerStatus {
    /// This node's id
    my_id: ServerId,
    /// Current server state (single writer: the role loop)
    state: watch::Sender<ServerState>,
    /// Current vote, replaced wholesale
    vote: RwLock<Vote>,
    /// Active role runner, if any
    active: RwLock<Option<ActiveRole>>,
    /// Whether a read-only server is currently serving
    read_only: AtomicBool,
}

impl PeerStatus {
    /// Create a status container in the LOOKING state, voting for itself
    pub fn new(my_id: ServerId) -> Self {
        let (state, _) = watch::channel(ServerState::Looking);
        Self {
            my_id,
            state,
            vote: RwLock::new(Vote::new(my_id, 0, 0)),
            active: RwLock::new(None),
            read_only: AtomicBool::new(false),
        }
    }

    /// Create a shared status container
    pub fn shared(my_id: ServerId) -> Arc<Self> {
        Arc::new(Self::new(my_id))
    }

    /// Get this node's id
    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    /// Get the current server state
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Subscribe to server state changes
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Server state {} -> {}", previous, state);
        }
    }

    /// Get the current vote
    pub async fn vote(&self) -> Vote {
        *self.vote.read().await
    }

    /// Replace the current vote
    pub async fn set_vote(&self, vote: Vote) {
        *self.vote.write().await = vote;
    }

    /// Snapshot of the active role, if one is running
    pub async fn active_role(&self) -> Option<ActiveRole> {
        self.active.read().await.clone()
    }

    /// Runner of the active role, if one is running
    pub async fn active_runner(&self) -> Option<Arc<dyn RoleRunner>> {
        self.active.read().await.as_ref().map(|a| Arc::clone(&a.runner))
    }

    pub(crate) async fn set_active_role(&self, role: Option<ActiveRole>) {
        *self.active.write().await = role;
    }

    /// Check if a read-only server is serving
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_only(&self, serving: bool) {
        self.read_only.store(serving, Ordering::Release);
    }
}
