//! Role Runners
//!
//! Leader, follower and observer execution engines are collaborators of
//! the quorum peer. The peer builds one through a [`RoleFactory`], calls its
//! blocking [`RoleRunner::run`], and always shuts it down afterwards.

mod read_only;
mod standby;

pub use read_only::ReadOnlyGate;
pub use standby::{StandbyFollower, StandbyLeader, StandbyObserver, StandbyRoles};

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::state::{EpochStore, PeerStatus, QuorumView, ServerId, ServerState, Zxid};
use crate::storage::Storage;

/// Executable behavior bound to LEADING, FOLLOWING or OBSERVING
#[async_trait]
pub trait RoleRunner: Send + Sync {
    /// Run the role until it is relinquished or fails
    async fn run(&self) -> Result<()>;

    /// Force `run` to return promptly. Safe to call more than once.
    async fn shutdown(&self);

    /// Last proposed zxid for a leader, last synced zxid for a learner.
    ///
    /// `None` while the runner is still setting up.
    fn last_zxid(&self) -> Option<Zxid> {
        None
    }
}

/// Server answering read-only requests while the peer is partitioned
#[async_trait]
pub trait ReadOnlyServer: Send + Sync {
    /// Begin serving
    async fn startup(&self) -> Result<()>;

    /// Stop serving (no-op if never started)
    async fn shutdown(&self);
}

/// Builds role runners for the quorum peer
pub trait RoleFactory: Send + Sync {
    fn make_leader(&self, ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>>;

    fn make_follower(&self, ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>>;

    fn make_observer(&self, ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>>;

    /// Provisional read-only server used while LOOKING
    fn make_read_only(&self, ctx: &RoleContext) -> Arc<dyn ReadOnlyServer>;
}

/// Everything a role runner may bind to
#[derive(Clone)]
pub struct RoleContext {
    /// This node's id
    pub my_id: ServerId,
    /// Membership view
    pub view: Arc<RwLock<QuorumView>>,
    /// Shared state and vote
    pub status: Arc<PeerStatus>,
    /// Storage engine
    pub storage: Arc<dyn Storage>,
    /// Epoch counters
    pub epochs: Arc<EpochStore>,
    /// Length of one tick
    pub tick_time: Duration,
    /// Ticks a learner may take to connect and sync
    pub init_limit: u32,
    /// Ticks a learner may fall behind before it is dropped
    pub sync_limit: u32,
}

/// Snapshot of the role currently executing
#[derive(Clone)]
pub struct ActiveRole {
    pub state: ServerState,
    pub runner: Arc<dyn RoleRunner>,
}

impl std::fmt::Debug for ActiveRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRole")
            .field("state", &self.state)
            .field("last_zxid", &self.runner.last_zxid())
            .finish()
    }
}
