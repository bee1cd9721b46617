//! WolfQuorum - Quorum Role State Machine
//!
//! The part of a distributed coordination node that decides, and keeps
//! re-deciding, whether the node is looking for a leader, leading,
//! following or observing, and that persists the epoch counters which make
//! leader transitions crash-consistent.
//!
//! # Architecture
//!
//! A [`QuorumPeer`] owns the membership view, the epoch store and the
//! current vote. One role loop task runs a pluggable election while
//! LOOKING, then the matching role runner until it returns, and falls back
//! to LOOKING again.
//!
//! # Features
//!
//! - Crash-safe `currentEpoch` / `acceptedEpoch` files with fallback derivation
//! - Voting and observing membership projections
//! - Read-only service after a grace period while partitioned
//! - Legacy datagram "who is the leader" responder and UDP exchange election
//! - Four-letter-word status listener
//! - Liveness-only standby leader, follower and observer runners

pub mod config;
pub mod error;
pub mod state;
pub mod election;
pub mod network;
pub mod roles;
pub mod storage;
pub mod peer;

pub use config::QuorumConfig;
pub use error::{Error, Result};
pub use peer::{PeerSettings, PeerSummary, QuorumPeer};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::QuorumConfig;
    pub use crate::error::{Error, Result};
    pub use crate::election::{ElectionMode, ElectionStrategy};
    pub use crate::network::ConnectionListener;
    pub use crate::peer::{PeerSettings, QuorumPeer};
    pub use crate::roles::{RoleContext, RoleFactory, RoleRunner};
    pub use crate::state::{LearnerType, QuorumView, ServerDescriptor, ServerState, Vote};
    pub use crate::storage::Storage;
}
