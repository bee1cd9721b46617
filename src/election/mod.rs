//! Leader Election
//!
//! The quorum peer runs an [`ElectionStrategy`] while LOOKING. The strategy
//! is chosen once, at construction, from the configured [`ElectionMode`].

mod udp_exchange;

pub use udp_exchange::{count_votes, ElectionResult, UdpExchangeElection};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::Vote;

/// Pluggable leader election algorithm
#[async_trait]
pub trait ElectionStrategy: Send + Sync {
    /// Block until a leader is agreed on, or fail
    async fn look_for_leader(&self) -> Result<Vote>;

    /// Interrupt an in-progress `look_for_leader` call
    async fn shutdown(&self);
}

/// Election algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElectionMode {
    /// Legacy datagram exchange of votes
    #[default]
    UdpExchange,
    /// Strategy running over the quorum connection manager
    ConnectionManager,
}

impl ElectionMode {
    /// Numeric algorithm code used by older configuration files
    pub fn code(&self) -> u8 {
        match self {
            ElectionMode::UdpExchange => 0,
            ElectionMode::ConnectionManager => 3,
        }
    }

    /// Whether this mode needs the legacy vote responder
    pub fn uses_responder(&self) -> bool {
        matches!(self, ElectionMode::UdpExchange)
    }
}

impl std::fmt::Display for ElectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionMode::UdpExchange => write!(f, "udp-exchange"),
            ElectionMode::ConnectionManager => write!(f, "connection-manager"),
        }
    }
}
