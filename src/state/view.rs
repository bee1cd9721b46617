//! Quorum Membership View
//!
//! A node's opinion of the ensemble: every configured server keyed by id,
//! with voting (participant) and observing projections.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server identifier
pub type ServerId = u64;

/// Whether a server votes and may lead, or only observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnerType {
    /// Votes in elections and may become leader
    #[default]
    Participant,
    /// Follows the leader without voting
    Observer,
}

impl std::fmt::Display for LearnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LearnerType::Participant => write!(f, "PARTICIPANT"),
            LearnerType::Observer => write!(f, "OBSERVER"),
        }
    }
}

/// One ensemble member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server id
    pub id: ServerId,
    /// Quorum address; the legacy vote responder listens on its port
    pub addr: SocketAddr,
    /// Leader election address
    pub election_addr: Option<SocketAddr>,
    /// Participant or observer
    pub learner_type: LearnerType,
}

impl ServerDescriptor {
    /// Create a participant descriptor
    pub fn new(id: ServerId, addr: SocketAddr, election_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            addr,
            election_addr,
            learner_type: LearnerType::Participant,
        }
    }

    /// Create an observer descriptor
    pub fn observer(id: ServerId, addr: SocketAddr, election_addr: Option<SocketAddr>) -> Self {
        Self {
            learner_type: LearnerType::Observer,
            ..Self::new(id, addr, election_addr)
        }
    }

    pub fn is_participant(&self) -> bool {
        self.learner_type == LearnerType::Participant
    }
}

/// Membership map for the ensemble.
///
/// Built once from configuration; membership is only ever replaced
/// wholesale through [`QuorumView::replace_membership`].
#[derive(Debug, Clone)]
pub struct QuorumView {
    /// This node's id
    my_id: ServerId,
    /// All known servers (including self)
    servers: BTreeMap<ServerId, ServerDescriptor>,
}

impl QuorumView {
    /// Create a view for the given local id
    pub fn new(my_id: ServerId, servers: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        Self {
            my_id,
            servers: servers.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    /// Get this node's id
    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    /// Replace the whole membership map
    pub fn replace_membership(&mut self, servers: impl IntoIterator<Item = ServerDescriptor>) {
        self.servers = servers.into_iter().map(|s| (s.id, s)).collect();
        tracing::info!("Membership replaced, {} servers in view", self.servers.len());
    }

    /// Full view, read-only
    pub fn view(&self) -> &BTreeMap<ServerId, ServerDescriptor> {
        &self.servers
    }

    /// Look up a single server
    pub fn get(&self, id: ServerId) -> Option<&ServerDescriptor> {
        self.servers.get(&id)
    }

    /// This node's own descriptor, if present
    pub fn local(&self) -> Option<&ServerDescriptor> {
        self.servers.get(&self.my_id)
    }

    fn filter(&self, keep: impl Fn(&ServerDescriptor) -> bool) -> BTreeMap<ServerId, ServerDescriptor> {
        self.servers
            .values()
            .filter(|s| keep(*s))
            .map(|s| (s.id, s.clone()))
            .collect()
    }

    /// Participants only (observers excluded)
    pub fn voting_view(&self) -> BTreeMap<ServerId, ServerDescriptor> {
        self.filter(ServerDescriptor::is_participant)
    }

    /// Observers only
    pub fn observing_view(&self) -> BTreeMap<ServerId, ServerDescriptor> {
        self.filter(|s| !s.is_participant())
    }

    /// Number of voting members
    pub fn quorum_size(&self) -> usize {
        self.voting_view().len()
    }

    /// Check if `count` voters form a strict majority of the voting view
    pub fn is_majority(&self, count: usize) -> bool {
        count > self.quorum_size() / 2
    }

    /// Check if a server is part of the view
    pub fn contains(&self, id: ServerId) -> bool {
        self.servers.contains_key(&id)
    }

    /// Total number of servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Quorum address of this node
    pub fn quorum_address(&self) -> Result<SocketAddr> {
        self.local()
            .map(|s| s.addr)
            .ok_or(Error::NotInView(self.my_id))
    }

    /// Update this node's own learner type in place.
    ///
    /// Returns false (and logs) if this node is missing from the view.
    pub fn set_local_learner_type(&mut self, learner_type: LearnerType) -> bool {
        match self.servers.get_mut(&self.my_id) {
            Some(server) => {
                server.learner_type = learner_type;
                true
            }
            None => {
                tracing::error!(
                    "Cannot set learner type {}: server {} is not in the view",
                    learner_type,
                    self.my_id
                );
                false
            }
        }
    }
}
