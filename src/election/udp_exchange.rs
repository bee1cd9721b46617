//! Legacy UDP Exchange Election
//!
//! Every round asks each voting member (this node included) who it
//! believes the leader is, over the legacy datagram protocol, and moves the
//! local vote towards the best known candidate. A candidate reported by a
//! strict majority of the voting view wins.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::ElectionStrategy;
use crate::error::{Error, Result};
use crate::network::query_leader;
use crate::state::zxid::epoch_of;
use crate::state::{PeerStatus, QuorumView, ServerId, Vote, Zxid};
use crate::storage::Storage;

/// How long to wait for each member's answer
const QUERY_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause between rounds without a winner
const ROUND_INTERVAL: Duration = Duration::from_millis(1000);

/// Outcome of tallying one round of votes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElectionResult {
    /// Best candidate by (zxid, id)
    pub vote: Option<Vote>,
    /// Candidate with the most votes
    pub winner: Option<Vote>,
    /// Votes for `winner`
    pub winning_count: usize,
    /// Votes naming a leader we heard from
    pub valid_votes: usize,
}

fn vote_for(leader_id: ServerId, zxid: Zxid) -> Vote {
    Vote::new(leader_id, zxid, epoch_of(zxid))
}

/// Tally votes collected from `heard_from`.
///
/// Votes for leaders that did not answer themselves are dropped, and each
/// candidate is credited with the highest zxid any voter reported for it.
pub fn count_votes(votes: &BTreeMap<ServerId, Vote>, heard_from: &BTreeSet<ServerId>) -> ElectionResult {
    let valid: Vec<&Vote> = votes
        .values()
        .filter(|v| heard_from.contains(&v.leader_id))
        .collect();

    let mut max_zxids: BTreeMap<ServerId, Zxid> = BTreeMap::new();
    for v in &valid {
        let zxid = max_zxids.entry(v.leader_id).or_insert(v.leader_zxid);
        *zxid = (*zxid).max(v.leader_zxid);
    }

    let mut tally: BTreeMap<(ServerId, Zxid), usize> = BTreeMap::new();
    for v in &valid {
        let zxid = max_zxids.get(&v.leader_id).copied().unwrap_or(v.leader_zxid);
        *tally.entry((v.leader_id, zxid)).or_default() += 1;
    }

    let vote = tally
        .keys()
        .max_by_key(|(id, zxid)| (*zxid, *id))
        .map(|(id, zxid)| vote_for(*id, *zxid));

    let winner = tally
        .iter()
        .max_by_key(|((id, zxid), count)| (**count, *zxid, *id));

    ElectionResult {
        vote,
        winner: winner.map(|((id, zxid), _)| vote_for(*id, *zxid)),
        winning_count: winner.map(|(_, count)| *count).unwrap_or(0),
        valid_votes: valid.len(),
    }
}

/// Legacy election over the datagram vote responder
pub struct UdpExchangeElection {
    /// This node's id
    my_id: ServerId,
    /// Membership view
    view: Arc<RwLock<QuorumView>>,
    /// Where the current vote is published
    status: Arc<PeerStatus>,
    /// Source of the last logged zxid
    storage: Arc<dyn Storage>,
    /// Per-member answer timeout
    query_timeout: Duration,
    /// Pause between rounds
    round_interval: Duration,
    /// Shutdown signal
    shutdown: CancellationToken,
}

impl UdpExchangeElection {
    /// Create the election for one peer
    pub fn new(
        view: Arc<RwLock<QuorumView>>,
        status: Arc<PeerStatus>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            my_id: status.my_id(),
            view,
            status,
            storage,
            query_timeout: QUERY_TIMEOUT,
            round_interval: ROUND_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override round timing
    pub fn with_timing(mut self, query_timeout: Duration, round_interval: Duration) -> Self {
        self.query_timeout = query_timeout;
        self.round_interval = round_interval;
        self
    }

    fn own_vote(&self) -> Vote {
        vote_for(self.my_id, self.storage.last_processed_zxid())
    }

    /// Run one exchange round; returns the winner if there is one
    async fn round(&self) -> Option<Vote> {
        let xid: u32 = rand::random();
        let targets: Vec<_> = {
            let view = self.view.read().await;
            view.voting_view().into_values().map(|s| s.addr).collect()
        };

        let answers = join_all(
            targets
                .iter()
                .map(|addr| query_leader(*addr, xid, self.query_timeout)),
        )
        .await;

        let mut votes = BTreeMap::new();
        let mut heard_from = BTreeSet::new();
        for answer in answers {
            match answer {
                Ok(r) => match r.zxid {
                    Some(zxid) => {
                        heard_from.insert(r.server_id);
                        votes.insert(r.server_id, vote_for(r.leader_id, zxid));
                    }
                    None => {
                        tracing::debug!("Server {} is between roles, ignoring its answer", r.server_id);
                    }
                },
                Err(e) => tracing::trace!("{}", e),
            }
        }

        if votes.is_empty() {
            self.status.set_vote(self.own_vote()).await;
            return None;
        }

        let result = count_votes(&votes, &heard_from);
        tracing::debug!(
            "Round {:#x}: {} answers, {} valid votes, best {:?}, winner {:?} x{}",
            xid,
            votes.len(),
            result.valid_votes,
            result.vote,
            result.winner,
            result.winning_count
        );

        if let Some(vote) = result.vote {
            self.status.set_vote(vote).await;
            if let Some(winner) = result.winner {
                if self.view.read().await.is_majority(result.winning_count) {
                    self.status.set_vote(winner).await;
                    return Some(winner);
                }
            }
        }
        None
    }
}

#[async_trait]
impl ElectionStrategy for UdpExchangeElection {
    async fn look_for_leader(&self) -> Result<Vote> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        self.status.set_vote(self.own_vote()).await;

        loop {
            let winner = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                winner = self.round() => winner,
            };

            if let Some(vote) = winner {
                tracing::info!("Election finished, leader is {}", vote);
                return Ok(vote);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.round_interval) => {}
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
