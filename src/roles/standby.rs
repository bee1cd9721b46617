//! Standby Role Runners
//!
//! Liveness-only leader, follower and observer runners. They carry no
//! transaction traffic; they keep a role alive for as long as the ensemble
//! agrees on it, using the legacy leader query protocol as a heartbeat.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ReadOnlyGate, ReadOnlyServer, RoleContext, RoleFactory, RoleRunner};
use crate::error::{Error, Result};
use crate::network::query_leader;
use crate::state::zxid::{epoch_of, make_zxid};
use crate::state::{ServerId, Zxid};

/// Minimum time to wait for a heartbeat answer
const MIN_PING_TIMEOUT: Duration = Duration::from_millis(50);

fn ping_timeout(tick: Duration) -> Duration {
    (tick / 2).max(MIN_PING_TIMEOUT)
}

/// Factory for the standby runners
#[derive(Debug, Default, Clone, Copy)]
pub struct StandbyRoles;

impl RoleFactory for StandbyRoles {
    fn make_leader(&self, ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>> {
        Ok(Arc::new(StandbyLeader::new(ctx.clone())))
    }

    fn make_follower(&self, ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>> {
        Ok(Arc::new(StandbyFollower::new(ctx.clone())))
    }

    fn make_observer(&self, ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>> {
        Ok(Arc::new(StandbyObserver::new(ctx.clone())))
    }

    fn make_read_only(&self, ctx: &RoleContext) -> Arc<dyn ReadOnlyServer> {
        Arc::new(ReadOnlyGate::new(Arc::clone(&ctx.status)))
    }
}

/// Counts missed heartbeats against the init/sync limits
#[derive(Debug)]
struct Liveness {
    grace: u32,
    missed: u32,
    limit: u32,
}

impl Liveness {
    fn new(init_limit: u32, sync_limit: u32) -> Self {
        Self {
            grace: init_limit,
            missed: 0,
            limit: sync_limit.max(1),
        }
    }

    /// Record one heartbeat; returns false once the limit is exceeded
    fn observe(&mut self, healthy: bool) -> bool {
        if healthy {
            self.grace = 0;
            self.missed = 0;
            return true;
        }
        if self.grace > 0 {
            self.grace -= 1;
            return true;
        }
        self.missed += 1;
        self.missed < self.limit
    }
}

/// Leader that stays in charge while a majority of voters follow it
pub struct StandbyLeader {
    ctx: RoleContext,
    shutdown: CancellationToken,
    last_proposed: watch::Sender<Option<Zxid>>,
}

impl StandbyLeader {
    pub fn new(ctx: RoleContext) -> Self {
        let (last_proposed, _) = watch::channel(None);
        Self {
            ctx,
            shutdown: CancellationToken::new(),
            last_proposed,
        }
    }

    /// Move to a fresh epoch above anything this node has seen
    async fn activate(&self) -> Result<Zxid> {
        let current = self.ctx.epochs.current_epoch().await?;
        let accepted = self.ctx.epochs.accepted_epoch().await?;
        let new_epoch = current.max(accepted) + 1;

        self.ctx.epochs.set_accepted_epoch(new_epoch).await?;
        self.ctx.epochs.set_current_epoch(new_epoch).await?;

        let zxid = make_zxid(new_epoch, 0);
        self.last_proposed.send_replace(Some(zxid));
        tracing::info!("Leading new epoch 0x{:x}", new_epoch);
        Ok(zxid)
    }

    /// Number of voters (self included) that report following this node
    async fn count_followers(&self) -> usize {
        let peers: Vec<_> = {
            let view = self.ctx.view.read().await;
            view.voting_view()
                .into_values()
                .filter(|s| s.id != self.ctx.my_id)
                .map(|s| s.addr)
                .collect()
        };

        let timeout = ping_timeout(self.ctx.tick_time);
        let answers = join_all(
            peers
                .into_iter()
                .map(|addr| query_leader(addr, rand::random(), timeout)),
        )
        .await;

        let following = answers
            .into_iter()
            .filter_map(|r| r.ok())
            .filter(|r| r.leader_id == self.ctx.my_id && r.server_id != self.ctx.my_id)
            .count();

        following + 1
    }
}

#[async_trait]
impl RoleRunner for StandbyLeader {
    async fn run(&self) -> Result<()> {
        self.activate().await?;

        let mut ticker = interval(self.ctx.tick_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = Liveness::new(self.ctx.init_limit, self.ctx.sync_limit);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let following = self.count_followers().await;
            let healthy = self.ctx.view.read().await.is_majority(following);
            if !liveness.observe(healthy) {
                tracing::warn!(
                    "Only {} voters following for {} ticks, relinquishing leadership",
                    following,
                    self.ctx.sync_limit
                );
                return Ok(());
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn last_zxid(&self) -> Option<Zxid> {
        *self.last_proposed.borrow()
    }
}

/// Shared learner loop for followers and observers
struct Learner {
    ctx: RoleContext,
    role: &'static str,
    shutdown: CancellationToken,
    synced: watch::Sender<Option<Zxid>>,
}

impl Learner {
    fn new(ctx: RoleContext, role: &'static str) -> Self {
        let (synced, _) = watch::channel(Some(ctx.storage.last_processed_zxid()));
        Self {
            ctx,
            role,
            shutdown: CancellationToken::new(),
            synced,
        }
    }

    /// Adopt the leader's epoch the first time we hear it
    async fn sync_epoch(&self, leader_zxid: Zxid) -> Result<()> {
        let epoch = epoch_of(leader_zxid);
        if epoch > self.ctx.epochs.accepted_epoch().await? {
            self.ctx.epochs.set_accepted_epoch(epoch).await?;
        }
        if epoch > self.ctx.epochs.current_epoch().await? {
            self.ctx.epochs.set_current_epoch(epoch).await?;
            tracing::info!("{} synced to leader epoch 0x{:x}", self.role, epoch);
        }
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let leader_id: ServerId = self.ctx.status.vote().await.leader_id;
        let leader_addr = self
            .ctx
            .view
            .read()
            .await
            .get(leader_id)
            .map(|s| s.addr)
            .ok_or_else(|| Error::Role(format!("Leader {} is not in the view", leader_id)))?;

        tracing::info!("{} leader {} at {}", self.role, leader_id, leader_addr);

        let timeout = ping_timeout(self.ctx.tick_time);
        let mut ticker = interval(self.ctx.tick_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = Liveness::new(self.ctx.init_limit, self.ctx.sync_limit);
        let mut epoch_synced = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let healthy = match query_leader(leader_addr, rand::random(), timeout).await {
                Ok(r) if r.server_id == leader_id && r.leader_id == leader_id => {
                    if let Some(zxid) = r.zxid {
                        if !epoch_synced {
                            self.sync_epoch(zxid).await?;
                            epoch_synced = true;
                        }
                        self.synced.send_replace(Some(zxid));
                    }
                    true
                }
                Ok(r) => {
                    tracing::debug!("Leader {} believes in {}", leader_id, r.leader_id);
                    false
                }
                Err(e) => {
                    tracing::debug!("Leader {} did not answer: {}", leader_id, e);
                    false
                }
            };

            if !liveness.observe(healthy) {
                tracing::warn!(
                    "Lost leader {} for {} ticks, {} giving up",
                    leader_id,
                    self.ctx.sync_limit,
                    self.role
                );
                return Ok(());
            }
        }
    }
}

/// Follower that stays with its leader while the leader keeps leading
pub struct StandbyFollower(Learner);

impl StandbyFollower {
    pub fn new(ctx: RoleContext) -> Self {
        Self(Learner::new(ctx, "Following"))
    }
}

#[async_trait]
impl RoleRunner for StandbyFollower {
    async fn run(&self) -> Result<()> {
        self.0.run().await
    }

    async fn shutdown(&self) {
        self.0.shutdown.cancel();
    }

    fn last_zxid(&self) -> Option<Zxid> {
        *self.0.synced.borrow()
    }
}

/// Observer variant of the standby follower
pub struct StandbyObserver(Learner);

impl StandbyObserver {
    pub fn new(ctx: RoleContext) -> Self {
        Self(Learner::new(ctx, "Observing"))
    }
}

#[async_trait]
impl RoleRunner for StandbyObserver {
    async fn run(&self) -> Result<()> {
        self.0.run().await
    }

    async fn shutdown(&self) {
        self.0.shutdown.cancel();
    }

    fn last_zxid(&self) -> Option<Zxid> {
        *self.0.synced.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::tempdir;
    use tokio::sync::RwLock;

    use crate::state::{EpochStore, PeerStatus, QuorumView, ServerDescriptor, Vote};
    use crate::storage::VolatileStorage;

    fn unused_addr() -> SocketAddr {
        // Bound then dropped: nothing answers here
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    fn context(dir: &std::path::Path, servers: Vec<ServerDescriptor>) -> RoleContext {
        RoleContext {
            my_id: 1,
            view: Arc::new(RwLock::new(QuorumView::new(1, servers))),
            status: PeerStatus::shared(1),
            storage: Arc::new(VolatileStorage::new(0)),
            epochs: Arc::new(EpochStore::new(dir.to_path_buf()).unwrap()),
            tick_time: Duration::from_millis(20),
            init_limit: 1,
            sync_limit: 2,
        }
    }

    #[test]
    fn test_liveness_limits() {
        let mut liveness = Liveness::new(1, 2);
        assert!(liveness.observe(false)); // grace
        assert!(liveness.observe(false)); // missed = 1
        assert!(!liveness.observe(false)); // missed = 2

        let mut liveness = Liveness::new(0, 2);
        assert!(liveness.observe(false));
        assert!(liveness.observe(true));
        assert!(liveness.observe(false));
        assert!(!liveness.observe(false));
    }

    #[tokio::test]
    async fn test_leader_bumps_epochs_and_relinquishes() {
        let dir = tempdir().unwrap();
        let ctx = context(
            dir.path(),
            vec![
                ServerDescriptor::new(1, unused_addr(), None),
                ServerDescriptor::new(2, unused_addr(), None),
                ServerDescriptor::new(3, unused_addr(), None),
            ],
        );
        ctx.epochs.set_accepted_epoch(4).await.unwrap();
        ctx.epochs.set_current_epoch(3).await.unwrap();

        let leader = StandbyLeader::new(ctx.clone());
        assert_eq!(leader.last_zxid(), None);

        tokio::time::timeout(Duration::from_secs(5), leader.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ctx.epochs.accepted_epoch().await.unwrap(), 5);
        assert_eq!(ctx.epochs.current_epoch().await.unwrap(), 5);
        assert_eq!(leader.last_zxid(), Some(make_zxid(5, 0)));
    }

    #[tokio::test]
    async fn test_single_voter_leader_runs_until_shutdown() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), vec![ServerDescriptor::new(1, unused_addr(), None)]);
        ctx.epochs.load(0).await.unwrap();

        let leader = Arc::new(StandbyLeader::new(ctx));
        let runner = Arc::clone(&leader);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());

        leader.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_follower_gives_up_on_silent_leader() {
        let dir = tempdir().unwrap();
        let ctx = context(
            dir.path(),
            vec![
                ServerDescriptor::new(1, unused_addr(), None),
                ServerDescriptor::new(2, unused_addr(), None),
            ],
        );
        ctx.status.set_vote(Vote::new(2, 0, 0)).await;

        let follower = StandbyFollower::new(ctx);
        assert_eq!(follower.last_zxid(), Some(0));
        tokio::time::timeout(Duration::from_secs(5), follower.run())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_observer_rejects_unknown_leader() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), vec![ServerDescriptor::new(1, unused_addr(), None)]);
        ctx.status.set_vote(Vote::new(9, 0, 0)).await;

        let observer = StandbyObserver::new(ctx);
        assert!(matches!(observer.run().await, Err(Error::Role(_))));
    }
}
