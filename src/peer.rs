//! Quorum Peer
//!
//! Drives one ensemble member through LOOKING, LEADING, FOLLOWING and
//! OBSERVING. A single role loop task owns every transition: it runs the
//! election while LOOKING, then the matching role runner until that runner
//! returns, and always falls back to LOOKING afterwards.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QuorumConfig;
use crate::election::{ElectionMode, ElectionStrategy, UdpExchangeElection};
use crate::error::{Error, Result};
use crate::network::{ConnectionListener, VoteResponder};
use crate::roles::{ActiveRole, ReadOnlyServer, RoleContext, RoleFactory, RoleRunner};
use crate::state::{
    Epoch, EpochStore, LearnerType, PeerStatus, QuorumView, ServerDescriptor, ServerId,
    ServerState, Vote,
};
use crate::storage::Storage;

/// Settings the peer is built from
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// This node's id
    pub my_id: ServerId,
    /// Initial membership view
    pub view: QuorumView,
    /// This node's learner type
    pub learner_type: LearnerType,
    /// Directory holding the epoch files
    pub snap_dir: PathBuf,
    /// Length of one tick
    pub tick_time: Duration,
    /// Ticks a learner may take to connect and sync
    pub init_limit: u32,
    /// Ticks a learner may fall behind
    pub sync_limit: u32,
    /// Election algorithm
    pub election: ElectionMode,
    /// How long LOOKING may last before read-only service starts
    pub read_only_grace: Duration,
}

impl From<&QuorumConfig> for PeerSettings {
    fn from(config: &QuorumConfig) -> Self {
        Self {
            my_id: config.node.id,
            view: config.quorum_view(),
            learner_type: config.learner_type(),
            snap_dir: config.snap_dir(),
            tick_time: config.tick_time(),
            init_limit: config.quorum.init_limit,
            sync_limit: config.quorum.sync_limit,
            election: config.quorum.election,
            read_only_grace: config.read_only_grace(),
        }
    }
}

/// Point-in-time description of a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: ServerId,
    pub state: ServerState,
    pub current_epoch: Option<Epoch>,
    pub accepted_epoch: Option<Epoch>,
    pub quorum_size: usize,
    pub learner_type: LearnerType,
    pub election: ElectionMode,
    pub read_only: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub vote: Vote,
}

/// One member of a quorum ensemble
pub struct QuorumPeer {
    /// This node's id
    my_id: ServerId,
    /// Membership view
    view: Arc<RwLock<QuorumView>>,
    /// Shared state, vote and active role
    status: Arc<PeerStatus>,
    /// Storage engine
    storage: Arc<dyn Storage>,
    /// Epoch counters
    epochs: Arc<EpochStore>,
    /// Client connection listener
    listener: Arc<dyn ConnectionListener>,
    /// Role runner factory
    roles: Arc<dyn RoleFactory>,
    /// This node's learner type
    learner_type: Arc<RwLock<LearnerType>>,
    /// Election algorithm selector
    election_mode: ElectionMode,
    /// Election strategy (injected, or built at start)
    election: Mutex<Option<Arc<dyn ElectionStrategy>>>,
    /// Legacy vote responder
    responder: Mutex<Option<VoteResponder>>,
    /// Length of one tick
    tick_time: Duration,
    /// Ticks a learner may take to connect and sync
    init_limit: u32,
    /// Ticks a learner may fall behind
    sync_limit: u32,
    /// Read-only grace period
    read_only_grace: Duration,
    /// Quorum address, known once started
    quorum_address: OnceLock<SocketAddr>,
    /// Whether `start` has been called
    started: AtomicBool,
    /// Whether the role loop should keep going
    running: Arc<AtomicBool>,
    /// Shutdown signal
    shutdown: CancellationToken,
    /// Role loop task
    role_loop: Mutex<Option<JoinHandle<()>>>,
    /// When the role loop was started
    started_at: OnceLock<DateTime<Utc>>,
}

impl QuorumPeer {
    /// Create a new quorum peer
    pub fn new(
        settings: PeerSettings,
        status: Arc<PeerStatus>,
        storage: Arc<dyn Storage>,
        listener: Arc<dyn ConnectionListener>,
        roles: Arc<dyn RoleFactory>,
    ) -> Result<Self> {
        if status.my_id() != settings.my_id {
            return Err(Error::Config(format!(
                "status belongs to server {} but the peer is server {}",
                status.my_id(),
                settings.my_id
            )));
        }

        let epochs = Arc::new(EpochStore::new(settings.snap_dir)?);

        Ok(Self {
            my_id: settings.my_id,
            view: Arc::new(RwLock::new(settings.view)),
            status,
            storage,
            epochs,
            listener,
            roles,
            learner_type: Arc::new(RwLock::new(settings.learner_type)),
            election_mode: settings.election,
            election: Mutex::new(None),
            responder: Mutex::new(None),
            tick_time: settings.tick_time,
            init_limit: settings.init_limit,
            sync_limit: settings.sync_limit,
            read_only_grace: settings.read_only_grace,
            quorum_address: OnceLock::new(),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            role_loop: Mutex::new(None),
            started_at: OnceLock::new(),
        })
    }

    /// Use the given election strategy instead of the built-in one
    pub fn with_election(mut self, strategy: Arc<dyn ElectionStrategy>) -> Self {
        self.election = Mutex::new(Some(strategy));
        self
    }

    /// Load state, start the listener and election, then launch the role loop.
    ///
    /// Returns once the listener and election strategy are ready; the role
    /// loop may still be LOOKING.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        self.storage.load_database().await?;
        if !self.storage.is_initialized() {
            return Err(Error::Storage("database reported loaded but is not initialized".into()));
        }
        let last_zxid = self.storage.last_processed_zxid();
        let epochs = self.epochs.load(last_zxid).await?;
        tracing::info!(
            "Loaded epochs from {}: current 0x{:x}, accepted 0x{:x}, last zxid 0x{:x}",
            self.epochs.snap_dir().display(),
            epochs.current,
            epochs.accepted,
            last_zxid
        );

        self.listener.start().await?;

        if let Err(e) = self.start_election(epochs.current).await {
            tracing::error!("Failed to start quorum peer {}: {}", self.my_id, e);
            if let Some(responder) = self.responder.lock().await.take() {
                responder.stop().await;
            }
            self.listener.shutdown().await;
            return Err(e);
        }

        let election = self.election_strategy().await?;
        self.running.store(true, Ordering::SeqCst);
        let role_loop = RoleLoop {
            ctx: self.role_context(),
            roles: Arc::clone(&self.roles),
            election,
            learner_type: Arc::clone(&self.learner_type),
            read_only_grace: self.read_only_grace,
            running: Arc::clone(&self.running),
            shutdown: self.shutdown.clone(),
        };
        *self.role_loop.lock().await = Some(tokio::spawn(role_loop.run()));
        let _ = self.started_at.set(Utc::now());

        Ok(())
    }

    async fn start_election(&self, current_epoch: Epoch) -> Result<()> {
        let quorum_address = self.view.read().await.quorum_address()?;
        let _ = self.quorum_address.set(quorum_address);

        let last_zxid = self.storage.last_processed_zxid();
        self.status
            .set_vote(Vote::new(self.my_id, last_zxid, current_epoch))
            .await;

        let mut election = self.election.lock().await;

        if self.election_mode.uses_responder() {
            let responder = VoteResponder::bind(quorum_address, Arc::clone(&self.status)).await?;
            *self.responder.lock().await = Some(responder);
        }

        if election.is_none() {
            match self.election_mode {
                ElectionMode::UdpExchange => {
                    *election = Some(Arc::new(UdpExchangeElection::new(
                        Arc::clone(&self.view),
                        Arc::clone(&self.status),
                        Arc::clone(&self.storage),
                    )));
                }
                ElectionMode::ConnectionManager => {
                    return Err(Error::Config(format!(
                        "election mode {} ({}) needs an election strategy",
                        self.election_mode,
                        self.election_mode.code()
                    )));
                }
            }
        }

        tracing::info!(
            "Election ready: {} on {}",
            self.election_mode,
            quorum_address
        );
        Ok(())
    }

    async fn election_strategy(&self) -> Result<Arc<dyn ElectionStrategy>> {
        self.election
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Election("no election strategy".into()))
    }

    fn role_context(&self) -> RoleContext {
        RoleContext {
            my_id: self.my_id,
            view: Arc::clone(&self.view),
            status: Arc::clone(&self.status),
            storage: Arc::clone(&self.storage),
            epochs: Arc::clone(&self.epochs),
            tick_time: self.tick_time,
            init_limit: self.init_limit,
            sync_limit: self.sync_limit,
        }
    }

    /// Stop the role loop and every collaborator. Safe to call from any task.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down quorum peer {}", self.my_id);
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        if let Some(runner) = self.status.active_runner().await {
            runner.shutdown().await;
        }

        self.listener.shutdown().await;

        if let Some(responder) = self.responder.lock().await.take() {
            responder.stop().await;
        }

        let election = self.election.lock().await.clone();
        if let Some(election) = election {
            election.shutdown().await;
        }

        if let Some(handle) = self.role_loop.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Role loop task failed: {}", e);
            }
        }

        if let Err(e) = self.storage.close().await {
            tracing::warn!("Failed to close storage: {}", e);
        }
    }

    /// Get this node's id
    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    /// Shared status container
    pub fn status(&self) -> Arc<PeerStatus> {
        Arc::clone(&self.status)
    }

    /// Get the current server state
    pub fn state(&self) -> ServerState {
        self.status.state()
    }

    /// Subscribe to server state changes
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.status.subscribe()
    }

    /// Get the current vote
    pub async fn vote(&self) -> Vote {
        self.status.vote().await
    }

    /// Replace the current vote
    pub async fn set_vote(&self, vote: Vote) {
        self.status.set_vote(vote).await;
    }

    /// Snapshot of the active role, if one is running
    pub async fn active_role(&self) -> Option<ActiveRole> {
        self.status.active_role().await
    }

    /// Check if the role loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the membership view
    pub async fn view(&self) -> QuorumView {
        self.view.read().await.clone()
    }

    /// Voting members
    pub async fn voting_view(&self) -> Vec<ServerDescriptor> {
        self.view.read().await.voting_view().into_values().collect()
    }

    /// Observing members
    pub async fn observing_view(&self) -> Vec<ServerDescriptor> {
        self.view.read().await.observing_view().into_values().collect()
    }

    /// Number of voting members
    pub async fn quorum_size(&self) -> usize {
        self.view.read().await.quorum_size()
    }

    /// Replace the whole membership map
    pub async fn replace_membership(&self, servers: impl IntoIterator<Item = ServerDescriptor>) {
        self.view.write().await.replace_membership(servers);
    }

    /// Current epoch (read from disk on first access)
    pub async fn current_epoch(&self) -> Result<Epoch> {
        self.epochs.current_epoch().await
    }

    /// Accepted epoch (read from disk on first access)
    pub async fn accepted_epoch(&self) -> Result<Epoch> {
        self.epochs.accepted_epoch().await
    }

    /// Durably set the current epoch
    pub async fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        self.epochs.set_current_epoch(epoch).await
    }

    /// Durably set the accepted epoch
    pub async fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        self.epochs.set_accepted_epoch(epoch).await
    }

    /// Election algorithm selector
    pub fn election_mode(&self) -> ElectionMode {
        self.election_mode
    }

    /// This node's learner type
    pub async fn learner_type(&self) -> LearnerType {
        *self.learner_type.read().await
    }

    /// Change this node's learner type, in the view as well
    pub async fn set_learner_type(&self, learner_type: LearnerType) {
        *self.learner_type.write().await = learner_type;
        self.view.write().await.set_local_learner_type(learner_type);
    }

    /// Quorum address, known once started
    pub fn quorum_address(&self) -> Option<SocketAddr> {
        self.quorum_address.get().copied()
    }

    /// Client listener address, once started
    pub fn client_address(&self) -> Option<SocketAddr> {
        self.listener.local_address()
    }

    /// Describe this peer
    pub async fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.my_id,
            state: self.state(),
            current_epoch: self.current_epoch().await.ok(),
            accepted_epoch: self.accepted_epoch().await.ok(),
            quorum_size: self.quorum_size().await,
            learner_type: self.learner_type().await,
            election: self.election_mode,
            read_only: self.status.is_read_only(),
            started_at: self.started_at.get().copied(),
            vote: self.vote().await,
        }
    }
}

/// State owned by the role loop task
struct RoleLoop {
    ctx: RoleContext,
    roles: Arc<dyn RoleFactory>,
    election: Arc<dyn ElectionStrategy>,
    learner_type: Arc<RwLock<LearnerType>>,
    read_only_grace: Duration,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl RoleLoop {
    async fn run(self) {
        tracing::info!("Starting quorum peer {}", self.ctx.my_id);

        while self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            let state = self.ctx.status.state();
            tracing::info!("{}", state);

            match state {
                ServerState::Looking => self.look().await,
                ServerState::Leading => {
                    let runner = self.roles.make_leader(&self.ctx);
                    self.run_role(state, runner).await;
                }
                ServerState::Following => {
                    let runner = self.roles.make_follower(&self.ctx);
                    self.run_role(state, runner).await;
                }
                ServerState::Observing => {
                    let runner = self.roles.make_observer(&self.ctx);
                    self.run_role(state, runner).await;
                }
            }
        }

        tracing::warn!("Quorum peer {} role loop exited", self.ctx.my_id);
    }

    /// LOOKING: elect a leader while a grace watcher guards read-only service
    async fn look(&self) {
        let read_only = self.roles.make_read_only(&self.ctx);
        let watcher_stop = self.shutdown.child_token();
        let watcher = tokio::spawn(grace_watcher(
            Arc::clone(&self.ctx.status),
            Arc::clone(&read_only),
            self.read_only_grace,
            watcher_stop.clone(),
        ));

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            outcome = self.election.look_for_leader() => outcome,
        };

        watcher_stop.cancel();
        if let Err(e) = watcher.await {
            tracing::warn!("Read-only grace watcher failed: {}", e);
        }
        read_only.shutdown().await;

        match outcome {
            Ok(vote) => {
                self.ctx.status.set_vote(vote).await;
                let observer = *self.learner_type.read().await == LearnerType::Observer;
                let next = if vote.leader_id == self.ctx.my_id {
                    if observer {
                        tracing::error!(
                            "Observer {} elected as leader, still LOOKING",
                            self.ctx.my_id
                        );
                        self.back_off().await;
                        return;
                    }
                    ServerState::Leading
                } else if observer {
                    ServerState::Observing
                } else {
                    ServerState::Following
                };
                self.ctx.status.set_state(next);
            }
            Err(e) if self.shutdown.is_cancelled() => {
                tracing::debug!("Election interrupted: {}", e);
            }
            Err(e) => {
                tracing::warn!("Election failed, still LOOKING: {}", e);
                self.back_off().await;
            }
        }
    }

    /// Wait one tick before the next election attempt
    async fn back_off(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.tick_time) => {}
        }
    }

    /// LEADING / FOLLOWING / OBSERVING: run the role until it ends
    async fn run_role(&self, state: ServerState, made: Result<Arc<dyn RoleRunner>>) {
        match made {
            Ok(runner) => {
                self.ctx
                    .status
                    .set_active_role(Some(ActiveRole {
                        state,
                        runner: Arc::clone(&runner),
                    }))
                    .await;

                let task_runner = Arc::clone(&runner);
                let mut task = tokio::spawn(async move { task_runner.run().await });

                let joined = tokio::select! {
                    joined = &mut task => joined,
                    _ = self.shutdown.cancelled() => {
                        runner.shutdown().await;
                        (&mut task).await
                    }
                };

                match joined {
                    Ok(Ok(())) => tracing::info!("{} role ended", state.mode()),
                    Ok(Err(e)) => tracing::warn!("{} role failed: {}", state.mode(), e),
                    Err(e) => tracing::error!("{} runner aborted: {}", state.mode(), e),
                }

                runner.shutdown().await;
                self.ctx.status.set_active_role(None).await;
            }
            Err(e) => {
                tracing::warn!("Failed to create {} runner: {}", state.mode(), e);
            }
        }

        self.ctx.status.set_state(ServerState::Looking);
    }
}

/// Start read-only service once the grace period passes while still LOOKING
async fn grace_watcher(
    status: Arc<PeerStatus>,
    read_only: Arc<dyn ReadOnlyServer>,
    grace: Duration,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(grace) => {
            if status.state() == ServerState::Looking {
                if let Err(e) = read_only.startup().await {
                    tracing::warn!("Failed to start read-only server: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;

    use crate::network::{protocol::LeaderResponse, query_leader, StatusListener};
    use crate::roles::{ReadOnlyGate, StandbyRoles};
    use crate::state::zxid::make_zxid;
    use crate::state::{EpochFile, Zxid};
    use crate::storage::VolatileStorage;

    const WAIT: Duration = Duration::from_secs(3);

    /// Election fed from a channel; blocks until a result arrives
    struct ScriptedElection {
        results: Mutex<mpsc::UnboundedReceiver<Result<Vote>>>,
        calls: AtomicUsize,
        stop: CancellationToken,
    }

    impl ScriptedElection {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<Vote>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let election = Arc::new(Self {
                results: Mutex::new(rx),
                calls: AtomicUsize::new(0),
                stop: CancellationToken::new(),
            });
            (election, tx)
        }
    }

    #[async_trait]
    impl ElectionStrategy for ScriptedElection {
        async fn look_for_leader(&self) -> Result<Vote> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().await;
            tokio::select! {
                _ = self.stop.cancelled() => Err(Error::Cancelled),
                next = results.recv() => next.unwrap_or(Err(Error::ShuttingDown)),
            }
        }

        async fn shutdown(&self) {
            self.stop.cancel();
        }
    }

    /// Runner that blocks until released or shut down
    struct GatedRunner {
        release: Mutex<mpsc::UnboundedReceiver<Result<()>>>,
        stop: CancellationToken,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RoleRunner for GatedRunner {
        async fn run(&self) -> Result<()> {
            let mut release = self.release.lock().await;
            tokio::select! {
                _ = self.stop.cancelled() => Ok(()),
                next = release.recv() => next.unwrap_or(Ok(())),
            }
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.stop.cancel();
        }

        fn last_zxid(&self) -> Option<u64> {
            Some(7)
        }
    }

    /// Read-only server counting its startups
    struct CountingReadOnly {
        gate: ReadOnlyGate,
        startups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReadOnlyServer for CountingReadOnly {
        async fn startup(&self) -> Result<()> {
            self.startups.fetch_add(1, Ordering::SeqCst);
            self.gate.startup().await
        }

        async fn shutdown(&self) {
            self.gate.shutdown().await;
        }
    }

    /// Factory handing out gated runners
    struct GatedRoles {
        release: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<()>>>>,
        made: std::sync::Mutex<Vec<ServerState>>,
        shutdowns: Arc<AtomicUsize>,
        read_only_startups: Arc<AtomicUsize>,
    }

    impl GatedRoles {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<()>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let roles = Arc::new(Self {
                release: std::sync::Mutex::new(Some(rx)),
                made: std::sync::Mutex::new(Vec::new()),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                read_only_startups: Arc::new(AtomicUsize::new(0)),
            });
            (roles, tx)
        }

        fn make(&self, state: ServerState) -> Result<Arc<dyn RoleRunner>> {
            self.made.lock().unwrap().push(state);
            let release = self
                .release
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| mpsc::unbounded_channel().1);
            Ok(Arc::new(GatedRunner {
                release: Mutex::new(release),
                stop: CancellationToken::new(),
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }

        fn made(&self) -> Vec<ServerState> {
            self.made.lock().unwrap().clone()
        }
    }

    impl RoleFactory for GatedRoles {
        fn make_leader(&self, _ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>> {
            self.make(ServerState::Leading)
        }

        fn make_follower(&self, _ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>> {
            self.make(ServerState::Following)
        }

        fn make_observer(&self, _ctx: &RoleContext) -> Result<Arc<dyn RoleRunner>> {
            self.make(ServerState::Observing)
        }

        fn make_read_only(&self, ctx: &RoleContext) -> Arc<dyn ReadOnlyServer> {
            Arc::new(CountingReadOnly {
                gate: ReadOnlyGate::new(Arc::clone(&ctx.status)),
                startups: Arc::clone(&self.read_only_startups),
            })
        }
    }

    /// Listener double
    #[derive(Default)]
    struct RecordingListener {
        started: AtomicBool,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl ConnectionListener for RecordingListener {
        async fn start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn local_address(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn local(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn settings(dir: &TempDir, my_id: ServerId, servers: Vec<ServerDescriptor>) -> PeerSettings {
        PeerSettings {
            my_id,
            view: QuorumView::new(my_id, servers),
            learner_type: LearnerType::Participant,
            snap_dir: dir.path().to_path_buf(),
            tick_time: Duration::from_millis(10),
            init_limit: 2,
            sync_limit: 2,
            election: ElectionMode::ConnectionManager,
            read_only_grace: Duration::from_secs(10),
        }
    }

    fn ensemble() -> Vec<ServerDescriptor> {
        vec![
            ServerDescriptor::new(1, local(12888), None),
            ServerDescriptor::new(2, local(22888), None),
            ServerDescriptor::observer(3, local(32888), None),
        ]
    }

    struct Harness {
        peer: QuorumPeer,
        votes: mpsc::UnboundedSender<Result<Vote>>,
        release: mpsc::UnboundedSender<Result<()>>,
        election: Arc<ScriptedElection>,
        roles: Arc<GatedRoles>,
        listener: Arc<RecordingListener>,
        storage: Arc<VolatileStorage>,
        _dir: TempDir,
    }

    fn harness(my_id: ServerId, tweak: impl FnOnce(&mut PeerSettings)) -> Harness {
        let dir = tempdir().unwrap();
        let mut settings = settings(&dir, my_id, ensemble());
        tweak(&mut settings);

        let (election, votes) = ScriptedElection::new();
        let (roles, release) = GatedRoles::new();
        let listener = Arc::new(RecordingListener::default());
        let storage = Arc::new(VolatileStorage::new(0));

        let peer = QuorumPeer::new(
            settings,
            PeerStatus::shared(my_id),
            storage.clone(),
            listener.clone(),
            roles.clone(),
        )
        .unwrap()
        .with_election(election.clone());

        Harness {
            peer,
            votes,
            release,
            election,
            roles,
            listener,
            storage,
            _dir: dir,
        }
    }

    async fn wait_for_state(peer: &QuorumPeer, state: ServerState) {
        let mut rx = peer.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for_role(peer: &QuorumPeer) -> ActiveRole {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(role) = peer.active_role().await {
                    return role;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_elected_self_leads_then_looks_again() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();
        assert!(h.listener.started.load(Ordering::SeqCst));
        assert_eq!(h.peer.quorum_address(), Some(local(12888)));
        assert_eq!(h.peer.state(), ServerState::Looking);

        h.votes.send(Ok(Vote::new(1, 0, 0))).unwrap();
        wait_for_state(&h.peer, ServerState::Leading).await;
        let role = wait_for_role(&h.peer).await;
        assert_eq!(role.state, ServerState::Leading);
        assert_eq!(role.runner.last_zxid(), Some(7));

        h.release.send(Err(Error::Role("lost quorum".into()))).unwrap();
        wait_for_state(&h.peer, ServerState::Looking).await;

        let election = h.election.clone();
        wait_until(|| election.calls.load(Ordering::SeqCst) >= 2).await;
        assert!(h.peer.active_role().await.is_none());
        assert_eq!(h.roles.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.roles.made(), vec![ServerState::Leading]);

        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_leader_makes_follower() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();

        h.votes.send(Ok(Vote::new(2, 5, 0))).unwrap();
        wait_for_state(&h.peer, ServerState::Following).await;
        assert_eq!(h.peer.vote().await, Vote::new(2, 5, 0));

        h.release.send(Ok(())).unwrap();
        wait_for_state(&h.peer, ServerState::Looking).await;
        assert_eq!(h.roles.made(), vec![ServerState::Following]);

        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_observer_observes() {
        let h = harness(3, |s| s.learner_type = LearnerType::Observer);
        assert_eq!(h.peer.learner_type().await, LearnerType::Observer);
        h.peer.start().await.unwrap();

        h.votes.send(Ok(Vote::new(2, 5, 0))).unwrap();
        wait_for_state(&h.peer, ServerState::Observing).await;
        assert_eq!(h.roles.made(), vec![ServerState::Observing]);

        h.peer.shutdown().await;
        assert!(h.peer.active_role().await.is_none());
    }

    #[tokio::test]
    async fn test_observer_never_leads() {
        let h = harness(3, |s| s.learner_type = LearnerType::Observer);
        h.peer.start().await.unwrap();

        h.votes.send(Ok(Vote::new(3, 0, 0))).unwrap();
        let election = h.election.clone();
        wait_until(|| election.calls.load(Ordering::SeqCst) >= 2).await;

        assert_eq!(h.peer.state(), ServerState::Looking);
        assert!(h.roles.made().is_empty());
        assert_eq!(h.peer.current_epoch().await.unwrap(), 0);

        h.peer.shutdown().await;
    }

    /// Strategy that fails the same way on every call
    struct FailingElection {
        error: fn() -> Error,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ElectionStrategy for FailingElection {
        async fn look_for_leader(&self) -> Result<Vote> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_cancelled_election_backs_off_while_running() {
        for error in [(|| Error::Cancelled) as fn() -> Error, || Error::ShuttingDown] {
            let dir = tempdir().unwrap();
            let (roles, _release) = GatedRoles::new();
            let election = Arc::new(FailingElection {
                error,
                calls: AtomicUsize::new(0),
            });
            let peer = QuorumPeer::new(
                settings(&dir, 1, ensemble()),
                PeerStatus::shared(1),
                Arc::new(VolatileStorage::new(0)),
                Arc::new(RecordingListener::default()),
                roles,
            )
            .unwrap()
            .with_election(election.clone());

            peer.start().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let calls = election.calls.load(Ordering::SeqCst);

            // 10ms tick: roughly ten attempts, never thousands
            assert!(calls >= 1);
            assert!(calls <= 20, "{} election attempts in 100ms", calls);
            assert_eq!(peer.state(), ServerState::Looking);

            peer.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_failed_election_stays_looking() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();

        h.votes.send(Err(Error::Election("no quorum".into()))).unwrap();
        let election = h.election.clone();
        wait_until(|| election.calls.load(Ordering::SeqCst) >= 2).await;
        assert_eq!(h.peer.state(), ServerState::Looking);
        assert!(h.roles.made().is_empty());

        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_only_after_grace_period() {
        let h = harness(1, |s| s.read_only_grace = Duration::from_millis(50));
        h.peer.start().await.unwrap();
        let status = h.peer.status();

        wait_until(|| status.is_read_only()).await;
        assert_eq!(h.roles.read_only_startups.load(Ordering::SeqCst), 1);

        h.votes.send(Ok(Vote::new(1, 0, 0))).unwrap();
        wait_for_state(&h.peer, ServerState::Leading).await;
        assert!(!status.is_read_only());

        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_read_only_when_elected_in_time() {
        let h = harness(1, |s| s.read_only_grace = Duration::from_millis(200));
        h.peer.start().await.unwrap();

        h.votes.send(Ok(Vote::new(1, 0, 0))).unwrap();
        wait_for_state(&h.peer, ServerState::Leading).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.roles.read_only_startups.load(Ordering::SeqCst), 0);
        assert!(!h.peer.status().is_read_only());

        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_election() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();
        assert!(h.peer.is_running());

        let election = h.election.clone();
        wait_until(|| election.calls.load(Ordering::SeqCst) >= 1).await;

        tokio::time::timeout(Duration::from_secs(1), h.peer.shutdown())
            .await
            .unwrap();
        assert!(!h.peer.is_running());
        assert!(h.peer.active_role().await.is_none());
        assert!(h.listener.stopped.load(Ordering::SeqCst));
        assert!(h.storage.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_runner() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();
        h.votes.send(Ok(Vote::new(2, 0, 0))).unwrap();
        wait_for_state(&h.peer, ServerState::Following).await;
        wait_for_role(&h.peer).await;

        tokio::time::timeout(Duration::from_secs(1), h.peer.shutdown())
            .await
            .unwrap();
        assert!(h.peer.active_role().await.is_none());
        assert!(h.roles.shutdowns.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();
        assert!(matches!(h.peer.start().await, Err(Error::AlreadyStarted)));
        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_from_view_is_fatal() {
        let h = harness(9, |_| {});
        let err = h.peer.start().await.unwrap_err();
        assert!(matches!(err, Error::NotInView(9)));
        assert!(err.is_fatal());
        assert!(!h.peer.is_running());
        assert!(h.listener.stopped.load(Ordering::SeqCst));
        assert_eq!(h.election.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inconsistent_epoch_is_fatal() {
        let dir = tempdir().unwrap();
        let store = EpochStore::new(dir.path().to_path_buf()).unwrap();
        store.write(EpochFile::Current, 1).unwrap();

        let (roles, _release) = GatedRoles::new();
        let listener = Arc::new(RecordingListener::default());
        let peer = QuorumPeer::new(
            settings(&dir, 1, ensemble()),
            PeerStatus::shared(1),
            Arc::new(VolatileStorage::new(make_zxid(2, 5))),
            listener.clone(),
            roles,
        )
        .unwrap();

        let err = peer.start().await.unwrap_err();
        assert!(matches!(err, Error::EpochInconsistent(_)));
        assert!(!peer.is_running());
        assert!(!listener.started.load(Ordering::SeqCst));
    }

    /// Storage whose load succeeds without leaving it initialized
    struct HollowStorage;

    #[async_trait]
    impl Storage for HollowStorage {
        async fn load_database(&self) -> Result<()> {
            Ok(())
        }

        fn last_processed_zxid(&self) -> Zxid {
            0
        }

        fn is_initialized(&self) -> bool {
            false
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_uninitialized_storage_refuses_start() {
        let dir = tempdir().unwrap();
        let (roles, _release) = GatedRoles::new();
        let listener = Arc::new(RecordingListener::default());
        let peer = QuorumPeer::new(
            settings(&dir, 1, ensemble()),
            PeerStatus::shared(1),
            Arc::new(HollowStorage),
            listener.clone(),
            roles,
        )
        .unwrap();

        let err = peer.start().await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!peer.is_running());
        assert!(!listener.started.load(Ordering::SeqCst));
        assert!(!dir.path().join(EpochFile::Current.file_name()).exists());
    }

    #[tokio::test]
    async fn test_connection_manager_needs_strategy() {
        let dir = tempdir().unwrap();
        let (roles, _release) = GatedRoles::new();
        let peer = QuorumPeer::new(
            settings(&dir, 1, ensemble()),
            PeerStatus::shared(1),
            Arc::new(VolatileStorage::new(0)),
            Arc::new(RecordingListener::default()),
            roles,
        )
        .unwrap();

        assert!(matches!(peer.start().await, Err(Error::Config(_))));
        assert!(!peer.is_running());
    }

    #[tokio::test]
    async fn test_set_learner_type_updates_view() {
        let h = harness(1, |_| {});
        assert_eq!(h.peer.quorum_size().await, 2);

        h.peer.set_learner_type(LearnerType::Observer).await;
        assert_eq!(h.peer.learner_type().await, LearnerType::Observer);
        assert_eq!(h.peer.quorum_size().await, 1);
        assert_eq!(h.peer.observing_view().await.len(), 2);
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let h = harness(1, |_| {});
        h.peer.start().await.unwrap();

        let summary = h.peer.summary().await;
        assert_eq!(summary.id, 1);
        assert_eq!(summary.state, ServerState::Looking);
        assert_eq!(summary.current_epoch, Some(0));
        assert_eq!(summary.quorum_size, 2);
        assert!(summary.started_at.is_some());

        let rendered = toml::to_string(&summary).unwrap();
        assert!(rendered.contains("state = \"LOOKING\""));
        assert!(rendered.contains("election = \"connection-manager\""));

        h.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_node_ensemble_elects_itself() {
        let dir = tempdir().unwrap();
        let quorum_port = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let mut settings = settings(&dir, 1, vec![ServerDescriptor::new(1, local(quorum_port), None)]);
        settings.election = ElectionMode::UdpExchange;

        let status = PeerStatus::shared(1);
        let listener = Arc::new(StatusListener::new(local(0), Arc::clone(&status)));
        let peer = QuorumPeer::new(
            settings,
            Arc::clone(&status),
            Arc::new(VolatileStorage::new(0)),
            listener,
            Arc::new(StandbyRoles),
        )
        .unwrap();

        peer.start().await.unwrap();
        assert!(peer.client_address().is_some());
        wait_for_state(&peer, ServerState::Leading).await;

        let leader_zxid = make_zxid(1, 0);
        let mut answer: Option<LeaderResponse> = None;
        for _ in 0..50 {
            let response = query_leader(local(quorum_port), 11, Duration::from_millis(200))
                .await
                .unwrap();
            if response.zxid == Some(leader_zxid) {
                answer = Some(response);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let answer = answer.unwrap();
        assert_eq!((answer.server_id, answer.leader_id), (1, 1));
        assert_eq!(peer.current_epoch().await.unwrap(), 1);
        assert_eq!(peer.accepted_epoch().await.unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(2), peer.shutdown())
            .await
            .unwrap();
        assert!(peer.active_role().await.is_none());
    }
}
