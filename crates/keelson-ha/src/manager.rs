// ABOUTME: HighAvailabilityManager: publishes this node's heartbeat, runs the election, and promotes or demotes.
// ABOUTME: Promotion rebinds the live graph before MASTER is advertised; demotion halts delta writes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use keelson_core::{
    Clock, HighAvailabilityMode, ManagementNodeRecord, NodeState, PlaneSyncRecord, SyncRecordDelta,
    SystemClock,
};
use keelson_rebind::{RebindError, RebindManager, RebindReport};
use keelson_store::{PersistenceError, SyncRecordPersister};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::election::elect;

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HaError {
    #[error("high availability manager already started")]
    AlreadyStarted,

    #[error("high availability manager not started")]
    NotStarted,

    #[error("high availability manager stopped")]
    Stopped,

    #[error("cannot start as master: node {0} is already master")]
    MasterAlreadyPresent(String),

    #[error("cannot start as standby: no live master present")]
    NoMasterPresent,

    #[error("sync record error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("promotion failed: {0}")]
    Rebind(#[from] RebindError),
}

/// What the HA manager needs from the rebind layer.
#[async_trait]
pub trait Rebinder: Send + Sync {
    async fn rebind(&self, read_only: bool) -> Result<RebindReport, RebindError>;

    async fn start_persisting(&self) -> Result<(), PersistenceError>;

    fn stop_persisting(&self);
}

#[async_trait]
impl Rebinder for RebindManager {
    async fn rebind(&self, read_only: bool) -> Result<RebindReport, RebindError> {
        self.rebind_default(read_only).await
    }

    async fn start_persisting(&self) -> Result<(), PersistenceError> {
        RebindManager::start_persisting(self).await
    }

    fn stop_persisting(&self) {
        RebindManager::stop_persisting(self)
    }
}

/// Told once per promotion, after the graph is rebound and MASTER published.
pub trait PromotionListener: Send + Sync {
    fn promoting_to_master(&self);
}

#[derive(Debug)]
struct Status {
    mode: Option<HighAvailabilityMode>,
    state: NodeState,
    master_since: Option<i64>,
    last_sync_ok: Option<i64>,
}

#[derive(Debug)]
struct Observed {
    state: NodeState,
    plane: PlaneSyncRecord,
}

pub struct HighAvailabilityManager {
    node_id: String,
    uri: Option<String>,
    persister: Arc<dyn SyncRecordPersister>,
    rebinder: Option<Arc<dyn Rebinder>>,
    listener: Option<Arc<dyn PromotionListener>>,
    clock: Arc<dyn Clock>,
    poll_period: Duration,
    heartbeat_timeout: Duration,
    // Held across a whole poll so polls, start, and stop never interleave
    status: tokio::sync::Mutex<Status>,
    observed: RwLock<Observed>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    shutdown: Notify,
}

impl HighAvailabilityManager {
    pub fn new(node_id: impl Into<String>, persister: Arc<dyn SyncRecordPersister>) -> Self {
        Self {
            node_id: node_id.into(),
            uri: None,
            persister,
            rebinder: None,
            listener: None,
            clock: Arc::new(SystemClock),
            poll_period: DEFAULT_POLL_PERIOD,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            status: tokio::sync::Mutex::new(Status {
                mode: None,
                state: NodeState::Initializing,
                master_since: None,
                last_sync_ok: None,
            }),
            observed: RwLock::new(Observed {
                state: NodeState::Initializing,
                plane: PlaneSyncRecord::default(),
            }),
            task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rebinder(mut self, rebinder: Arc<dyn Rebinder>) -> Self {
        self.rebinder = Some(rebinder);
        self
    }

    pub fn with_promotion_listener(mut self, listener: Arc<dyn PromotionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_state(&self) -> NodeState {
        self.observed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// The plane as last observed, with this node's current belief about itself.
    pub fn management_plane_sync_state(&self) -> PlaneSyncRecord {
        self.observed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plane
            .clone()
    }

    /// Join the management plane in `mode` and start the poll loop.
    pub async fn start(self: &Arc<Self>, mode: HighAvailabilityMode) -> Result<(), HaError> {
        let mut status = self.status.lock().await;
        if status.mode.is_some() {
            return Err(HaError::AlreadyStarted);
        }
        tracing::info!(node_id = %self.node_id, mode = %mode, "starting high availability");

        match mode {
            HighAvailabilityMode::Disabled => {
                status.mode = Some(mode);
                return self.start_disabled(&mut status).await;
            }
            HighAvailabilityMode::Master => {
                let plane = self.persister.load_sync_record().await?;
                if let Some(master) = self.live_master_other_than_self(&plane) {
                    return Err(HaError::MasterAlreadyPresent(master));
                }
                status.mode = Some(mode);
                let now = self.clock.now_millis();
                self.promote(&mut status, now).await?;
                self.observe(&status, now, Some(plane));
            }
            HighAvailabilityMode::Standby | HighAvailabilityMode::HotStandby => {
                let plane = self.persister.load_sync_record().await?;
                if self.live_master_other_than_self(&plane).is_none() {
                    return Err(HaError::NoMasterPresent);
                }
                status.mode = Some(mode);
            }
            HighAvailabilityMode::Auto => {
                status.mode = Some(mode);
            }
        }

        self.poll_locked(&mut status).await;
        drop(status);

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        *task = Some(tokio::spawn(run_loop(Arc::clone(self))));
        Ok(())
    }

    async fn start_disabled(&self, status: &mut Status) -> Result<(), HaError> {
        let now = self.clock.now_millis();
        if let Some(rebinder) = &self.rebinder {
            if let Err(e) = rebinder.rebind(false).await {
                if !e.is_transient() {
                    tracing::error!(node_id = %self.node_id, error = %e, "rebind failed, node failed");
                    status.state = NodeState::Failed;
                    self.observe(status, now, None);
                }
                return Err(e.into());
            }
            rebinder.start_persisting().await?;
        }
        status.state = NodeState::Master;
        status.master_since = Some(now);
        self.observe(status, now, None);
        tracing::info!(node_id = %self.node_id, "high availability disabled, running as master");
        if let Some(listener) = &self.listener {
            listener.promoting_to_master();
        }
        Ok(())
    }

    /// Run one election round. The poll loop calls this every period.
    pub async fn poll_once(&self) -> Result<NodeState, HaError> {
        let mut status = self.status.lock().await;
        match status.mode {
            None => return Err(HaError::NotStarted),
            Some(_) if status.state == NodeState::Terminated => return Err(HaError::Stopped),
            Some(HighAvailabilityMode::Disabled) => return Ok(status.state),
            Some(_) => {}
        }
        self.poll_locked(&mut status).await;
        Ok(status.state)
    }

    async fn poll_locked(&self, status: &mut Status) {
        let now = self.clock.now_millis();
        let own = self.record(status, now);

        let published = self
            .persister
            .delta(&SyncRecordDelta::default().node(own.clone()))
            .await;
        if let Err(e) = &published {
            tracing::warn!(node_id = %self.node_id, error = %e, "failed to publish heartbeat");
        }
        let loaded = match self.persister.load_sync_record().await {
            Ok(plane) => Some(plane),
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "failed to load sync records");
                None
            }
        };

        let plane = match loaded {
            Some(plane) if published.is_ok() => {
                status.last_sync_ok = Some(now);
                plane.apply_delta(&SyncRecordDelta::default().node(own))
            }
            _ => {
                self.check_sync_loss(status, now);
                self.observe(status, now, None);
                return;
            }
        };

        let election = elect(&plane, now, self.heartbeat_timeout);
        if let Some(ambiguity) = &election.ambiguity {
            tracing::warn!(node_id = %self.node_id, claimants = ?ambiguity.claimants, "election ambiguity");
        }

        let elected_self = election.master.as_deref() == Some(self.node_id.as_str());
        let state = status.state;
        match state {
            NodeState::Master if elected_self => {}
            NodeState::Master => {
                tracing::info!(
                    node_id = %self.node_id,
                    master = ?election.master,
                    "another node holds mastership, demoting"
                );
                self.demote(status, now).await;
            }
            NodeState::Failed | NodeState::Terminated => {}
            NodeState::Initializing | NodeState::Standby if elected_self => {
                if let Err(e) = self.promote(status, now).await {
                    tracing::warn!(node_id = %self.node_id, error = %e, "promotion did not complete");
                }
            }
            NodeState::Initializing | NodeState::Standby => {
                if state == NodeState::Initializing {
                    status.state = NodeState::Standby;
                    tracing::info!(node_id = %self.node_id, master = ?election.master, "joined as standby");
                    self.publish(status, now).await;
                }
                if status.mode == Some(HighAvailabilityMode::HotStandby) {
                    self.refresh_hot_standby().await;
                }
            }
        }

        self.observe(status, now, Some(plane));
    }

    /// A master that cannot confirm its claim for longer than the timeout
    /// steps down rather than risk two masters.
    fn check_sync_loss(&self, status: &mut Status, now: i64) {
        if status.state != NodeState::Master {
            return;
        }
        let timeout = i64::try_from(self.heartbeat_timeout.as_millis()).unwrap_or(i64::MAX);
        let last_ok = status.last_sync_ok.unwrap_or(i64::MIN);
        if now.saturating_sub(last_ok) > timeout {
            tracing::warn!(
                node_id = %self.node_id,
                unsynced_ms = now.saturating_sub(last_ok),
                "no successful sync within heartbeat timeout, demoting"
            );
            if let Some(rebinder) = &self.rebinder {
                rebinder.stop_persisting();
            }
            status.state = NodeState::Standby;
            status.master_since = None;
        }
    }

    async fn promote(&self, status: &mut Status, now: i64) -> Result<(), HaError> {
        tracing::info!(node_id = %self.node_id, "promoting to master");
        if let Some(rebinder) = &self.rebinder {
            match rebinder.rebind(false).await {
                Ok(report) => {
                    tracing::info!(
                        node_id = %self.node_id,
                        objects = report.object_count(),
                        failures = report.failure_count(),
                        "rebind complete"
                    );
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(node_id = %self.node_id, error = %e, "rebind could not read persisted state, staying standby");
                    self.stay_standby(status, now).await;
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::error!(node_id = %self.node_id, error = %e, "rebind failed, node failed");
                    status.state = NodeState::Failed;
                    status.master_since = None;
                    self.publish(status, now).await;
                    return Err(e.into());
                }
            }
            if let Err(e) = rebinder.start_persisting().await {
                self.stay_standby(status, now).await;
                return Err(e.into());
            }
        }

        status.state = NodeState::Master;
        status.master_since = Some(now);
        status.last_sync_ok = Some(now);
        self.publish(status, now).await;
        tracing::info!(node_id = %self.node_id, "now master");
        if let Some(listener) = &self.listener {
            listener.promoting_to_master();
        }
        Ok(())
    }

    /// Promotion hit a store error; the next poll runs the election again.
    async fn stay_standby(&self, status: &mut Status, now: i64) {
        if status.state == NodeState::Initializing {
            status.state = NodeState::Standby;
            self.publish(status, now).await;
        }
    }

    async fn demote(&self, status: &mut Status, now: i64) {
        if let Some(rebinder) = &self.rebinder {
            rebinder.stop_persisting();
        }
        status.state = NodeState::Standby;
        status.master_since = None;
        self.publish(status, now).await;
        tracing::info!(node_id = %self.node_id, "now standby");
    }

    async fn refresh_hot_standby(&self) {
        let Some(rebinder) = &self.rebinder else {
            return;
        };
        match rebinder.rebind(true).await {
            Ok(report) => {
                tracing::debug!(node_id = %self.node_id, objects = report.object_count(), "hot standby refreshed");
            }
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "hot standby rebind failed");
            }
        }
    }

    /// Leave the plane: stop polling, halt delta writes, and publish a final
    /// TERMINATED record so peers can take over without waiting out the timeout.
    pub async fn stop(&self) {
        // The loop finishes its current poll before it sees the signal
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(node_id = %self.node_id, error = %e, "poll loop ended abnormally");
        }

        let mut status = self.status.lock().await;
        if status.mode.is_none() || status.state == NodeState::Terminated {
            return;
        }
        if let Some(rebinder) = &self.rebinder {
            rebinder.stop_persisting();
        }
        let now = self.clock.now_millis();
        status.state = NodeState::Terminated;
        status.master_since = None;
        if status.mode != Some(HighAvailabilityMode::Disabled) {
            self.publish(&status, now).await;
        }
        self.observe(&status, now, None);
        tracing::info!(node_id = %self.node_id, "high availability stopped");
    }

    fn record(&self, status: &Status, now: i64) -> ManagementNodeRecord {
        let mut record = ManagementNodeRecord::new(&self.node_id, status.state, now);
        record.uri = self.uri.clone();
        if status.state == NodeState::Master {
            record.master_since_utc = status.master_since;
        }
        record
    }

    async fn publish(&self, status: &Status, now: i64) {
        let delta = SyncRecordDelta::default().node(self.record(status, now));
        if let Err(e) = self.persister.delta(&delta).await {
            tracing::warn!(node_id = %self.node_id, state = %status.state, error = %e, "failed to publish node state");
        }
    }

    fn observe(&self, status: &Status, now: i64, plane: Option<PlaneSyncRecord>) {
        let mut observed = self.observed.write().unwrap_or_else(PoisonError::into_inner);
        let base = plane.unwrap_or_else(|| observed.plane.clone());
        observed.plane = base.apply_delta(&SyncRecordDelta::default().node(self.record(status, now)));
        observed.state = status.state;
    }

    fn live_master_other_than_self(&self, plane: &PlaneSyncRecord) -> Option<String> {
        let now = self.clock.now_millis();
        elect(plane, now, self.heartbeat_timeout)
            .master
            .filter(|id| *id != self.node_id)
            .filter(|id| plane.nodes.get(id).is_some_and(|r| r.state == NodeState::Master))
    }
}

async fn run_loop(manager: Arc<HighAvailabilityManager>) {
    let mut ticker = tokio::time::interval(manager.poll_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // start() already ran the first poll
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = manager.shutdown.notified() => break,
        }
        if manager.stopping.load(Ordering::SeqCst) {
            break;
        }
        match manager.poll_once().await {
            Ok(_) => {}
            Err(HaError::Stopped) => break,
            Err(e) => tracing::warn!(node_id = %manager.node_id, error = %e, "poll failed"),
        }
    }
}
