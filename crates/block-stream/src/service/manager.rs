//! # Block Node Connection Manager
//!
//! Owns one [`BlockNodeConnection`] per configured peer and keeps exactly one
//! of them `ACTIVE`.
//!
//! ## Selection
//!
//! Connections are opened as `READY` standbys. The active publisher is the
//! standby with the lowest priority value; ties are broken randomly. A better
//! peer that becomes ready later preempts the active connection at the next
//! block boundary, and [`BlockNodeConnectionManager::select_block_node`] can
//! force a switch to any peer.
//!
//! ## Failover and backoff
//!
//! A failing connection reports back through [`ConnectionCoordinator`]. The
//! manager detaches it, schedules a retry of the same peer (fixed delay or
//! jittered exponential backoff) and, when asked to, hands streaming to the
//! next standby starting at the failed connection's position. A peer with a
//! scheduled retry is in backoff and is skipped by selection.
//!
//! ## Buffer pressure
//!
//! The manager is the block buffer's [`BufferPressureHandler`]. When the
//! buffer reaches its action stage, streaming is forced onto another peer in
//! the hope that it acknowledges faster.
//!
//! ## Locking
//!
//! `state` is taken before `config` and `lifecycle`. No lock is held across
//! an `.await`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    backoff_delay, invariant_single_active, jittered, validate_block_nodes,
    BlockNodeConfiguration, BlockNodeConnectionConfig, ConnectionState, HighLatencyResult,
    PeerStats, RetryState,
};
use crate::events::{BlockStreamError, ConfigError, PipelineOperation};
use crate::ports::inbound::{BlockBufferApi, PublisherControl};
use crate::ports::outbound::{
    BufferPressureHandler, CleanupSink, ConfigProvider, ConnectionCoordinator, StreamMetrics,
    StreamTransport,
};
use crate::service::{
    AcknowledgementTracker, BlockBufferService, BlockNodeConnection, ConnectionContext,
    PipelineTaskRunner,
};

struct PendingAttempt {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    nodes: Vec<BlockNodeConfiguration>,
    connections: HashMap<BlockNodeConfiguration, Arc<BlockNodeConnection>>,
    active: Option<Arc<BlockNodeConnection>>,
    pending_attempts: HashMap<BlockNodeConfiguration, PendingAttempt>,
    retry: HashMap<BlockNodeConfiguration, RetryState>,
    disabled: HashSet<BlockNodeConfiguration>,
    connecting: HashSet<BlockNodeConfiguration>,
    /// Standby to activate next, ahead of priority order.
    preferred_candidate: Option<BlockNodeConfiguration>,
    /// Peer preempted by a forced switch; retried after the longer delay.
    forced_switch_from: Option<BlockNodeConfiguration>,
    /// Block the next activated connection starts at.
    pending_resume: Option<u64>,
    /// Initial connection round in progress.
    starting: bool,
}

impl ManagerState {
    fn is_tracked(&self, connection: &Arc<BlockNodeConnection>) -> bool {
        self.connections
            .get(connection.configuration())
            .is_some_and(|tracked| Arc::ptr_eq(tracked, connection))
    }

    fn is_active(&self, connection: &Arc<BlockNodeConnection>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, connection))
    }

    fn detach(&mut self, connection: &Arc<BlockNodeConnection>) {
        if self.is_tracked(connection) {
            self.connections.remove(connection.configuration());
        }
        if self.is_active(connection) {
            self.active = None;
        }
    }
}

/// Selects, fails over and reschedules the connections to Block Nodes.
pub struct BlockNodeConnectionManager {
    provider: Arc<dyn ConfigProvider>,
    config: RwLock<BlockNodeConnectionConfig>,
    buffer: Arc<BlockBufferService>,
    transport: Arc<dyn StreamTransport>,
    metrics: Arc<dyn StreamMetrics>,
    ack_tracker: RwLock<Arc<AcknowledgementTracker>>,
    state: Mutex<ManagerState>,
    stats: Mutex<HashMap<BlockNodeConfiguration, PeerStats>>,
    is_active: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
    next_attempt_id: AtomicU64,
    self_ref: Weak<BlockNodeConnectionManager>,
}

impl BlockNodeConnectionManager {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        buffer: Arc<BlockBufferService>,
        transport: Arc<dyn StreamTransport>,
        metrics: Arc<dyn StreamMetrics>,
    ) -> Arc<Self> {
        let config = provider.connection_config();
        let ack_tracker = Self::new_ack_tracker(config.quorum_threshold, &buffer);
        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let handler: Weak<dyn BufferPressureHandler> = self_ref.clone();
            buffer.set_pressure_handler(handler);
            Self {
                provider,
                config: RwLock::new(config),
                buffer,
                transport,
                metrics,
                ack_tracker: RwLock::new(ack_tracker),
                state: Mutex::new(ManagerState::default()),
                stats: Mutex::new(HashMap::new()),
                is_active: AtomicBool::new(false),
                lifecycle: Mutex::new(CancellationToken::new()),
                next_attempt_id: AtomicU64::new(1),
                self_ref: self_ref.clone(),
            }
        })
    }

    fn new_ack_tracker(
        quorum: usize,
        buffer: &Arc<BlockBufferService>,
    ) -> Arc<AcknowledgementTracker> {
        let sink: Arc<dyn CleanupSink> = buffer.clone();
        Arc::new(AcknowledgementTracker::new(quorum, sink))
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> &Arc<BlockBufferService> {
        &self.buffer
    }

    pub fn ack_tracker(&self) -> Arc<AcknowledgementTracker> {
        Arc::clone(&self.ack_tracker.read())
    }

    pub fn connection_config(&self) -> BlockNodeConnectionConfig {
        self.config.read().clone()
    }

    pub fn active_connection(&self) -> Option<Arc<BlockNodeConnection>> {
        self.state.lock().active.clone()
    }

    pub fn connection(&self, node: &BlockNodeConfiguration) -> Option<Arc<BlockNodeConnection>> {
        self.state.lock().connections.get(node).cloned()
    }

    /// Every open connection, active and standby.
    pub fn connections(&self) -> Vec<Arc<BlockNodeConnection>> {
        self.state.lock().connections.values().cloned().collect()
    }

    pub fn is_disabled(&self, node: &BlockNodeConfiguration) -> bool {
        self.state.lock().disabled.contains(node)
    }

    /// Whether a retry of `node` is scheduled.
    pub fn has_pending_attempt(&self, node: &BlockNodeConfiguration) -> bool {
        self.state.lock().pending_attempts.contains_key(node)
    }

    /// EndOfStream responses from `node` within the rate-limit window.
    pub fn end_of_stream_count(&self, node: &BlockNodeConfiguration) -> usize {
        self.stats
            .lock()
            .get(node)
            .map_or(0, PeerStats::end_of_stream_count)
    }

    pub fn current_streaming_block_number(&self) -> Option<u64> {
        self.active_connection()
            .and_then(|connection| connection.streaming_block_number())
    }

    pub fn active_connection_peer(&self) -> Option<BlockNodeConfiguration> {
        self.active_connection()
            .map(|connection| connection.configuration().clone())
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Connects to every configured peer and activates the best one.
    ///
    /// Must be called from within a tokio runtime. Calling it on a running
    /// manager is a no-op.
    pub fn start(&self) -> Result<(), BlockStreamError> {
        let nodes = validate_block_nodes(self.provider.block_nodes())?;
        if nodes.is_empty() {
            return Err(ConfigError::Invalid("no block nodes configured".into()).into());
        }
        let manager = self
            .self_ref
            .upgrade()
            .ok_or(BlockStreamError::ManagerInactive)?;
        if self.is_active.swap(true, Ordering::AcqRel) {
            debug!("Connection manager already running");
            return Ok(());
        }

        *self.config.write() = self.provider.connection_config();
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            state.nodes = nodes.clone();
            state.starting = true;
            *self.lifecycle.lock() = token;
        }

        info!(
            nodes = nodes.len(),
            quorum = self.ack_tracker().quorum(),
            "Starting block node connection manager"
        );
        tokio::spawn(manager.connect_all());
        Ok(())
    }

    async fn connect_all(self: Arc<Self>) {
        let nodes = self.state.lock().nodes.clone();
        let mut attempts = JoinSet::new();
        for node in nodes {
            let manager = Arc::clone(&self);
            attempts.spawn(async move {
                manager.open_connection(&node, None).await;
            });
        }
        while attempts.join_next().await.is_some() {}

        let mut state = self.state.lock();
        state.starting = false;
        if !self.is_active() || state.active.is_some() {
            return;
        }
        self.fail_over_locked(&mut state, None);
    }

    /// Closes every connection and cancels scheduled work. Idempotent.
    pub async fn shutdown(&self) {
        if !self.is_active.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down block node connection manager");

        let connections: Vec<Arc<BlockNodeConnection>> = {
            let mut state = self.state.lock();
            for (_, attempt) in state.pending_attempts.drain() {
                attempt.token.cancel();
            }
            state.active = None;
            state.connecting.clear();
            state.connections.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            connection.close(true).await;
        }

        self.lifecycle.lock().cancel();
        self.metrics.record_no_active_connection();
        info!("Block node connection manager stopped");
    }

    /// Re-reads the provider. If the peers or connection settings changed,
    /// streaming is restarted with the new configuration.
    pub async fn reload_configuration(&self) -> Result<bool, BlockStreamError> {
        let nodes = validate_block_nodes(self.provider.block_nodes())?;
        let config = self.provider.connection_config();

        let current_nodes = self.state.lock().nodes.clone();
        let current: HashSet<&BlockNodeConfiguration> = current_nodes.iter().collect();
        let updated: HashSet<&BlockNodeConfiguration> = nodes.iter().collect();
        let config_changed = *self.config.read() != config;
        if current == updated && !config_changed {
            debug!("Block node configuration unchanged");
            return Ok(false);
        }

        info!(
            previous = current_nodes.len(),
            nodes = nodes.len(),
            config_changed,
            "Block node configuration changed, restarting streaming"
        );
        let tracker = self.ack_tracker();
        for removed in current.difference(&updated) {
            tracker.remove_peer(&removed.node_id());
            self.stats.lock().remove(*removed);
        }
        if tracker.quorum() != config.quorum_threshold.max(1) {
            *self.ack_tracker.write() = Self::new_ack_tracker(config.quorum_threshold, &self.buffer);
        }

        let was_active = self.is_active();
        self.shutdown().await;
        *self.state.lock() = ManagerState::default();
        *self.config.write() = config;
        if was_active {
            self.start()?;
        }
        Ok(true)
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    /// Makes `node` the active publisher, opening a connection if needed.
    ///
    /// Without `force`, `node` only takes over if it has a better priority
    /// than the active peer.
    pub fn select_block_node(
        &self,
        node: &BlockNodeConfiguration,
        force: bool,
    ) -> Result<(), BlockStreamError> {
        if !self.is_active() {
            return Err(BlockStreamError::ManagerInactive);
        }
        let existing = {
            let mut state = self.state.lock();
            if !state.nodes.contains(node) {
                return Err(BlockStreamError::PeerUnavailable {
                    node: node.node_id(),
                    reason: "not configured".into(),
                });
            }
            if state.disabled.contains(node) {
                return Err(BlockStreamError::PeerUnavailable {
                    node: node.node_id(),
                    reason: "disabled until configuration reload".into(),
                });
            }
            let existing = state.connections.get(node).cloned();
            if existing.is_none() {
                self.schedule_attempt_locked(&mut state, node.clone(), Duration::ZERO, None, force);
            }
            existing
        };
        if let Some(connection) = existing {
            self.promote(&connection, force);
        }
        Ok(())
    }

    /// Moves the active connection to `block_number`, or makes it the start
    /// of the next activated connection.
    pub fn jump_to_block(&self, block_number: u64) {
        let mut state = self.state.lock();
        match state.active.clone() {
            Some(active) => active.jump_to_block(block_number),
            None => {
                info!(block_number, "No active connection, deferring jump");
                state.pending_resume = Some(block_number);
            }
        }
    }

    /// Forces streaming onto a peer other than the active one.
    ///
    /// A ready standby is preferred; otherwise a forced connection attempt is
    /// scheduled on the best unconnected peer. Returns whether a switch was
    /// initiated.
    pub fn select_new_block_node_for_streaming(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let standby = {
            let mut state = self.state.lock();
            if state.nodes.len() <= 1 {
                debug!("Only one block node configured, not switching");
                return false;
            }
            let mut standbys: Vec<Arc<BlockNodeConnection>> = state
                .connections
                .values()
                .filter(|connection| {
                    !state.is_active(connection)
                        && connection.state() == ConnectionState::Ready
                        && !connection.is_closing_at_block_boundary()
                })
                .cloned()
                .collect();
            standbys.shuffle(&mut rand::thread_rng());
            standbys.sort_by_key(|connection| connection.priority());
            match standbys.into_iter().next() {
                Some(standby) => standby,
                None => {
                    if tokio::runtime::Handle::try_current().is_err() {
                        warn!("No runtime available to open a new block node connection");
                        return false;
                    }
                    let Some(node) = Self::unconnected_candidates(&state).into_iter().next()
                    else {
                        warn!("No block node available to take over streaming");
                        return false;
                    };
                    info!(peer = %node, "Opening new block node to take over streaming");
                    self.schedule_attempt_locked(&mut state, node, Duration::ZERO, None, true);
                    return true;
                }
            }
        };
        self.promote(&standby, true);
        true
    }

    fn promote(&self, connection: &Arc<BlockNodeConnection>, force: bool) {
        let mut state = self.state.lock();
        if !self.is_active() || !state.is_tracked(connection) {
            return;
        }
        let Some(active) = state.active.clone() else {
            let resume = state.pending_resume;
            if self.activate_locked(&mut state, connection, resume) {
                state.pending_resume = None;
            }
            return;
        };
        if Arc::ptr_eq(&active, connection) || connection.state() != ConnectionState::Ready {
            return;
        }
        if force || connection.priority() < active.priority() {
            info!(
                active = %active,
                candidate = %connection,
                force,
                "Switching block node at the next block boundary"
            );
            state.preferred_candidate = Some(connection.configuration().clone());
            if force {
                state.forced_switch_from = Some(active.configuration().clone());
            }
            active.close_at_block_boundary();
        }
    }

    fn activate_locked(
        &self,
        state: &mut ManagerState,
        connection: &Arc<BlockNodeConnection>,
        resume: Option<u64>,
    ) -> bool {
        if let Some(block_number) = resume {
            if connection.streaming_block_number().is_none() {
                connection.jump_to_block(block_number);
            }
        }
        if let Err(error) = connection.update_connection_state(ConnectionState::Active) {
            warn!(connection = %connection, %error, "Could not activate connection");
            return false;
        }
        state.active = Some(Arc::clone(connection));
        state.preferred_candidate = None;
        if !invariant_single_active(state.connections.values().map(|c| c.state())) {
            error!(connection = %connection, "More than one connection is active");
        }
        self.metrics.record_active_connection(connection.configuration());
        info!(
            connection = %connection,
            streaming = ?connection.streaming_block_number(),
            "Block node connection is now active"
        );
        true
    }

    /// Activates the best standby. Returns `false` if none could be activated.
    fn activate_next_locked(&self, state: &mut ManagerState) -> bool {
        let mut candidates: Vec<Arc<BlockNodeConnection>> = state
            .connections
            .values()
            .filter(|connection| {
                connection.state() == ConnectionState::Ready
                    && !connection.is_closing_at_block_boundary()
            })
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by_key(|connection| connection.priority());
        if let Some(preferred) = state.preferred_candidate.take() {
            if let Some(index) = candidates
                .iter()
                .position(|connection| connection.configuration() == &preferred)
            {
                let connection = candidates.remove(index);
                candidates.insert(0, connection);
            }
        }

        let resume = state.pending_resume;
        for candidate in candidates {
            if self.activate_locked(state, &candidate, resume) {
                state.pending_resume = None;
                return true;
            }
        }
        false
    }

    fn fail_over_locked(&self, state: &mut ManagerState, resume: Option<u64>) {
        if resume.is_some() {
            state.pending_resume = resume;
        }
        if self.activate_next_locked(state) {
            return;
        }
        self.metrics.record_no_active_connection();
        self.select_new_block_node_locked(state);
    }

    /// Schedules an immediate attempt on the best peer that is neither
    /// connected nor in backoff.
    fn select_new_block_node_locked(&self, state: &mut ManagerState) {
        match Self::unconnected_candidates(state).into_iter().next() {
            Some(node) => {
                info!(peer = %node, "Selected block node to take over streaming");
                self.schedule_attempt_locked(state, node, Duration::ZERO, None, false);
            }
            None => warn!("No block node available to take over streaming"),
        }
    }

    /// Peers neither connected, connecting, in backoff nor disabled, best
    /// priority first.
    fn unconnected_candidates(state: &ManagerState) -> Vec<BlockNodeConfiguration> {
        let mut candidates: Vec<BlockNodeConfiguration> = state
            .nodes
            .iter()
            .filter(|node| {
                !state.connections.contains_key(*node)
                    && !state.pending_attempts.contains_key(*node)
                    && !state.disabled.contains(*node)
                    && !state.connecting.contains(*node)
            })
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by_key(|node| node.priority);
        candidates
    }

    // =========================================================================
    // CONNECTION ATTEMPTS
    // =========================================================================

    fn schedule_attempt_locked(
        &self,
        state: &mut ManagerState,
        node: BlockNodeConfiguration,
        delay: Duration,
        resume_block: Option<u64>,
        force: bool,
    ) {
        if !self.is_active() || state.disabled.contains(&node) || !state.nodes.contains(&node) {
            return;
        }
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let token = self.lifecycle.lock().child_token();
        let id = self.next_attempt_id.fetch_add(1, Ordering::Relaxed);
        let attempt = PendingAttempt {
            id,
            token: token.clone(),
        };
        if let Some(previous) = state.pending_attempts.insert(node.clone(), attempt) {
            previous.token.cancel();
        }

        debug!(peer = %node, ?delay, ?resume_block, force, "Scheduled connection attempt");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    manager.run_connection_attempt(node, id, resume_block, force).await;
                }
            }
        });
    }

    async fn run_connection_attempt(
        self: Arc<Self>,
        node: BlockNodeConfiguration,
        id: u64,
        resume_block: Option<u64>,
        force: bool,
    ) {
        {
            let mut state = self.state.lock();
            match state.pending_attempts.get(&node) {
                Some(attempt) if attempt.id == id => {
                    state.pending_attempts.remove(&node);
                }
                _ => return,
            }
        }
        if let Some(connection) = self.open_connection(&node, resume_block).await {
            self.promote(&connection, force);
        }
    }

    /// Opens a standby connection to `node`, or returns the existing one.
    ///
    /// A failed attempt schedules a retry with backoff.
    async fn open_connection(
        self: &Arc<Self>,
        node: &BlockNodeConfiguration,
        resume_block: Option<u64>,
    ) -> Option<Arc<BlockNodeConnection>> {
        {
            let mut state = self.state.lock();
            if !self.is_active() || state.disabled.contains(node) || !state.nodes.contains(node) {
                return None;
            }
            if let Some(existing) = state.connections.get(node) {
                return Some(Arc::clone(existing));
            }
            if !state.connecting.insert(node.clone()) {
                return None;
            }
        }

        let connection = match self.establish(node, resume_block).await {
            Ok(connection) => connection,
            Err(error) => {
                let mut state = self.state.lock();
                state.connecting.remove(node);
                if matches!(error, BlockStreamError::Cancelled) || !self.is_active() {
                    return None;
                }
                warn!(peer = %node, %error, "Connection attempt failed");
                let delay = self.next_backoff_delay_locked(&mut state, node);
                self.schedule_attempt_locked(&mut state, node.clone(), delay, resume_block, false);
                if !state.starting && state.active.is_none() {
                    self.fail_over_locked(&mut state, None);
                }
                return None;
            }
        };

        let accepted = {
            let mut state = self.state.lock();
            state.connecting.remove(node);
            let accepted = self.is_active()
                && state.nodes.contains(node)
                && !state.disabled.contains(node)
                && !state.connections.contains_key(node);
            if accepted {
                state.connections.insert(node.clone(), Arc::clone(&connection));
            }
            accepted
        };
        if !accepted {
            debug!(connection = %connection, "Discarding connection opened after a state change");
            connection.close(true).await;
            return None;
        }
        info!(connection = %connection, "Standby connection ready");
        Some(connection)
    }

    async fn establish(
        &self,
        node: &BlockNodeConfiguration,
        resume_block: Option<u64>,
    ) -> Result<Arc<BlockNodeConnection>, BlockStreamError> {
        let config = self.connection_config();
        let wanted = self.check_peer_status(node, &config).await?;

        let connection = BlockNodeConnection::new(node.clone(), config, self.connection_context());
        connection.initialize().await?;
        if let Some(block_number) = wanted.or(resume_block) {
            connection.jump_to_block(block_number);
        }
        Ok(connection)
    }

    /// Asks the peer which block it wants next. Peers wanting a block outside
    /// the buffered range are unavailable.
    async fn check_peer_status(
        &self,
        node: &BlockNodeConfiguration,
        config: &BlockNodeConnectionConfig,
    ) -> Result<Option<u64>, BlockStreamError> {
        let status = self
            .runner()
            .run_with_timeout(
                PipelineOperation::StatusQuery,
                config.connection_timeout,
                self.transport.query_status(node),
            )
            .await?;
        let Some(status) = status else {
            return Ok(None);
        };

        let wanted = status.wanted_block();
        if let Some(earliest) = self.buffer.earliest_available_block_number() {
            if wanted < earliest {
                return Err(BlockStreamError::PeerUnavailable {
                    node: node.node_id(),
                    reason: format!("wants block {wanted}, earliest buffered block is {earliest}"),
                });
            }
        }
        if let Some(last) = self.buffer.last_block_number_produced() {
            if wanted > last.saturating_add(1) {
                return Err(BlockStreamError::PeerUnavailable {
                    node: node.node_id(),
                    reason: format!("wants block {wanted}, last produced block is {last}"),
                });
            }
        }
        debug!(peer = %node, wanted, "Peer status accepted");
        Ok(Some(wanted))
    }

    fn runner(&self) -> PipelineTaskRunner {
        let timeout = self.config.read().pipeline_operation_timeout;
        PipelineTaskRunner::new(timeout, self.lifecycle.lock().clone())
    }

    fn connection_context(&self) -> ConnectionContext {
        let coordinator: Weak<dyn ConnectionCoordinator> = self.self_ref.clone();
        ConnectionContext {
            buffer: Arc::clone(&self.buffer),
            transport: Arc::clone(&self.transport),
            coordinator,
            metrics: Arc::clone(&self.metrics),
            runner: self.runner(),
        }
    }

    fn next_backoff_delay_locked(
        &self,
        state: &mut ManagerState,
        node: &BlockNodeConfiguration,
    ) -> Duration {
        let config = self.config.read();
        let attempt = state
            .retry
            .entry(node.clone())
            .or_default()
            .record_attempt(Instant::now(), config.backoff_reset_time_frame);
        let delay = jittered(
            backoff_delay(attempt, config.max_backoff_delay),
            &mut rand::thread_rng(),
        );
        debug!(peer = %node, attempt, ?delay, "Computed retry backoff");
        delay
    }
}

// =============================================================================
// CONNECTION CALLBACKS
// =============================================================================

impl ConnectionCoordinator for BlockNodeConnectionManager {
    fn reschedule_connection(
        &self,
        connection: &Arc<BlockNodeConnection>,
        delay: Option<Duration>,
        resume_block: Option<u64>,
        select_new_node: bool,
    ) {
        let mut state = self.state.lock();
        let was_active = state.is_active(connection);
        if !self.is_active() || !(was_active || state.is_tracked(connection)) {
            return;
        }
        state.detach(connection);

        let node = connection.configuration().clone();
        let failover_resume = resume_block.or_else(|| connection.streaming_block_number());
        let delay = delay.unwrap_or_else(|| self.next_backoff_delay_locked(&mut state, &node));
        info!(
            connection = %connection,
            ?delay,
            ?resume_block,
            select_new_node,
            "Rescheduling connection"
        );
        self.schedule_attempt_locked(&mut state, node, delay, resume_block, false);

        if was_active {
            if select_new_node && state.nodes.len() > 1 {
                self.fail_over_locked(&mut state, failover_resume);
            } else {
                state.pending_resume = failover_resume;
                self.metrics.record_no_active_connection();
            }
        }
    }

    fn notify_connection_closed(&self, connection: &Arc<BlockNodeConnection>) {
        let mut state = self.state.lock();
        let was_active = state.is_active(connection);
        if !self.is_active() || !(was_active || state.is_tracked(connection)) {
            return;
        }
        state.detach(connection);

        let node = connection.configuration().clone();
        let delay = if state.forced_switch_from.as_ref() == Some(&node) {
            state.forced_switch_from = None;
            self.config.read().forced_switch_reschedule_delay
        } else {
            self.next_backoff_delay_locked(&mut state, &node)
        };
        debug!(connection = %connection, ?delay, was_active, "Connection closed");
        self.schedule_attempt_locked(&mut state, node, delay, None, false);

        if was_active {
            self.fail_over_locked(&mut state, connection.streaming_block_number());
        }
    }

    fn notify_connection_unrecoverable(&self, connection: &Arc<BlockNodeConnection>) {
        let mut state = self.state.lock();
        let was_active = state.is_active(connection);
        if !self.is_active() || !(was_active || state.is_tracked(connection)) {
            return;
        }
        state.detach(connection);

        let node = connection.configuration().clone();
        if let Some(attempt) = state.pending_attempts.remove(&node) {
            attempt.token.cancel();
        }
        state.disabled.insert(node.clone());
        error!(peer = %node, "Block node disabled until the configuration is reloaded");

        if was_active {
            self.fail_over_locked(&mut state, connection.streaming_block_number());
        }
    }

    fn record_acknowledgement(&self, node: &BlockNodeConfiguration, block_number: u64) {
        self.ack_tracker()
            .on_acknowledgement(&node.node_id(), block_number);
    }

    fn record_block_ack_and_check_latency(
        &self,
        node: &BlockNodeConfiguration,
        block_number: u64,
        at: Instant,
    ) -> HighLatencyResult {
        let (threshold, events_before_switching) = {
            let config = self.config.read();
            (
                config.high_latency_threshold,
                config.high_latency_events_before_switching,
            )
        };
        let result = self
            .stats
            .lock()
            .entry(node.clone())
            .or_default()
            .record_acknowledgement_and_evaluate(
                block_number,
                at,
                threshold,
                events_before_switching,
            );
        if result.is_high_latency {
            self.metrics.record_high_latency_event();
            warn!(
                peer = %node,
                block_number,
                latency = ?result.latency,
                consecutive = result.consecutive_high_latency_events,
                "High acknowledgement latency"
            );
        }
        result
    }

    fn record_block_proof_sent(&self, node: &BlockNodeConfiguration, block_number: u64, at: Instant) {
        self.stats
            .lock()
            .entry(node.clone())
            .or_default()
            .record_block_proof_sent(block_number, at);
    }

    fn record_end_of_stream_and_check_limit(
        &self,
        node: &BlockNodeConfiguration,
        at: Instant,
    ) -> bool {
        let (max_allowed, window) = {
            let config = self.config.read();
            (
                config.max_end_of_streams_allowed,
                config.end_of_stream_time_frame,
            )
        };
        self.stats
            .lock()
            .entry(node.clone())
            .or_default()
            .add_end_of_stream_and_check_limit(at, max_allowed, window)
    }

    fn is_only_one_block_node_configured(&self) -> bool {
        self.state.lock().nodes.len() <= 1
    }
}

#[async_trait]
impl BufferPressureHandler for BlockNodeConnectionManager {
    fn on_buffer_action_stage(&self, saturation_percent: f64) {
        if self.select_new_block_node_for_streaming() {
            info!(saturation_percent, "Moved streaming off the active block node");
        }
    }
}

#[async_trait]
impl PublisherControl for BlockNodeConnectionManager {
    fn start(&self) -> Result<(), BlockStreamError> {
        BlockNodeConnectionManager::start(self)
    }

    async fn shutdown(&self) {
        BlockNodeConnectionManager::shutdown(self).await
    }

    async fn reload_configuration(&self) -> Result<bool, BlockStreamError> {
        BlockNodeConnectionManager::reload_configuration(self).await
    }

    fn jump_to_block(&self, block_number: u64) {
        BlockNodeConnectionManager::jump_to_block(self, block_number)
    }

    fn current_streaming_block_number(&self) -> Option<u64> {
        BlockNodeConnectionManager::current_streaming_block_number(self)
    }

    fn active_connection_peer(&self) -> Option<BlockNodeConfiguration> {
        BlockNodeConnectionManager::active_connection_peer(self)
    }
}
