//! Stream consumer engine.
//!
//! Lifecycle: `STOPPED → INITIALIZING → RUNNING → SHUTTING_DOWN → STOPPED`.
//!
//! ```text
//!            ┌─────────────────────── run_cycle ───────────────────────┐
//!            │ 1. recover: XAUTOCLAIM idle + own pending (`0`)          │
//! Redis ───▶ │ 2. new:     XREADGROUP `>` (one call per group, joined) │ ──▶ process_messages
//!            │ 3. safety:  own pending (`0`)                           │
//!            └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every broker call goes through the broker breaker and every handler call
//! through the store breaker. A cycle that acknowledges nothing is followed
//! by an idle sleep that shutdown interrupts.
//!
//! Streams whose consumer group is missing are left out of reads so they
//! cannot stall the rest of their group. Creation is retried at most once
//! per `health_interval`, or right away when a read reports NOGROUP.

mod process;


use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerError, BreakerSnapshot, CircuitBreaker};
use crate::broker::{BrokerError, ReadCursor, StreamBroker, StreamMessage};
use crate::coordinator::{ConsumerGroupCoordinator, CoordinatorHealth, GroupCreationReport};
use crate::dlq::DeadLetterQueue;
use crate::handlers::DispatchTable;
use crate::ledger::ProcessedLedger;
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::shutdown::ShutdownSignal;

pub use self::process::{BatchSummary, ReadSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Stopped,
    Initializing,
    Running,
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not reach the broker after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    #[error("engine is {0:?}, expected RUNNING")]
    NotRunning(EngineState),

    #[error("shutdown requested")]
    ShutdownRequested,
}

/// Bounded exponential backoff for the initial broker connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tenant this consumer serves
    pub tenant_id: String,
    pub batch_size: usize,
    /// Blocking wait for new messages
    pub block: Duration,
    /// Sleep after a cycle that acknowledged nothing
    pub idle_sleep: Duration,
    /// Pending messages idle this long are claimed from other consumers
    pub claim_idle: Duration,
    pub validate: bool,
    /// Grace period for the in-flight batch on shutdown
    pub grace_period: Duration,
    pub reconnect: ReconnectPolicy,
    pub health_interval: Duration,
    pub maintenance_interval: Duration,
    pub trim_max_len: usize,
    pub idle_consumer_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            batch_size: 10,
            block: Duration::from_millis(2000),
            idle_sleep: Duration::from_millis(1000),
            claim_idle: Duration::from_secs(30),
            validate: true,
            grace_period: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            health_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            trim_max_len: 100_000,
            idle_consumer_threshold: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Collaborators handed to the engine at construction.
pub struct EngineComponents {
    pub broker: Arc<dyn StreamBroker>,
    pub coordinator: Arc<ConsumerGroupCoordinator>,
    pub dispatch: DispatchTable,
    pub dlq: DeadLetterQueue,
    pub ledger: ProcessedLedger,
    pub broker_breaker: Arc<CircuitBreaker>,
    pub store_breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<MetricsRecorder>,
    pub shutdown: ShutdownSignal,
}

/// One consumer group and the streams read through it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    pub group: String,
    pub consumer: String,
    pub streams: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub status: String,
    pub state: EngineState,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorHealth>,
    pub metrics: MetricsSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
}

pub struct StreamConsumer {
    config: EngineConfig,
    broker: Arc<dyn StreamBroker>,
    coordinator: Arc<ConsumerGroupCoordinator>,
    dispatch: DispatchTable,
    dlq: DeadLetterQueue,
    ledger: ProcessedLedger,
    broker_breaker: Arc<CircuitBreaker>,
    store_breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRecorder>,
    shutdown: ShutdownSignal,
    groups: Vec<GroupPlan>,
    /// Streams whose consumer group could not be created
    unready: Mutex<BTreeSet<String>>,
    next_group_retry: Mutex<Option<Instant>>,
    state: Mutex<EngineState>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the duration of a batch; shutdown waits on it.
    in_flight: tokio::sync::Mutex<()>,
}

impl StreamConsumer {
    pub fn new(config: EngineConfig, components: EngineComponents) -> Self {
        let groups = plan_groups(&components.coordinator, &config.tenant_id);
        Self {
            config,
            broker: components.broker,
            coordinator: components.coordinator,
            dispatch: components.dispatch,
            dlq: components.dlq,
            ledger: components.ledger,
            broker_breaker: components.broker_breaker,
            store_breaker: components.store_breaker,
            metrics: components.metrics,
            shutdown: components.shutdown,
            groups,
            unready: Mutex::new(BTreeSet::new()),
            next_group_retry: Mutex::new(None),
            state: Mutex::new(EngineState::Stopped),
            timers: Mutex::new(Vec::new()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn set_state(&self, state: EngineState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = ?*current, to = ?state, "Engine state change");
            *current = state;
        }
    }

    pub fn groups(&self) -> &[GroupPlan] {
        &self.groups
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Connect, start maintenance timers and create consumer groups.
    pub async fn initialize(&self) -> Result<GroupCreationReport, EngineError> {
        match self.state() {
            EngineState::Stopped => {}
            other => return Err(EngineError::NotRunning(other)),
        }
        self.set_state(EngineState::Initializing);
        info!(
            tenant_id = %self.config.tenant_id,
            groups = self.groups.len(),
            "Stream consumer initializing"
        );

        if let Err(e) = self.connect().await {
            self.set_state(EngineState::Stopped);
            return Err(e);
        }

        self.start_timers();

        let streams = self.coordinator.streams().keys();
        let report = self
            .coordinator
            .create_consumer_groups(&streams, &self.config.tenant_id)
            .await;
        if !report.failed.is_empty() {
            warn!(
                failed = report.failed.len(),
                ready = report.ready(),
                "Some consumer groups could not be created, reading the rest"
            );
            self.unready
                .lock()
                .extend(report.failed.iter().map(|f| f.stream.clone()));
        }
        *self.next_group_retry.lock() = Some(Instant::now() + self.config.health_interval);

        {
            let mut state = self.state.lock();
            if *state != EngineState::Initializing || self.shutdown.is_triggered() {
                info!(state = ?*state, "Shutdown requested during initialization");
                if *state == EngineState::Initializing {
                    *state = EngineState::Stopped;
                }
                for timer in self.timers.lock().drain(..) {
                    timer.abort();
                }
                return Err(EngineError::ShutdownRequested);
            }
            *state = EngineState::Running;
        }
        info!(outcome = "success", "Stream consumer running");
        Ok(report)
    }

    /// Ping with bounded exponential backoff.
    async fn connect(&self) -> Result<(), EngineError> {
        let policy = &self.config.reconnect;
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts.max(1) {
            if self.shutdown.is_triggered() {
                return Err(EngineError::ShutdownRequested);
            }
            match self.broker.ping().await {
                Ok(()) => {
                    info!(attempt = attempt, "Connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == policy.max_attempts {
                        break;
                    }
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt = attempt,
                        max_attempts = policy.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker unreachable, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(EngineError::ShutdownRequested),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        error!(attempts = policy.max_attempts, error = %last_error, "Giving up on broker connection");
        Err(EngineError::ConnectionFailed {
            attempts: policy.max_attempts,
            reason: last_error,
        })
    }

    fn start_timers(&self) {
        let mut timers = self.timers.lock();

        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        let tenant = self.config.tenant_id.clone();
        let every = self.config.health_interval;
        timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let health = coordinator.health_check(&tenant).await;
                        if health.status == "healthy" {
                            debug!(total_pending = health.total_pending, "Periodic health check");
                        } else {
                            warn!(
                                status = %health.status,
                                total_pending = health.total_pending,
                                unhealthy = health.streams.iter().filter(|s| !s.healthy).count(),
                                "Periodic health check"
                            );
                        }
                    }
                }
            }
        }));

        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        let tenant = self.config.tenant_id.clone();
        let every = self.config.maintenance_interval;
        let max_len = self.config.trim_max_len;
        let idle_threshold = self.config.idle_consumer_threshold;
        timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        coordinator.trim_streams(max_len).await;
                        for stream in coordinator.streams().keys() {
                            coordinator
                                .cleanup_idle_consumers(&stream, &tenant, Some(idle_threshold))
                                .await;
                        }
                    }
                }
            }
        }));
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(EngineError::NotRunning(state));
        }

        while self.state() == EngineState::Running && !self.shutdown.is_triggered() {
            let acked = self.run_cycle().await;
            if acked == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_sleep) => {}
                }
            }
        }

        info!("Stream consumer loop stopped");
        Ok(())
    }

    /// One recovery/new/safety pass. Returns the number of acknowledged messages.
    pub async fn run_cycle(&self) -> usize {
        let mut acked = 0;
        self.retry_unready_groups(false).await;

        for plan in &self.groups {
            if self.shutdown.is_triggered() {
                return acked;
            }
            let mut recovered = self.claim_idle(plan).await;
            recovered.extend(self.read(plan, ReadCursor::Pending, None).await);
            let recovered = dedupe(recovered);
            acked += self.process_messages(plan, recovered, ReadSource::Recovery).await.acked;
        }

        let reads = join_all(self.groups.iter().map(|plan| async move {
            let messages = self.read(plan, ReadCursor::New, Some(self.config.block)).await;
            (plan, messages)
        }));
        let batches = tokio::select! {
            _ = self.shutdown.cancelled() => return acked,
            batches = reads => batches,
        };
        for (plan, messages) in batches {
            acked += self.process_messages(plan, messages, ReadSource::New).await.acked;
        }

        for plan in &self.groups {
            if self.shutdown.is_triggered() {
                return acked;
            }
            let pending = self.read(plan, ReadCursor::Pending, None).await;
            acked += self.process_messages(plan, pending, ReadSource::Recovery).await.acked;
        }

        acked
    }

    /// Streams of `plan` whose group exists.
    fn ready_streams(&self, plan: &GroupPlan) -> Vec<String> {
        let unready = self.unready.lock();
        plan.streams
            .iter()
            .filter(|s| !unready.contains(*s))
            .cloned()
            .collect()
    }

    async fn read(
        &self,
        plan: &GroupPlan,
        cursor: ReadCursor,
        block: Option<Duration>,
    ) -> Vec<StreamMessage> {
        let mut result = self.read_streams(plan, cursor, block).await;

        if matches!(result, Err(BreakerError::Inner(BrokerError::NoGroup(_)))) {
            warn!(group = %plan.group, "Consumer group missing on a stream, recreating");
            self.unready.lock().extend(plan.streams.iter().cloned());
            self.retry_unready_groups(true).await;
            result = self.read_streams(plan, cursor, None).await;
        }

        match result {
            Ok(messages) => {
                if !messages.is_empty() {
                    debug!(group = %plan.group, cursor = cursor.as_id(), count = messages.len(), "Read messages");
                }
                messages
            }
            Err(e) if e.is_open() => {
                debug!(group = %plan.group, error = %e, "Skipping read, broker breaker open");
                Vec::new()
            }
            Err(e) => {
                warn!(group = %plan.group, cursor = cursor.as_id(), error = %e, "Stream read failed");
                Vec::new()
            }
        }
    }

    async fn read_streams(
        &self,
        plan: &GroupPlan,
        cursor: ReadCursor,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BreakerError<BrokerError>> {
        let streams = self.ready_streams(plan);
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        self.broker_breaker
            .execute(|| {
                self.broker.read_group(
                    &plan.group,
                    &plan.consumer,
                    &streams,
                    cursor,
                    self.config.batch_size,
                    block,
                )
            })
            .await
    }

    /// Try again to create the groups that are missing. Unless `now`, runs at
    /// most once per `health_interval`.
    async fn retry_unready_groups(&self, now: bool) {
        let streams: Vec<String> = self.unready.lock().iter().cloned().collect();
        if streams.is_empty() {
            return;
        }
        {
            let mut next = self.next_group_retry.lock();
            let current = Instant::now();
            if !now && next.is_some_and(|at| current < at) {
                return;
            }
            *next = Some(current + self.config.health_interval);
        }

        for stream in streams {
            match self
                .coordinator
                .create_consumer_group(&stream, &self.config.tenant_id)
                .await
            {
                Ok(creation) => {
                    info!(stream = %stream, group = %creation.group, "Consumer group available");
                    self.unready.lock().remove(&stream);
                }
                Err(e) => warn!(stream = %stream, error = %e, "Consumer group still unavailable"),
            }
        }
    }

    /// Take over messages other consumers left idle beyond `claim_idle`.
    async fn claim_idle(&self, plan: &GroupPlan) -> Vec<StreamMessage> {
        let mut claimed = Vec::new();
        for stream in &self.ready_streams(plan) {
            let result = self
                .broker_breaker
                .execute(|| {
                    self.broker.auto_claim(
                        stream,
                        &plan.group,
                        &plan.consumer,
                        self.config.claim_idle,
                        self.config.batch_size,
                    )
                })
                .await;
            match result {
                Ok(messages) => {
                    if !messages.is_empty() {
                        info!(stream = %stream, count = messages.len(), "Claimed idle pending messages");
                    }
                    claimed.extend(messages);
                }
                Err(e) => debug!(stream = %stream, error = %e, "Auto-claim skipped"),
            }
        }
        claimed
    }

    /// Stop the loop, let the in-flight batch finish, stop timers and close
    /// the broker. Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                EngineState::ShuttingDown => return,
                EngineState::Stopped if self.timers.lock().is_empty() => {
                    self.shutdown.trigger();
                    return;
                }
                _ => *state = EngineState::ShuttingDown,
            }
        }
        info!("Stream consumer shutting down");
        self.shutdown.trigger();

        if tokio::time::timeout(self.config.grace_period, self.in_flight.lock())
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.config.grace_period.as_millis() as u64,
                "In-flight batch did not finish within grace period"
            );
        }

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        self.broker.close().await;

        self.set_state(EngineState::Stopped);
        let metrics = self.metrics.snapshot();
        info!(
            events_processed = metrics.events_processed,
            events_failed = metrics.events_failed,
            dlq_count = metrics.dlq_count,
            "Stream consumer stopped"
        );
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Broker ping, coordinator roll-up, metrics and breaker state. Never fails.
    pub async fn health_check(&self) -> EngineHealth {
        let breakers = vec![self.broker_breaker.snapshot(), self.store_breaker.snapshot()];
        let state = self.state();

        if let Err(e) = self.broker.ping().await {
            return EngineHealth {
                status: "error".to_string(),
                state,
                tenant_id: self.config.tenant_id.clone(),
                error: Some(e.to_string()),
                coordinator: None,
                metrics: self.metrics.snapshot(),
                breakers,
            };
        }

        let coordinator = self.coordinator.health_check(&self.config.tenant_id).await;
        let status = if state == EngineState::Running && coordinator.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        EngineHealth {
            status: status.to_string(),
            state,
            tenant_id: self.config.tenant_id.clone(),
            error: None,
            coordinator: Some(coordinator),
            metrics: self.metrics.snapshot(),
            breakers,
        }
    }
}

/// Keep the first delivery of each `(stream, id)`. XAUTOCLAIM also returns
/// this consumer's own idle entries, which the `0` read sees too.
fn dedupe(messages: Vec<StreamMessage>) -> Vec<StreamMessage> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert((m.stream.clone(), m.id.clone())))
        .collect()
}

/// Streams of the same type share one group and one consumer identity.
fn plan_groups(coordinator: &ConsumerGroupCoordinator, tenant_id: &str) -> Vec<GroupPlan> {
    let mut plans: BTreeMap<String, GroupPlan> = BTreeMap::new();
    for stream in coordinator.streams().keys() {
        let group = coordinator.generate_consumer_group_name(&stream, tenant_id);
        let consumer = coordinator.generate_consumer_name(&stream, tenant_id);
        plans
            .entry(group.clone())
            .or_insert_with(|| GroupPlan {
                group,
                consumer,
                streams: Vec::new(),
            })
            .streams
            .push(stream);
    }
    plans.into_values().collect()
}
