//! Connection Resilience Manager
//!
//! One state machine per agent connection:
//!
//! ```text
//! CONNECTING -> CONNECTED -> (disconnect/kick/error) -> SCHEDULING_RECONNECT
//!     -> RECONNECTING -> CONNECTING (new connection attached)
//!                     \-> SCHEDULING_RECONNECT (factory failed)
//! ```
//!
//! `PERMANENTLY_FAILED` is terminal and is reached on an auth failure, a
//! permanent ban, or when the attempt limit is exceeded.
//!
//! Each attached connection gets a watcher task; each pending reconnect is
//! a timer task that can be aborted. The session lock is never held across
//! an await.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::ReconnectConfig;

use super::backoff::reconnect_delay;
use super::classify::{classify_error, classify_kick, ErrorClass};
use super::connection::{AgentConnection, ConnectionFactory, ConnectionSignal};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LATENCY_WINDOW: usize = 20;

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by resilience manager operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Agent was never attached or has been detached
    #[error("No session for agent: {0}")]
    SessionNotFound(String),

    /// Connection handle already gave its signal stream away
    #[error("Connection for agent {0} has no signal stream")]
    NoSignalStream(String),

    /// Operation needs auto-reconnect, which is switched off
    #[error("Auto-reconnect disabled for agent: {0}")]
    Disabled(String),
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Attached, waiting for the spawn signal
    Connecting,
    /// Spawned and healthy
    Connected,
    /// Lost; a reconnect timer is pending
    SchedulingReconnect,
    /// Factory call in flight
    Reconnecting,
    /// Dropped while auto-reconnect was disabled
    Disconnected,
    /// Banned, refused credentials or out of attempts; never retried
    PermanentlyFailed,
}

/// Events emitted by the resilience manager
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// Connection reported spawn; attempt count reset
    Connected {
        agent_id: String,
    },
    /// Connection lost, with its classification
    Disconnected {
        agent_id: String,
        class: ErrorClass,
        reason: String,
    },
    /// Timer armed for the next attempt
    ReconnectScheduled {
        agent_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Factory called
    Reconnecting {
        agent_id: String,
        attempt: u32,
    },
    /// Factory returned a new connection
    ReconnectSucceeded {
        agent_id: String,
        attempt: u32,
        latency: Duration,
    },
    /// Factory errored or timed out
    ReconnectFailed {
        agent_id: String,
        attempt: u32,
        class: ErrorClass,
        error: String,
    },
    /// Terminal; emitted once per session
    PermanentlyFailed {
        agent_id: String,
        class: ErrorClass,
        reason: String,
    },
}

/// Reconnect statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStats {
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    /// Spawn signals seen, initial connection included
    pub total_connections: u64,
    /// Mean factory latency over the most recent reconnects
    pub average_latency_ms: f64,
    pub last_latency_ms: Option<u64>,
}

/// Snapshot of one agent's session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub agent_id: String,
    pub state: ConnectionState,
    pub attempt_count: u32,
    pub next_delay: Option<Duration>,
    pub last_error: Option<ErrorClass>,
    pub enabled: bool,
    pub stats: ReconnectStats,
}

/// Notified when an agent's connection is back, so it can rejoin the fleet
pub trait ReconnectObserver: Send + Sync {
    fn on_reconnected(&self, agent_id: &str);

    fn on_permanent_failure(&self, _agent_id: &str, _class: ErrorClass) {}
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    agent_id: String,
    state: ConnectionState,
    attempt_count: u32,
    next_delay: Option<Duration>,
    last_error: Option<ErrorClass>,
    enabled: bool,
    /// In-flight guard: a reconnect is scheduled or running
    reconnecting: bool,
    /// Set when a reconnect produced a connection that has not spawned yet
    rejoin_pending: bool,
    generation: u64,
    stats: ReconnectStats,
    latencies: VecDeque<u64>,
    watcher: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    connection: Option<Box<dyn AgentConnection>>,
}

impl Session {
    fn new(agent_id: String) -> Self {
        Self {
            agent_id,
            state: ConnectionState::Connecting,
            attempt_count: 0,
            next_delay: None,
            last_error: None,
            enabled: true,
            reconnecting: false,
            rejoin_pending: false,
            generation: 0,
            stats: ReconnectStats::default(),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            watcher: None,
            timer: None,
            connection: None,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            agent_id: self.agent_id.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            next_delay: self.next_delay,
            last_error: self.last_error,
            enabled: self.enabled,
            stats: self.stats.clone(),
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        let ms = latency.as_millis().min(u64::MAX as u128) as u64;
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
        self.stats.last_latency_ms = Some(ms);
        self.stats.average_latency_ms =
            self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn stop(&mut self) {
        self.cancel_timer();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Work to do once the session lock is released
enum Followup {
    None,
    Rejoined(String),
    Failed(String, ErrorClass),
}

// ============================================================================
// Manager
// ============================================================================

struct Inner {
    config: ReconnectConfig,
    factory: Arc<dyn ConnectionFactory>,
    sessions: Mutex<HashMap<String, Session>>,
    observers: RwLock<Vec<Arc<dyn ReconnectObserver>>>,
    event_tx: broadcast::Sender<ResilienceEvent>,
}

/// Classified exponential-backoff reconnection for agent connections.
///
/// Cloning is cheap; clones share sessions. Methods that start tasks must be
/// called from within a tokio runtime.
#[derive(Clone)]
pub struct ResilienceManager {
    inner: Arc<Inner>,
}

impl ResilienceManager {
    /// Manager with no sessions. `factory` builds replacement connections.
    pub fn new(config: ReconnectConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                sessions: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Observers run in registration order, outside the session lock
    pub fn add_observer(&self, observer: Arc<dyn ReconnectObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Start watching a live connection for an agent. Replaces any previous
    /// connection and cancels a pending reconnect; attempt count, stats and
    /// the enabled flag carry over.
    pub fn attach(
        &self,
        agent_id: impl Into<String>,
        connection: Box<dyn AgentConnection>,
    ) -> ResilienceResult<()> {
        Inner::attach(&self.inner, agent_id.into(), connection, true)
    }

    /// Re-enable auto-reconnect. A session that dropped while disabled
    /// schedules a reconnect right away.
    pub fn enable(&self, agent_id: &str) -> ResilienceResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(agent_id)
            .ok_or_else(|| ResilienceError::SessionNotFound(agent_id.to_string()))?;
        session.enabled = true;
        tracing::info!(agent_id, "auto-reconnect enabled");

        if session.state == ConnectionState::Disconnected {
            if let Followup::Failed(id, class) = Inner::schedule_reconnect(&self.inner, session) {
                drop(sessions);
                self.inner.notify_failure(&id, class);
            }
        }
        Ok(())
    }

    /// Suppress auto-reconnect and cancel any pending timer
    pub fn disable(&self, agent_id: &str) -> ResilienceResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(agent_id)
            .ok_or_else(|| ResilienceError::SessionNotFound(agent_id.to_string()))?;
        session.enabled = false;
        session.cancel_timer();
        session.next_delay = None;
        if session.reconnecting {
            session.reconnecting = false;
            session.state = ConnectionState::Disconnected;
        }
        tracing::info!(agent_id, "auto-reconnect disabled");
        Ok(())
    }

    /// Cancel any pending timer, reset the attempt count and reconnect now.
    /// Also revives a permanently failed session.
    pub fn force_reconnect(&self, agent_id: &str) -> ResilienceResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(agent_id)
            .ok_or_else(|| ResilienceError::SessionNotFound(agent_id.to_string()))?;
        if !session.enabled {
            return Err(ResilienceError::Disabled(agent_id.to_string()));
        }

        session.cancel_timer();
        session.attempt_count = 0;
        session.next_delay = None;
        session.reconnecting = true;
        session.state = ConnectionState::SchedulingReconnect;
        tracing::info!(agent_id, "forced reconnect");

        let inner = self.inner.clone();
        let id = agent_id.to_string();
        session.timer = Some(tokio::spawn(async move {
            Inner::perform_reconnect(inner, id).await;
        }));
        Ok(())
    }

    /// Stop watching an agent and forget its session
    pub fn detach(&self, agent_id: &str) -> bool {
        match self.inner.sessions.lock().remove(agent_id) {
            Some(mut session) => {
                session.stop();
                tracing::debug!(agent_id, "session detached");
                true
            }
            None => false,
        }
    }

    /// Abort every watcher and timer task
    pub fn shutdown(&self) {
        for session in self.inner.sessions.lock().values_mut() {
            session.stop();
        }
    }

    /// Snapshot of one session
    pub fn session(&self, agent_id: &str) -> Option<SessionInfo> {
        self.inner.sessions.lock().get(agent_id).map(Session::info)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.inner.sessions.lock().values().map(Session::info).collect();
        sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        sessions
    }

    /// Reconnect counters and rolling latency for one agent
    pub fn get_stats(&self, agent_id: &str) -> ResilienceResult<ReconnectStats> {
        self.inner
            .sessions
            .lock()
            .get(agent_id)
            .map(|s| s.stats.clone())
            .ok_or_else(|| ResilienceError::SessionNotFound(agent_id.to_string()))
    }

    /// Zero the counters and latency window; the attempt count is untouched
    pub fn reset_stats(&self, agent_id: &str) -> ResilienceResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(agent_id)
            .ok_or_else(|| ResilienceError::SessionNotFound(agent_id.to_string()))?;
        session.stats = ReconnectStats::default();
        session.latencies.clear();
        Ok(())
    }

    /// Totals across all sessions
    pub fn aggregate_stats(&self) -> ReconnectStats {
        let sessions = self.inner.sessions.lock();
        let mut total = ReconnectStats::default();
        let mut latencies: Vec<u64> = Vec::new();
        for session in sessions.values() {
            total.successful_reconnects += session.stats.successful_reconnects;
            total.failed_reconnects += session.stats.failed_reconnects;
            total.total_connections += session.stats.total_connections;
            latencies.extend(session.latencies.iter().copied());
        }
        if !latencies.is_empty() {
            total.average_latency_ms =
                latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
        }
        total
    }
}

impl Inner {
    fn emit(&self, event: ResilienceEvent) {
        let _ = self.event_tx.send(event);
    }

    fn attach(
        inner: &Arc<Self>,
        agent_id: String,
        mut connection: Box<dyn AgentConnection>,
        external: bool,
    ) -> ResilienceResult<()> {
        let signals = connection
            .take_signals()
            .ok_or_else(|| ResilienceError::NoSignalStream(agent_id.clone()))?;

        let mut sessions = inner.sessions.lock();
        let session = sessions
            .entry(agent_id.clone())
            .or_insert_with(|| Session::new(agent_id.clone()));

        if let Some(watcher) = session.watcher.take() {
            watcher.abort();
        }
        if external {
            session.cancel_timer();
            session.rejoin_pending = false;
        } else {
            // Called from the reconnect timer task itself
            session.timer = None;
        }
        session.generation += 1;
        session.reconnecting = false;
        session.next_delay = None;
        session.state = ConnectionState::Connecting;
        session.connection = Some(connection);
        session.watcher = Some(Self::spawn_watcher(
            inner.clone(),
            agent_id.clone(),
            session.generation,
            signals,
        ));

        tracing::debug!(agent_id = %agent_id, generation = session.generation, "connection attached");
        Ok(())
    }

    fn spawn_watcher(
        inner: Arc<Self>,
        agent_id: String,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                Self::handle_signal(&inner, &agent_id, generation, signal);
            }
            tracing::debug!(agent_id = %agent_id, "signal stream closed");
        })
    }

    fn handle_signal(inner: &Arc<Self>, agent_id: &str, generation: u64, signal: ConnectionSignal) {
        let followup = {
            let mut sessions = inner.sessions.lock();
            let Some(session) = sessions.get_mut(agent_id) else {
                return;
            };
            if session.generation != generation
                || session.state == ConnectionState::PermanentlyFailed
            {
                return;
            }

            let (class, reason) = match signal {
                ConnectionSignal::Spawned => {
                    session.attempt_count = 0;
                    session.next_delay = None;
                    session.reconnecting = false;
                    session.state = ConnectionState::Connected;
                    session.stats.total_connections += 1;
                    tracing::info!(agent_id, "agent connected");
                    inner.emit(ResilienceEvent::Connected {
                        agent_id: agent_id.to_string(),
                    });

                    let followup = if session.rejoin_pending {
                        session.rejoin_pending = false;
                        Followup::Rejoined(agent_id.to_string())
                    } else {
                        Followup::None
                    };
                    drop(sessions);
                    inner.run_followup(followup);
                    return;
                }
                ConnectionSignal::Disconnected { reason } => {
                    let reason = reason.unwrap_or_default();
                    (classify_error(&reason), reason)
                }
                ConnectionSignal::Kicked { reason } => (classify_kick(&reason), reason),
                ConnectionSignal::Error { message, class } => {
                    (class.unwrap_or_else(|| classify_error(&message)), message)
                }
            };

            session.last_error = Some(class);
            tracing::warn!(agent_id, class = %class, reason = %reason, "connection lost");
            inner.emit(ResilienceEvent::Disconnected {
                agent_id: agent_id.to_string(),
                class,
                reason: reason.clone(),
            });

            if class.is_terminal() {
                Self::fail_permanently(inner, session, class, reason)
            } else {
                Self::schedule_reconnect(inner, session)
            }
        };
        inner.run_followup(followup);
    }

    fn fail_permanently(
        inner: &Arc<Self>,
        session: &mut Session,
        class: ErrorClass,
        reason: String,
    ) -> Followup {
        session.cancel_timer();
        session.reconnecting = false;
        session.rejoin_pending = false;
        session.next_delay = None;
        session.state = ConnectionState::PermanentlyFailed;
        tracing::error!(
            agent_id = %session.agent_id,
            class = %class,
            reason = %reason,
            "connection permanently failed"
        );
        inner.emit(ResilienceEvent::PermanentlyFailed {
            agent_id: session.agent_id.clone(),
            class,
            reason,
        });
        Followup::Failed(session.agent_id.clone(), class)
    }

    /// Arm a reconnect timer unless one is already in flight
    fn schedule_reconnect(inner: &Arc<Self>, session: &mut Session) -> Followup {
        if !session.enabled {
            session.state = ConnectionState::Disconnected;
            tracing::debug!(agent_id = %session.agent_id, "auto-reconnect disabled, not scheduling");
            return Followup::None;
        }
        if session.reconnecting {
            tracing::debug!(agent_id = %session.agent_id, "reconnect already in flight");
            return Followup::None;
        }

        if let Some(limit) = inner.config.attempt_limit() {
            if session.attempt_count >= limit {
                let class = session.last_error.unwrap_or(ErrorClass::Unknown);
                let reason = format!("gave up after {} reconnect attempts", session.attempt_count);
                return Self::fail_permanently(inner, session, class, reason);
            }
        }

        let delay = reconnect_delay(&inner.config, session.attempt_count);
        session.reconnecting = true;
        session.next_delay = Some(delay);
        session.state = ConnectionState::SchedulingReconnect;

        tracing::info!(
            agent_id = %session.agent_id,
            attempt = session.attempt_count + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        inner.emit(ResilienceEvent::ReconnectScheduled {
            agent_id: session.agent_id.clone(),
            attempt: session.attempt_count + 1,
            delay,
        });

        let task_inner = inner.clone();
        let agent_id = session.agent_id.clone();
        session.cancel_timer();
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::perform_reconnect(task_inner, agent_id).await;
        }));
        Followup::None
    }

    async fn perform_reconnect(inner: Arc<Self>, agent_id: String) {
        let attempt = {
            let mut sessions = inner.sessions.lock();
            let Some(session) = sessions.get_mut(&agent_id) else {
                return;
            };
            if !session.enabled || session.state == ConnectionState::PermanentlyFailed {
                session.reconnecting = false;
                return;
            }
            session.attempt_count += 1;
            session.next_delay = None;
            session.state = ConnectionState::Reconnecting;
            session.attempt_count
        };

        tracing::info!(agent_id = %agent_id, attempt, "reconnecting");
        inner.emit(ResilienceEvent::Reconnecting {
            agent_id: agent_id.clone(),
            attempt,
        });

        let started = tokio::time::Instant::now();
        let timeout = inner.config.connect_timeout();
        let result = tokio::time::timeout(timeout, inner.factory.connect(&agent_id)).await;
        let latency = started.elapsed();

        let outcome = match result {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err((classify_error(&e.to_string()), e.to_string())),
            Err(_) => Err((
                ErrorClass::Timeout,
                format!("connection factory timed out after {:?}", timeout),
            )),
        };

        match outcome {
            Ok(connection) => {
                {
                    let mut sessions = inner.sessions.lock();
                    let Some(session) = sessions.get_mut(&agent_id) else {
                        return;
                    };
                    session.stats.successful_reconnects += 1;
                    session.record_latency(latency);
                    session.rejoin_pending = true;
                }
                tracing::info!(
                    agent_id = %agent_id,
                    attempt,
                    latency_ms = latency.as_millis() as u64,
                    "reconnect succeeded"
                );
                inner.emit(ResilienceEvent::ReconnectSucceeded {
                    agent_id: agent_id.clone(),
                    attempt,
                    latency,
                });

                if let Err(e) = Self::attach(&inner, agent_id.clone(), connection, false) {
                    tracing::error!(agent_id = %agent_id, error = %e, "failed to attach new connection");
                    let followup = {
                        let mut sessions = inner.sessions.lock();
                        match sessions.get_mut(&agent_id) {
                            Some(session) => {
                                session.reconnecting = false;
                                Self::schedule_reconnect(&inner, session)
                            }
                            None => Followup::None,
                        }
                    };
                    inner.run_followup(followup);
                }
            }
            Err((class, error)) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    attempt,
                    class = %class,
                    error = %error,
                    "reconnect failed"
                );
                inner.emit(ResilienceEvent::ReconnectFailed {
                    agent_id: agent_id.clone(),
                    attempt,
                    class,
                    error: error.clone(),
                });

                let followup = {
                    let mut sessions = inner.sessions.lock();
                    let Some(session) = sessions.get_mut(&agent_id) else {
                        return;
                    };
                    session.stats.failed_reconnects += 1;
                    session.record_latency(latency);
                    session.last_error = Some(class);
                    session.reconnecting = false;
                    // The timer running this reconnect is finishing
                    session.timer = None;

                    if class.is_terminal() {
                        Self::fail_permanently(&inner, session, class, error)
                    } else {
                        Self::schedule_reconnect(&inner, session)
                    }
                };
                inner.run_followup(followup);
            }
        }
    }

    fn run_followup(&self, followup: Followup) {
        match followup {
            Followup::None => {}
            Followup::Rejoined(agent_id) => self.notify_rejoin(&agent_id),
            Followup::Failed(agent_id, class) => self.notify_failure(&agent_id, class),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn ReconnectObserver>> {
        self.observers.read().clone()
    }

    fn notify_rejoin(&self, agent_id: &str) {
        for observer in self.observers() {
            if catch_unwind(AssertUnwindSafe(|| observer.on_reconnected(agent_id))).is_err() {
                tracing::error!(agent_id, "reconnect observer panicked");
            }
        }
    }

    fn notify_failure(&self, agent_id: &str, class: ErrorClass) {
        for observer in self.observers() {
            if catch_unwind(AssertUnwindSafe(|| observer.on_permanent_failure(agent_id, class)))
                .is_err()
            {
                tracing::error!(agent_id, "reconnect observer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{ChannelConnection, SignalSender};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: i64) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10000,
            factor: 2.0,
            jitter: false,
            max_attempts,
            connect_timeout_ms: 5000,
        }
    }

    /// Factory whose connections are controlled through the returned channel
    fn channel_factory() -> (
        Arc<dyn ConnectionFactory>,
        mpsc::UnboundedReceiver<SignalSender>,
        Arc<AtomicU32>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let factory = move |_agent_id: String| {
            let tx = tx.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let (sender, connection) = ChannelConnection::new();
                let _ = tx.send(sender);
                Ok::<_, anyhow::Error>(connection.boxed())
            }
        };
        (Arc::new(factory), rx, calls)
    }

    fn failing_factory(message: &'static str) -> (Arc<dyn ConnectionFactory>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let factory = move |_agent_id: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Box<dyn AgentConnection>, _>(anyhow::anyhow!(message))
            }
        };
        (Arc::new(factory), calls)
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<ResilienceEvent>, f: F) -> ResilienceEvent
    where
        F: Fn(&ResilienceEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if f(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_is_capped() {
        let (factory, _) = failing_factory("connect ECONNREFUSED");
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.spawned();
        signals.disconnected(Some("socketClosed"));

        let mut delays = Vec::new();
        while delays.len() < 6 {
            if let ResilienceEvent::ReconnectScheduled { delay, .. } = next_matching(&mut events, |e| {
                matches!(e, ResilienceEvent::ReconnectScheduled { .. })
            })
            .await
            {
                delays.push(delay.as_millis() as u64);
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_ban_fails_once() {
        let (factory, calls) = failing_factory("unused");
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.spawned();
        signals.kicked("You have been banned permanently");
        signals.disconnected(Some("kicked"));
        signals.error("ECONNREFUSED");

        let event = next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::PermanentlyFailed { .. })
        })
        .await;
        assert_eq!(
            event,
            ResilienceEvent::PermanentlyFailed {
                agent_id: "bot".to_string(),
                class: ErrorClass::KickedPermanent,
                reason: "You have been banned permanently".to_string(),
            }
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        let mut permanent = 0;
        let mut scheduled = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ResilienceEvent::PermanentlyFailed { .. } => permanent += 1,
                ResilienceEvent::ReconnectScheduled { .. } => scheduled += 1,
                _ => {}
            }
        }
        assert_eq!(permanent, 0);
        assert_eq!(scheduled, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            manager.session("bot").unwrap().state,
            ConnectionState::PermanentlyFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_terminal() {
        let (factory, calls) = failing_factory("unused");
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.error("Invalid credentials");

        let event = next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::PermanentlyFailed { .. })
        })
        .await;
        assert!(matches!(
            event,
            ResilienceEvent::PermanentlyFailed { class: ErrorClass::Auth, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_class_overrides_text() {
        let (factory, _) = failing_factory("unused");
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.error_with_class("session refreshed", ErrorClass::Network);

        let event = next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::Disconnected { .. })
        })
        .await;
        assert!(matches!(
            event,
            ResilienceEvent::Disconnected { class: ErrorClass::Network, .. }
        ));
        next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::ReconnectScheduled { .. })
        })
        .await;
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_resets_attempts() {
        let (factory, mut connections, calls) = channel_factory();
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.spawned();
        signals.disconnected(None);

        let fresh = connections.recv().await.unwrap();
        next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::ReconnectSucceeded { .. })
        })
        .await;
        assert_eq!(manager.session("bot").unwrap().attempt_count, 1);
        assert_eq!(manager.session("bot").unwrap().state, ConnectionState::Connecting);

        fresh.spawned();
        next_matching(&mut events, |e| matches!(e, ResilienceEvent::Connected { .. })).await;

        let session = manager.session("bot").unwrap();
        assert_eq!(session.state, ConnectionState::Connected);
        assert_eq!(session.attempt_count, 0);
        assert_eq!(session.stats.successful_reconnects, 1);
        assert_eq!(session.stats.total_connections, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The old connection is no longer watched
        assert!(signals.is_closed());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_signals_schedule_once() {
        let (factory, calls) = failing_factory("ECONNREFUSED");
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.error("read ECONNRESET");
        signals.disconnected(Some("socketClosed"));

        next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_exceeded() {
        let (factory, calls) = failing_factory("ETIMEDOUT");
        let manager = ResilienceManager::new(config(3), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.disconnected(Some("ETIMEDOUT"));

        let event = next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::PermanentlyFailed { .. })
        })
        .await;
        assert!(matches!(
            event,
            ResilienceEvent::PermanentlyFailed { class: ErrorClass::Network, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.get_stats("bot").unwrap().failed_reconnects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_timeout() {
        let factory = |_agent_id: String| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err::<Box<dyn AgentConnection>, _>(anyhow::anyhow!("never"))
        };
        let manager = ResilienceManager::new(config(1), Arc::new(factory));
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.disconnected(None);

        let event = next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::ReconnectFailed { .. })
        })
        .await;
        assert!(matches!(
            event,
            ResilienceEvent::ReconnectFailed { class: ErrorClass::Timeout, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_pending_reconnect() {
        let (factory, calls) = failing_factory("ECONNREFUSED");
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.disconnected(None);
        next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::ReconnectScheduled { .. })
        })
        .await;

        manager.disable("bot").unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.session("bot").unwrap().state, ConnectionState::Disconnected);
        assert_eq!(manager.force_reconnect("bot"), Err(ResilienceError::Disabled("bot".to_string())));

        manager.enable("bot").unwrap();
        next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_resets_attempts() {
        let (factory, mut connections, _) = channel_factory();
        let manager = ResilienceManager::new(config(-1), factory);
        let mut events = manager.subscribe();

        let (_signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        manager.force_reconnect("bot").unwrap();

        let event = next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            event,
            ResilienceEvent::Reconnecting {
                agent_id: "bot".to_string(),
                attempt: 1
            }
        );
        let fresh = connections.recv().await.unwrap();
        fresh.spawned();
        next_matching(&mut events, |e| matches!(e, ResilienceEvent::Connected { .. })).await;
        assert_eq!(manager.session("bot").unwrap().attempt_count, 0);

        assert!(manager.force_reconnect("ghost").is_err());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_notified() {
        struct Recorder {
            rejoined: Mutex<Vec<String>>,
            failed: Mutex<Vec<(String, ErrorClass)>>,
        }
        impl ReconnectObserver for Recorder {
            fn on_reconnected(&self, agent_id: &str) {
                self.rejoined.lock().push(agent_id.to_string());
            }
            fn on_permanent_failure(&self, agent_id: &str, class: ErrorClass) {
                self.failed.lock().push((agent_id.to_string(), class));
            }
        }

        let (factory, mut connections, _) = channel_factory();
        let manager = ResilienceManager::new(config(-1), factory);
        let recorder = Arc::new(Recorder {
            rejoined: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        });
        manager.add_observer(recorder.clone());
        let mut events = manager.subscribe();

        let (signals, connection) = ChannelConnection::new();
        manager.attach("bot", connection.boxed()).unwrap();
        signals.spawned();
        next_matching(&mut events, |e| matches!(e, ResilienceEvent::Connected { .. })).await;
        // Initial connection is not a rejoin
        assert!(recorder.rejoined.lock().is_empty());

        signals.disconnected(Some("Server closed"));
        let fresh = connections.recv().await.unwrap();
        fresh.spawned();
        next_matching(&mut events, |e| matches!(e, ResilienceEvent::Connected { .. })).await;
        assert_eq!(*recorder.rejoined.lock(), vec!["bot".to_string()]);

        fresh.kicked("banned");
        next_matching(&mut events, |e| {
            matches!(e, ResilienceEvent::PermanentlyFailed { .. })
        })
        .await;
        assert_eq!(
            *recorder.failed.lock(),
            vec![("bot".to_string(), ErrorClass::KickedPermanent)]
        );
    }

    #[tokio::test]
    async fn test_attach_requires_signal_stream() {
        let (factory, _) = failing_factory("unused");
        let manager = ResilienceManager::new(config(-1), factory);

        let (_signals, mut connection) = ChannelConnection::new();
        let _ = connection.take_signals();
        assert_eq!(
            manager.attach("bot", connection.boxed()),
            Err(ResilienceError::NoSignalStream("bot".to_string()))
        );
        assert!(manager.session("bot").is_none());
        assert!(manager.reset_stats("bot").is_err());
    }

    #[test]
    fn test_latency_window() {
        let mut session = Session::new("bot".to_string());
        for ms in 0..30u64 {
            session.record_latency(Duration::from_millis(ms));
        }
        assert_eq!(session.latencies.len(), LATENCY_WINDOW);
        // mean of 10..=29
        assert_eq!(session.stats.average_latency_ms, 19.5);
        assert_eq!(session.stats.last_latency_ms, Some(29));
    }
}
