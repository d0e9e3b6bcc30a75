//! Agent Directory
//!
//! Registry of known agents: capabilities, status, position, health and
//! last heartbeat. The directory is the single owner of liveness state;
//! the message bus and scheduler read it through this API.
//!
//! Records are never removed. A liveness sweep marks silent agents offline
//! and a heartbeat brings them back.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::TaskId;

/// Errors returned by directory operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DirectoryError {
    /// No agent registered under this id
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    /// Update would leave status and current task out of step
    #[error("Invalid update for agent {agent_id}: {reason}")]
    InvalidUpdate {
        agent_id: String,
        reason: &'static str,
    },
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Online and free to take a task
    #[default]
    Idle,
    /// Online and holding exactly one task
    Busy,
    /// Silent past the heartbeat timeout or removed from scheduling; holds no task
    Offline,
}

/// World position reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Distance on the horizontal (x/z) plane, ignoring height
    pub fn planar_distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }
}

/// Everything the directory knows about one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Task currently held; `Some` exactly when status is `Busy`
    pub current_task: Option<TaskId>,
    pub position: Option<Position>,
    pub health: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    fn new(agent_id: String, capabilities: BTreeSet<String>, health: f64) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            capabilities,
            status: AgentStatus::Idle,
            current_task: None,
            position: None,
            health,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// True when every required capability is present
    pub fn has_all_capabilities<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|r| self.has_capability(r.as_ref()))
    }

    /// Idle and holding nothing
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle && self.current_task.is_none()
    }
}

/// Shallow update applied by [`AgentDirectory::update_status`]; `None` fields are left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    pub status: Option<AgentStatus>,
    pub position: Option<Position>,
    pub health: Option<f64>,
    /// `Some(None)` clears the current task
    pub current_task: Option<Option<TaskId>>,
}

impl AgentUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_health(mut self, health: f64) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_current_task(mut self, task: Option<TaskId>) -> Self {
        self.current_task = Some(task);
        self
    }
}

/// Filter used by the scheduler to find candidates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentQuery {
    pub status: Option<AgentStatus>,
    pub required_capabilities: Vec<String>,
}

impl AgentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle agents only
    pub fn idle() -> Self {
        Self::new().with_status(AgentStatus::Idle)
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, record: &AgentRecord) -> bool {
        self.status.map(|s| record.status == s).unwrap_or(true)
            && record.has_all_capabilities(&self.required_capabilities)
    }
}

/// An agent taken offline by a liveness sweep
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineAgent {
    pub agent_id: String,
    /// Task the agent held when it went silent
    pub abandoned_task: Option<TaskId>,
}

/// Why an agent let go of a task outside the scheduler's own transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseReason {
    /// Marked offline by a liveness sweep
    Offline,
    /// Record overwritten by a fresh registration
    Reregistered,
    /// Task cleared through [`AgentDirectory::update_status`]
    Cleared,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Offline => "agent offline",
            ReleaseReason::Reregistered => "agent re-registered",
            ReleaseReason::Cleared => "agent released task",
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Told when an agent drops its task through the directory, so the owner of
/// the task can settle it. Called after the directory lock is released.
pub trait TaskReleaseObserver: Send + Sync {
    fn on_task_released(&self, agent_id: &str, task_id: TaskId, reason: ReleaseReason);
}

/// Per-status agent counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub offline_agents: usize,
}

/// Registry of agents, iterated in registration order
pub struct AgentDirectory {
    agents: RwLock<IndexMap<String, AgentRecord>>,
    default_health: f64,
    observers: RwLock<Vec<Weak<dyn TaskReleaseObserver>>>,
}

impl std::fmt::Debug for AgentDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDirectory")
            .field("agents", &self.agents.read().len())
            .field("default_health", &self.default_health)
            .finish()
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::with_default_health(20.0)
    }

    /// Health assigned to freshly registered agents
    pub fn with_default_health(default_health: f64) -> Self {
        Self {
            agents: RwLock::new(IndexMap::new()),
            default_health,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer for tasks dropped by sweeps, re-registration or
    /// status updates. Held weakly; a dropped observer is skipped.
    pub fn add_observer(&self, observer: Weak<dyn TaskReleaseObserver>) {
        self.observers.write().push(observer);
    }

    /// Create or overwrite an agent record. The record starts idle with no task.
    pub fn register<I, S>(&self, agent_id: impl Into<String>, capabilities: I) -> AgentRecord
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent_id = agent_id.into();
        let capabilities = capabilities.into_iter().map(Into::into).collect();
        let record = AgentRecord::new(agent_id.clone(), capabilities, self.default_health);

        let previous = self.agents.write().insert(agent_id.clone(), record.clone());
        let replaced = previous.is_some();

        tracing::info!(
            agent_id = %agent_id,
            capabilities = ?record.capabilities,
            replaced,
            "agent registered"
        );
        if let Some(task_id) = previous.and_then(|p| p.current_task) {
            self.notify_released(&agent_id, task_id, ReleaseReason::Reregistered);
        }
        record
    }

    /// Shallow-merge the given fields into the agent record.
    ///
    /// The merged record must keep `Busy` and a held task together, and a
    /// task can only be kept or cleared here, never handed out. Clearing a
    /// held task reports it to the release observers.
    pub fn update_status(&self, agent_id: &str, update: AgentUpdate) -> DirectoryResult<()> {
        let released = {
            let mut agents = self.agents.write();
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| DirectoryError::AgentNotFound(agent_id.to_string()))?;

            let status = update.status.unwrap_or(agent.status);
            let task = update.current_task.unwrap_or(agent.current_task);
            let invalid = |reason| DirectoryError::InvalidUpdate {
                agent_id: agent_id.to_string(),
                reason,
            };
            if task.is_some() && task != agent.current_task {
                return Err(invalid("tasks are assigned by the scheduler"));
            }
            if status == AgentStatus::Busy && task.is_none() {
                return Err(invalid("a busy agent must hold a task"));
            }
            if status != AgentStatus::Busy && task.is_some() {
                return Err(invalid("only a busy agent may hold a task"));
            }

            let released = agent.current_task.filter(|_| task.is_none());
            agent.status = status;
            agent.current_task = task;
            if let Some(position) = update.position {
                agent.position = Some(position);
            }
            if let Some(health) = update.health {
                agent.health = health;
            }
            released
        };

        if let Some(task_id) = released {
            self.notify_released(agent_id, task_id, ReleaseReason::Cleared);
        }
        Ok(())
    }

    /// Refresh last-seen. An offline agent holds no task, so it comes back
    /// idle. Returns true when the agent was revived.
    pub fn heartbeat(&self, agent_id: &str) -> DirectoryResult<bool> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| DirectoryError::AgentNotFound(agent_id.to_string()))?;

        agent.last_heartbeat = Utc::now();

        if agent.status == AgentStatus::Offline {
            agent.status = AgentStatus::Idle;
            tracing::info!(agent_id, status = ?agent.status, "agent back online");
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark every agent whose last heartbeat is older than `timeout` offline.
    ///
    /// An offline agent never keeps a task: the one it held is detached,
    /// reported in the result and passed to the release observers.
    pub fn sweep_inactive(&self, timeout: Duration) -> Vec<OfflineAgent> {
        let cutoff = Utc::now() - to_chrono(timeout);
        let mut swept = Vec::new();

        let mut agents = self.agents.write();
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Offline && agent.last_heartbeat < cutoff {
                agent.status = AgentStatus::Offline;
                let abandoned_task = agent.current_task.take();
                tracing::warn!(
                    agent_id = %agent.agent_id,
                    last_heartbeat = %agent.last_heartbeat,
                    abandoned_task = ?abandoned_task,
                    "agent marked offline"
                );
                swept.push(OfflineAgent {
                    agent_id: agent.agent_id.clone(),
                    abandoned_task,
                });
            }
        }
        drop(agents);

        for agent in &swept {
            if let Some(task_id) = agent.abandoned_task {
                self.notify_released(&agent.agent_id, task_id, ReleaseReason::Offline);
            }
        }
        swept
    }

    /// Candidates matching the query, in registration order
    pub fn query(&self, query: &AgentQuery) -> Vec<AgentRecord> {
        self.find(|record| query.matches(record))
    }

    /// Records satisfying an arbitrary predicate, in registration order
    pub fn find(&self, predicate: impl Fn(&AgentRecord) -> bool) -> Vec<AgentRecord> {
        self.agents
            .read()
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.agents.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Agent counts per status
    pub fn stats(&self) -> DirectoryStats {
        let agents = self.agents.read();
        let mut stats = DirectoryStats {
            total_agents: agents.len(),
            ..Default::default()
        };
        for agent in agents.values() {
            match agent.status {
                AgentStatus::Idle => stats.idle_agents += 1,
                AgentStatus::Busy => stats.busy_agents += 1,
                AgentStatus::Offline => stats.offline_agents += 1,
            }
        }
        stats
    }

    /// Atomically hand a task to an idle agent. Fails if the agent is gone,
    /// not idle, or already holds a task.
    pub(crate) fn claim(&self, agent_id: &str, task_id: TaskId) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(agent_id) {
            Some(agent) if agent.is_available() => {
                agent.status = AgentStatus::Busy;
                agent.current_task = Some(task_id);
                true
            }
            _ => false,
        }
    }

    /// Free an agent from the given task. No-op if it holds a different task
    /// (or none). An offline agent stays offline.
    pub(crate) fn release(&self, agent_id: &str, task_id: TaskId) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(agent_id) {
            Some(agent) if agent.current_task == Some(task_id) => {
                agent.current_task = None;
                if agent.status == AgentStatus::Busy {
                    agent.status = AgentStatus::Idle;
                }
                true
            }
            _ => false,
        }
    }

    fn notify_released(&self, agent_id: &str, task_id: TaskId, reason: ReleaseReason) {
        let observers: Vec<Arc<dyn TaskReleaseObserver>> = {
            let mut observers = self.observers.write();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(agent_id, %task_id, %reason, observers = observers.len(), "task released");
        for observer in observers {
            observer.on_task_released(agent_id, task_id, reason);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) {
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.last_heartbeat = at;
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
