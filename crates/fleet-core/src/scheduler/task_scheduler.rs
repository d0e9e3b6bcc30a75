//! Task Scheduler
//!
//! Priority queue of work items plus the capability/fitness based
//! assignment pass. Assignment runs after every `submit`, `complete`,
//! `fail` and `cancel`, and on demand through [`TaskScheduler::tick`].
//!
//! The scheduler holds its own lock while it reads and claims agents in the
//! directory, never the other way round. It also observes the directory: a
//! task an agent drops outside these transitions (liveness sweep,
//! re-registration, status update) is failed and retried like any other.
//!
//! Terminal tasks may be pruned. A task id that was issued but is no longer
//! stored belongs to a pruned terminal task, so late `complete`, `fail` or
//! `cancel` calls on it stay no-ops instead of reporting an unknown task.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::agents::{
    AgentDirectory, AgentQuery, AgentRecord, ReleaseReason, TaskReleaseObserver,
};
use crate::config::SchedulerConfig;

use super::fitness::select_best;
use super::types::{
    FailOutcome, SchedulerError, SchedulerEvent, SchedulerResult, SchedulerStats, Task, TaskId,
    TaskRequest, TaskStatus,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Task>,
    /// Pending task ids in assignment order
    pending: Vec<TaskId>,
    next_id: u64,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    /// Insert behind every task of equal or higher priority
    fn enqueue(&mut self, task_id: TaskId, priority: i32) {
        let tasks = &self.tasks;
        let position = self
            .pending
            .iter()
            .position(|id| tasks.get(id).map(|t| t.priority < priority).unwrap_or(false))
            .unwrap_or(self.pending.len());
        self.pending.insert(position, task_id);
    }

    fn dequeue(&mut self, task_id: TaskId) {
        self.pending.retain(|id| *id != task_id);
    }

    /// `Ok(true)` for a stored task, `Ok(false)` for an issued id whose
    /// terminal task was pruned
    fn check_known(&self, task_id: TaskId) -> SchedulerResult<bool> {
        if self.tasks.contains_key(&task_id) {
            Ok(true)
        } else if task_id.0 > 0 && task_id.0 <= self.next_id {
            Ok(false)
        } else {
            Err(SchedulerError::TaskNotFound(task_id))
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Capability-aware task scheduler
pub struct TaskScheduler {
    directory: Arc<AgentDirectory>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl TaskScheduler {
    /// Create a scheduler over `directory` and register it for tasks the
    /// directory releases
    pub fn new(directory: Arc<AgentDirectory>, config: SchedulerConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = Arc::new(Self {
            directory: directory.clone(),
            config,
            state: Mutex::new(SchedulerState::default()),
            event_tx,
        });

        let observer: Arc<dyn TaskReleaseObserver> = scheduler.clone();
        directory.add_observer(Arc::downgrade(&observer));
        scheduler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Create a pending task and run an assignment pass
    pub fn submit(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        priority: i32,
        required_capabilities: Vec<String>,
    ) -> TaskId {
        self.submit_request(
            TaskRequest::new(task_type)
                .with_payload(payload)
                .with_priority(priority)
                .with_capabilities(required_capabilities),
        )
    }

    /// Like [`TaskScheduler::submit`], with location and the other request fields
    pub fn submit_request(&self, request: TaskRequest) -> TaskId {
        let mut events = Vec::new();
        let task_id = {
            let mut state = self.state.lock();
            let task_id = self.insert_task(&mut state, request, None, &mut events);
            self.assign_pending(&mut state, &mut events);
            task_id
        };
        self.emit_all(events);
        task_id
    }

    /// Mark an assigned task completed and free its agent.
    ///
    /// Returns `Ok(false)` when the task is not currently assigned, so a
    /// repeated call has no effect.
    pub fn complete(&self, task_id: TaskId, result: Value) -> SchedulerResult<bool> {
        let mut events = Vec::new();
        let completed = {
            let mut state = self.state.lock();
            if !state.check_known(task_id)? {
                tracing::debug!(%task_id, "complete ignored, task pruned");
                return Ok(false);
            }
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::TaskNotFound(task_id))?;

            if task.status != TaskStatus::Assigned {
                tracing::debug!(%task_id, status = ?task.status, "complete ignored");
                false
            } else {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.result = Some(result);
                let agent_id = task.assigned_agent.clone();

                if let Some(agent_id) = &agent_id {
                    self.directory.release(agent_id, task_id);
                }
                state.stats.total_completed += 1;
                tracing::info!(%task_id, agent_id = ?agent_id, "task completed");
                events.push(SchedulerEvent::TaskCompleted { task_id, agent_id });

                self.assign_pending(&mut state, &mut events);
                true
            }
        };
        self.emit_all(events);
        Ok(completed)
    }

    /// Fail a pending or assigned task. Below the retry bound a copy is
    /// queued at one lower priority with its retry count incremented.
    pub fn fail(&self, task_id: TaskId, reason: impl Into<String>) -> SchedulerResult<FailOutcome> {
        let reason = reason.into();
        let mut events = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if !state.check_known(task_id)? {
                tracing::debug!(%task_id, "fail ignored, task pruned");
                return Ok(FailOutcome::Ignored);
            }
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::TaskNotFound(task_id))?;

            if task.status.is_terminal() {
                tracing::debug!(%task_id, status = ?task.status, "fail ignored");
                FailOutcome::Ignored
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.failure_reason = Some(reason.clone());
                let agent_id = task.assigned_agent.clone();
                let retry_count = task.retry_count;
                let retry_request = task.retry_request();

                if let Some(agent_id) = &agent_id {
                    self.directory.release(agent_id, task_id);
                }
                state.dequeue(task_id);
                state.stats.total_failed += 1;

                let outcome = if retry_count < self.config.max_retries {
                    let retry_id = self.insert_task(
                        &mut state,
                        retry_request,
                        Some((task_id, retry_count + 1)),
                        &mut events,
                    );
                    state.stats.total_retried += 1;
                    tracing::warn!(
                        %task_id,
                        %retry_id,
                        attempt = retry_count + 1,
                        reason = %reason,
                        "task failed, requeued"
                    );
                    FailOutcome::Requeued(retry_id)
                } else {
                    tracing::error!(
                        %task_id,
                        retries = retry_count,
                        reason = %reason,
                        "task failed, retries exhausted"
                    );
                    FailOutcome::Exhausted
                };

                events.push(SchedulerEvent::TaskFailed {
                    task_id,
                    reason,
                    retry: match outcome {
                        FailOutcome::Requeued(id) => Some(id),
                        _ => None,
                    },
                });

                self.assign_pending(&mut state, &mut events);
                outcome
            }
        };
        self.emit_all(events);
        Ok(outcome)
    }

    /// Cancel a pending or assigned task. No retry is queued.
    pub fn cancel(&self, task_id: TaskId) -> SchedulerResult<bool> {
        let mut events = Vec::new();
        let cancelled = {
            let mut state = self.state.lock();
            if !state.check_known(task_id)? {
                return Ok(false);
            }
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::TaskNotFound(task_id))?;

            if task.status.is_terminal() {
                false
            } else {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                let agent_id = task.assigned_agent.clone();

                if let Some(agent_id) = &agent_id {
                    self.directory.release(agent_id, task_id);
                }
                state.dequeue(task_id);
                state.stats.total_cancelled += 1;
                tracing::info!(%task_id, "task cancelled");
                events.push(SchedulerEvent::TaskCancelled { task_id });

                self.assign_pending(&mut state, &mut events);
                true
            }
        };
        self.emit_all(events);
        Ok(cancelled)
    }

    /// Fail `task_id` only while it is still assigned to `agent_id`
    fn fail_held(
        &self,
        agent_id: &str,
        task_id: TaskId,
        reason: ReleaseReason,
    ) -> SchedulerResult<FailOutcome> {
        let held = self
            .state
            .lock()
            .tasks
            .get(&task_id)
            .map(|t| {
                t.status == TaskStatus::Assigned && t.assigned_agent.as_deref() == Some(agent_id)
            })
            .unwrap_or(false);
        if !held {
            return Ok(FailOutcome::Ignored);
        }
        self.fail(task_id, reason.as_str())
    }

    /// Run one assignment pass. Returns the number of tasks assigned.
    pub fn tick(&self) -> usize {
        let mut events = Vec::new();
        let assigned = {
            let mut state = self.state.lock();
            self.assign_pending(&mut state, &mut events)
        };
        if assigned > 0 {
            tracing::debug!(assigned, "reassignment tick");
        }
        self.emit_all(events);
        assigned
    }

    /// Drop terminal tasks older than the retention window, then the oldest
    /// ones beyond the terminal task cap. Returns the number removed.
    pub fn prune_terminal(&self) -> usize {
        let retention = chrono::Duration::milliseconds(
            self.config.terminal_retention_ms.min(i64::MAX as u64) as i64,
        );
        let cutoff = Utc::now() - retention;

        let mut state = self.state.lock();
        let before = state.tasks.len();

        state.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });

        let mut terminal: Vec<(chrono::DateTime<Utc>, TaskId)> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.completed_at.unwrap_or(t.created_at), t.id))
            .collect();
        if terminal.len() > self.config.max_terminal_tasks {
            terminal.sort();
            let excess = terminal.len() - self.config.max_terminal_tasks;
            for (_, id) in terminal.into_iter().take(excess) {
                state.tasks.remove(&id);
            }
        }

        let removed = before - state.tasks.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned terminal tasks");
        }
        removed
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().tasks.get(&task_id).cloned()
    }

    /// Pending tasks in assignment order
    pub fn pending_tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    /// Stored tasks in the given status, ordered by id
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Task currently assigned to an agent
    pub fn task_for_agent(&self, agent_id: &str) -> Option<Task> {
        self.state
            .lock()
            .tasks
            .values()
            .find(|t| {
                t.status == TaskStatus::Assigned && t.assigned_agent.as_deref() == Some(agent_id)
            })
            .cloned()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.pending_tasks = state.pending.len();
        stats.assigned_tasks = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Assigned)
            .count();
        stats
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn insert_task(
        &self,
        state: &mut SchedulerState,
        request: TaskRequest,
        retry_of: Option<(TaskId, u32)>,
        events: &mut Vec<SchedulerEvent>,
    ) -> TaskId {
        let task_id = state.allocate_id();
        let mut task = Task::from_request(task_id, request);
        if let Some((original, retry_count)) = retry_of {
            task.retry_of = Some(original);
            task.retry_count = retry_count;
        }
        let priority = task.priority;

        tracing::debug!(
            %task_id,
            task_type = %task.task_type,
            priority,
            capabilities = ?task.required_capabilities,
            "task submitted"
        );

        state.tasks.insert(task_id, task);
        state.enqueue(task_id, priority);
        state.stats.total_submitted += 1;
        events.push(SchedulerEvent::TaskSubmitted { task_id, priority });
        task_id
    }

    /// Walk the pending queue in priority order and hand each task to the
    /// fittest idle agent that has every required capability.
    fn assign_pending(&self, state: &mut SchedulerState, events: &mut Vec<SchedulerEvent>) -> usize {
        let mut assigned = 0;
        let mut index = 0;

        while index < state.pending.len() {
            let idle: Vec<AgentRecord> = self
                .directory
                .query(&AgentQuery::idle())
                .into_iter()
                .filter(|a| a.is_available())
                .collect();
            if idle.is_empty() {
                break;
            }

            let task_id = state.pending[index];
            let Some(task) = state.tasks.get(&task_id) else {
                state.pending.remove(index);
                continue;
            };

            let eligible = idle
                .iter()
                .filter(|a| a.has_all_capabilities(&task.required_capabilities));
            let choice = select_best(eligible, task, self.config.max_health)
                .map(|(agent, score)| (agent.agent_id.clone(), score));

            match choice {
                Some((agent_id, score)) if self.directory.claim(&agent_id, task_id) => {
                    state.pending.remove(index);
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::Assigned;
                        task.assigned_agent = Some(agent_id.clone());
                        task.assigned_at = Some(Utc::now());
                    }
                    state.stats.total_assigned += 1;
                    assigned += 1;

                    tracing::info!(%task_id, agent_id = %agent_id, score, "task assigned");
                    events.push(SchedulerEvent::TaskAssigned {
                        task_id,
                        agent_id,
                        score,
                    });
                }
                _ => index += 1,
            }
        }
        assigned
    }

    fn emit_all(&self, events: Vec<SchedulerEvent>) {
        for event in events {
            // No receivers is fine
            let _ = self.event_tx.send(event);
        }
    }
}

impl TaskReleaseObserver for TaskScheduler {
    fn on_task_released(&self, agent_id: &str, task_id: TaskId, reason: ReleaseReason) {
        match self.fail_held(agent_id, task_id, reason) {
            Ok(FailOutcome::Ignored) => {}
            Ok(outcome) => {
                tracing::info!(agent_id, %task_id, %reason, ?outcome, "released task failed")
            }
            Err(e) => tracing::warn!(agent_id, %task_id, error = %e, "released task missing"),
        }
    }
}
