//! Task model shared by the scheduler and the directory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::agents::Position;

/// Errors returned by scheduler operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// No task was ever issued under this id
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Monotonically increasing task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle. Every state after `Assigned` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for an eligible idle agent
    Pending,
    /// Held by exactly one busy agent
    Assigned,
    /// Finished with a result
    Completed,
    /// Given up on; a retry may have been queued
    Failed,
    /// Withdrawn by the caller, never retried
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Everything needed to create a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_type: String,
    pub payload: Value,
    pub priority: i32,
    pub required_capabilities: Vec<String>,
    pub location: Option<Position>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: Value::Null,
            priority: 0,
            required_capabilities: Vec::new(),
            location: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
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

    /// Where the work happens; closer agents score higher
    pub fn with_location(mut self, location: Position) -> Self {
        self.location = Some(location);
        self
    }
}

/// A unit of assignable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Value,
    /// Higher is more urgent
    pub priority: i32,
    pub required_capabilities: Vec<String>,
    pub location: Option<Position>,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// The failed task this one retries
    pub retry_of: Option<TaskId>,
    pub result: Option<Value>,
    pub failure_reason: Option<String>,
}

impl Task {
    pub(crate) fn from_request(id: TaskId, request: TaskRequest) -> Self {
        Self {
            id,
            task_type: request.task_type,
            payload: request.payload,
            priority: request.priority,
            required_capabilities: request.required_capabilities,
            location: request.location,
            status: TaskStatus::Pending,
            assigned_agent: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            retry_count: 0,
            retry_of: None,
            result: None,
            failure_reason: None,
        }
    }

    /// Request for the follow-up task created when this one fails
    pub(crate) fn retry_request(&self) -> TaskRequest {
        TaskRequest {
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority.saturating_sub(1),
            required_capabilities: self.required_capabilities.clone(),
            location: self.location,
        }
    }
}

/// What `fail` did with a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Task was already terminal; nothing changed
    Ignored,
    /// Task failed and a retry was queued under the new id
    Requeued(TaskId),
    /// Task failed and the retry bound was reached
    Exhausted,
}

/// Scheduler events, published after the state change is visible
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Task created, including retries
    TaskSubmitted {
        task_id: TaskId,
        priority: i32,
    },
    /// Task handed to the fittest eligible agent
    TaskAssigned {
        task_id: TaskId,
        agent_id: String,
        score: f64,
    },
    /// Assigned task finished
    TaskCompleted {
        task_id: TaskId,
        agent_id: Option<String>,
    },
    /// Task failed; `retry` names the requeued copy, if any
    TaskFailed {
        task_id: TaskId,
        reason: String,
        retry: Option<TaskId>,
    },
    /// Task withdrawn
    TaskCancelled {
        task_id: TaskId,
    },
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub pending_tasks: usize,
    pub assigned_tasks: usize,
    pub total_submitted: u64,
    pub total_assigned: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_cancelled: u64,
}
