//! Message Bus
//!
//! Direct and broadcast messaging between registered agents.
//!
//! # Features
//! - Per-agent inbox delivery over bounded tokio channels
//! - Typed handlers invoked in subscription order, with fault isolation
//! - Bounded, time-ordered message log with age-based cleanup
//! - Heartbeat bookkeeping forwarded to the agent directory

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::agents::{AgentDirectory, DirectoryResult, OfflineAgent};
use crate::config::BusConfig;

use super::messages::{AgentInbox, AgentMessage, MessageKind, MessageType, SYSTEM_SENDER};

// ============================================================================
// Error Types
// ============================================================================

/// Result type alias for message bus operations
pub type MessageBusResult<T> = Result<T, MessageBusError>;

/// Errors returned by message bus lookups
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessageBusError {
    /// Agent has no subscriber entry on the bus
    #[error("Agent not registered on bus: {0}")]
    AgentNotRegistered(String),
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler invoked for every message of a subscribed type
pub type MessageHandler = Arc<dyn Fn(&AgentMessage) -> anyhow::Result<()> + Send + Sync>;

/// Returned by [`MessageBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    message_type: MessageType,
    handler: MessageHandler,
}

// ============================================================================
// State
// ============================================================================

/// Per-agent traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageCounters {
    pub sent: u64,
    pub received: u64,
    /// Deliveries dropped because the inbox was full or closed
    pub dropped: u64,
}

struct Subscriber {
    inbox: mpsc::Sender<AgentMessage>,
    counters: AgentMessageCounters,
}

#[derive(Default)]
struct BusState {
    subscribers: IndexMap<String, Subscriber>,
    log: VecDeque<AgentMessage>,
    total_messages: u64,
    total_broadcasts: u64,
}

/// Statistics about the message bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBusStats {
    pub registered_agents: usize,
    pub log_size: usize,
    pub max_log_size: usize,
    pub total_messages: u64,
    pub total_broadcasts: u64,
    pub handler_failures: u64,
}

// ============================================================================
// Message Bus
// ============================================================================

pub struct MessageBus {
    directory: Arc<AgentDirectory>,
    config: BusConfig,
    state: Mutex<BusState>,
    handlers: RwLock<Vec<HandlerEntry>>,
    next_handler_id: AtomicU64,
    handler_failures: AtomicU64,
}

impl MessageBus {
    /// Bus whose liveness calls go to `directory`
    pub fn new(directory: Arc<AgentDirectory>, config: BusConfig) -> Self {
        Self {
            directory,
            config,
            state: Mutex::new(BusState::default()),
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create (or replace) the subscriber entry for an agent and return its
    /// inbox. A previous inbox for the same agent is closed. Counters survive
    /// re-registration.
    pub fn register_agent(&self, agent_id: impl Into<String>) -> AgentInbox {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));

        let mut state = self.state.lock();
        let counters = state
            .subscribers
            .shift_remove(&agent_id)
            .map(|s| s.counters)
            .unwrap_or_default();
        state.subscribers.insert(
            agent_id.clone(),
            Subscriber {
                inbox: tx,
                counters,
            },
        );
        drop(state);

        tracing::debug!(agent_id = %agent_id, "agent registered on bus");
        AgentInbox::new(agent_id, rx)
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state.lock().subscribers.contains_key(agent_id)
    }

    /// Registered agent ids in registration order
    pub fn registered_agents(&self) -> Vec<String> {
        self.state.lock().subscribers.keys().cloned().collect()
    }

    /// Subscribe a handler to a message type. Handlers for the same type run
    /// in the order they were added.
    pub fn on<F>(&self, message_type: impl Into<MessageType>, handler: F) -> HandlerId
    where
        F: Fn(&AgentMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let message_type: MessageType = message_type.into();
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push(HandlerEntry {
            id,
            message_type: message_type.normalized(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Send a message to one agent. Returns false if `to` is not registered.
    pub fn send(&self, from: &str, to: &str, kind: MessageKind) -> bool {
        let message = AgentMessage::new(from, to, kind);
        {
            let mut state = self.state.lock();
            if !state.subscribers.contains_key(to) {
                tracing::debug!(from, to, "send to unknown agent");
                return false;
            }
            self.deliver(&mut state, &message);
        }
        self.dispatch(&message);
        true
    }

    /// Fan a message out to every registered agent except `exclude`.
    ///
    /// Each recipient gets its own message. The sender is the excluded agent
    /// when given, [`SYSTEM_SENDER`] otherwise. Returns the number of
    /// recipients.
    pub fn broadcast(&self, kind: MessageKind, exclude: Option<&str>) -> usize {
        let from = exclude.unwrap_or(SYSTEM_SENDER);
        let messages: Vec<AgentMessage> = {
            let mut state = self.state.lock();
            let recipients: Vec<String> = state
                .subscribers
                .keys()
                .filter(|id| Some(id.as_str()) != exclude)
                .cloned()
                .collect();

            let messages: Vec<AgentMessage> = recipients
                .into_iter()
                .map(|to| AgentMessage::broadcast_to(from, to, kind.clone()))
                .collect();
            for message in &messages {
                self.deliver(&mut state, message);
            }
            state.total_broadcasts += 1;
            messages
        };

        tracing::debug!(
            from,
            message_type = %kind.message_type(),
            recipients = messages.len(),
            "broadcast"
        );
        for message in &messages {
            self.dispatch(message);
        }
        messages.len()
    }

    /// Refresh an agent's liveness in the directory
    pub fn heartbeat(&self, agent_id: &str) -> DirectoryResult<bool> {
        self.directory.heartbeat(agent_id)
    }

    /// Mark agents silent for longer than `timeout` offline. Tasks they held
    /// go back to the scheduler through the directory's release observers.
    pub fn check_inactive(&self, timeout: Duration) -> Vec<OfflineAgent> {
        self.directory.sweep_inactive(timeout)
    }

    /// Purge logged messages older than `max_age`. Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(max_age.as_millis().min(i64::MAX as u128) as i64);
        let mut state = self.state.lock();
        let before = state.log.len();
        while state
            .log
            .front()
            .map(|m| m.timestamp < cutoff)
            .unwrap_or(false)
        {
            state.log.pop_front();
        }
        let removed = before - state.log.len();
        if removed > 0 {
            tracing::debug!(removed, "purged old messages");
        }
        removed
    }

    /// Most recent messages first
    pub fn history(&self, limit: Option<usize>) -> Vec<AgentMessage> {
        let state = self.state.lock();
        let limit = limit.unwrap_or(state.log.len());
        state.log.iter().rev().take(limit).cloned().collect()
    }

    /// Traffic counters for one registered agent
    pub fn counters(&self, agent_id: &str) -> MessageBusResult<AgentMessageCounters> {
        self.state
            .lock()
            .subscribers
            .get(agent_id)
            .map(|s| s.counters.clone())
            .ok_or_else(|| MessageBusError::AgentNotRegistered(agent_id.to_string()))
    }

    pub fn stats(&self) -> MessageBusStats {
        let state = self.state.lock();
        MessageBusStats {
            registered_agents: state.subscribers.len(),
            log_size: state.log.len(),
            max_log_size: self.config.max_log_size,
            total_messages: state.total_messages,
            total_broadcasts: state.total_broadcasts,
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, state: &mut BusState, message: &AgentMessage) {
        state.log.push_back(message.clone());
        while state.log.len() > self.config.max_log_size {
            state.log.pop_front();
        }
        state.total_messages += 1;

        if let Some(sender) = state.subscribers.get_mut(&message.from) {
            sender.counters.sent += 1;
        }

        let to = message.to.as_str();
        if let Some(recipient) = state.subscribers.get_mut(to) {
            match recipient.inbox.try_send(message.clone()) {
                Ok(()) => recipient.counters.received += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    recipient.counters.dropped += 1;
                    tracing::warn!(agent_id = to, "inbox full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    recipient.counters.dropped += 1;
                    tracing::debug!(agent_id = to, "inbox closed, message dropped");
                }
            }
        }
    }

    /// Run matching handlers outside the bus lock so a handler may send
    fn dispatch(&self, message: &AgentMessage) {
        let message_type = message.message_type();
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.message_type == message_type)
            .map(|h| h.handler.clone())
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        message_id = %message.id,
                        message_type = %message_type,
                        error = %e,
                        "message handler failed"
                    );
                }
                Err(_) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        message_id = %message.id,
                        message_type = %message_type,
                        "message handler panicked"
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_log(&self, by: chrono::Duration) {
        for message in self.state.lock().log.iter_mut() {
            message.timestamp = message.timestamp - by;
        }
    }
}
