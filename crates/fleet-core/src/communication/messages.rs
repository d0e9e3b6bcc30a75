//! Message types carried by the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agents::Position;

/// Sender id used for broadcasts that do not originate from an agent
pub const SYSTEM_SENDER: &str = "system";

/// Closed set of message kinds, each with its own payload shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    HelpRequest {
        reason: String,
        #[serde(default)]
        position: Option<Position>,
    },
    DangerAlert {
        threat: String,
        #[serde(default)]
        position: Option<Position>,
    },
    ResourceFound {
        resource: String,
        #[serde(default)]
        position: Option<Position>,
        #[serde(default)]
        quantity: Option<u32>,
    },
    ActivityProposal {
        activity: String,
        #[serde(default)]
        participants: Vec<String>,
    },
    Heartbeat,
    /// Escape hatch for application-defined messages
    Custom { kind: String, payload: Value },
}

impl MessageKind {
    /// Application-defined message. A `kind` naming a built-in type (for
    /// example `"resource_found"`) still routes as that type.
    pub fn custom(kind: impl Into<String>, payload: Value) -> Self {
        Self::Custom {
            kind: kind.into(),
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::HelpRequest { .. } => MessageType::HelpRequest,
            Self::DangerAlert { .. } => MessageType::DangerAlert,
            Self::ResourceFound { .. } => MessageType::ResourceFound,
            Self::ActivityProposal { .. } => MessageType::ActivityProposal,
            Self::Heartbeat => MessageType::Heartbeat,
            Self::Custom { kind, .. } => MessageType::from(kind.as_str()),
        }
    }
}

/// Discriminant used to route messages to handlers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    HelpRequest,
    DangerAlert,
    ResourceFound,
    ActivityProposal,
    Heartbeat,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::HelpRequest => "help_request",
            Self::DangerAlert => "danger_alert",
            Self::ResourceFound => "resource_found",
            Self::ActivityProposal => "activity_proposal",
            Self::Heartbeat => "heartbeat",
            Self::Custom(kind) => kind,
        }
    }

    /// Fold a `Custom` name that matches a built-in type into that type
    pub fn normalized(self) -> Self {
        match self {
            Self::Custom(kind) => Self::from(kind.as_str()),
            other => other,
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        match value {
            "help_request" => Self::HelpRequest,
            "danger_alert" => Self::DangerAlert,
            "resource_found" => Self::ResourceFound,
            "activity_proposal" => Self::ActivityProposal,
            "heartbeat" => Self::Heartbeat,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in the bus log.
///
/// A broadcast is logged as one message per recipient, each marked with
/// `broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub broadcast: bool,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            broadcast: false,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Copy of a broadcast addressed to one recipient
    pub fn broadcast_to(from: impl Into<String>, to: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            broadcast: true,
            ..Self::new(from, to, kind)
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }
}

/// Receiving end of an agent's mailbox, handed out on registration
#[derive(Debug)]
pub struct AgentInbox {
    agent_id: String,
    receiver: mpsc::Receiver<AgentMessage>,
}

impl AgentInbox {
    pub(crate) fn new(agent_id: String, receiver: mpsc::Receiver<AgentMessage>) -> Self {
        Self { agent_id, receiver }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Wait for the next message. `None` once the agent is re-registered
    /// elsewhere or the bus is dropped.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        self.receiver.try_recv().ok()
    }

    /// Everything currently queued
    pub fn drain(&mut self) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            messages.push(message);
        }
        messages
    }
}
