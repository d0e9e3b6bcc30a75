//! Connection seam between the resilience manager and the caller's
//! connection layer

use async_trait::async_trait;
use std::future::Future;
use tokio::sync::mpsc;

use super::classify::ErrorClass;

/// Lifecycle signal emitted by a live connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    /// Connection is up and the agent is in the world
    Spawned,
    Disconnected { reason: Option<String> },
    Kicked { reason: String },
    /// Generic error. `class` short-circuits text classification.
    Error {
        message: String,
        class: Option<ErrorClass>,
    },
}

/// A live connection the manager can watch
pub trait AgentConnection: Send + Sync + 'static {
    /// Hand over the signal stream. Called once per attach; `None` means the
    /// stream was already taken.
    fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionSignal>>;
}

/// Builds a fresh connection for an agent. Credentials and host details
/// live with the implementor.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, agent_id: &str) -> anyhow::Result<Box<dyn AgentConnection>>;
}

#[async_trait]
impl<F, Fut> ConnectionFactory for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Box<dyn AgentConnection>>> + Send + 'static,
{
    async fn connect(&self, agent_id: &str) -> anyhow::Result<Box<dyn AgentConnection>> {
        (self)(agent_id.to_string()).await
    }
}

/// Channel-backed connection for adapters that push signals from callbacks
#[derive(Debug)]
pub struct ChannelConnection {
    signals: Option<mpsc::UnboundedReceiver<ConnectionSignal>>,
}

impl ChannelConnection {
    pub fn new() -> (SignalSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalSender { tx }, Self { signals: Some(rx) })
    }

    pub fn boxed(self) -> Box<dyn AgentConnection> {
        Box::new(self)
    }
}

impl AgentConnection for ChannelConnection {
    fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionSignal>> {
        self.signals.take()
    }
}

/// Sending half of a [`ChannelConnection`]
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ConnectionSignal>,
}

impl SignalSender {
    /// Returns false once nobody is watching the connection
    pub fn send(&self, signal: ConnectionSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn spawned(&self) -> bool {
        self.send(ConnectionSignal::Spawned)
    }

    pub fn disconnected(&self, reason: Option<&str>) -> bool {
        self.send(ConnectionSignal::Disconnected {
            reason: reason.map(str::to_string),
        })
    }

    pub fn kicked(&self, reason: impl Into<String>) -> bool {
        self.send(ConnectionSignal::Kicked {
            reason: reason.into(),
        })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(ConnectionSignal::Error {
            message: message.into(),
            class: None,
        })
    }

    pub fn error_with_class(&self, message: impl Into<String>, class: ErrorClass) -> bool {
        self.send(ConnectionSignal::Error {
            message: message.into(),
            class: Some(class),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
