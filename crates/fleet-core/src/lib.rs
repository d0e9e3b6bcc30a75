//! Fleet Core - coordination and resilience for autonomous agent fleets
//!
//! - [`agents`]: agent directory with capability and liveness tracking
//! - [`scheduler`]: priority task queue with fitness-based assignment
//! - [`communication`]: typed pub/sub message bus
//! - [`resilience`]: classified exponential-backoff reconnection
//! - [`fleet`]: service facade wiring the above together
//!
//! All state is in memory. Components are explicitly constructed and shared
//! through `Arc`; nothing is global.

pub mod agents;
pub mod communication;
pub mod config;
pub mod fleet;
pub mod logging;
pub mod resilience;
pub mod scheduler;

pub use agents::{AgentDirectory, AgentRecord, AgentStatus};
pub use communication::{AgentInbox, AgentMessage, MessageBus, MessageKind, MessageType};
pub use config::FleetConfig;
pub use fleet::{Fleet, FleetStats};
pub use resilience::{
    AgentConnection, ConnectionFactory, ConnectionSignal, ErrorClass, ResilienceEvent,
    ResilienceManager,
};
pub use scheduler::{TaskId, TaskRequest, TaskScheduler, TaskStatus};
