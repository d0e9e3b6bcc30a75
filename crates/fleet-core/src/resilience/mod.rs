// Connection Resilience Module
//
// Disconnect classification, backoff calculation and the per-agent
// reconnect state machine.

mod backoff;
mod classify;
mod connection;
mod manager;


pub use backoff::*;
pub use classify::*;
pub use connection::*;
pub use manager::*;
