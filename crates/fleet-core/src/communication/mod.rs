// Agent Communication Module
//
// Typed messages, per-agent inboxes and the pub/sub message bus.

mod message_bus;
mod messages;

#[cfg(test)]
mod message_bus_property_tests;

pub use message_bus::*;
pub use messages::*;
