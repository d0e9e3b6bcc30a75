// Agent Directory Module
//
// Registry of agents with capability, status and liveness bookkeeping.

mod directory;

pub use directory::*;
