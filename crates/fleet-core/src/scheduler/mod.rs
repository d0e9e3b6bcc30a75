// Task Scheduler Module
//
// Priority queue of tasks and the fitness-based assignment of tasks to
// idle, capability-matching agents from the directory.

mod fitness;
mod task_scheduler;
mod types;


pub use fitness::*;
pub use task_scheduler::*;
pub use types::*;
