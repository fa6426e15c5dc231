//! Shared types for the Taskmux session monitor.

mod session;
mod task;

pub use session::*;
pub use task::*;
