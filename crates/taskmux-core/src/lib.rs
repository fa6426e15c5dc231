//! Core monitoring and task lifecycle engine for Taskmux.

mod buffer;
mod capture;
mod classifier;
mod config;
mod db;
mod error;
mod monitor;
mod patterns;
mod queue;
mod ratelimit;

pub use buffer::{BufferEntry, OutputBuffer, truncate_capture};
pub use capture::{SessionDriver, TmuxDriver, capture_with_retry};
pub use classifier::{ActivityClassifier, Classification};
pub use config::{Config, MonitorConfig, QueueConfig};
pub use db::TaskStore;
pub use error::TaskmuxError;
pub use monitor::{MonitorEvent, MonitorScheduler};
pub use patterns::{ActivityPattern, PatternLibrary, strip_ansi};
pub use queue::TaskEngine;
pub use ratelimit::{compute_resume_time, detect_rate_limit};

/// Result type for Taskmux operations.
pub type Result<T> = std::result::Result<T, TaskmuxError>;
