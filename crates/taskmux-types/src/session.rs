//! Session monitoring types and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One monitored tmux pane driven by an external assistant process.
///
/// Immutable: targets are defined at startup and never change while the
/// monitor is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTarget {
    /// Stable session identifier (used as the key for all per-session state).
    pub id: String,
    /// tmux target string, e.g. "agents:0.1".
    pub pane: String,
    /// Optional human-readable role label (e.g. "backend", "reviewer").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl SessionTarget {
    pub fn new(id: impl Into<String>, pane: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pane: pane.into(),
            role: None,
        }
    }
}

/// Coarse classification of what a session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    /// Writing or editing source code.
    Coding,
    /// Creating or modifying files.
    FileOperation,
    /// Running a shell command.
    CommandExecution,
    /// Analyzing, planning, or otherwise reflecting.
    Thinking,
    /// Waiting at a prompt, or showing an error.
    Idle,
}

impl ActivityCategory {
    /// Whether this category represents productive work (drives the fast
    /// poll interval).
    pub fn is_working(self) -> bool {
        !matches!(self, ActivityCategory::Idle)
    }
}

/// A de-duplicated status observation for one session.
///
/// Produced only when newly captured text differs from the prior snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub category: ActivityCategory,
    /// Short human-readable description of the detected activity.
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// File the session appears to be working on, if one was extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Shell command the session appears to be running, if extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl StatusUpdate {
    pub fn new(category: ActivityCategory, description: impl Into<String>) -> Self {
        Self {
            category,
            description: description.into(),
            timestamp: Utc::now(),
            file_name: None,
            command: None,
        }
    }

    /// Material difference check used for broadcast de-duplication.
    ///
    /// Timestamps are deliberately ignored: two observations of the same
    /// category/description/file/command are the same status.
    pub fn differs_from(&self, other: &StatusUpdate) -> bool {
        self.category != other.category
            || self.description != other.description
            || self.file_name != other.file_name
            || self.command != other.command
    }
}

/// Capture-health state machine for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    /// Never observed yet.
    Unknown,
    /// Last capture succeeded.
    Active,
    /// 1..max_retries-1 consecutive capture failures.
    Degraded,
    /// At or past the consecutive-failure threshold.
    Offline,
}

/// Error condition attached to a session's monitoring state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorState {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Number of capture attempts made since the error was first recorded.
    pub recovery_attempts: u32,
}

/// Per-session monitoring bookkeeping.
///
/// Created lazily on first observation; lives for the process lifetime minus
/// explicit pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMonitoringState {
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    /// Whether the last classified activity was productive work.
    pub is_active: bool,
    pub health: SessionHealth,
    /// Last status that was broadcast for this session.
    pub last_known_status: Option<StatusUpdate>,
    pub error: Option<SessionErrorState>,
    /// True while the session's status is synthesized from cached knowledge
    /// because direct capture is unavailable.
    pub fallback_mode: bool,
    pub last_successful_check: Option<DateTime<Utc>>,
}

impl Default for SessionMonitoringState {
    fn default() -> Self {
        Self {
            last_check: Utc::now(),
            consecutive_failures: 0,
            is_active: false,
            health: SessionHealth::Unknown,
            last_known_status: None,
            error: None,
            fallback_mode: false,
            last_successful_check: None,
        }
    }
}

/// Process-wide monitoring counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    /// Rolling average duration of one full tick in milliseconds.
    pub avg_check_duration_ms: f64,
    /// Sessions whose last classified activity was productive.
    pub active_sessions: usize,
    /// Sessions that came back after an error or offline state.
    pub recovered_errors: u64,
    /// Times the scheduler entered graceful-degradation fallback.
    pub fallback_activations: u64,
}
