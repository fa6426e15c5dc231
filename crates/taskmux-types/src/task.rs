//! Work-item types and the task lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task status in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be dispatched.
    Pending,
    /// Dispatched to a session and being worked on.
    InProgress,
    /// Suspended (rate limit); resumable without restarting.
    Paused,
    /// Finished successfully.
    Completed,
    /// Failed; retryable back to pending.
    Failed,
    /// Removed from active processing.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again (except failed -> pending via
    /// an explicit retry).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// One structured failure record. `error_history` strictly appends these;
/// it is never truncated or overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// Value of `retry_count` at the moment the failure was recorded.
    pub retry_count_at_failure: u32,
}

/// A unit of work dispatched to a monitored session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Session id the task is (or was last) assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Append-only failure log.
    #[serde(default)]
    pub error_history: Vec<TaskError>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh pending task.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            assigned_to: None,
            paused_reason: None,
            failure_reason: None,
            error_history: Vec::new(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Process-wide rate-limit condition. Singleton, persisted for durability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub is_limited: bool,
    pub paused_at: Option<DateTime<Utc>>,
    /// Set whenever `is_limited` is true.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error_message: Option<String>,
}

impl RateLimitState {
    /// Whether the cooldown has elapsed as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("Fix tests", "Make the suite green");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_history.is_empty());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_rate_limit_expiry() {
        let now = Utc::now();
        let mut state = RateLimitState {
            is_limited: true,
            paused_at: Some(now),
            next_retry_at: Some(now + chrono::Duration::minutes(5)),
            retry_count: 1,
            last_error_message: None,
        };
        assert!(!state.is_expired(now));
        assert!(state.is_expired(now + chrono::Duration::minutes(6)));

        // A limited state with no deadline is treated as expired rather than
        // pausing the queue forever.
        state.next_retry_at = None;
        assert!(state.is_expired(now));
    }

    #[test]
    fn test_task_serde_round_trip() {
        let mut task = Task::new("t", "d");
        task.error_history.push(TaskError {
            timestamp: Utc::now(),
            reason: "capture failed".into(),
            retry_count_at_failure: 0,
        });
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.error_history.len(), 1);
    }
}
