//! Activity classification over captured terminal output.
//!
//! The classifier keeps the previous capture per session so each tick only
//! inspects output that actually appeared since the last one. Full-screen
//! redraws defeat incremental diffing, in which case classification falls
//! back to the visible tail.

use crate::patterns::{PatternLibrary, strip_ansi};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use taskmux_types::{ActivityCategory, StatusUpdate};
use tracing::debug;

/// Outcome of classifying one capture.
#[derive(Debug, Clone)]
pub struct Classification {
    pub update: StatusUpdate,
    /// Whether an error marker drove this classification.
    pub is_error: bool,
}

/// Stateful per-session activity classifier.
pub struct ActivityClassifier {
    library: PatternLibrary,
    /// Last ANSI-stripped capture per session id.
    previous: DashMap<String, String>,
    /// Last instant productive activity was observed per session id.
    last_activity: DashMap<String, DateTime<Utc>>,
    tail_lines: usize,
    idle_threshold: Duration,
}

impl ActivityClassifier {
    pub fn new(tail_lines: usize, idle_threshold_secs: u64) -> Self {
        Self {
            library: PatternLibrary::new(),
            previous: DashMap::new(),
            last_activity: DashMap::new(),
            tail_lines,
            idle_threshold: Duration::seconds(idle_threshold_secs as i64),
        }
    }

    /// Classify a raw capture for one session, updating the stored snapshot.
    ///
    /// `now` is passed in so the scheduler observes one consistent instant
    /// across a whole tick.
    pub fn classify(&self, session_id: &str, raw: &str, now: DateTime<Utc>) -> Classification {
        let clean = strip_ansi(raw);
        let fresh = self.take_fresh_output(session_id, &clean);

        if fresh.trim().is_empty() {
            return self.classify_quiet(session_id, &clean, now);
        }

        let result = self.classify_text(&fresh, now);
        if result.update.category.is_working() {
            self.last_activity.insert(session_id.to_string(), now);
        }

        debug!(
            target: "taskmux::classify",
            "Session {} classified as {:?}: {}",
            session_id, result.update.category, result.update.description
        );
        result
    }

    /// Drop all stored state for a session.
    pub fn forget(&self, session_id: &str) {
        self.previous.remove(session_id);
        self.last_activity.remove(session_id);
    }

    /// Return only the text that appeared since the previous capture, and
    /// store the new capture as the baseline.
    ///
    /// When the new capture is a pure extension of the old one the suffix is
    /// exact. Anything else (scrollback rotation, redraw, cleared screen)
    /// falls back to the last `tail_lines` lines.
    fn take_fresh_output(&self, session_id: &str, clean: &str) -> String {
        let fresh = match self.previous.get(session_id) {
            None => clean.to_string(),
            Some(prev) if clean == prev.as_str() => String::new(),
            Some(prev) if clean.starts_with(prev.as_str()) => clean[prev.len()..].to_string(),
            Some(_) => {
                let lines: Vec<&str> = clean.lines().collect();
                let start = lines.len().saturating_sub(self.tail_lines);
                lines[start..].join("\n")
            }
        };
        self.previous
            .insert(session_id.to_string(), clean.to_string());
        fresh
    }

    /// Classification when no new text appeared this tick.
    ///
    /// Quiet output is not immediately idle: a session can sit on unchanged
    /// output mid-work. It becomes idle once the threshold elapses, or at
    /// once if the visible tail shows an explicit prompt marker.
    fn classify_quiet(&self, session_id: &str, clean: &str, now: DateTime<Utc>) -> Classification {
        if clean.trim().is_empty() || self.library.has_idle_marker(clean) {
            return Classification {
                update: StatusUpdate {
                    timestamp: now,
                    ..StatusUpdate::new(ActivityCategory::Idle, "Waiting at prompt")
                },
                is_error: false,
            };
        }
        let quiet_for = self
            .last_activity
            .get(session_id)
            .map(|t| now - *t)
            .unwrap_or(self.idle_threshold);
        if quiet_for >= self.idle_threshold {
            Classification {
                update: StatusUpdate {
                    timestamp: now,
                    ..StatusUpdate::new(ActivityCategory::Idle, "No recent activity")
                },
                is_error: false,
            }
        } else {
            // Still within the activity window; re-derive from the tail so
            // the status stays stable and de-duplication suppresses it.
            self.classify_text(clean, now)
        }
    }

    fn classify_text(&self, text: &str, now: DateTime<Utc>) -> Classification {
        // Errors override everything, including productive-looking tokens
        // in the same fragment.
        if self.library.has_error(text) {
            let description = self
                .library
                .error_line(text)
                .unwrap_or_else(|| "Error detected".to_string());
            return Classification {
                update: StatusUpdate {
                    timestamp: now,
                    ..StatusUpdate::new(ActivityCategory::Idle, description)
                },
                is_error: true,
            };
        }

        let mut update = match self.library.find_best_match(text) {
            Some(pattern) => StatusUpdate {
                timestamp: now,
                ..StatusUpdate::new(pattern.category, pattern.description)
            },
            None => StatusUpdate {
                timestamp: now,
                ..StatusUpdate::new(ActivityCategory::Thinking, "Working")
            },
        };

        // Attach extracted detail only where it is meaningful.
        if matches!(
            update.category,
            ActivityCategory::FileOperation | ActivityCategory::Coding
        ) {
            update.file_name = self.library.extract_file_name(text);
        }
        if update.category == ActivityCategory::CommandExecution {
            update.command = self.library.extract_command(text);
        }
        Classification {
            update,
            is_error: false,
        }
    }
}
