//! Monitor and queue configuration.
//!
//! Every heuristic threshold in the engine lives here rather than as a
//! hard-coded constant, so deployments can tune polling cadence, compression
//! behavior, and rate-limit handling without rebuilding.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

/// Configuration for the monitoring scheduler and capture layer.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval while any session is actively working, in milliseconds.
    #[serde(default = "default_active_interval_ms")]
    pub active_interval_ms: u64,
    /// Poll interval while every session is idle, in milliseconds.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Hard floor for either interval after self-tuning.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Hard ceiling for either interval after self-tuning.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Multiplicative factor applied when self-tuning scales intervals.
    #[serde(default = "default_tune_factor")]
    pub tune_factor: f64,
    /// Average tick duration above which intervals are scaled up, ms.
    #[serde(default = "default_tune_upper_ms")]
    pub tune_upper_ms: f64,
    /// Average tick duration below which intervals are scaled down, ms.
    #[serde(default = "default_tune_lower_ms")]
    pub tune_lower_ms: f64,
    /// Timeout for a single capture attempt, in seconds.
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    /// Retries per capture (attempts = retries + 1).
    #[serde(default = "default_capture_retries")]
    pub capture_retries: u32,
    /// Fixed backoff between capture retries, in milliseconds.
    #[serde(default = "default_capture_backoff_ms")]
    pub capture_backoff_ms: u64,
    /// Consecutive failures after which a session is authoritatively offline.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Window after the last successful check during which fallback keeps the
    /// last known status instead of synthesizing offline, in seconds.
    #[serde(default = "default_fallback_grace_secs")]
    pub fallback_grace_secs: u64,
    /// Seconds without detected activity before a session is considered idle.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    /// Per-session error state older than this is pruned, in seconds.
    #[serde(default = "default_error_max_age_secs")]
    pub error_max_age_secs: u64,
    /// Lines of output to inspect when a full redraw breaks incremental diffing.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    /// Circular buffer capacity per session, in entries.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Entries longer than this many bytes are compressed before storage.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Lines matching any of these keywords survive aggressive compression.
    #[serde(default = "default_importance_keywords")]
    pub importance_keywords: Vec<String>,
    /// Raw capture line cap applied before buffering.
    #[serde(default = "default_capture_max_lines")]
    pub capture_max_lines: usize,
    /// Character budget for pathological single-line captures.
    #[serde(default = "default_capture_char_budget")]
    pub capture_char_budget: usize,
}

/// Configuration for the task lifecycle engine.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Database path for the persistent task store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Marker phrase a session prints when its assigned task is done.
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
    /// Cooldown applied when a rate-limit message carries no parseable
    /// resume time, in minutes.
    #[serde(default = "default_rate_limit_fallback_mins")]
    pub rate_limit_fallback_mins: i64,
    /// A task in progress with no session activity for this long is reported
    /// as stuck (reported only; never force-cancelled).
    #[serde(default = "default_stuck_task_secs")]
    pub stuck_task_secs: u64,
}

fn default_active_interval_ms() -> u64 {
    5_000
}

fn default_idle_interval_ms() -> u64 {
    15_000
}

fn default_min_interval_ms() -> u64 {
    2_000
}

fn default_max_interval_ms() -> u64 {
    60_000
}

fn default_tune_factor() -> f64 {
    1.5
}

fn default_tune_upper_ms() -> f64 {
    2_000.0
}

fn default_tune_lower_ms() -> f64 {
    250.0
}

fn default_capture_timeout_secs() -> u64 {
    5
}

fn default_capture_retries() -> u32 {
    2
}

fn default_capture_backoff_ms() -> u64 {
    500
}

fn default_max_failures() -> u32 {
    3
}

fn default_fallback_grace_secs() -> u64 {
    60
}

fn default_idle_threshold_secs() -> u64 {
    120
}

fn default_error_max_age_secs() -> u64 {
    3_600
}

fn default_tail_lines() -> usize {
    20
}

fn default_buffer_capacity() -> usize {
    50
}

fn default_compression_threshold() -> usize {
    4_096
}

fn default_importance_keywords() -> Vec<String> {
    [
        "error", "fail", "warning", "complete", "done", "created", "modified",
        "running", "executing", "panic",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_capture_max_lines() -> usize {
    200
}

fn default_capture_char_budget() -> usize {
    16_384
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskmux")
        .join("tasks.db")
}

fn default_completion_marker() -> String {
    "TASK COMPLETE".to_string()
}

fn default_rate_limit_fallback_mins() -> i64 {
    60
}

fn default_stuck_task_secs() -> u64 {
    1_800
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: default_active_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            tune_factor: default_tune_factor(),
            tune_upper_ms: default_tune_upper_ms(),
            tune_lower_ms: default_tune_lower_ms(),
            capture_timeout_secs: default_capture_timeout_secs(),
            capture_retries: default_capture_retries(),
            capture_backoff_ms: default_capture_backoff_ms(),
            max_failures: default_max_failures(),
            fallback_grace_secs: default_fallback_grace_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
            error_max_age_secs: default_error_max_age_secs(),
            tail_lines: default_tail_lines(),
            buffer_capacity: default_buffer_capacity(),
            compression_threshold: default_compression_threshold(),
            importance_keywords: default_importance_keywords(),
            capture_max_lines: default_capture_max_lines(),
            capture_char_budget: default_capture_char_budget(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            completion_marker: default_completion_marker(),
            rate_limit_fallback_mins: default_rate_limit_fallback_mins(),
            stuck_task_secs: default_stuck_task_secs(),
        }
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from the default location (config/default.toml) or fall
    /// back to defaults.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/default.toml");
        if config_path.exists() {
            return Self::load_from(&config_path);
        }
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = MonitorConfig::default();
        assert!(cfg.active_interval_ms < cfg.idle_interval_ms);
        assert!(cfg.min_interval_ms <= cfg.active_interval_ms);
        assert!(cfg.idle_interval_ms <= cfg.max_interval_ms);
        assert!(cfg.max_failures >= 1);
        assert!(!cfg.importance_keywords.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [monitor]
            active_interval_ms = 1000

            [queue]
            completion_marker = "ALL DONE"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.monitor.active_interval_ms, 1000);
        assert_eq!(cfg.monitor.idle_interval_ms, default_idle_interval_ms());
        assert_eq!(cfg.queue.completion_marker, "ALL DONE");
        assert_eq!(
            cfg.queue.rate_limit_fallback_mins,
            default_rate_limit_fallback_mins()
        );
    }
}
