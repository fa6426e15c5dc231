//! Adaptive polling scheduler.
//!
//! One scheduler owns every monitored session: each tick it captures all of
//! them, classifies the new output, advances the per-session health machine,
//! and broadcasts de-duplicated events. The poll cadence adapts to observed
//! activity and to how long ticks actually take.

use crate::buffer::{OutputBuffer, truncate_capture};
use crate::capture::{SessionDriver, capture_with_retry};
use crate::classifier::ActivityClassifier;
use crate::config::MonitorConfig;
use crate::ratelimit::detect_rate_limit;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use taskmux_types::{
    ActivityCategory, MonitoringStats, SessionErrorState, SessionHealth, SessionMonitoringState,
    SessionTarget, StatusUpdate,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Appended to a cached status description while capture is failing.
const FALLBACK_NOTE: &str = " (capture failing; showing last known status)";

/// Events broadcast to subscribers (UIs, the task engine, loggers).
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A session's status materially changed since the last broadcast.
    StatusChanged {
        session_id: String,
        update: StatusUpdate,
    },
    /// A session crossed a health boundary.
    HealthChanged {
        session_id: String,
        health: SessionHealth,
    },
    /// A throttle message appeared in a session's output.
    RateLimitDetected { session_id: String, message: String },
}

/// Polls all registered sessions and publishes their activity.
pub struct MonitorScheduler<D: SessionDriver> {
    driver: D,
    config: MonitorConfig,
    targets: DashMap<String, SessionTarget>,
    states: DashMap<String, SessionMonitoringState>,
    buffers: DashMap<String, OutputBuffer>,
    /// Last rate-limit line seen per session, to avoid re-announcing the
    /// same on-screen message every tick.
    rate_limit_seen: DashMap<String, String>,
    classifier: ActivityClassifier,
    event_tx: broadcast::Sender<MonitorEvent>,
    stats: Mutex<MonitoringStats>,
    ticks: AtomicU64,
    running: AtomicBool,
    /// Current self-tuned intervals, in milliseconds.
    active_interval_ms: AtomicU64,
    idle_interval_ms: AtomicU64,
}

impl<D: SessionDriver> MonitorScheduler<D> {
    pub fn new(driver: D, config: MonitorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let classifier = ActivityClassifier::new(config.tail_lines, config.idle_threshold_secs);
        let active_interval_ms = AtomicU64::new(config.active_interval_ms);
        let idle_interval_ms = AtomicU64::new(config.idle_interval_ms);
        Self {
            driver,
            config,
            targets: DashMap::new(),
            states: DashMap::new(),
            buffers: DashMap::new(),
            rate_limit_seen: DashMap::new(),
            classifier,
            event_tx,
            stats: Mutex::new(MonitoringStats::default()),
            ticks: AtomicU64::new(0),
            running: AtomicBool::new(false),
            active_interval_ms,
            idle_interval_ms,
        }
    }

    /// Subscribe to monitor events. Slow subscribers miss events rather than
    /// stalling the scheduler.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Register a session for monitoring.
    pub fn add_session(&self, target: SessionTarget) {
        info!(target: "taskmux::monitor", "Monitoring session {} ({})", target.id, target.pane);
        self.states
            .insert(target.id.clone(), SessionMonitoringState::default());
        self.buffers.insert(
            target.id.clone(),
            OutputBuffer::new(
                self.config.buffer_capacity,
                self.config.compression_threshold,
                self.config.importance_keywords.clone(),
            ),
        );
        self.targets.insert(target.id.clone(), target);
    }

    /// Drop a session and all its monitoring state.
    pub fn remove_session(&self, session_id: &str) {
        self.targets.remove(session_id);
        self.states.remove(session_id);
        self.buffers.remove(session_id);
        self.rate_limit_seen.remove(session_id);
        self.classifier.forget(session_id);
    }

    /// Snapshot of one session's monitoring state.
    pub fn session_state(&self, session_id: &str) -> Option<SessionMonitoringState> {
        self.states.get(session_id).map(|s| s.value().clone())
    }

    /// Force a status for one session, bypassing automatic classification.
    ///
    /// The override is broadcast unconditionally and becomes the baseline the
    /// next automatic classification is de-duplicated against.
    pub fn set_status(&self, session_id: &str, update: StatusUpdate) {
        let mut entry = self.states.entry(session_id.to_string()).or_default();
        entry.is_active = update.category.is_working();
        entry.last_known_status = Some(update.clone());
        drop(entry);
        debug!(
            target: "taskmux::monitor",
            session = session_id,
            category = ?update.category,
            "manual status override"
        );
        let _ = self.event_tx.send(MonitorEvent::StatusChanged {
            session_id: session_id.to_string(),
            update,
        });
    }

    /// Recent buffered output for one session, newest last.
    pub fn recent_output(&self, session_id: &str, n: usize) -> Vec<String> {
        self.buffers
            .get_mut(session_id)
            .map(|mut b| b.recent(n).into_iter().map(|e| e.text).collect())
            .unwrap_or_default()
    }

    /// Snapshot of process-wide counters.
    pub fn stats(&self) -> MonitoringStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.active_sessions = self
            .states
            .iter()
            .filter(|entry| entry.value().is_active)
            .count();
        stats
    }

    /// Run one full monitoring pass over every session.
    ///
    /// All captures complete (or fail) before any event is sent, so each
    /// broadcast compares against the state as of the start of the tick.
    pub async fn tick(&self) {
        let started = Instant::now();
        let now = Utc::now();
        let targets: Vec<SessionTarget> =
            self.targets.iter().map(|e| e.value().clone()).collect();

        let mut results: Vec<(SessionTarget, crate::Result<String>)> =
            Vec::with_capacity(targets.len());
        for target in targets {
            let result = capture_with_retry(
                &self.driver,
                &target,
                Duration::from_secs(self.config.capture_timeout_secs),
                self.config.capture_retries,
                Duration::from_millis(self.config.capture_backoff_ms),
            )
            .await;
            results.push((target, result));
        }

        {
            let mut stats = self.stats.lock().unwrap();
            for (_, result) in &results {
                stats.total_checks += 1;
                match result {
                    Ok(_) => stats.successful_checks += 1,
                    Err(_) => stats.failed_checks += 1,
                }
            }
        }

        // Every capture failing in one pass points at the capture mechanism
        // itself, not at the individual sessions.
        let mechanism_failure = !results.is_empty() && results.iter().all(|(_, r)| r.is_err());

        let mut events: Vec<MonitorEvent> = Vec::new();
        for (target, result) in results {
            match result {
                Ok(raw) => self.handle_capture(&target, raw, now, &mut events),
                Err(e) => self.handle_capture_failure(
                    &target,
                    e.to_string(),
                    now,
                    mechanism_failure,
                    &mut events,
                ),
            }
        }

        self.prune_stale_errors(now);
        self.record_tick_duration(started.elapsed());

        for event in events {
            // Send fails only when nobody is subscribed.
            let _ = self.event_tx.send(event);
        }
    }

    fn handle_capture(
        &self,
        target: &SessionTarget,
        raw: String,
        now: DateTime<Utc>,
        events: &mut Vec<MonitorEvent>,
    ) {
        let bounded = truncate_capture(
            &raw,
            self.config.capture_max_lines,
            self.config.capture_char_budget,
        );

        if let Some(mut buffer) = self.buffers.get_mut(&target.id) {
            buffer.push(&bounded);
        }

        if let Some(line) = detect_rate_limit(&bounded) {
            let already_seen = self
                .rate_limit_seen
                .get(&target.id)
                .map(|l| *l == line)
                .unwrap_or(false);
            if !already_seen {
                warn!(
                    target: "taskmux::monitor",
                    "Rate limit detected in {}: {}", target.id, line
                );
                self.rate_limit_seen.insert(target.id.clone(), line.clone());
                events.push(MonitorEvent::RateLimitDetected {
                    session_id: target.id.clone(),
                    message: line,
                });
            }
        } else {
            self.rate_limit_seen.remove(&target.id);
        }

        let classified = self.classifier.classify(&target.id, &bounded, now);
        let update = classified.update;

        let mut state = self
            .states
            .entry(target.id.clone())
            .or_default();
        let was_down = matches!(
            state.health,
            SessionHealth::Degraded | SessionHealth::Offline
        );
        state.last_check = now;
        state.last_successful_check = Some(now);
        state.consecutive_failures = 0;
        state.fallback_mode = false;
        // A clean capture clears any prior error; an error classification
        // re-establishes it from the offending line.
        state.error = if classified.is_error {
            Some(SessionErrorState {
                message: update.description.clone(),
                timestamp: now,
                recovery_attempts: 0,
            })
        } else {
            None
        };
        state.is_active = update.category.is_working();

        if state.health != SessionHealth::Active {
            state.health = SessionHealth::Active;
            events.push(MonitorEvent::HealthChanged {
                session_id: target.id.clone(),
                health: SessionHealth::Active,
            });
            if was_down {
                info!(target: "taskmux::monitor", "Session {} recovered", target.id);
                self.stats.lock().unwrap().recovered_errors += 1;
            }
        }

        let changed = state
            .last_known_status
            .as_ref()
            .map(|prev| update.differs_from(prev))
            .unwrap_or(true);
        if changed {
            debug!(
                target: "taskmux::monitor",
                "Session {} -> {:?}: {}", target.id, update.category, update.description
            );
            state.last_known_status = Some(update.clone());
            events.push(MonitorEvent::StatusChanged {
                session_id: target.id.clone(),
                update,
            });
        }
    }

    fn handle_capture_failure(
        &self,
        target: &SessionTarget,
        message: String,
        now: DateTime<Utc>,
        mechanism_failure: bool,
        events: &mut Vec<MonitorEvent>,
    ) {
        let mut state = self
            .states
            .entry(target.id.clone())
            .or_default();
        state.last_check = now;
        state.consecutive_failures += 1;

        let new_health = if state.consecutive_failures >= self.config.max_failures {
            SessionHealth::Offline
        } else {
            SessionHealth::Degraded
        };

        // Error state appears once the streak crosses the offline threshold;
        // classified errors set it from the capture path.
        if new_health == SessionHealth::Offline {
            match &mut state.error {
                Some(err) => err.recovery_attempts += 1,
                None => {
                    state.error = Some(SessionErrorState {
                        message: message.clone(),
                        timestamp: now,
                        recovery_attempts: 0,
                    });
                }
            }
        }

        if state.health != new_health {
            warn!(
                target: "taskmux::monitor",
                "Session {} is {:?} after {} failures: {}",
                target.id, new_health, state.consecutive_failures, message
            );
            state.health = new_health;
            events.push(MonitorEvent::HealthChanged {
                session_id: target.id.clone(),
                health: new_health,
            });
        }

        // Fallback synthesis: immediately when the capture mechanism as a
        // whole is down, otherwise once this session crosses the offline
        // threshold.
        if !mechanism_failure && new_health != SessionHealth::Offline {
            return;
        }

        let within_grace = state
            .last_successful_check
            .map(|t| now - t <= ChronoDuration::seconds(self.config.fallback_grace_secs as i64))
            .unwrap_or(false);

        if within_grace {
            if !state.fallback_mode {
                info!(
                    target: "taskmux::monitor",
                    "Session {} entering fallback on cached status", target.id
                );
                state.fallback_mode = true;
                self.stats.lock().unwrap().fallback_activations += 1;
            }
            // Keep the cached label but say it is stale, so subscribers can
            // tell a live status from a fallback one.
            if let Some(prev) = state.last_known_status.clone() {
                let base = prev.description.trim_end_matches(FALLBACK_NOTE);
                let update = StatusUpdate {
                    timestamp: now,
                    file_name: prev.file_name.clone(),
                    command: prev.command.clone(),
                    ..StatusUpdate::new(prev.category, format!("{}{}", base, FALLBACK_NOTE))
                };
                if update.differs_from(&prev) {
                    state.last_known_status = Some(update.clone());
                    events.push(MonitorEvent::StatusChanged {
                        session_id: target.id.clone(),
                        update,
                    });
                }
            }
            return;
        }

        state.fallback_mode = false;
        state.is_active = false;
        let update = StatusUpdate {
            timestamp: now,
            ..StatusUpdate::new(ActivityCategory::Idle, "Session unreachable")
        };
        let changed = state
            .last_known_status
            .as_ref()
            .map(|prev| update.differs_from(prev))
            .unwrap_or(true);
        if changed {
            state.last_known_status = Some(update.clone());
            events.push(MonitorEvent::StatusChanged {
                session_id: target.id.clone(),
                update,
            });
        }
    }

    /// Drop per-session error records older than the configured ceiling,
    /// resetting the failure streak so the session gets a fresh run-up to
    /// the offline threshold.
    fn prune_stale_errors(&self, now: DateTime<Utc>) {
        let max_age = ChronoDuration::seconds(self.config.error_max_age_secs as i64);
        for mut entry in self.states.iter_mut() {
            let stale = entry
                .error
                .as_ref()
                .map(|e| now - e.timestamp > max_age)
                .unwrap_or(false);
            if stale {
                entry.error = None;
                entry.consecutive_failures = 0;
            }
        }
    }

    fn record_tick_duration(&self, elapsed: Duration) {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut stats = self.stats.lock().unwrap();
        let ms = elapsed.as_secs_f64() * 1_000.0;
        stats.avg_check_duration_ms =
            (stats.avg_check_duration_ms * (ticks - 1) as f64 + ms) / ticks as f64;
    }

    /// Interval until the next tick, based on whether anything is working.
    pub fn next_interval(&self) -> Duration {
        let any_active = self.states.iter().any(|entry| entry.value().is_active);
        let ms = if any_active {
            self.active_interval_ms.load(Ordering::Relaxed)
        } else {
            self.idle_interval_ms.load(Ordering::Relaxed)
        };
        Duration::from_millis(ms)
    }

    /// Scale both intervals from the observed average tick duration.
    ///
    /// Slow ticks widen the cadence so polling never dominates the host;
    /// consistently fast ticks narrow it back toward the configured values.
    pub fn tune_intervals(&self) {
        let avg_ms = self.stats.lock().unwrap().avg_check_duration_ms;
        let factor = if avg_ms > self.config.tune_upper_ms {
            self.config.tune_factor
        } else if avg_ms < self.config.tune_lower_ms {
            1.0 / self.config.tune_factor
        } else {
            return;
        };

        for (interval, floor) in [
            (&self.active_interval_ms, self.config.active_interval_ms),
            (&self.idle_interval_ms, self.config.idle_interval_ms),
        ] {
            let current = interval.load(Ordering::Relaxed);
            let mut scaled = (current as f64 * factor) as u64;
            if factor < 1.0 {
                // Never tune below the configured baseline.
                scaled = scaled.max(floor);
            }
            let scaled = scaled.clamp(self.config.min_interval_ms, self.config.max_interval_ms);
            if scaled != current {
                debug!(
                    target: "taskmux::monitor",
                    "Tuned interval {} -> {}ms (avg tick {:.0}ms)", current, scaled, avg_ms
                );
                interval.store(scaled, Ordering::Relaxed);
            }
        }
    }

    /// Stop the polling loop after the current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll until `stop` is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(target: "taskmux::monitor", "Monitor loop started");
        while self.running.load(Ordering::SeqCst) {
            self.tick().await;
            self.tune_intervals();
            tokio::time::sleep(self.next_interval()).await;
        }
        info!(target: "taskmux::monitor", "Monitor loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Result, TaskmuxError};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Scripted driver: each session yields its queued captures in order,
    /// then repeats the last one.
    struct ScriptedDriver {
        scripts: Mutex<HashMap<String, Vec<Result<String>>>>,
    }

    impl ScriptedDriver {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
            }
        }

        fn push(&self, session: &str, result: Result<String>) {
            self.scripts
                .lock()
                .unwrap()
                .entry(session.to_string())
                .or_default()
                .push(result);
        }
    }

    impl SessionDriver for Arc<ScriptedDriver> {
        async fn capture(&self, target: &SessionTarget) -> Result<String> {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.entry(target.id.clone()).or_default();
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                match queue.first() {
                    Some(Ok(text)) => Ok(text.clone()),
                    Some(Err(_)) | None => Err(TaskmuxError::CaptureFailed {
                        target: target.pane.clone(),
                        message: "scripted failure".into(),
                    }),
                }
            }
        }

        async fn send_input(&self, _target: &SessionTarget, _input: &str) -> Result<()> {
            Ok(())
        }
    }

    fn quick_config() -> MonitorConfig {
        MonitorConfig {
            capture_retries: 0,
            capture_backoff_ms: 1,
            ..MonitorConfig::default()
        }
    }

    fn scheduler(driver: Arc<ScriptedDriver>) -> MonitorScheduler<Arc<ScriptedDriver>> {
        MonitorScheduler::new(driver, quick_config())
    }

    fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_identical_captures_broadcast_once() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push("s1", Ok("Running: cargo build\n".into()));
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));
        let mut rx = monitor.subscribe();

        monitor.tick().await;
        let first: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::StatusChanged { .. }))
            .collect();
        assert_eq!(first.len(), 1);

        // Unchanged screen: no new status event.
        monitor.tick().await;
        monitor.tick().await;
        let rest: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::StatusChanged { .. }))
            .collect();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_three_failures_marks_offline() {
        let driver = Arc::new(ScriptedDriver::new());
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));
        let mut rx = monitor.subscribe();

        monitor.tick().await;
        let state = monitor.session_state("s1").unwrap();
        assert_eq!(state.health, SessionHealth::Degraded);
        // A short streak is not yet an error condition.
        assert!(state.error.is_none());
        monitor.tick().await;
        monitor.tick().await;

        let state = monitor.session_state("s1").unwrap();
        assert_eq!(state.health, SessionHealth::Offline);
        assert_eq!(state.consecutive_failures, 3);
        assert!(state.error.is_some());

        let health_events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::HealthChanged { health, .. } => Some(health),
                _ => None,
            })
            .collect();
        assert_eq!(
            health_events,
            vec![SessionHealth::Degraded, SessionHealth::Offline]
        );

        // Never captured successfully, so no grace window applies and the
        // session is reported unreachable.
        assert_eq!(
            state.last_known_status.unwrap().description,
            "Session unreachable"
        );
    }

    #[tokio::test]
    async fn test_recovery_after_offline() {
        let driver = Arc::new(ScriptedDriver::new());
        for _ in 0..3 {
            driver.push(
                "s1",
                Err(TaskmuxError::CaptureFailed {
                    target: "w:0.0".into(),
                    message: "gone".into(),
                }),
            );
        }
        driver.push("s1", Ok("$ \n".into()));
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));

        for _ in 0..3 {
            monitor.tick().await;
        }
        assert_eq!(
            monitor.session_state("s1").unwrap().health,
            SessionHealth::Offline
        );

        monitor.tick().await;
        let state = monitor.session_state("s1").unwrap();
        assert_eq!(state.health, SessionHealth::Active);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.error.is_none());
        assert_eq!(monitor.stats().recovered_errors, 1);
    }

    #[tokio::test]
    async fn test_capture_outage_annotates_cached_status() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push("s1", Ok("Running: cargo build\n".into()));
        driver.push(
            "s1",
            Err(TaskmuxError::CaptureFailed {
                target: "w:0.0".into(),
                message: "tmux server gone".into(),
            }),
        );
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));
        let mut rx = monitor.subscribe();

        monitor.tick().await;
        drain(&mut rx);

        // Every capture failed this tick, but the last success is well
        // inside the grace window: the cached label survives with a
        // staleness note, and subscribers hear about it.
        monitor.tick().await;
        let state = monitor.session_state("s1").unwrap();
        assert!(state.fallback_mode);
        let status = state.last_known_status.clone().unwrap();
        assert_eq!(status.category, ActivityCategory::CommandExecution);
        assert!(status.description.starts_with("Running a command"));
        assert!(status.description.contains("capture failing"));
        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::StatusChanged { .. }))
            .collect();
        assert_eq!(statuses.len(), 1);

        // The note is stable across a continued outage.
        monitor.tick().await;
        assert!(
            drain(&mut rx)
                .iter()
                .all(|e| !matches!(e, MonitorEvent::StatusChanged { .. }))
        );
        assert_eq!(monitor.stats().fallback_activations, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_announced_once_per_message() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push("s1", Ok("You've been rate limited. Retry in 5 minutes\n".into()));
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));
        let mut rx = monitor.subscribe();

        monitor.tick().await;
        monitor.tick().await;
        let limits: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::RateLimitDetected { .. }))
            .collect();
        assert_eq!(limits.len(), 1);
    }

    #[tokio::test]
    async fn test_interval_follows_activity() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push("s1", Ok("Running: cargo build\n".into()));
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));

        // No tick yet: nothing active, idle cadence.
        assert_eq!(monitor.next_interval(), Duration::from_millis(15_000));

        monitor.tick().await;
        assert_eq!(monitor.next_interval(), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_stats_count_checks() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push("ok", Ok("hello\n".into()));
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("ok", "w:0.0"));
        monitor.add_session(SessionTarget::new("bad", "w:0.1"));

        monitor.tick().await;
        let stats = monitor.stats();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.successful_checks, 1);
        assert_eq!(stats.failed_checks, 1);
    }

    #[tokio::test]
    async fn test_remove_session_clears_state() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push("s1", Ok("hello\n".into()));
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));
        monitor.tick().await;
        assert!(monitor.session_state("s1").is_some());

        monitor.remove_session("s1");
        assert!(monitor.session_state("s1").is_none());
        assert!(monitor.recent_output("s1", 5).is_empty());
    }

    #[tokio::test]
    async fn test_manual_override_broadcasts_and_sticks() {
        let driver = Arc::new(ScriptedDriver::new());
        let monitor = scheduler(driver);
        monitor.add_session(SessionTarget::new("s1", "w:0.0"));
        let mut rx = monitor.subscribe();

        let forced = StatusUpdate::new(ActivityCategory::Coding, "Pairing manually");
        monitor.set_status("s1", forced.clone());

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [MonitorEvent::StatusChanged { session_id, update }]
                if session_id == "s1" && update.description == "Pairing manually"
        ));

        let state = monitor.session_state("s1").unwrap();
        assert!(state.is_active);
        assert_eq!(
            state.last_known_status.unwrap().category,
            ActivityCategory::Coding
        );

        // A later identical override still broadcasts.
        monitor.set_status("s1", forced);
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
