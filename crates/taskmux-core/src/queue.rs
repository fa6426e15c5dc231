//! Task lifecycle engine.
//!
//! Sits between the persistent store and the monitored sessions: accepts
//! work, dispatches at most one task per pass to an idle session, finalizes
//! completions from session output, and pauses the whole queue while a
//! provider rate limit is in force.

use crate::capture::SessionDriver;
use crate::config::QueueConfig;
use crate::db::TaskStore;
use crate::monitor::MonitorEvent;
use crate::ratelimit::compute_resume_time;
use crate::{Result, TaskmuxError};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use taskmux_types::{RateLimitState, SessionTarget, Task, TaskError, TaskStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Task queue engine over a persistent store and a session driver.
pub struct TaskEngine<D: SessionDriver> {
    driver: D,
    store: TaskStore,
    config: QueueConfig,
    /// Cached copy of the persisted singleton rate-limit state.
    rate_limit: Mutex<RateLimitState>,
    /// Targets seen at dispatch time, keyed by session id, so completion
    /// scans can capture the right pane.
    sessions: DashMap<String, SessionTarget>,
}

impl<D: SessionDriver> TaskEngine<D> {
    /// Build the engine, restoring any persisted rate-limit condition so a
    /// cooldown survives restarts.
    pub fn new(driver: D, store: TaskStore, config: QueueConfig) -> Result<Self> {
        let rate_limit = store.load_rate_limit()?;
        if rate_limit.is_limited {
            info!(
                target: "taskmux::queue",
                "Restored rate-limit pause (retry at {:?})", rate_limit.next_retry_at
            );
        }
        Ok(Self {
            driver,
            store,
            config,
            rate_limit: Mutex::new(rate_limit),
            sessions: DashMap::new(),
        })
    }

    /// Submit a new pending task.
    pub fn submit(&self, title: impl Into<String>, description: impl Into<String>) -> Result<Task> {
        let task = Task::new(title, description);
        self.store.insert(&task)?;
        info!(target: "taskmux::queue", "Task {} submitted: {}", task.id, task.title);
        Ok(task)
    }

    pub fn get(&self, id: Uuid) -> Result<Task> {
        self.store.get(id)?.ok_or(TaskmuxError::TaskNotFound(id))
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        self.store.list()
    }

    /// Snapshot of the current rate-limit condition.
    pub fn rate_limit(&self) -> RateLimitState {
        self.rate_limit.lock().unwrap().clone()
    }

    /// Run one queue pass: finalize work whose completion marker is already
    /// on screen, settle the rate-limit gate, then dispatch at most one
    /// task to `idle_session` if one is available.
    ///
    /// Paused tasks outrank pending ones so work interrupted by a rate
    /// limit resumes before anything new starts. Returns the dispatched
    /// task, if any.
    pub async fn process_queue(
        &self,
        idle_session: Option<&SessionTarget>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        self.finalize_in_progress().await?;
        if self.gate_closed(now)? {
            return Ok(None);
        }
        let Some(session) = idle_session else {
            return Ok(None);
        };

        let candidate = {
            let paused = self.store.list_by_status(TaskStatus::Paused)?;
            match paused.into_iter().next() {
                Some(task) => Some((task, TaskStatus::Paused)),
                None => self
                    .store
                    .list_by_status(TaskStatus::Pending)?
                    .into_iter()
                    .next()
                    .map(|task| (task, TaskStatus::Pending)),
            }
        };
        let Some((mut task, from)) = candidate else {
            return Ok(None);
        };

        // The CAS guards against a concurrent pass claiming the same row.
        if !self
            .store
            .transition_status(task.id, from, TaskStatus::InProgress)?
        {
            return Ok(None);
        }

        task.status = TaskStatus::InProgress;
        task.assigned_to = Some(session.id.clone());
        task.paused_reason = None;
        task.updated_at = now;
        let task = self.store.update(&task)?;
        self.sessions.insert(session.id.clone(), session.clone());

        // A resumed task gets a resume instruction, not its original
        // briefing, so the session builds on whatever it already produced.
        let prompt = if from == TaskStatus::Paused {
            format!(
                "Resume task \"{}\": continue from the work already completed instead of starting over.",
                task.title
            )
        } else if task.description.is_empty() {
            task.title.clone()
        } else {
            task.description.clone()
        };
        if let Err(e) = self.driver.send_input(session, &prompt).await {
            warn!(
                target: "taskmux::queue",
                "Dispatch of {} to {} failed: {}", task.id, session.id, e
            );
            self.mark_failed(task.id, format!("dispatch failed: {}", e))?;
            return Err(e);
        }

        info!(
            target: "taskmux::queue",
            "Task {} dispatched to {}", task.id, session.id
        );
        Ok(Some(task))
    }

    /// Capture each assigned session and finalize any in-progress task whose
    /// completion marker is already visible. Capture failures here are not
    /// fatal; the monitor's health machine owns those.
    async fn finalize_in_progress(&self) -> Result<()> {
        for task in self.store.list_by_status(TaskStatus::InProgress)? {
            let Some(session_id) = task.assigned_to.clone() else {
                continue;
            };
            let Some(target) = self.sessions.get(&session_id).map(|t| t.value().clone()) else {
                continue;
            };
            match self.driver.capture(&target).await {
                Ok(output) => {
                    self.record_output(&session_id, &output)?;
                }
                Err(e) => debug!(
                    target: "taskmux::queue",
                    "Completion scan of {} failed: {}", session_id, e
                ),
            }
        }
        Ok(())
    }

    /// Whether the queue is currently held closed by a rate limit.
    ///
    /// An expired cooldown is cleared here, so resumption needs no separate
    /// timer.
    fn gate_closed(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.rate_limit.lock().unwrap();
        if !state.is_limited {
            return Ok(false);
        }
        if !state.is_expired(now) {
            return Ok(true);
        }
        info!(target: "taskmux::queue", "Rate-limit cooldown elapsed, resuming queue");
        // Persist first; the cache only takes states the store accepted.
        let mut cleared = state.clone();
        cleared.is_limited = false;
        cleared.paused_at = None;
        cleared.next_retry_at = None;
        self.store.save_rate_limit(&cleared)?;
        *state = cleared;
        Ok(false)
    }

    /// Check session output for the completion marker and finalize the
    /// session's in-progress task if present.
    pub fn record_output(&self, session_id: &str, output: &str) -> Result<Option<Task>> {
        if !output.contains(&self.config.completion_marker) {
            return Ok(None);
        }
        let in_progress = self.store.list_by_status(TaskStatus::InProgress)?;
        let Some(task) = in_progress
            .into_iter()
            .find(|t| t.assigned_to.as_deref() == Some(session_id))
        else {
            return Ok(None);
        };

        if !self
            .store
            .transition_status(task.id, TaskStatus::InProgress, TaskStatus::Completed)?
        {
            return Ok(None);
        }
        info!(
            target: "taskmux::queue",
            "Task {} completed by {}", task.id, session_id
        );
        Ok(Some(self.get(task.id)?))
    }

    /// Pause the queue for a rate limit. Idempotent: a second detection
    /// while already limited changes nothing.
    ///
    /// Returns whether this call applied the pause.
    pub fn pause_for_rate_limit(&self, message: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.rate_limit.lock().unwrap();
        if state.is_limited {
            return Ok(false);
        }
        let resume_at = compute_resume_time(message, now, self.config.rate_limit_fallback_mins);
        let mut paused = state.clone();
        paused.is_limited = true;
        paused.paused_at = Some(now);
        paused.next_retry_at = Some(resume_at);
        paused.retry_count += 1;
        paused.last_error_message = Some(message.to_string());
        self.store.save_rate_limit(&paused)?;
        *state = paused;
        drop(state);

        warn!(
            target: "taskmux::queue",
            "Queue paused for rate limit until {}: {}", resume_at, message
        );

        // Park in-flight work so it resumes ahead of pending tasks.
        for mut task in self.store.list_by_status(TaskStatus::InProgress)? {
            if self
                .store
                .transition_status(task.id, TaskStatus::InProgress, TaskStatus::Paused)?
            {
                task.status = TaskStatus::Paused;
                task.paused_reason = Some(message.to_string());
                task.updated_at = now;
                self.store.update(&task)?;
            }
        }
        Ok(true)
    }

    /// Manually lift a rate-limit pause before its deadline.
    pub fn clear_rate_limit(&self) -> Result<()> {
        let mut state = self.rate_limit.lock().unwrap();
        if !state.is_limited {
            return Ok(());
        }
        info!(target: "taskmux::queue", "Rate-limit pause cleared manually");
        let mut cleared = state.clone();
        cleared.is_limited = false;
        cleared.paused_at = None;
        cleared.next_retry_at = None;
        self.store.save_rate_limit(&cleared)?;
        *state = cleared;
        Ok(())
    }

    /// Record a failure. Appends to the task's error history and moves it
    /// to failed; terminal tasks reject the transition.
    pub fn mark_failed(&self, id: Uuid, reason: impl Into<String>) -> Result<Task> {
        let mut task = self.get(id)?;
        if task.status.is_terminal() {
            return Err(TaskmuxError::InvalidTransition {
                from: format!("{:?}", task.status),
                to: format!("{:?}", TaskStatus::Failed),
            });
        }
        let reason = reason.into();
        task.error_history.push(TaskError {
            timestamp: Utc::now(),
            reason: reason.clone(),
            retry_count_at_failure: task.retry_count,
        });
        task.status = TaskStatus::Failed;
        task.failure_reason = Some(reason);
        task.updated_at = Utc::now();
        self.store.update(&task)
    }

    /// Requeue a failed task. History and counters survive the retry.
    pub fn retry(&self, id: Uuid) -> Result<Task> {
        let mut task = self.get(id)?;
        if task.status != TaskStatus::Failed {
            return Err(TaskmuxError::InvalidTransition {
                from: format!("{:?}", task.status),
                to: format!("{:?}", TaskStatus::Pending),
            });
        }
        task.status = TaskStatus::Pending;
        task.failure_reason = None;
        task.assigned_to = None;
        task.retry_count += 1;
        task.updated_at = Utc::now();
        let task = self.store.update(&task)?;
        info!(
            target: "taskmux::queue",
            "Task {} requeued (retry {})", task.id, task.retry_count
        );
        Ok(task)
    }

    /// Cancel a task from any non-terminal state.
    pub fn cancel(&self, id: Uuid) -> Result<Task> {
        let mut task = self.get(id)?;
        if task.status.is_terminal() {
            return Err(TaskmuxError::InvalidTransition {
                from: format!("{:?}", task.status),
                to: format!("{:?}", TaskStatus::Cancelled),
            });
        }
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        self.store.update(&task)
    }

    /// In-progress tasks with no progress for the configured window.
    ///
    /// Reported only; stuck work is never force-cancelled.
    pub fn stuck_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let ceiling = Duration::seconds(self.config.stuck_task_secs as i64);
        let stuck: Vec<Task> = self
            .store
            .list_by_status(TaskStatus::InProgress)?
            .into_iter()
            .filter(|t| now - t.updated_at > ceiling)
            .collect();
        for task in &stuck {
            warn!(
                target: "taskmux::queue",
                "Task {} appears stuck on {:?} since {}",
                task.id, task.assigned_to, task.updated_at
            );
        }
        Ok(stuck)
    }

    /// React to a monitor event. Only throttle detections matter here;
    /// status traffic is for UIs.
    pub fn handle_event(&self, event: &MonitorEvent, now: DateTime<Utc>) -> Result<()> {
        if let MonitorEvent::RateLimitDetected { message, .. } = event {
            self.pause_for_rate_limit(message, now)?;
        }
        Ok(())
    }
}
