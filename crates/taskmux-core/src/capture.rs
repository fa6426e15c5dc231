//! Session output capture.
//!
//! The monitor depends on a narrow two-operation collaborator: read a
//! session's currently visible text, and deliver literal input to it.
//! `TmuxDriver` implements it over the tmux CLI; tests substitute their own
//! drivers.

use crate::{Result, TaskmuxError};
use std::time::Duration;
use taskmux_types::SessionTarget;
use tracing::{debug, warn};

/// Narrow capability the monitor and queue need from the terminal layer.
pub trait SessionDriver: Send + Sync + 'static {
    /// Capture the currently visible text of a session.
    fn capture(
        &self,
        target: &SessionTarget,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Deliver literal input to a session, followed by a carriage return.
    fn send_input(
        &self,
        target: &SessionTarget,
        input: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Drives sessions through the tmux CLI.
#[derive(Debug, Clone, Default)]
pub struct TmuxDriver;

impl TmuxDriver {
    pub fn new() -> Self {
        Self
    }

    async fn run_tmux(&self, target: &SessionTarget, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| TaskmuxError::CaptureFailed {
                target: target.pane.clone(),
                message: format!("failed to spawn tmux: {}", e),
            })?;

        if !output.status.success() {
            return Err(TaskmuxError::CaptureFailed {
                target: target.pane.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl SessionDriver for TmuxDriver {
    async fn capture(&self, target: &SessionTarget) -> Result<String> {
        self.run_tmux(target, &["capture-pane", "-p", "-t", &target.pane])
            .await
    }

    async fn send_input(&self, target: &SessionTarget, input: &str) -> Result<()> {
        // Literal text first so tmux never interprets the payload as key
        // names, then the newline as a separate key press.
        self.run_tmux(target, &["send-keys", "-t", &target.pane, "-l", input])
            .await
            .map_err(|e| TaskmuxError::InputFailed {
                target: target.pane.clone(),
                message: e.to_string(),
            })?;
        self.run_tmux(target, &["send-keys", "-t", &target.pane, "Enter"])
            .await
            .map_err(|e| TaskmuxError::InputFailed {
                target: target.pane.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Capture with a short timeout and a small fixed retry budget.
///
/// Never blocks past `timeout × (retries + 1)` plus backoff; both unreachable
/// panes and timeouts come back as capture errors for the scheduler to count.
pub async fn capture_with_retry<D: SessionDriver>(
    driver: &D,
    target: &SessionTarget,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
) -> Result<String> {
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
        }

        match tokio::time::timeout(timeout, driver.capture(target)).await {
            Ok(Ok(text)) => {
                if attempt > 0 {
                    debug!(
                        target: "taskmux::capture",
                        "Capture for {} succeeded on retry {}",
                        target.id, attempt
                    );
                }
                return Ok(text);
            }
            Ok(Err(e)) => {
                warn!(
                    target: "taskmux::capture",
                    "Capture attempt {} for {} failed: {}",
                    attempt + 1, target.id, e
                );
                last_err = Some(e);
            }
            Err(_) => {
                warn!(
                    target: "taskmux::capture",
                    "Capture attempt {} for {} timed out after {}s",
                    attempt + 1, target.id, timeout.as_secs()
                );
                last_err = Some(TaskmuxError::CaptureTimeout {
                    target: target.pane.clone(),
                    seconds: timeout.as_secs(),
                });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TaskmuxError::CaptureFailed {
        target: target.pane.clone(),
        message: "no capture attempts made".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyDriver {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl SessionDriver for FlakyDriver {
        async fn capture(&self, target: &SessionTarget) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(TaskmuxError::CaptureFailed {
                    target: target.pane.clone(),
                    message: "pane gone".into(),
                })
            } else {
                Ok("visible text".into())
            }
        }

        async fn send_input(&self, _target: &SessionTarget, _input: &str) -> Result<()> {
            Ok(())
        }
    }

    struct HangingDriver;

    impl SessionDriver for HangingDriver {
        async fn capture(&self, _target: &SessionTarget) -> Result<String> {
            std::future::pending().await
        }

        async fn send_input(&self, _target: &SessionTarget, _input: &str) -> Result<()> {
            Ok(())
        }
    }

    fn target() -> SessionTarget {
        SessionTarget::new("s1", "agents:0.1")
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let driver = Arc::new(FlakyDriver {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let text = capture_with_retry(
            driver.as_ref(),
            &target(),
            Duration::from_secs(1),
            2,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(text, "visible text");
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let driver = FlakyDriver {
            calls: AtomicU32::new(0),
            fail_first: 10,
        };
        let err = capture_with_retry(
            &driver,
            &target(),
            Duration::from_secs(1),
            2,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_capture_fault());
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_bounds_hanging_capture() {
        let err = capture_with_retry(
            &HangingDriver,
            &target(),
            Duration::from_millis(20),
            1,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskmuxError::CaptureTimeout { .. }));
    }
}
