//! Health of the periodic loops.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use kraftsync_core::Error;

/// Status of one periodic loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    /// Loop name
    pub name: &'static str,
    /// Completed runs, successful or not
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Records run outcomes for one loop.
#[derive(Debug)]
pub struct LoopTracker {
    status: Mutex<LoopStatus>,
}

impl LoopTracker {
    pub fn new(name: &'static str) -> Self {
        Self {
            status: Mutex::new(LoopStatus {
                name,
                runs: 0,
                last_run: None,
                last_success: None,
                consecutive_failures: 0,
                last_error: None,
            }),
        }
    }

    pub fn record_success(&self) {
        let now = Utc::now();
        let mut status = self.status.lock();
        status.runs += 1;
        status.last_run = Some(now);
        status.last_success = Some(now);
        status.consecutive_failures = 0;
        status.last_error = None;
    }

    pub fn record_failure(&self, error: &Error) {
        let mut status = self.status.lock();
        status.runs += 1;
        status.last_run = Some(Utc::now());
        status.consecutive_failures += 1;
        status.last_error = Some(error.to_string());
    }

    pub fn status(&self) -> LoopStatus {
        self.status.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_reset_on_success() {
        let tracker = LoopTracker::new("telemetry");
        tracker.record_failure(&Error::NetworkTransient("timeout".into()));
        tracker.record_failure(&Error::NetworkTransient("timeout".into()));
        let status = tracker.status();
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_success.is_none());
        assert!(status.last_error.unwrap().contains("timeout"));

        tracker.record_success();
        let status = tracker.status();
        assert_eq!(status.runs, 3);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        assert!(status.last_success.is_some());
    }
}
