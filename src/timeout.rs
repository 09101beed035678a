//! Per-task timeout.
//!
//! The deadline covers step execution only: it starts after the workspace
//! has been provisioned and is checked by the process supervisor between
//! polls. Cache lookups, provisioning and diffing are not counted.

use std::time::{Duration, Instant};

/// Default per-task timeout (60 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Upper bound for a configured timeout (one day).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeoutValidationError {
    #[error("timeout must be in (0s, 86400s], got {value:?}")]
    OutOfBounds { value: Duration },
}

/// Validated per-task timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTimeout {
    duration: Duration,
}

impl Default for TaskTimeout {
    fn default() -> Self {
        Self {
            duration: DEFAULT_TIMEOUT,
        }
    }
}

impl TaskTimeout {
    pub fn new(duration: Duration) -> Result<Self, TimeoutValidationError> {
        if duration.is_zero() || duration > MAX_TIMEOUT {
            return Err(TimeoutValidationError::OutOfBounds { value: duration });
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Start the clock.
    pub fn start(&self) -> Deadline {
        Deadline::after(self.duration)
    }
}

/// Deadline check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineStatus {
    Ok,
    Expired,
}

impl DeadlineStatus {
    pub fn is_expired(&self) -> bool {
        matches!(self, DeadlineStatus::Expired)
    }
}

/// A running deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    limit: Duration,
    start: Instant,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            limit,
            start: Instant::now(),
        }
    }

    pub fn check(&self) -> DeadlineStatus {
        if self.start.elapsed() > self.limit {
            DeadlineStatus::Expired
        } else {
            DeadlineStatus::Ok
        }
    }

    /// The configured duration, reported in timeout errors.
    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_default_timeout() {
        assert_eq!(TaskTimeout::default().duration(), Duration::from_secs(3600));
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(matches!(
            TaskTimeout::new(Duration::ZERO),
            Err(TimeoutValidationError::OutOfBounds { .. })
        ));
        assert!(TaskTimeout::new(Duration::from_secs(86_401)).is_err());
        assert!(TaskTimeout::new(Duration::from_secs(86_400)).is_ok());
        assert!(TaskTimeout::new(Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = TaskTimeout::new(Duration::from_millis(50)).unwrap().start();
        assert_eq!(deadline.check(), DeadlineStatus::Ok);
        assert!(deadline.remaining() <= Duration::from_millis(50));

        sleep(Duration::from_millis(80));
        assert!(deadline.check().is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert_eq!(deadline.limit(), Duration::from_millis(50));
    }
}
