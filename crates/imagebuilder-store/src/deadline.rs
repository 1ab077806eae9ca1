use crate::StoreError;
use std::time::{Duration, Instant};

/// Absolute point in time by which a store call must finish.
///
/// Derived once from the caller's timeout and threaded through every store
/// call of a build, so the whole build shares one budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
            budget: timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Fail with [`StoreError::Timeout`] once the deadline has passed.
    pub fn check(&self, op: &'static str, key: &str) -> Result<(), StoreError> {
        if self.is_expired() {
            return Err(StoreError::Timeout {
                op,
                key: key.to_owned(),
                timeout: self.budget,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deadline_passes_check() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.is_expired());
        assert!(d.remaining() > Duration::from_secs(50));
        d.check("exists", "k").unwrap();
    }

    #[test]
    fn zero_deadline_times_out() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Duration::ZERO);
        match d.check("upload", "Store/A") {
            Err(StoreError::Timeout { op, key, timeout }) => {
                assert_eq!(op, "upload");
                assert_eq!(key, "Store/A");
                assert_eq!(timeout, Duration::ZERO);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
