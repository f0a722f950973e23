use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::HarvestError;

/// Fixed-delay retry budget shared by metadata listing and both transfer protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds, the error is not retryable, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub fn run<T, F, P>(&self, label: &str, mut op: F, is_retryable: P) -> Result<T, HarvestError>
    where
        F: FnMut(usize) -> Result<T, HarvestError>,
        P: Fn(&HarvestError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1usize;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }
                    warn!(
                        target: "retry",
                        "{label}: attempt {attempt}/{max_attempts} failed: {err}"
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Retries only errors classified as transient.
    pub fn run_transient<T, F>(&self, label: &str, op: F) -> Result<T, HarvestError>
    where
        F: FnMut(usize) -> Result<T, HarvestError>,
    {
        self.run(label, op, HarvestError::is_transient)
    }

    /// Retries every error.
    pub fn run_any<T, F>(&self, label: &str, op: F) -> Result<T, HarvestError>
    where
        F: FnMut(usize) -> Result<T, HarvestError>,
    {
        self.run(label, op, |_| true)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn quick(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO)
    }

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let result = quick(3).run_transient("listing", |_| {
            calls += 1;
            if calls < 3 {
                Err(HarvestError::SearchStatus {
                    status: 503,
                    message: "busy".to_string(),
                })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = quick(5).run_transient("listing", |_| {
            calls += 1;
            Err(HarvestError::SearchDecode("bad json".to_string()))
        });
        assert_matches!(result, Err(HarvestError::SearchDecode(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let mut calls = 0;
        let result: Result<(), _> = quick(3).run_any("opendap", |attempt| {
            calls += 1;
            Err(HarvestError::QueryProtocol(format!("attempt {attempt}")))
        });
        assert_matches!(result, Err(HarvestError::QueryProtocol(msg)) if msg == "attempt 3");
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _ = quick(0).run_any::<(), _>("once", |_| {
            calls += 1;
            Err(HarvestError::QueryProtocol("no".to_string()))
        });
        assert_eq!(calls, 1);
    }
}
