use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Pause before retry number `attempt` (0-based): doubles up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug)]
pub enum StepError<E> {
    TimedOut(Duration),
    Failed(E),
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for StepError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::TimedOut(d) => write!(f, "timed out after {:?}", d),
            StepError::Failed(e) => write!(f, "{}", e),
            StepError::Panicked(msg) => write!(f, "collaborator panicked: {}", msg),
        }
    }
}

/// Run a blocking collaborator call on the blocking pool with a timeout,
/// retrying transient failures and timeouts per `policy`.
///
/// A timed-out call keeps its blocking thread until it returns on its own;
/// the worker moves on regardless.
pub async fn call_blocking<T, E, F>(
    policy: &RetryPolicy,
    limit: Duration,
    is_transient: fn(&E) -> bool,
    op: F,
) -> Result<T, StepError<E>>
where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn() -> Result<T, E> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let mut attempt = 0;

    loop {
        let call = op.clone();
        let result = timeout(limit, tokio::task::spawn_blocking(move || call())).await;

        let err = match result {
            Ok(Ok(Ok(value))) => return Ok(value),
            Ok(Ok(Err(e))) => StepError::Failed(e),
            Ok(Err(join)) => return Err(StepError::Panicked(join.to_string())),
            Err(_) => StepError::TimedOut(limit),
        };

        let retryable = match &err {
            StepError::TimedOut(_) => true,
            StepError::Failed(e) => is_transient(e),
            StepError::Panicked(_) => false,
        };

        attempt += 1;
        if !retryable || attempt >= policy.max_attempts {
            return Err(err);
        }

        tracing::debug!(attempt, "Retrying collaborator call");
        sleep(policy.backoff(attempt - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, StepError<bool>> = call_blocking(
            &policy(3),
            Duration::from_secs(5),
            |transient| *transient,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(true)
                } else {
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StepError<bool>> = call_blocking(
            &policy(3),
            Duration::from_secs(5),
            |transient| *transient,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(false)
            },
        )
        .await;

        assert!(matches!(result, Err(StepError::Failed(false))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let result: Result<(), StepError<bool>> = call_blocking(
            &policy(2),
            Duration::from_millis(20),
            |_| false,
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(StepError::TimedOut(_))));
    }
}
