//! Retry engine: runs an operation under a backoff policy.
//!
//! The engine never logs on its own. Every retry and the final give-up are
//! reported to an injected [`RetryReporter`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ClassifiedError, ErrorCode, ErrorKind, Result};

/// Attempts for recoverable work, which retries immediately.
pub const RECOVERABLE_ATTEMPTS: u32 = 3;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 32_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Reject values the builders would never produce, such as a negative
    /// jitter or a shrinking multiplier read from a config file.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, value: f64, expected: &str| {
            ClassifiedError::fatal(
                ErrorCode::InvalidConfig,
                format!("retry {} is {}, expected {}", field, value, expected),
            )
            .with_context("field", field)
        };
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid("jitter", self.jitter, "a fraction between 0 and 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("multiplier", self.multiplier, "a finite value of at least 1"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(invalid(
                "initial_delay_ms",
                self.initial_delay_ms as f64,
                "no more than max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry as i32);
        let millis = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Delay before retry number `retry`, with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.jitter.min(1.0);
        if jitter.is_nan() || jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + factor)).max(0.0))
    }
}

/// Receives retry progress. Implementations decide where it goes.
pub trait RetryReporter: Send + Sync {
    /// `attempt` failed and will be retried after `delay`.
    fn on_retry(&self, attempt: u32, delay: Duration, error: &ClassifiedError);

    /// `attempts` were made and the last failure is final.
    fn on_give_up(&self, attempts: u32, error: &ClassifiedError);
}

/// Forwards retry reports to `tracing`.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    operation: String,
}

impl TracingReporter {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
        }
    }
}

impl RetryReporter for TracingReporter {
    fn on_retry(&self, attempt: u32, delay: Duration, error: &ClassifiedError) {
        tracing::warn!(
            operation = %self.operation,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            code = %error.code,
            "Attempt failed, retrying: {}",
            error.message
        );
    }

    fn on_give_up(&self, attempts: u32, error: &ClassifiedError) {
        tracing::error!(
            operation = %self.operation,
            attempts = attempts,
            code = %error.code,
            "Giving up: {}",
            error.message
        );
    }
}

/// Discards reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentReporter;

impl RetryReporter for SilentReporter {
    fn on_retry(&self, _attempt: u32, _delay: Duration, _error: &ClassifiedError) {}
    fn on_give_up(&self, _attempts: u32, _error: &ClassifiedError) {}
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the retry budget is spent.
///
/// The operation receives the 1-based attempt number. Retryable errors wait
/// out the backoff for up to `policy.max_retries` retries, fewer when the
/// error declares its own ceiling. Recoverable errors retry at once, at most three
/// attempts in total. The error returned on give-up carries the retry count
/// and a `retry_history` context entry.
pub async fn execute_with_retry<T, F, Fut, P>(
    mut operation: F,
    is_retryable: P,
    policy: &RetryPolicy,
    reporter: &dyn RetryReporter,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&ClassifiedError) -> bool,
{
    let mut history = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retries_so_far = attempt - 1;
        let budget = match err.kind {
            ErrorKind::Retryable { max_retries } => max_retries
                .map_or(policy.max_retries, |own| own.min(policy.max_retries)),
            ErrorKind::Recoverable => (RECOVERABLE_ATTEMPTS - 1).min(policy.max_retries),
            ErrorKind::Fatal => 0,
        };
        history.push(json!({
            "attempt": attempt,
            "code": err.code,
            "message": err.message,
            "at": err.timestamp,
        }));

        if !is_retryable(&err) || retries_so_far >= budget {
            reporter.on_give_up(attempt, &err);
            return Err(err
                .with_retry_count(retries_so_far)
                .with_context("retry_history", &history));
        }

        let delay = if err.is_recoverable() {
            Duration::ZERO
        } else {
            policy.delay_for(retries_so_far)
        };
        reporter.on_retry(attempt, delay, &err);
        tokio::time::sleep(delay).await;
    }
}

/// Recoverable-class work: immediate retries, bounded at three attempts.
pub async fn execute_recoverable<T, F, Fut>(operation: F, reporter: &dyn RetryReporter) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_with_retry(
        operation,
        ClassifiedError::is_recoverable,
        &RetryPolicy::immediate(RECOVERABLE_ATTEMPTS - 1),
        reporter,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingReporter {
        retries: Mutex<Vec<(u32, Duration)>>,
        gave_up: Mutex<Option<u32>>,
    }

    impl RetryReporter for RecordingReporter {
        fn on_retry(&self, attempt: u32, delay: Duration, _error: &ClassifiedError) {
            self.retries.lock().unwrap().push((attempt, delay));
        }

        fn on_give_up(&self, attempts: u32, _error: &ClassifiedError) {
            *self.gave_up.lock().unwrap() = Some(attempts);
        }
    }

    fn rate_limited() -> ClassifiedError {
        ClassifiedError::retryable(ErrorCode::WorkerRateLimited, "429 too many requests")
    }

    #[test]
    fn test_default_base_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(10), Duration::from_millis(32_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis();
            assert!((1599..=2401).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::immediate(5).validate().is_ok());

        let negative = RetryPolicy {
            jitter: -0.5,
            ..RetryPolicy::default()
        };
        assert_eq!(negative.validate().unwrap_err().code, ErrorCode::InvalidConfig);

        let nan = RetryPolicy {
            jitter: f64::NAN,
            ..RetryPolicy::default()
        };
        assert!(nan.validate().is_err());
        assert_eq!(nan.delay_for(1), nan.base_delay(1));

        let shrinking = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_four_attempts() {
        let calls = AtomicU32::new(0);
        let reporter = RecordingReporter::default();
        let policy = RetryPolicy::default().with_jitter(0.0);
        let start = Instant::now();

        let result: Result<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            },
            ClassifiedError::is_retryable,
            &policy,
            &reporter,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.retry_count, 3);
        assert_eq!(err.context["retry_history"].as_array().unwrap().len(), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(7000));

        let retries = reporter.retries.lock().unwrap().clone();
        assert_eq!(
            retries,
            vec![
                (1, Duration::from_millis(1000)),
                (2, Duration::from_millis(2000)),
                (3, Duration::from_millis(4000)),
            ]
        );
        assert_eq!(*reporter.gave_up.lock().unwrap(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let reporter = RecordingReporter::default();
        let value = execute_with_retry(
            |attempt| async move {
                if attempt < 3 {
                    Err(rate_limited())
                } else {
                    Ok(attempt)
                }
            },
            ClassifiedError::is_retryable,
            &RetryPolicy::default(),
            &reporter,
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(reporter.retries.lock().unwrap().len(), 2);
        assert!(reporter.gave_up.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::fatal(ErrorCode::WorkerAuth, "401")) }
            },
            ClassifiedError::is_retryable,
            &RetryPolicy::default(),
            &SilentReporter,
        )
        .await;

        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_budget_caps_policy() {
        let calls = AtomicU32::new(0);
        let _: Result<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ClassifiedError::retryable_with(
                        ErrorCode::WorkerUnavailable,
                        "503",
                        1,
                    ))
                }
            },
            ClassifiedError::is_retryable,
            &RetryPolicy::default(),
            &SilentReporter,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_budget_above_default_is_honoured() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            },
            ClassifiedError::is_retryable,
            &RetryPolicy::immediate(5),
            &SilentReporter,
        )
        .await;

        assert_eq!(result.unwrap_err().retry_count, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_skips_backoff_in_general_engine() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::recoverable(ErrorCode::LockContention, "locked")) }
            },
            |e: &ClassifiedError| !e.is_fatal(),
            &RetryPolicy::default(),
            &SilentReporter,
        )
        .await;

        assert_eq!(result.unwrap_err().retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), RECOVERABLE_ATTEMPTS);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_retries_immediately() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = execute_recoverable(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::recoverable(ErrorCode::Io, "locked")) }
            },
            &SilentReporter,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
