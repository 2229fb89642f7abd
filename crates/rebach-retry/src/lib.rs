//! Bounded fixed-wait retry harness for rebach's remote calls.
//!
//! Every call to the catalog, the final preservation registry, or the staging
//! store goes through [`RetryPolicy::run`]: at most `max_tries` invocations
//! with exactly `wait` between them. There is deliberately no backoff or
//! jitter; the wait is constant so operators can predict run length from the
//! config alone.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rebach_retry::{AttemptError, RetryPolicy};
//!
//! let policy = RetryPolicy { max_tries: 3, wait: Duration::ZERO };
//! let result: Result<&str, _> = policy.run(|attempt| {
//!     if attempt < 2 {
//!         Err(AttemptError::transient(anyhow::anyhow!("connection reset")))
//!     } else {
//!         Ok("fetched")
//!     }
//! });
//! assert_eq!(result.unwrap(), "fetched");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a failed attempt.
///
/// `Transient` failures are retried until the policy is exhausted;
/// `Fatal` failures surface immediately (the entity is missing or the
/// request can never succeed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth another try: timeouts, connection resets, 5xx responses.
    #[default]
    Transient,
    /// Retrying cannot help: the entity does not exist or access is denied.
    Fatal,
}

/// Classify an HTTP status code for retry purposes.
///
/// 404 means the entity is gone and 403 means we will never be allowed in;
/// everything else that reaches this function (5xx, unexpected 3xx/4xx) is
/// treated as transient by default.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        404 | 403 => ErrorClass::Fatal,
        _ => ErrorClass::Transient,
    }
}

/// A failed attempt: the underlying error plus its retry classification.
#[derive(Debug)]
pub struct AttemptError {
    pub class: ErrorClass,
    pub error: anyhow::Error,
}

impl AttemptError {
    pub fn transient(error: anyhow::Error) -> Self {
        Self {
            class: ErrorClass::Transient,
            error,
        }
    }

    pub fn fatal(error: anyhow::Error) -> Self {
        Self {
            class: ErrorClass::Fatal,
            error,
        }
    }

    /// Build from an HTTP status code and a message.
    pub fn from_status(status: u16, error: anyhow::Error) -> Self {
        Self {
            class: classify_http_status(status),
            error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for AttemptError {}

/// Retry configuration for one remote service.
///
/// Mirrors the `retries` / `retries_wait` pair each config section carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of invocations, including the first.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// Fixed wait between invocations; also the per-attempt deadline.
    #[serde(default = "default_wait")]
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
}

fn default_max_tries() -> u32 {
    3
}

fn default_wait() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            wait: default_wait(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_tries: u32, wait: Duration) -> Self {
        Self { max_tries, wait }
    }

    /// Execute `op` until it succeeds, fails fatally, or the try budget is
    /// spent. The closure receives the 1-indexed attempt number. The last
    /// error is returned on exhaustion.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, AttemptError>
    where
        F: FnMut(u32) -> Result<T, AttemptError>,
    {
        let max_tries = self.max_tries.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if attempt >= max_tries {
                        return Err(e);
                    }
                    std::thread::sleep(self.wait);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn success_on_first_try() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result = policy.run(|_| Ok::<_, AttemptError>("ok"));
        assert_eq!(result.unwrap(), "ok");
    }

    #[test]
    fn success_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut seen = 0;
        let result = policy.run(|attempt| {
            seen = attempt;
            if attempt < 3 {
                Err(AttemptError::transient(anyhow::anyhow!("reset")))
            } else {
                Ok("ok")
            }
        });
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(seen, 3);
    }

    #[test]
    fn exhaustion_surfaces_last_error() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut attempts = 0;
        let result: Result<(), _> = policy.run(|attempt| {
            attempts = attempt;
            Err(AttemptError::transient(anyhow::anyhow!(
                "failure {attempt}"
            )))
        });
        let err = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert!(err.to_string().contains("failure 3"));
    }

    #[test]
    fn fatal_error_short_circuits() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30));
        let mut attempts = 0;
        let result: Result<(), _> = policy.run(|attempt| {
            attempts = attempt;
            Err(AttemptError::fatal(anyhow::anyhow!("missing")))
        });
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn zero_tries_still_invokes_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let mut attempts = 0;
        let _: Result<(), _> = policy.run(|attempt| {
            attempts = attempt;
            Err(AttemptError::transient(anyhow::anyhow!("nope")))
        });
        assert_eq!(attempts, 1);
    }

    #[test]
    fn attempts_are_spaced_by_the_configured_wait() {
        let wait = Duration::from_millis(40);
        let policy = RetryPolicy::new(3, wait);
        let start = Instant::now();
        let _: Result<(), _> =
            policy.run(|_| Err(AttemptError::transient(anyhow::anyhow!("500"))));
        let elapsed = start.elapsed();

        // Two waits between three attempts; the lower bound is strict, the
        // upper bound leaves room for scheduler overshoot.
        assert!(elapsed >= wait.mul_f64(2.0 * 0.9), "elapsed {elapsed:?}");
        assert!(elapsed < wait.mul_f64(2.0 * 3.0), "elapsed {elapsed:?}");
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(404), ErrorClass::Fatal);
        assert_eq!(classify_http_status(403), ErrorClass::Fatal);
        assert_eq!(classify_http_status(500), ErrorClass::Transient);
        assert_eq!(classify_http_status(503), ErrorClass::Transient);
        assert_eq!(classify_http_status(429), ErrorClass::Transient);
    }

    #[test]
    fn policy_serde_round_trip() {
        let json = r#"{"max_tries": 4, "wait": "15s"}"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.max_tries, 4);
        assert_eq!(policy.wait, Duration::from_secs(15));
    }
}
