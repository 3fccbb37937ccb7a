//! Storage call policy: timeouts and retry with exponential backoff
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Initial delay
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Get delay for a specific retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // initial_delay * (multiplier ^ (attempt - 1)), capped
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi((attempt - 1) as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry an operation with exponential backoff
///
/// Only errors for which `KeyError::is_retryable` holds are retried; every
/// other error is returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut f: F) -> KeyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KeyResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt,
                        total_attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Storage call failed, retrying with exponential backoff"
                );
                sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = config.max_retries,
                        error = %e,
                        "Storage call failed after all retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Timeout and retry settings applied to every repository call
#[derive(Debug, Clone)]
pub struct StoragePolicy {
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl StoragePolicy {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self { timeout, retry }
    }

    /// Run a single storage call bounded by the timeout
    ///
    /// Used for writes: a timed-out write may still have been applied, so it
    /// is surfaced rather than retried.
    pub async fn write<Fut, T>(&self, operation: &str, fut: Fut) -> KeyResult<T>
    where
        Fut: Future<Output = KeyResult<T>>,
    {
        match timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(KeyError::StorageUnavailable(format!(
                "{} timed out after {} ms",
                operation,
                self.timeout.as_millis()
            ))),
        }
    }

    /// Run an idempotent storage read with timeout and bounded retries
    pub async fn read<F, Fut, T>(&self, operation: &str, mut f: F) -> KeyResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        retry_with_backoff(&self.retry, || self.write(operation, f())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let config =
            RetryConfig::new(5, Duration::from_millis(100), Duration::from_millis(350), 2.0);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_storage_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(2), 2.0);

        let result = retry_with_backoff(&config, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(KeyError::StorageUnavailable("connection reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(1), 1.0);

        let result: KeyResult<()> = retry_with_backoff(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(KeyError::StorageUnavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(KeyError::StorageUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: KeyResult<()> = retry_with_backoff(&RetryConfig::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(KeyError::Conflict("root v2 exists".into()))
        })
        .await;

        assert!(matches!(result, Err(KeyError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_storage_unavailable() {
        let policy = StoragePolicy::new(Duration::from_millis(10), RetryConfig::none());
        let result: KeyResult<()> = policy
            .write("commit", async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(KeyError::StorageUnavailable(_))));
    }
}
