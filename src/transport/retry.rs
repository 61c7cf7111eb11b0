//! Exponential-backoff retry around any [`Transport`].

use std::time::Duration;

use super::{TransferRequest, Transport, TransportError, TransportFuture, TransportKind};

/// Retry budget and backoff curve for transient transfer failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (zero-based), doubling each time
    /// and clamped to [`RetryPolicy::max_delay`].
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Decorator retrying [`TransportError::Transient`] failures.
///
/// Other errors are returned after the first attempt.
#[derive(Clone, Debug)]
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingTransport<T> {
    /// Wraps `inner` with `policy`.
    pub const fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped transport.
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    async fn perform(
        &self,
        request: TransferRequest<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut attempt = 0_u32;
        loop {
            match self.inner.execute(request.clone()).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        url = request.url,
                        transport = self.inner.kind().as_str(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transfer failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<T: Transport> Transport for RetryingTransport<T> {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        Box::pin(self.perform(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FlakyTransport;
    use rstest::rstest;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[rstest]
    #[case(0, Duration::from_millis(500))]
    #[case(1, Duration::from_secs(1))]
    #[case(3, Duration::from_secs(4))]
    #[case(10, Duration::from_secs(30))]
    #[case(40, Duration::from_secs(30))]
    fn delay_doubles_and_clamps(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(RetryPolicy::default().delay_for(attempt), expected);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 2)]
    #[tokio::test]
    async fn succeeds_when_failures_fit_budget(#[case] failures: u32, #[case] retries: u32) {
        let flaky = FlakyTransport::failing_times(failures);
        let transport = RetryingTransport::new(flaky.clone(), fast_policy(retries));

        let body = transport
            .execute(TransferRequest::download("http://h/f"))
            .await
            .expect("transfer should eventually succeed");

        assert_eq!(body, Some(b"payload".to_vec()));
        assert_eq!(flaky.attempts(), failures + 1);
    }

    #[rstest]
    #[tokio::test]
    async fn gives_up_after_budget_with_last_error() {
        let flaky = FlakyTransport::failing_times(5);
        let transport = RetryingTransport::new(flaky.clone(), fast_policy(2));

        let err = transport
            .execute(TransferRequest::download("http://h/f"))
            .await
            .expect_err("budget should be exhausted");

        assert!(err.is_retryable());
        assert!(err.to_string().contains("attempt 3"), "{err}");
        assert_eq!(flaky.attempts(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn backend_unavailable_is_not_retried() {
        let flaky = FlakyTransport::unavailable();
        let transport = RetryingTransport::new(flaky.clone(), fast_policy(4));

        let err = transport
            .execute(TransferRequest::download("http://h/f"))
            .await
            .expect_err("unavailable backend should fail");

        assert!(err.is_backend_unavailable());
        assert_eq!(flaky.attempts(), 1);
    }
}
