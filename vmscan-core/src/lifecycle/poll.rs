use std::future::Future;

use crate::config::PollPolicy;
use crate::error::Result;

/// Result of a bounded poll loop.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Call `check` until it yields a value, at most `policy.max_attempts` times.
///
/// `check` receives the 1-based attempt number. `Ok(None)` means "not yet" and
/// sleeps `policy.interval()` before the next attempt; an error ends the loop
/// immediately.
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, mut check: F) -> Result<PollOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = check(attempt).await? {
            return Ok(PollOutcome::Ready { value, attempts: attempt });
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval()).await;
        }
    }

    Ok(PollOutcome::Exhausted { attempts: policy.max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_attempt() {
        let policy = PollPolicy::new(Duration::from_secs(5), 10);
        let start = Instant::now();

        let outcome = poll_until(&policy, |attempt| async move {
            Ok((attempt == 3).then_some("up"))
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready { value: "up", attempts: 3 });
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_does_not_sleep_after_last_attempt() {
        let policy = PollPolicy::new(Duration::from_secs(5), 100);
        let start = Instant::now();
        let mut calls = 0;

        let outcome: PollOutcome<()> = poll_until(&policy, |_| {
            calls += 1;
            async { Ok(None) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 100 });
        assert_eq!(calls, 100);
        assert_eq!(start.elapsed(), policy.budget());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_stops_polling() {
        let policy = PollPolicy::new(Duration::from_secs(1), 10);
        let mut calls = 0;

        let result: Result<PollOutcome<()>> = poll_until(&policy, |attempt| {
            calls += 1;
            async move {
                if attempt == 2 {
                    Err(ScanError::Remote { reason: "gone".into() })
                } else {
                    Ok(None)
                }
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
