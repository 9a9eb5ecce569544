use std::time::Duration;

use futures::Future;
use tracing::warn;

use tutti_core::ensemble::{Backoff, RetryPolicy};
use tutti_core::error::{Result, TuttiError};
use tutti_core::types::UnitOutput;

/// Delay before the retry following `attempt` (0-based).
///
/// fixed: initial; linear: initial × (attempt + 1);
/// exponential: min(initial × 2^attempt, max). No jitter — callers
/// depend on the exact sequence.
pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let ms = match policy.backoff {
        Backoff::Fixed => policy.initial_delay_ms,
        Backoff::Linear => policy.initial_delay_ms.saturating_mul(u64::from(attempt) + 1),
        Backoff::Exponential => policy
            .initial_delay_ms
            .saturating_mul(1u64 << attempt.min(63))
            .min(policy.max_delay_ms),
    };
    Duration::from_millis(ms.min(policy.max_delay_ms))
}

/// Whether an error is eligible for retry under this policy.
///
/// An empty `retry_on` list retries any unit failure; a non-empty list
/// allow-lists error codes.
pub fn is_retryable(policy: &RetryPolicy, err: &TuttiError) -> bool {
    if policy.retry_on.is_empty() {
        return matches!(
            err,
            TuttiError::UnitExecution { .. } | TuttiError::Timeout { .. }
        );
    }
    policy.retry_on.iter().any(|code| code == err.code())
}

/// Run `op` with retries per the policy.
///
/// The final attempt's error propagates unchanged.
pub async fn execute_with_retry<F, Fut>(
    policy: &RetryPolicy,
    step: &str,
    mut op: F,
) -> Result<UnitOutput>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<UnitOutput>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..max_attempts {
        match op(attempt).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                if is_retryable(policy, &e) && attempt + 1 < max_attempts {
                    let delay = delay_for(policy, attempt);
                    warn!(
                        step,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying unit step"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TuttiError::UnitExecution {
        unit: step.to_string(),
        message: "retry loop exhausted".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(backoff: Backoff, initial: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff,
            initial_delay_ms: initial,
            max_delay_ms: max,
            retry_on: vec![],
        }
    }

    #[test]
    fn test_exponential_sequence() {
        let p = policy(Backoff::Exponential, 100, 1000);
        let delays: Vec<u64> = (0..6).map(|a| delay_for(&p, a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = policy(Backoff::Fixed, 250, 30000);
        assert_eq!(delay_for(&fixed, 0).as_millis(), 250);
        assert_eq!(delay_for(&fixed, 5).as_millis(), 250);

        let linear = policy(Backoff::Linear, 100, 30000);
        assert_eq!(delay_for(&linear, 0).as_millis(), 100);
        assert_eq!(delay_for(&linear, 2).as_millis(), 300);
    }

    #[test]
    fn test_retry_on_allow_list() {
        let mut p = policy(Backoff::Fixed, 1, 1);
        p.retry_on = vec!["timeout".into()];

        let timeout = TuttiError::Timeout {
            step: "s".into(),
            timeout_ms: 5,
        };
        let exec = TuttiError::UnitExecution {
            unit: "u".into(),
            message: "boom".into(),
        };
        assert!(is_retryable(&p, &timeout));
        assert!(!is_retryable(&p, &exec));

        // Empty list: any unit failure retries, config errors never do.
        p.retry_on.clear();
        assert!(is_retryable(&p, &exec));
        assert!(!is_retryable(&p, &TuttiError::UnitConfig("bad".into())));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let p = policy(Backoff::Fixed, 1, 1);
        let calls = AtomicU32::new(0);

        let output = execute_with_retry(&p, "flaky", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TuttiError::UnitExecution {
                        unit: "flaky".into(),
                        message: "transient".into(),
                    })
                } else {
                    Ok(UnitOutput::new(json!("done")))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(output.data, json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_error_propagates() {
        let p = policy(Backoff::Fixed, 1, 1);
        let calls = AtomicU32::new(0);

        let err = execute_with_retry(&p, "doomed", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TuttiError::UnitExecution {
                    unit: "doomed".into(),
                    message: "permanent".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("permanent"));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let p = policy(Backoff::Fixed, 1, 1);
        let calls = AtomicU32::new(0);

        let err = execute_with_retry(&p, "cfg", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TuttiError::UnitConfig("bad reference".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), "unit_config");
    }
}
