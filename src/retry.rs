use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Politique de relance : nombre d'essais borné, attente exponentielle
/// plafonnée entre deux essais.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Délai avant l'essai `attempt + 1` (`attempt` commence à 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug)]
pub enum AttemptError<E> {
    Timeout(Duration),
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Timeout(after) => write!(f, "timed out after {} ms", after.as_millis()),
            AttemptError::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Tous les essais ont échoué ; `last` est l'erreur du dernier.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: AttemptError<E>,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempt(s): {}", self.attempts, self.last)
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Exhausted<E> {}

#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Exécute `op` jusqu'au succès ou épuisement de la politique, chaque essai
/// sous `timeout`.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    what: &str,
    op: F,
) -> Result<Retried<T>, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_if(policy, timeout, what, op, |_| true).await
}

/// Comme [`retry`], mais s'arrête dès qu'une erreur n'est pas `transient`.
/// Un délai dépassé compte toujours comme transitoire.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    timeout: Duration,
    what: &str,
    mut op: F,
    transient: P,
) -> Result<Retried<T>, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Ok(Err(err)) => AttemptError::Failed(err),
            Err(_) => AttemptError::Timeout(timeout),
        };

        let permanent = matches!(&err, AttemptError::Failed(e) if !transient(e));
        if permanent || attempt >= max_attempts {
            tracing::warn!(what, attempt, permanent, error = %err, "giving up");
            return Err(Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_after(attempt);
        tracing::debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(4), Duration::from_millis(800));
        assert_eq!(p.delay_after(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_after(60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry(&fast(5), Duration::from_secs(1), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("boom {n}"))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(out.value, 3);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn gives_up_and_reports_last_error() {
        let err = retry(&fast(2), Duration::from_secs(1), "test", || async {
            Err::<(), _>("nope")
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.to_string(), "gave up after 2 attempt(s): nope");
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_if(
            &fast(5),
            Duration::from_secs(1),
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("conflict")
            },
            |e: &&str| *e != "conflict",
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let err = retry(&fast(1), Duration::from_millis(10), "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err.last, AttemptError::Timeout(_)));
    }
}
