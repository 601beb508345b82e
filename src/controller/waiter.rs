//! Bounded polling
//!
//! Every blocking wait in the engine goes through [`wait_until`]: poll at a
//! fixed interval until the probe reports ready, reports a terminal failure,
//! or the per-wait timeout elapses. Dropping the future cancels the wait.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// What a single probe observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    /// Still converging; carries the observed status for logging
    Pending(String),
    /// Terminal failure state
    Failed { status: String, reason: String },
}

/// Poll `probe` every `interval` until it is ready, bounded by `timeout`
///
/// # Errors
///
/// [`Error::ProvisioningTimeout`] when `timeout` elapses,
/// [`Error::ResourceFailed`] when the probe reports a terminal state, and any
/// error returned by the probe itself.
pub async fn wait_until<T, F, Fut>(
    resource: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    let polling = async {
        loop {
            match probe().await? {
                Poll::Ready(value) => return Ok(value),
                Poll::Failed { status, reason } => {
                    return Err(Error::ResourceFailed {
                        resource: resource.to_string(),
                        status,
                        reason,
                    })
                }
                Poll::Pending(status) => {
                    debug!(resource, %status, "Waiting");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    };

    tokio::time::timeout(timeout, polling)
        .await
        .map_err(|_| Error::ProvisioningTimeout {
            resource: resource.to_string(),
            timeout,
        })?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_polls() {
        let counter = AtomicUsize::new(0);
        let polls = &counter;
        let value = wait_until(
            "nat gateway nat-1",
            Duration::from_secs(600),
            Duration::from_secs(15),
            move || async move {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                Ok(if n < 3 {
                    Poll::Pending("pending".to_string())
                } else {
                    Poll::Ready("nat-1")
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "nat-1");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let err = wait_until::<(), _, _>(
            "cluster demo",
            Duration::from_secs(60),
            Duration::from_secs(15),
            || async { Ok(Poll::Pending("CREATING".to_string())) },
        )
        .await
        .unwrap_err();

        match err {
            Error::ProvisioningTimeout { resource, timeout } => {
                assert_eq!(resource, "cluster demo");
                assert_eq!(timeout, Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_stops_waiting() {
        let err = wait_until::<(), _, _>(
            "cluster demo",
            Duration::from_secs(60),
            Duration::from_secs(15),
            || async {
                Ok(Poll::Failed {
                    status: "FAILED".to_string(),
                    reason: "subnet has no free addresses".to_string(),
                })
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ResourceFailed { ref status, .. } if status == "FAILED"));
    }
}
