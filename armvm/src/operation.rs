//! Long-running remote operations.
//!
//! Every mutating call against the control plane returns a [`Pollable`]
//! handle. [`run_to_completion`] issues the call and polls the handle at a
//! fixed interval until it reaches a terminal state or the pass
//! [`Deadline`] expires.

use crate::error::RemoteError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// State of a long-running operation after one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed(RemoteError),
}

/// Handle of an operation accepted by the remote control plane.
#[async_trait]
pub trait LongRunningOperation: Send {
    /// Query the current state. An `Err` means the poll itself failed.
    async fn poll(&mut self) -> Result<OperationStatus, RemoteError>;
}

pub type Pollable = Box<dyn LongRunningOperation>;

/// An operation that already finished when it was accepted.
pub struct Completed;

#[async_trait]
impl LongRunningOperation for Completed {
    async fn poll(&mut self) -> Result<OperationStatus, RemoteError> {
        Ok(OperationStatus::Succeeded)
    }
}

/// Point in time after which a pass gives up waiting.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + timeout,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Why waiting for an operation stopped short of success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The call or the operation was rejected.
    Rejected(RemoteError),
    /// The deadline expired first. Holds the time spent on this operation.
    TimedOut(Duration),
}

/// Issue `start` and poll the returned handle until it completes.
///
/// Both the initial call and the polling are bounded by `deadline`.
pub async fn run_to_completion<F>(
    start: F,
    deadline: Deadline,
    interval: Duration,
) -> Result<(), WaitError>
where
    F: Future<Output = Result<Pollable, RemoteError>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout_at(deadline.instant(), async {
        let mut operation = start.await?;
        loop {
            match operation.poll().await? {
                OperationStatus::Succeeded => return Ok(()),
                OperationStatus::Failed(e) => return Err(e),
                OperationStatus::InProgress => tokio::time::sleep(interval).await,
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WaitError::Rejected(e)),
        Err(_) => Err(WaitError::TimedOut(started.elapsed())),
    }
}

/// Bound a single remote read by `deadline`. On expiry, returns the time
/// spent on the read.
pub async fn within<T, F>(
    deadline: Deadline,
    call: F,
) -> Result<Result<T, RemoteError>, Duration>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    let started = Instant::now();
    tokio::time::timeout_at(deadline.instant(), call)
        .await
        .map_err(|_| started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Countdown {
        remaining: u32,
        polls: Arc<AtomicU32>,
        outcome: OperationStatus,
    }

    #[async_trait]
    impl LongRunningOperation for Countdown {
        async fn poll(&mut self) -> Result<OperationStatus, RemoteError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.remaining == 0 {
                return Ok(self.outcome.clone());
            }
            self.remaining -= 1;
            Ok(OperationStatus::InProgress)
        }
    }

    fn countdown(remaining: u32, outcome: OperationStatus) -> (Pollable, Arc<AtomicU32>) {
        let polls = Arc::new(AtomicU32::new(0));
        let op = Countdown {
            remaining,
            polls: polls.clone(),
            outcome,
        };
        (Box::new(op), polls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_succeeded() {
        let (op, polls) = countdown(3, OperationStatus::Succeeded);
        let deadline = Deadline::after(Duration::from_secs(60));

        let result = run_to_completion(async { Ok(op) }, deadline, Duration::from_secs(10)).await;

        assert_eq!(result, Ok(()));
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(deadline.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_operation_is_rejection() {
        let (op, _) = countdown(1, OperationStatus::Failed(RemoteError::conflict("busy")));
        let deadline = Deadline::after(Duration::from_secs(60));

        let result = run_to_completion(async { Ok(op) }, deadline, Duration::from_secs(1)).await;

        assert_eq!(
            result,
            Err(WaitError::Rejected(RemoteError::conflict("busy")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_is_never_polled() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let result = run_to_completion(
            async { Err(RemoteError::new(400, "BadRequest", "nope")) },
            deadline,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(WaitError::Rejected(e)) if e.status == 400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_is_timeout() {
        let (op, _) = countdown(u32::MAX, OperationStatus::Succeeded);
        let deadline = Deadline::after(Duration::from_secs(25));

        let result = run_to_completion(async { Ok(op) }, deadline, Duration::from_secs(10)).await;

        assert_eq!(result, Err(WaitError::TimedOut(Duration::from_secs(25))));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_time_spent_on_the_operation() {
        let (op, _) = countdown(u32::MAX, OperationStatus::Succeeded);
        let deadline = Deadline::after(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(45)).await;

        let result = run_to_completion(async { Ok(op) }, deadline, Duration::from_secs(5)).await;

        assert_eq!(result, Err(WaitError::TimedOut(Duration::from_secs(15))));
        assert_eq!(deadline.elapsed(), Duration::from_secs(60));

        let deadline = Deadline::after(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RemoteError>(1)
        };
        assert_eq!(within(deadline, slow).await, Err(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_bounds_a_read() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RemoteError>(1)
        };
        assert_eq!(within(deadline, slow).await, Err(Duration::from_secs(5)));

        let deadline = Deadline::after(Duration::from_secs(5));
        assert_eq!(within(deadline, async { Ok(7) }).await, Ok(Ok(7)));
    }
}
