use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Incremental,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Incremental => f.write_str("incremental"),
        }
    }
}

/// Signals job completion. Dropping it without calling `finish` (panic,
/// abort) also counts as finished.
pub struct JobCompletion(watch::Sender<bool>);

impl JobCompletion {
    pub fn finish(self) {
        let _ = self.0.send(true);
    }
}

/// A running (or finished) validation job.
#[derive(Debug, Clone)]
pub struct ValidationJob {
    id: Uuid,
    kind: JobKind,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ValidationJob {
    pub fn new(kind: JobKind) -> (Self, JobCompletion) {
        let (tx, rx) = watch::channel(false);
        let job = Self {
            id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            done: rx,
        };
        (job, JobCompletion(tx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Waits until the job has finished.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        loop {
            if *done.borrow_and_update() {
                return;
            }
            // Err means the sender is gone, which also means finished.
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            kind: self.kind,
            started_at: self.started_at,
            cancelled: self.is_cancelled(),
            running: !self.is_finished(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_finish() {
        let (job, completion) = ValidationJob::new(JobKind::Full);
        assert!(!job.is_finished());

        let waiter = job.clone();
        let wait = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        completion.finish();

        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();
        assert!(job.is_finished());
        assert!(!job.status().running);
    }

    #[tokio::test]
    async fn test_dropped_completion_counts_as_finished() {
        let (job, completion) = ValidationJob::new(JobKind::Incremental);
        drop(completion);
        tokio::time::timeout(Duration::from_secs(1), job.wait())
            .await
            .unwrap();
        assert!(job.is_finished());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (job, _completion) = ValidationJob::new(JobKind::Full);
        job.cancel();
        job.cancel();
        assert!(job.is_cancelled());
        assert!(job.token().is_cancelled());
        assert_eq!(job.status().kind, JobKind::Full);
    }
}
