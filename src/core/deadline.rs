use super::{MigrateError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs `fut` under a per-call deadline layered beneath a job's
/// cancellation token.
///
/// Whichever fires first wins: the token yields `Cancelled`, the deadline
/// yields `DeadlineExceeded`. The inner future is dropped in both cases.
pub async fn with_deadline<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(MigrateError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(MigrateError::DeadlineExceeded),
        },
    }
}

/// Sleeps for `dur` unless the token fires first.
pub async fn sleep_or_cancel(cancel: &CancellationToken, dur: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        _ = tokio::time::sleep(dur) => Ok(()),
    }
}
