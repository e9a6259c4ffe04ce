//! Consistency checks between the base and target stores.
//!
//! [`Validator`] scans both tables page by page in both directions;
//! [`IncrementalValidator`] checks a single row on demand. Both publish
//! mismatches through a [`Producer`] and never repair anything themselves.

pub mod full;
pub mod row;

use crate::core::{MigrateError, Result, with_deadline};
use crate::events::{Direction, InconsistencyKind, InconsistentEvent, Producer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub use full::Validator;
pub use row::{IncrementalValidator, RowChangeListener};

/// How a scan direction behaves once it runs out of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Stop at the first empty or short page.
    OneShot,
    /// Sleep `poll_interval` and read again from the current offset.
    Continuous { poll_interval: Duration },
}

impl ScanMode {
    pub fn continuous(poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(MigrateError::Config(
                "poll interval must be > 0 for a continuous scan".to_string(),
            ));
        }
        Ok(Self::Continuous { poll_interval })
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            Self::OneShot => None,
            Self::Continuous { poll_interval } => Some(*poll_interval),
        }
    }
}

/// Publishes inconsistency events tagged with one direction.
#[derive(Clone)]
pub(crate) struct Reporter {
    producer: Arc<dyn Producer>,
    direction: Direction,
    call_timeout: Duration,
}

impl Reporter {
    pub(crate) fn new(
        producer: Arc<dyn Producer>,
        direction: Direction,
        call_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            direction,
            call_timeout,
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    /// Publish failures are logged and dropped. Only cancellation of the
    /// surrounding job is returned.
    pub(crate) async fn notify(
        &self,
        cancel: &CancellationToken,
        id: i64,
        kind: InconsistencyKind,
    ) -> Result<()> {
        let evt = InconsistentEvent::new(id, self.direction, kind);
        match with_deadline(
            cancel,
            self.call_timeout,
            self.producer.produce_inconsistent_event(&evt),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(MigrateError::Cancelled) => Err(MigrateError::Cancelled),
            Err(err) => {
                error!(
                    id,
                    direction = %self.direction,
                    kind = %kind,
                    error = %err,
                    "failed to report inconsistent row"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Producer that keeps events in memory.
    #[derive(Default)]
    pub struct RecordingProducer {
        events: Mutex<Vec<InconsistentEvent>>,
        fail: Mutex<usize>,
    }

    impl RecordingProducer {
        pub fn events(&self) -> Vec<InconsistentEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn fail_next(&self, n: usize) {
            *self.fail.lock().unwrap() = n;
        }
    }

    #[async_trait]
    impl Producer for RecordingProducer {
        async fn produce_inconsistent_event(&self, evt: &InconsistentEvent) -> Result<()> {
            {
                let mut fail = self.fail.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(MigrateError::Broker("unavailable".to_string()));
                }
            }
            self.events.lock().unwrap().push(*evt);
            Ok(())
        }
    }
}
