use log_events::Timestamp;
use tracing::{debug, warn};

use crate::{LogStore, StorageError};

/// Tracks the resume point of a store.
///
/// The committed value never moves backwards. A value that could not be
/// persisted is kept as pending and retried by the next commit or by
/// [`CheckpointManager::flush`].
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    committed: Option<Timestamp>,
    pending: Option<Timestamp>,
}

impl CheckpointManager {
    pub fn load<S: LogStore + ?Sized>(store: &S) -> Result<Self, StorageError> {
        let committed = store.checkpoint()?;
        debug!(checkpoint = ?committed.map(|ts| ts.to_rfc3339()), "loaded checkpoint");
        Ok(Self {
            committed,
            pending: None,
        })
    }

    /// Where the next run should resume; `None` on a first run.
    pub fn resume_from(&self) -> Option<Timestamp> {
        self.committed
    }

    /// Latest value accepted, persisted or not.
    pub fn latest(&self) -> Option<Timestamp> {
        self.pending.or(self.committed)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Persists `timestamp` unless it precedes the latest accepted value.
    /// Returns whether the store now holds `timestamp`.
    pub fn commit<S: LogStore + ?Sized>(
        &mut self,
        store: &mut S,
        timestamp: Timestamp,
    ) -> Result<bool, StorageError> {
        if let Some(latest) = self.latest() {
            if timestamp < latest {
                debug!(%timestamp, %latest, "ignoring checkpoint regression");
                return Ok(false);
            }
        }

        match store.set_checkpoint(timestamp) {
            Ok(()) => {
                self.committed = Some(timestamp);
                self.pending = None;
                Ok(true)
            }
            Err(err) => {
                self.pending = Some(timestamp);
                Err(err)
            }
        }
    }

    /// Best-effort write of a pending value. Returns the committed checkpoint.
    pub fn flush<S: LogStore + ?Sized>(&mut self, store: &mut S) -> Option<Timestamp> {
        if let Some(pending) = self.pending {
            match store.set_checkpoint(pending) {
                Ok(()) => {
                    self.committed = Some(pending);
                    self.pending = None;
                    debug!(checkpoint = %pending, "flushed pending checkpoint");
                }
                Err(err) => {
                    warn!(checkpoint = %pending, error = %err, "failed to flush checkpoint");
                }
            }
        }
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStore;

    fn ts(raw: &str) -> Timestamp {
        Timestamp::parse(raw).unwrap()
    }

    #[test]
    fn first_run_has_no_resume_point() {
        let store = SqliteStore::open_in_memory().unwrap();
        let manager = CheckpointManager::load(&store).unwrap();
        assert_eq!(manager.resume_from(), None);
    }

    #[test]
    fn commit_is_monotonic() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut manager = CheckpointManager::load(&store).unwrap();

        assert!(manager.commit(&mut store, ts("2024-01-01T00:00:02Z")).unwrap());
        assert!(!manager.commit(&mut store, ts("2024-01-01T00:00:01Z")).unwrap());
        assert!(manager.commit(&mut store, ts("2024-01-01T00:00:02Z")).unwrap());

        assert_eq!(store.checkpoint().unwrap(), Some(ts("2024-01-01T00:00:02Z")));
        let reloaded = CheckpointManager::load(&store).unwrap();
        assert_eq!(reloaded.resume_from(), Some(ts("2024-01-01T00:00:02Z")));
    }
}
