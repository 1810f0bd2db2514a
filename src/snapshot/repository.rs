//! Snapshot bookkeeping on top of a [`SnapshotStore`].

use std::sync::Arc;

use crate::errors::ExecutionError;
use crate::execution::JobId;

use super::store::SnapshotStore;
use super::SnapshotEntry;
use super::SnapshotId;
use super::SnapshotRecord;

/// Answers "which is the newest restorable snapshot of a job" and
/// moves entries in and out of the store.
#[derive(Clone)]
pub struct SnapshotRepository {
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotRepository {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    /// Register a new, not yet successful snapshot with the next id.
    pub fn register_snapshot(&self, job_id: JobId) -> Result<SnapshotRecord, ExecutionError> {
        let next_id = self
            .store
            .records(job_id)?
            .last()
            .map(|r| SnapshotId(r.snapshot_id.0 + 1))
            .unwrap_or(SnapshotId(0));
        let record = SnapshotRecord::new(job_id, next_id);
        self.store.put_record(&record)?;
        tracing::debug!("Registered {next_id} for {job_id}");
        Ok(record)
    }

    /// Mark a snapshot as complete and delete all older ones.
    pub fn set_successful(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
    ) -> Result<(), ExecutionError> {
        let mut record = self
            .store
            .records(job_id)?
            .into_iter()
            .find(|r| r.snapshot_id == snapshot_id)
            .ok_or_else(|| {
                ExecutionError::Store(format!("{snapshot_id} of {job_id} was never registered"))
            })?;
        record.successful = true;
        self.store.put_record(&record)?;
        self.delete_older(job_id, snapshot_id)?;
        tracing::info!("{snapshot_id} of {job_id} is complete");
        Ok(())
    }

    /// Newest successful snapshot, if any.
    pub fn latest_successful(
        &self,
        job_id: JobId,
    ) -> Result<Option<SnapshotRecord>, ExecutionError> {
        Ok(self
            .store
            .records(job_id)?
            .into_iter()
            .filter(|r| r.successful)
            .max_by_key(|r| r.snapshot_id))
    }

    pub fn records(&self, job_id: JobId) -> Result<Vec<SnapshotRecord>, ExecutionError> {
        self.store.records(job_id)
    }

    pub fn write_entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
        entries: &[SnapshotEntry],
    ) -> Result<(), ExecutionError> {
        self.store
            .append_entries(job_id, snapshot_id, vertex, entries)
    }

    pub fn entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
    ) -> Result<Vec<SnapshotEntry>, ExecutionError> {
        self.store.entries(job_id, snapshot_id, vertex)
    }

    /// Remove everything of a finished job.
    pub fn delete_all(&self, job_id: JobId) -> Result<(), ExecutionError> {
        for record in self.store.records(job_id)? {
            self.store.delete_snapshot(job_id, record.snapshot_id)?;
        }
        Ok(())
    }

    pub fn is_empty(&self, job_id: JobId) -> Result<bool, ExecutionError> {
        self.store.is_empty(job_id)
    }

    fn delete_older(&self, job_id: JobId, snapshot_id: SnapshotId) -> Result<(), ExecutionError> {
        for record in self.store.records(job_id)? {
            if record.snapshot_id < snapshot_id {
                self.store.delete_snapshot(job_id, record.snapshot_id)?;
            }
        }
        Ok(())
    }
}

#[test]
fn latest_successful_skips_failed_attempts() {
    use super::store::InMemSnapshotStore;

    let repo = SnapshotRepository::new(Arc::new(InMemSnapshotStore::new()));
    let job = JobId(3);
    assert_eq!(repo.latest_successful(job).unwrap(), None);

    let first = repo.register_snapshot(job).unwrap();
    assert_eq!(first.snapshot_id, SnapshotId(0));
    repo.set_successful(job, first.snapshot_id).unwrap();

    let second = repo.register_snapshot(job).unwrap();
    assert_eq!(second.snapshot_id, SnapshotId(1));
    // Still in progress, so the first one is the restorable one.
    assert_eq!(
        repo.latest_successful(job).unwrap().map(|r| r.snapshot_id),
        Some(SnapshotId(0))
    );

    repo.set_successful(job, second.snapshot_id).unwrap();
    let records = repo.records(job).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].snapshot_id, SnapshotId(1));

    repo.delete_all(job).unwrap();
    assert!(repo.is_empty(job).unwrap());
}
