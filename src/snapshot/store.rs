//! Durable storage behind the snapshot protocol.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::ExecutionError;
use crate::execution::JobId;

use super::SnapshotEntry;
use super::SnapshotId;
use super::SnapshotRecord;

/// Key/value store for snapshot records and entries.
///
/// Writes from all nodes of a job must become visible to all nodes.
/// Entries are appended; the same key may appear several times in
/// one snapshot if several instances wrote it.
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the record with the same snapshot id.
    fn put_record(&self, record: &SnapshotRecord) -> Result<(), ExecutionError>;

    /// All records of the job in snapshot id order.
    fn records(&self, job_id: JobId) -> Result<Vec<SnapshotRecord>, ExecutionError>;

    fn append_entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
        entries: &[SnapshotEntry],
    ) -> Result<(), ExecutionError>;

    /// Entries a vertex wrote for a snapshot, in write order.
    fn entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
    ) -> Result<Vec<SnapshotEntry>, ExecutionError>;

    /// Drop the record and entries of one snapshot.
    fn delete_snapshot(&self, job_id: JobId, snapshot_id: SnapshotId)
        -> Result<(), ExecutionError>;

    /// Does the job have neither records nor entries.
    fn is_empty(&self, job_id: JobId) -> Result<bool, ExecutionError>;
}

#[derive(Debug, Default)]
struct JobSnapshots {
    records: BTreeMap<SnapshotId, SnapshotRecord>,
    entries: HashMap<(SnapshotId, String), Vec<SnapshotEntry>>,
}

impl JobSnapshots {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.entries.is_empty()
    }
}

/// Store that lives as long as the process. Used for tests and
/// in-process clusters where all nodes share one instance.
#[derive(Debug, Default)]
pub struct InMemSnapshotStore {
    jobs: Mutex<HashMap<JobId, JobSnapshots>>,
}

impl InMemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(&self, job_id: JobId, f: impl FnOnce(&mut JobSnapshots) -> T) -> T {
        let mut jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());
        let job = jobs.entry(job_id).or_default();
        let res = f(job);
        if job.is_empty() {
            jobs.remove(&job_id);
        }
        res
    }
}

impl SnapshotStore for InMemSnapshotStore {
    fn put_record(&self, record: &SnapshotRecord) -> Result<(), ExecutionError> {
        self.with_job(record.job_id, |job| {
            job.records.insert(record.snapshot_id, record.clone());
        });
        Ok(())
    }

    fn records(&self, job_id: JobId) -> Result<Vec<SnapshotRecord>, ExecutionError> {
        Ok(self.with_job(job_id, |job| job.records.values().cloned().collect()))
    }

    fn append_entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
        entries: &[SnapshotEntry],
    ) -> Result<(), ExecutionError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_job(job_id, |job| {
            job.entries
                .entry((snapshot_id, vertex.to_string()))
                .or_default()
                .extend_from_slice(entries);
        });
        Ok(())
    }

    fn entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
    ) -> Result<Vec<SnapshotEntry>, ExecutionError> {
        Ok(self.with_job(job_id, |job| {
            job.entries
                .get(&(snapshot_id, vertex.to_string()))
                .cloned()
                .unwrap_or_default()
        }))
    }

    fn delete_snapshot(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
    ) -> Result<(), ExecutionError> {
        self.with_job(job_id, |job| {
            job.records.remove(&snapshot_id);
            job.entries.retain(|(id, _vertex), _| *id != snapshot_id);
        });
        Ok(())
    }

    fn is_empty(&self, job_id: JobId) -> Result<bool, ExecutionError> {
        Ok(self.with_job(job_id, |job| job.is_empty()))
    }
}

#[test]
fn in_mem_entries_per_vertex() {
    use serde_json::json;

    use super::SnapshotKey;

    let store = InMemSnapshotStore::new();
    let job = JobId(1);
    let entry = |k: i64, v: i64| SnapshotEntry::new(SnapshotKey::Partitioned(json!(k)), json!(v));

    store
        .append_entries(job, SnapshotId(0), "source", &[entry(0, 10), entry(1, 11)])
        .unwrap();
    store
        .append_entries(job, SnapshotId(0), "source", &[entry(2, 12)])
        .unwrap();
    store
        .append_entries(job, SnapshotId(0), "sink", &[entry(0, 1)])
        .unwrap();

    assert_eq!(
        store.entries(job, SnapshotId(0), "source").unwrap(),
        vec![entry(0, 10), entry(1, 11), entry(2, 12)]
    );
    assert_eq!(store.entries(job, SnapshotId(1), "source").unwrap(), vec![]);
    assert!(!store.is_empty(job).unwrap());

    store.delete_snapshot(job, SnapshotId(0)).unwrap();
    assert!(store.is_empty(job).unwrap());
}

#[test]
fn in_mem_records_are_ordered() {
    let store = InMemSnapshotStore::new();
    let job = JobId(2);
    store
        .put_record(&SnapshotRecord::new(job, SnapshotId(1)))
        .unwrap();
    store
        .put_record(&SnapshotRecord::new(job, SnapshotId(0)))
        .unwrap();
    let ids: Vec<_> = store
        .records(job)
        .unwrap()
        .into_iter()
        .map(|r| r.snapshot_id)
        .collect();
    assert_eq!(ids, vec![SnapshotId(0), SnapshotId(1)]);
}
