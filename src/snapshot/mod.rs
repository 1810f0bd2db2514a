//! Snapshot-based fault tolerance.
//!
//! Architecture
//! ------------
//!
//! Processors write their state as key/value [`SnapshotEntry`]s into
//! the snapshot bucket of their outbox. The processor tasklet flushes
//! that bucket into the [`repository::SnapshotRepository`], which
//! stores entries per `(job, snapshot id, vertex)` in a
//! [`store::SnapshotStore`].
//!
//! A [`SnapshotRecord`] is the durable marker of a snapshot attempt.
//! It only becomes successful once every processor instance of every
//! node finished writing for that snapshot id, so the newest
//! successful record is always a complete, restorable snapshot.
//!
//! On restore every processor instance receives the entries it owns:
//! a [`SnapshotKey::Broadcast`] key goes to all instances of the
//! vertex, a [`SnapshotKey::Partitioned`] key only to the instance
//! that owns its partition under [`partition_of`] and
//! [`owner_of_partition`], the same rule partitioned edges use.

use std::fmt;
use std::hash::Hasher;

use chrono::DateTime;
use chrono::Utc;
use seahash::SeaHasher;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::execution::JobId;

pub mod repository;
pub mod sqlite;
pub mod store;

/// Increasing id of a snapshot attempt within a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

/// Durable marker of one snapshot attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub job_id: JobId,
    pub snapshot_id: SnapshotId,
    pub started_at: DateTime<Utc>,
    pub successful: bool,
}

impl SnapshotRecord {
    pub fn new(job_id: JobId, snapshot_id: SnapshotId) -> Self {
        Self {
            job_id,
            snapshot_id,
            started_at: Utc::now(),
            successful: false,
        }
    }
}

/// Key of one piece of saved processor state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotKey {
    /// Restored to the instance owning the key's partition.
    Partitioned(Value),
    /// Restored to every instance of the vertex.
    Broadcast(Value),
}

impl SnapshotKey {
    pub fn value(&self) -> &Value {
        match self {
            Self::Partitioned(value) | Self::Broadcast(value) => value,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: SnapshotKey,
    pub value: Value,
}

impl SnapshotEntry {
    pub fn new(key: SnapshotKey, value: Value) -> Self {
        Self { key, value }
    }
}

/// Vertex-wide override of key routing on restore.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotRestorePolicy {
    /// Follow the key: broadcast keys everywhere, others to owners.
    #[default]
    Partitioned,
    /// Every instance sees every entry and picks what it needs.
    Broadcast,
}

/// Partition of a key.
///
/// Hashes the key's JSON text with [`SeaHasher`], which is stable
/// across processes and platforms.
pub fn partition_of(key: &Value, partition_count: usize) -> usize {
    let mut hasher = SeaHasher::default();
    hasher.write(key.to_string().as_bytes());
    (hasher.finish() % partition_count.max(1) as u64) as usize
}

/// Global processor index owning a partition.
pub fn owner_of_partition(partition: usize, total_parallelism: usize) -> usize {
    partition % total_parallelism.max(1)
}

/// Should an entry be restored into the processor with this global
/// index.
///
/// Partitioned keys go to their global owner, the instance a
/// distributed partitioned edge routes them to. A local partitioned
/// edge routes by local index, so on several members each of them
/// holds partial state of a key. Those partials are all restored into
/// the one global owner, which merges them. Every partial is restored
/// exactly once, and whatever combines the members' results
/// downstream sees the same totals.
pub(crate) fn is_restored_to(
    key: &SnapshotKey,
    policy: SnapshotRestorePolicy,
    global_index: usize,
    total_parallelism: usize,
    partition_count: usize,
) -> bool {
    match (policy, key) {
        (SnapshotRestorePolicy::Broadcast, _) | (_, SnapshotKey::Broadcast(_)) => true,
        (SnapshotRestorePolicy::Partitioned, SnapshotKey::Partitioned(key)) => {
            owner_of_partition(partition_of(key, partition_count), total_parallelism)
                == global_index
        }
    }
}

#[test]
fn partitioned_keys_have_exactly_one_owner() {
    use serde_json::json;

    for k in 0..100 {
        let key = SnapshotKey::Partitioned(json!(k));
        let owners: Vec<_> = (0..4)
            .filter(|i| is_restored_to(&key, SnapshotRestorePolicy::Partitioned, *i, 4, 271))
            .collect();
        assert_eq!(owners.len(), 1);
    }
}

#[test]
fn broadcast_keys_go_everywhere() {
    use serde_json::json;

    let key = SnapshotKey::Broadcast(json!("offsets"));
    assert!((0..4).all(|i| is_restored_to(&key, SnapshotRestorePolicy::Partitioned, i, 4, 271)));
    let key = SnapshotKey::Partitioned(json!("offsets"));
    assert!((0..4).all(|i| is_restored_to(&key, SnapshotRestorePolicy::Broadcast, i, 4, 271)));
}

#[test]
fn partition_is_stable() {
    use serde_json::json;

    assert_eq!(
        partition_of(&json!(["a", 1]), 271),
        partition_of(&json!(["a", 1]), 271)
    );
    assert!(partition_of(&json!("x"), 7) < 7);
}
