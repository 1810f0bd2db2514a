//! The processor contract.
//!
//! Architecture
//! ------------
//!
//! A [`Processor`] is one parallel instance of a vertex. The
//! scheduler drives it through a strict lifecycle:
//!
//! 1. [`Processor::init`] once.
//! 2. If the execution restores a snapshot:
//!    [`Processor::restore_snapshot`] with all entries it owns, then
//!    [`Processor::finish_snapshot_restore`] until it returns `true`.
//! 3. [`Processor::process`] for each inbound edge with items, with
//!    [`Processor::save_snapshot`] calls interleaved whenever a
//!    snapshot is taken.
//! 4. [`Processor::complete`] until it returns `true`, once all inbound
//!    edges are exhausted.
//!
//! Every call must return without blocking. Output goes to an
//! [`Outbox`] whose buckets are bounded; when an offer is rejected the
//! processor returns and gets called again with the same state. Most
//! processors do not implement [`Processor`] directly but
//! [`logic::ProcessorLogic`], which handles inbox draining and keeps
//! track of items the outbox did not accept yet.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::cluster::JobResources;
use crate::config::ProcessingGuarantee;
use crate::errors::ExecutionError;
use crate::errors::HookResult;
use crate::execution::ExecutionId;
use crate::execution::JobId;
use crate::item::Item;
use crate::snapshot::SnapshotEntry;
use crate::snapshot::SnapshotKey;

pub mod flat_map;
pub mod logic;

/// Ordered items from one inbound edge, drained front to back.
pub trait Inbox<T> {
    fn peek(&self) -> Option<&T>;

    /// Remove and return the front item.
    fn remove(&mut self) -> Option<T>;

    fn len(&self) -> usize;

    fn poll(&mut self) -> Option<T> {
        self.remove()
    }

    fn is_empty(&self) -> bool {
        self.peek().is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VecDequeInbox<T>(VecDeque<T>);

impl<T> VecDequeInbox<T> {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    pub fn push(&mut self, item: T) {
        self.0.push_back(item);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl<T> Default for VecDequeInbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<T>> for VecDequeInbox<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items.into())
    }
}

impl<T> Extend<T> for VecDequeInbox<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<T> Inbox<T> for VecDequeInbox<T> {
    fn peek(&self) -> Option<&T> {
        self.0.front()
    }

    fn remove(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Bounded output buckets, one per outbound edge ordinal, plus the
/// snapshot bucket.
///
/// An offer that returns `false` must be retried later with the
/// identical item. Offering to several buckets remembers which ones
/// already took the item, so the retry does not duplicate it.
pub trait Outbox {
    fn bucket_count(&self) -> usize;

    fn offer(&mut self, ordinal: usize, item: &Item) -> bool;

    fn offer_to(&mut self, ordinals: &[usize], item: &Item) -> bool;

    /// Offer to every edge bucket, never the snapshot bucket.
    fn offer_all(&mut self, item: &Item) -> bool {
        let ordinals: Vec<usize> = (0..self.bucket_count()).collect();
        self.offer_to(&ordinals, item)
    }

    fn offer_to_snapshot(&mut self, key: &SnapshotKey, value: &Value) -> bool;
}

/// Where a processor instance sits in the job.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub vertex_name: String,
    /// Index among all instances of the vertex in the cluster.
    pub global_index: usize,
    /// Index among the instances of the vertex on this node.
    pub local_index: usize,
    pub local_parallelism: usize,
    pub total_parallelism: usize,
    pub member_index: usize,
    pub member_count: usize,
    pub partition_count: usize,
    pub processing_guarantee: ProcessingGuarantee,
    pub resources: Arc<JobResources>,
}

impl ProcessorContext {
    /// Context of a lone instance outside any cluster.
    pub fn standalone(vertex_name: impl Into<String>) -> Self {
        Self {
            job_id: JobId(0),
            execution_id: ExecutionId(0),
            vertex_name: vertex_name.into(),
            global_index: 0,
            local_index: 0,
            local_parallelism: 1,
            total_parallelism: 1,
            member_index: 0,
            member_count: 1,
            partition_count: crate::config::DEFAULT_PARTITION_COUNT,
            processing_guarantee: ProcessingGuarantee::ExactlyOnce,
            resources: Arc::new(JobResources::default()),
        }
    }

    /// Same vertex, a different slot among `total_parallelism`
    /// instances on one node.
    pub fn with_index(mut self, global_index: usize, total_parallelism: usize) -> Self {
        self.global_index = global_index;
        self.local_index = global_index;
        self.total_parallelism = total_parallelism;
        self.local_parallelism = total_parallelism;
        self
    }
}

/// Scheduler-facing lifecycle of one processor instance.
pub trait Processor: Send {
    fn init(&mut self, _context: &ProcessorContext) -> HookResult<()> {
        Ok(())
    }

    /// Read once before the first call. Non-cooperative processors get
    /// a dedicated thread and may block.
    fn is_cooperative(&self) -> bool {
        true
    }

    /// Drain as much of the inbox as the outbox allows. Items left in
    /// the inbox are offered again on the next call.
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut dyn Inbox<Item>,
        outbox: &mut dyn Outbox,
    ) -> HookResult<()>;

    /// Called after all inbound edges are exhausted. `false` means
    /// call again.
    fn complete(&mut self, _outbox: &mut dyn Outbox) -> HookResult<bool> {
        Ok(true)
    }

    /// Write state to the snapshot bucket. `false` means call again.
    fn save_snapshot(&mut self, _outbox: &mut dyn Outbox) -> HookResult<bool> {
        Ok(true)
    }

    /// Take over state from entries of a previous execution.
    fn restore_snapshot(&mut self, _inbox: &mut dyn Inbox<SnapshotEntry>) -> HookResult<()> {
        Err(ExecutionError::not_implemented("restore_snapshot").into())
    }

    /// Called once after all entries are restored. `false` means call
    /// again.
    fn finish_snapshot_restore(&mut self, _outbox: &mut dyn Outbox) -> HookResult<bool> {
        Ok(true)
    }
}

/// Creates the processor instances of a vertex.
pub trait ProcessorSupplier: Send + Sync {
    fn get(&self, context: &ProcessorContext) -> HookResult<Box<dyn Processor>>;
}

impl<F> ProcessorSupplier for F
where
    F: Fn(&ProcessorContext) -> Box<dyn Processor> + Send + Sync,
{
    fn get(&self, context: &ProcessorContext) -> HookResult<Box<dyn Processor>> {
        Ok(self(context))
    }
}

#[test]
fn inbox_drains_front_to_back() {
    let mut inbox = VecDequeInbox::from(vec![1, 2, 3]);
    assert_eq!(inbox.peek(), Some(&1));
    assert_eq!(inbox.remove(), Some(1));
    assert_eq!(inbox.poll(), Some(2));
    assert_eq!(inbox.len(), 1);
    assert!(!inbox.is_empty());
    inbox.remove();
    assert!(inbox.is_empty());
    assert_eq!(inbox.poll(), None);
}
