//! Per-execution bookkeeping of the snapshot in progress on this node.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::errors::ExecutionError;
use crate::snapshot::SnapshotId;

use super::completion::CompletionFuture;

/// No snapshot requested yet.
const NONE_REQUESTED: u64 = u64::MAX;

#[derive(Debug)]
struct ActiveSnapshot {
    id: SnapshotId,
    remaining: usize,
    future: CompletionFuture,
}

#[derive(Debug)]
struct State {
    live_tasklets: usize,
    active: Option<ActiveSnapshot>,
}

/// Shared by all processor tasklets of an execution on one node.
///
/// Source tasklets poll [`SnapshotContext::requested_snapshot`] to
/// learn they should snapshot; everybody else learns it from barriers.
/// Every tasklet reports once it wrote its state, and a tasklet that
/// finished before taking the snapshot counts as done for it.
#[derive(Debug)]
pub(crate) struct SnapshotContext {
    requested: AtomicU64,
    state: Mutex<State>,
}

impl SnapshotContext {
    pub(crate) fn new(tasklet_count: usize) -> Self {
        Self {
            requested: AtomicU64::new(NONE_REQUESTED),
            state: Mutex::new(State {
                live_tasklets: tasklet_count,
                active: None,
            }),
        }
    }

    pub(crate) fn requested_snapshot(&self) -> Option<SnapshotId> {
        match self.requested.load(Ordering::Acquire) {
            NONE_REQUESTED => None,
            id => Some(SnapshotId(id)),
        }
    }

    /// Completes once every live tasklet wrote its state for `id`.
    pub(crate) fn start_snapshot(&self, id: SnapshotId) -> Result<CompletionFuture, ExecutionError> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            return Err(ExecutionError::ProtocolViolation(format!(
                "{id} requested while {} is still in progress",
                active.id
            )));
        }
        if self.requested_snapshot().map_or(false, |last| last >= id) {
            return Err(ExecutionError::ProtocolViolation(format!(
                "{id} is not newer than the last requested snapshot"
            )));
        }
        let future = CompletionFuture::new();
        if state.live_tasklets == 0 {
            future.complete(Ok(()));
        } else {
            state.active = Some(ActiveSnapshot {
                id,
                remaining: state.live_tasklets,
                future: future.clone(),
            });
        }
        self.requested.store(id.0, Ordering::Release);
        tracing::debug!("Starting {id} with {} live tasklets", state.live_tasklets);
        Ok(future)
    }

    pub(crate) fn snapshot_done_for_tasklet(&self, id: SnapshotId) {
        let mut state = self.lock();
        Self::count_down(&mut state, |active| active.id == id);
    }

    /// A tasklet finished. `last_snapshot_id` is the newest snapshot
    /// it took.
    pub(crate) fn tasklet_done(&self, last_snapshot_id: Option<SnapshotId>) {
        let mut state = self.lock();
        state.live_tasklets = state.live_tasklets.saturating_sub(1);
        Self::count_down(&mut state, |active| {
            last_snapshot_id.map_or(true, |last| last < active.id)
        });
    }

    /// Fail the snapshot in progress, if any.
    pub(crate) fn cancel(&self, err: ExecutionError) {
        if let Some(active) = self.lock().active.take() {
            active.future.complete(Err(err));
        }
    }

    fn count_down(state: &mut State, applies: impl FnOnce(&ActiveSnapshot) -> bool) {
        let finished = match &mut state.active {
            Some(active) if applies(active) => {
                active.remaining = active.remaining.saturating_sub(1);
                active.remaining == 0
            }
            _ => false,
        };
        if finished {
            if let Some(active) = state.active.take() {
                tracing::debug!("All tasklets took {}", active.id);
                active.future.complete(Ok(()));
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[test]
fn snapshot_completes_after_all_tasklets() {
    let context = SnapshotContext::new(2);
    assert_eq!(context.requested_snapshot(), None);
    let future = context.start_snapshot(SnapshotId(0)).unwrap();
    assert_eq!(context.requested_snapshot(), Some(SnapshotId(0)));
    context.snapshot_done_for_tasklet(SnapshotId(0));
    assert!(!future.is_done());
    // Finished without ever seeing the barrier.
    context.tasklet_done(None);
    assert!(future.join().is_ok());

    // The remaining tasklet already took snapshot 0, so finishing it
    // only counts for snapshot 1.
    let future = context.start_snapshot(SnapshotId(1)).unwrap();
    context.tasklet_done(Some(SnapshotId(0)));
    assert!(future.join().is_ok());

    let future = context.start_snapshot(SnapshotId(2)).unwrap();
    assert!(future.is_done());
}

#[test]
fn overlapping_snapshots_are_rejected() {
    let context = SnapshotContext::new(1);
    context.start_snapshot(SnapshotId(0)).unwrap();
    assert!(context.start_snapshot(SnapshotId(1)).is_err());
    context.cancel(ExecutionError::Cancelled);
    assert!(context.start_snapshot(SnapshotId(0)).is_err());
    assert!(context.start_snapshot(SnapshotId(1)).is_ok());
}
