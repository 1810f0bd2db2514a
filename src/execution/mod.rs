//! Running a job execution on one node.
//!
//! Architecture
//! ------------
//!
//! The unit of scheduling is the [`Tasklet`]: a non-blocking piece of
//! work that is called over and over until it reports it is done.
//! Every processor instance is wrapped in a
//! [`processor_tasklet::ProcessorTasklet`], and every distributed edge
//! gets [`network::SenderTasklet`]s and [`network::ReceiverTasklet`]s
//! that ship items to and from other nodes.
//!
//! Tasklets are connected by the bounded queues of
//! [`conveyor`]. Nothing ever blocks on a full or empty queue; a
//! tasklet just returns and gets called again later by the
//! [`service::TaskletExecutionService`] worker it lives on.
//!
//! An [`context::ExecutionContext`] owns all tasklets of one
//! execution attempt on this node and exposes its completion as a
//! [`completion::CompletionFuture`].

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::ExecutionError;

pub mod completion;
pub mod context;
pub(crate) mod conveyor;
pub mod network;
pub mod plan;
pub(crate) mod processor_tasklet;
pub mod service;
pub(crate) mod snapshot_context;

/// Identifies a logical job submission.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{:04x}", self.0)
    }
}

/// Identifies one attempt to run a job.
///
/// Chosen by the coordinator. A job goes through several executions
/// across restarts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{:04x}", self.0)
    }
}

/// Outcome of one [`Tasklet::call`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub made_progress: bool,
    pub is_done: bool,
}

impl ProgressState {
    pub const NO_PROGRESS: Self = Self {
        made_progress: false,
        is_done: false,
    };
    pub const MADE_PROGRESS: Self = Self {
        made_progress: true,
        is_done: false,
    };
    pub const DONE: Self = Self {
        made_progress: true,
        is_done: true,
    };
}

/// Accumulates progress over the steps of a single call.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    made_progress: bool,
    is_done: bool,
}

impl ProgressTracker {
    pub(crate) fn new() -> Self {
        Self {
            made_progress: false,
            is_done: true,
        }
    }

    pub(crate) fn made_progress(&mut self, progress: bool) {
        self.made_progress |= progress;
    }

    pub(crate) fn not_done(&mut self) {
        self.is_done = false;
    }

    /// Progress and not done.
    pub(crate) fn active(&mut self) {
        self.made_progress = true;
        self.is_done = false;
    }

    pub(crate) fn to_progress_state(&self) -> ProgressState {
        ProgressState {
            made_progress: self.made_progress,
            is_done: self.is_done,
        }
    }
}

/// Scheduler-visible unit of cooperative work.
pub trait Tasklet: Send {
    /// Called once on the thread that will run the tasklet, before
    /// the first [`Tasklet::call`].
    fn init(&mut self) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Do a bounded amount of work. Must not block when
    /// [`Tasklet::is_cooperative`].
    fn call(&mut self) -> Result<ProgressState, ExecutionError>;

    /// Cooperative tasklets share worker threads; others get a
    /// dedicated thread.
    fn is_cooperative(&self) -> bool {
        true
    }

    fn name(&self) -> String;
}

#[test]
fn tracker_starts_done_without_progress() {
    let mut tracker = ProgressTracker::new();
    assert_eq!(
        tracker.to_progress_state(),
        ProgressState {
            made_progress: false,
            is_done: true
        }
    );
    tracker.not_done();
    assert_eq!(tracker.to_progress_state(), ProgressState::NO_PROGRESS);
    tracker.made_progress(true);
    assert_eq!(tracker.to_progress_state(), ProgressState::MADE_PROGRESS);
}

#[test]
fn id_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &ExecutionId(7),
        &[Token::NewtypeStruct { name: "ExecutionId" }, Token::U64(7)],
    );
}
