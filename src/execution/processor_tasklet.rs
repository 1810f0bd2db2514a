//! The tasklet that drives one processor instance.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;

use crate::config::ProcessingGuarantee;
use crate::errors::panic_err;
use crate::errors::ExecutionError;
use crate::errors::ResultExt;
use crate::item::Item;
use crate::processor::Inbox;
use crate::processor::Processor;
use crate::processor::ProcessorContext;
use crate::processor::VecDequeInbox;
use crate::snapshot::repository::SnapshotRepository;
use crate::snapshot::SnapshotEntry;
use crate::snapshot::SnapshotId;
use crate::with_timer;

use super::conveyor::InboundEdgeStream;
use super::conveyor::OutboxImpl;
use super::conveyor::QueuedItem;
use super::snapshot_context::SnapshotContext;
use super::ProgressState;
use super::ProgressTracker;
use super::Tasklet;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    RestoreSnapshot,
    FinishRestore,
    ProcessInbox,
    SaveSnapshot(SnapshotId),
    EmitBarrier(SnapshotId),
    Complete,
    EmitDone,
    End,
}

struct TaskletMetrics {
    item_inp_count: Counter<u64>,
    item_out_count: Counter<u64>,
    call_duration: Histogram<f64>,
    snapshot_duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl TaskletMetrics {
    fn new(context: &ProcessorContext) -> Self {
        let meter = opentelemetry::global::meter("flowcore");
        Self {
            item_inp_count: meter
                .u64_counter("item_inp_count")
                .with_description("number of items this processor has ingested")
                .init(),
            item_out_count: meter
                .u64_counter("item_out_count")
                .with_description("number of items this processor has emitted")
                .init(),
            call_duration: meter
                .f64_histogram("tasklet_call_duration_seconds")
                .with_description("duration of one processor tasklet call in seconds")
                .init(),
            snapshot_duration: meter
                .f64_histogram("snapshot_duration_seconds")
                .with_description("time from starting to save state to emitting the barrier")
                .init(),
            labels: vec![
                KeyValue::new("vertex", context.vertex_name.clone()),
                KeyValue::new("global_index", context.global_index.to_string()),
            ],
        }
    }
}

/// Everything a processor tasklet is built from.
pub(crate) struct TaskletSetup {
    pub(crate) context: ProcessorContext,
    pub(crate) processor: Box<dyn Processor>,
    pub(crate) instreams: Vec<InboundEdgeStream>,
    pub(crate) outbox: OutboxImpl,
    /// Entries owned by this instance if the execution restores a
    /// snapshot.
    pub(crate) restore: Option<Vec<SnapshotEntry>>,
    pub(crate) snapshots: Arc<SnapshotContext>,
    pub(crate) repository: SnapshotRepository,
}

/// Moves one processor through restore, processing, snapshots and
/// completion.
///
/// Inbound edges are drained one at a time in priority order, and the
/// inbox is always processed empty before anything else happens, so
/// a snapshot never cuts through a batch of items.
pub(crate) struct ProcessorTasklet {
    name: String,
    context: ProcessorContext,
    processor: Box<dyn Processor>,
    cooperative: bool,
    instreams: Vec<InboundEdgeStream>,
    /// Barrier received per stream and not yet taken.
    stream_barriers: Vec<Option<SnapshotId>>,
    next_stream: usize,
    inbox: VecDequeInbox<Item>,
    inbox_ordinal: usize,
    outbox: OutboxImpl,
    restore_inbox: VecDequeInbox<SnapshotEntry>,
    snapshots: Arc<SnapshotContext>,
    repository: SnapshotRepository,
    state: State,
    pending_barrier: Option<SnapshotId>,
    last_snapshot_id: Option<SnapshotId>,
    snapshot_started: Option<Instant>,
    metrics: TaskletMetrics,
}

impl ProcessorTasklet {
    pub(crate) fn new(setup: TaskletSetup) -> Self {
        let TaskletSetup {
            context,
            processor,
            mut instreams,
            outbox,
            restore,
            snapshots,
            repository,
        } = setup;
        instreams.sort_by_key(|s| (s.priority(), s.ordinal()));
        let state = if restore.is_some() {
            State::RestoreSnapshot
        } else {
            State::ProcessInbox
        };
        Self {
            name: format!("{}#{}", context.vertex_name, context.global_index),
            cooperative: processor.is_cooperative(),
            stream_barriers: vec![None; instreams.len()],
            next_stream: 0,
            inbox: VecDequeInbox::new(),
            inbox_ordinal: 0,
            restore_inbox: VecDequeInbox::from(restore.unwrap_or_default()),
            metrics: TaskletMetrics::new(&context),
            context,
            processor,
            instreams,
            outbox,
            snapshots,
            repository,
            state,
            pending_barrier: None,
            last_snapshot_id: None,
            snapshot_started: None,
        }
    }

    fn align_barriers(&self) -> bool {
        self.context.processing_guarantee == ProcessingGuarantee::ExactlyOnce
    }

    fn step(&mut self) -> Result<ProgressState, ExecutionError> {
        let mut progress = ProgressTracker::new();
        match self.state {
            State::RestoreSnapshot => {
                if !self.restore_inbox.is_empty() {
                    tracing::debug!(
                        "Restoring {} entries into {}",
                        self.restore_inbox.len(),
                        self.name
                    );
                    self.processor
                        .restore_snapshot(&mut self.restore_inbox)
                        .reraise_with(|| format!("error restoring state of {}", self.name))?;
                    if !self.restore_inbox.is_empty() {
                        return Err(ExecutionError::ProtocolViolation(format!(
                            "{} left {} snapshot entries unrestored",
                            self.name,
                            self.restore_inbox.len()
                        )));
                    }
                }
                self.state = State::FinishRestore;
                progress.active();
            }
            State::FinishRestore => {
                let done = self
                    .processor
                    .finish_snapshot_restore(&mut self.outbox)
                    .reraise_with(|| format!("error finishing restore of {}", self.name))?;
                if done {
                    self.state = State::ProcessInbox;
                }
                progress.made_progress(done);
                progress.not_done();
            }
            State::ProcessInbox => {
                self.process_inbox(&mut progress)?;
                progress.not_done();
            }
            State::SaveSnapshot(id) => {
                let done = self
                    .processor
                    .save_snapshot(&mut self.outbox)
                    .reraise_with(|| format!("error saving state of {} for {id}", self.name))?;
                self.flush_snapshot_entries(id)?;
                if done {
                    self.state = State::EmitBarrier(id);
                }
                progress.active();
            }
            State::EmitBarrier(id) => {
                if self.outbox.offer_control(&QueuedItem::Barrier(id)) {
                    self.last_snapshot_id = Some(id);
                    self.snapshots.snapshot_done_for_tasklet(id);
                    if let Some(started) = self.snapshot_started.take() {
                        self.metrics
                            .snapshot_duration
                            .record(started.elapsed().as_secs_f64(), &self.metrics.labels);
                    }
                    tracing::trace!("{} took {id}", self.name);
                    self.state = State::ProcessInbox;
                    progress.made_progress(true);
                }
                progress.not_done();
            }
            State::Complete => {
                if let Some(id) = self.newer_requested_snapshot() {
                    self.begin_snapshot(id);
                    progress.made_progress(true);
                } else {
                    let done = self
                        .processor
                        .complete(&mut self.outbox)
                        .reraise_with(|| format!("error completing {}", self.name))?;
                    if done {
                        tracing::debug!("{} completed", self.name);
                        self.state = State::EmitDone;
                        progress.made_progress(true);
                    }
                }
                progress.not_done();
            }
            State::EmitDone => {
                if self.outbox.offer_control(&QueuedItem::Done) {
                    self.state = State::End;
                    self.snapshots.tasklet_done(self.last_snapshot_id);
                    progress.made_progress(true);
                } else {
                    progress.not_done();
                }
            }
            State::End => {}
        }

        let items_out = self.outbox.take_items_out();
        if items_out > 0 {
            self.metrics
                .item_out_count
                .add(items_out, &self.metrics.labels);
            progress.made_progress(true);
        }
        Ok(progress.to_progress_state())
    }

    fn process_inbox(&mut self, progress: &mut ProgressTracker) -> Result<(), ExecutionError> {
        if self.inbox.is_empty() {
            if let Some(id) = self.pending_barrier.take() {
                self.begin_snapshot(id);
                progress.made_progress(true);
                return Ok(());
            }
            if self.instreams.iter().all(InboundEdgeStream::is_done) {
                self.state = State::Complete;
                progress.made_progress(true);
                return Ok(());
            }
            self.fill_inbox(progress);
        }
        if !self.inbox.is_empty() {
            let before = self.inbox.len();
            self.processor
                .process(self.inbox_ordinal, &mut self.inbox, &mut self.outbox)
                .reraise_with(|| {
                    format!(
                        "error processing items from ordinal {} in {}",
                        self.inbox_ordinal, self.name
                    )
                })?;
            let consumed = before - self.inbox.len();
            if consumed > 0 {
                self.metrics
                    .item_inp_count
                    .add(consumed as u64, &self.metrics.labels);
                progress.made_progress(true);
            }
        }
        Ok(())
    }

    /// Drain the next stream of the active priority group with items.
    fn fill_inbox(&mut self, progress: &mut ProgressTracker) {
        let Some(priority) = self
            .instreams
            .iter()
            .filter(|s| !s.is_done())
            .map(InboundEdgeStream::priority)
            .min()
        else {
            return;
        };
        // Draining ahead of edges with a later priority can't wait for
        // their barriers, so it never blocks.
        let later_groups = self
            .instreams
            .iter()
            .any(|s| !s.is_done() && s.priority() > priority);
        let align = self.align_barriers() && !later_groups;

        let count = self.instreams.len();
        for n in 0..count {
            let idx = (self.next_stream + n) % count;
            let stream = &mut self.instreams[idx];
            if stream.is_done()
                || stream.priority() != priority
                || (align && self.stream_barriers[idx].is_some())
            {
                continue;
            }
            let outcome = stream.drain_to(&mut self.inbox, align);
            progress.made_progress(outcome.made_progress);
            if let Some(id) = outcome.barrier {
                self.stream_barriers[idx] = Some(id);
            }
            if !self.inbox.is_empty() {
                self.inbox_ordinal = stream.ordinal();
                self.next_stream = (idx + 1) % count;
                break;
            }
        }
        self.check_barrier_alignment();
    }

    /// Streams of a later priority group hold no barrier until they
    /// are drained, so a snapshot waits for the earlier groups to
    /// finish. Taking it sooner would miss the state their items add.
    fn check_barrier_alignment(&mut self) {
        let Some(id) = self.stream_barriers.iter().flatten().next().copied() else {
            return;
        };
        let aligned = self
            .instreams
            .iter()
            .zip(&self.stream_barriers)
            .all(|(stream, barrier)| barrier.is_some() || stream.is_done());
        if aligned {
            self.stream_barriers.iter_mut().for_each(|b| *b = None);
            self.pending_barrier = Some(id);
        }
    }

    fn newer_requested_snapshot(&self) -> Option<SnapshotId> {
        self.snapshots
            .requested_snapshot()
            .filter(|id| self.last_snapshot_id.map_or(true, |last| *id > last))
    }

    fn begin_snapshot(&mut self, id: SnapshotId) {
        tracing::trace!("{} saving state for {id}", self.name);
        self.snapshot_started = Some(Instant::now());
        self.state = State::SaveSnapshot(id);
    }

    fn flush_snapshot_entries(&mut self, id: SnapshotId) -> Result<(), ExecutionError> {
        if self.outbox.has_snapshot_entries() {
            let entries = self.outbox.take_snapshot_entries();
            self.repository.write_entries(
                self.context.job_id,
                id,
                &self.context.vertex_name,
                &entries,
            )?;
        }
        Ok(())
    }
}

impl Tasklet for ProcessorTasklet {
    fn init(&mut self) -> Result<(), ExecutionError> {
        let context = &self.context;
        let name = &self.name;
        catch_unwind(AssertUnwindSafe(|| {
            self.processor
                .init(context)
                .reraise_with(|| format!("error initializing {name}"))
        }))
        .unwrap_or_else(|payload| Err(panic_err(format!("{name} panicked in init"), payload)))
    }

    fn call(&mut self) -> Result<ProgressState, ExecutionError> {
        let res = with_timer!(
            self.metrics.call_duration,
            self.metrics.labels,
            catch_unwind(AssertUnwindSafe(|| self.step()))
        );
        res.unwrap_or_else(|payload| Err(panic_err(format!("{} panicked", self.name), payload)))
    }

    fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod test_support {
    use serde_json::Value;

    use crate::errors::HookResult;
    use crate::item::Item;
    use crate::processor::logic::Emitter;
    use crate::processor::logic::ProcessorLogic;
    use crate::snapshot::SnapshotKey;

    /// Adds every item to a running total and emits the total.
    pub(super) struct Sum(pub(super) i64);

    impl ProcessorLogic for Sum {
        fn try_process(
            &mut self,
            _ordinal: usize,
            item: &Value,
            emitter: &mut Emitter<'_>,
        ) -> HookResult<bool> {
            let next = self.0 + item.as_i64().unwrap_or(0);
            let emitted = emitter.try_emit(&Item::Data(next.into()));
            if emitted {
                self.0 = next;
            }
            Ok(emitted)
        }

        fn save_snapshot(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
            Ok(emitter.try_emit_to_snapshot(&SnapshotKey::Broadcast("sum".into()), &self.0.into()))
        }

        fn restore_from_snapshot(&mut self, _key: SnapshotKey, value: Value) -> HookResult<()> {
            self.0 = value.as_i64().unwrap_or(0);
            Ok(())
        }
    }

    /// Takes only the first restored entry.
    pub(super) struct RestoresOne;

    impl crate::processor::Processor for RestoresOne {
        fn process(
            &mut self,
            _ordinal: usize,
            inbox: &mut dyn crate::processor::Inbox<Item>,
            _outbox: &mut dyn crate::processor::Outbox,
        ) -> HookResult<()> {
            while inbox.remove().is_some() {}
            Ok(())
        }

        fn restore_snapshot(
            &mut self,
            inbox: &mut dyn crate::processor::Inbox<crate::snapshot::SnapshotEntry>,
        ) -> HookResult<()> {
            inbox.remove();
            Ok(())
        }
    }

    pub(super) struct Panics;

    impl ProcessorLogic for Panics {
        fn try_process(
            &mut self,
            _ordinal: usize,
            _item: &Value,
            _emitter: &mut Emitter<'_>,
        ) -> HookResult<bool> {
            panic!("boom");
        }
    }
}

#[cfg(test)]
fn tasklet_with(
    processor: Box<dyn Processor>,
    inputs: usize,
    restore: Option<Vec<SnapshotEntry>>,
) -> (
    ProcessorTasklet,
    Vec<super::conveyor::QueueSender>,
    super::conveyor::QueueReceiver,
    Arc<SnapshotContext>,
    SnapshotRepository,
) {
    use super::conveyor::queue;
    use super::conveyor::OutboundCollector;
    use super::plan::Routing;
    use crate::snapshot::store::InMemSnapshotStore;

    let (senders, receivers): (Vec<_>, Vec<_>) = (0..inputs).map(|_| queue(16)).unzip();
    let (out_tx, out_rx) = queue(16);
    let instreams = if inputs == 0 {
        Vec::new()
    } else {
        vec![InboundEdgeStream::new(0, 0, receivers)]
    };
    let snapshots = Arc::new(SnapshotContext::new(1));
    let repository = SnapshotRepository::new(Arc::new(InMemSnapshotStore::new()));
    let tasklet = ProcessorTasklet::new(TaskletSetup {
        context: ProcessorContext::standalone("sum"),
        processor,
        instreams,
        outbox: OutboxImpl::new(
            vec![OutboundCollector::new(Routing::Unicast, 271, vec![out_tx])],
            4,
        ),
        restore,
        snapshots: snapshots.clone(),
        repository: repository.clone(),
    });
    (tasklet, senders, out_rx, snapshots, repository)
}

#[cfg(test)]
fn run_until_idle(tasklet: &mut ProcessorTasklet) -> ProgressState {
    loop {
        let state = tasklet.call().unwrap();
        if state.is_done || !state.made_progress {
            return state;
        }
    }
}

#[test]
fn barrier_triggers_snapshot_and_is_forwarded() {
    use super::conveyor::try_offer;
    use crate::execution::JobId;
    use crate::processor::logic::LogicProcessor;
    use test_support::Sum;

    let (mut tasklet, senders, mut out, snapshots, repository) =
        tasklet_with(LogicProcessor::boxed(Sum(0)), 2, None);
    tasklet.init().unwrap();
    let snapshot = snapshots.start_snapshot(SnapshotId(0)).unwrap();

    for queued in [
        QueuedItem::Item(Item::Data(1.into())),
        QueuedItem::Barrier(SnapshotId(0)),
        QueuedItem::Item(Item::Data(10.into())),
    ] {
        assert!(try_offer(&senders[0], &queued));
    }
    run_until_idle(&mut tasklet);
    assert!(!snapshot.is_done(), "second queue has no barrier yet");

    assert!(try_offer(&senders[1], &QueuedItem::Item(Item::Data(2.into()))));
    assert!(try_offer(&senders[1], &QueuedItem::Barrier(SnapshotId(0))));
    run_until_idle(&mut tasklet);
    assert!(snapshot.join().is_ok());

    let saved = repository.entries(JobId(0), SnapshotId(0), "sum").unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].value, serde_json::json!(3));

    let received: Vec<_> = std::iter::from_fn(|| out.try_recv().ok()).collect();
    assert_eq!(
        received,
        vec![
            QueuedItem::Item(Item::Data(1.into())),
            QueuedItem::Item(Item::Data(3.into())),
            QueuedItem::Barrier(SnapshotId(0)),
            QueuedItem::Item(Item::Data(13.into())),
        ]
    );

    for sender in &senders {
        assert!(try_offer(sender, &QueuedItem::Done));
    }
    assert!(run_until_idle(&mut tasklet).is_done);
    assert_eq!(out.try_recv().unwrap(), QueuedItem::Done);
}

#[test]
fn restored_state_is_used() {
    use super::conveyor::try_offer;
    use crate::processor::logic::LogicProcessor;
    use crate::snapshot::SnapshotKey;
    use test_support::Sum;

    let restore = vec![SnapshotEntry::new(
        SnapshotKey::Broadcast("sum".into()),
        40.into(),
    )];
    let (mut tasklet, senders, mut out, _snapshots, _repository) =
        tasklet_with(LogicProcessor::boxed(Sum(0)), 1, Some(restore));
    tasklet.init().unwrap();
    assert!(try_offer(&senders[0], &QueuedItem::Item(Item::Data(2.into()))));
    assert!(try_offer(&senders[0], &QueuedItem::Done));
    assert!(run_until_idle(&mut tasklet).is_done);
    assert_eq!(
        out.try_recv().unwrap(),
        QueuedItem::Item(Item::Data(42.into()))
    );
}

#[test]
fn source_snapshots_when_requested() {
    use crate::processor::logic::LogicProcessor;
    use test_support::Sum;

    // Without inputs the processor sits in `complete`.
    let (mut tasklet, _senders, mut out, snapshots, _repository) =
        tasklet_with(LogicProcessor::boxed(Sum(5)), 0, None);
    tasklet.init().unwrap();
    let snapshot = snapshots.start_snapshot(SnapshotId(7)).unwrap();
    assert!(run_until_idle(&mut tasklet).is_done);
    assert!(snapshot.join().is_ok());
    assert_eq!(out.try_recv().unwrap(), QueuedItem::Barrier(SnapshotId(7)));
    assert_eq!(out.try_recv().unwrap(), QueuedItem::Done);
}

#[test]
fn panics_become_errors() {
    use super::conveyor::try_offer;
    use crate::processor::logic::LogicProcessor;
    use test_support::Panics;

    let (mut tasklet, senders, _out, _snapshots, _repository) =
        tasklet_with(LogicProcessor::boxed(Panics), 1, None);
    tasklet.init().unwrap();
    assert!(try_offer(&senders[0], &QueuedItem::Item(Item::Data(1.into()))));
    let err = loop {
        match tasklet.call() {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(err.to_string().contains("boom"), "{err}");
    assert!(err.to_string().contains("sum#0 panicked"), "{err}");
}

#[test]
fn unrestored_entries_fail_the_tasklet() {
    use crate::snapshot::SnapshotKey;
    use test_support::RestoresOne;

    let restore = vec![
        SnapshotEntry::new(SnapshotKey::Broadcast("a".into()), 1.into()),
        SnapshotEntry::new(SnapshotKey::Broadcast("b".into()), 2.into()),
    ];
    let (mut tasklet, _senders, _out, _snapshots, _repository) =
        tasklet_with(Box::new(RestoresOne), 1, Some(restore));
    tasklet.init().unwrap();
    let err = tasklet.call().unwrap_err();
    assert!(matches!(err, ExecutionError::ProtocolViolation(_)), "{err}");
    assert!(err.to_string().contains("1 snapshot entries"), "{err}");
}
