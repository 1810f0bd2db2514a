//! Tools for testing processors in isolation.
//!
//! [`TestOutbox`] is an [`Outbox`] with tiny, inspectable buckets.
//! [`TestSupport`] drives a single processor instance through its
//! whole lifecycle the way the scheduler would, while making life
//! hard for it: buckets of capacity one, optional random rejections,
//! and optionally a snapshot plus a restore into a fresh instance
//! after every input item.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::ExecutionError;
use crate::errors::ResultExt;
use crate::item::Item;
use crate::processor::Inbox;
use crate::processor::Outbox;
use crate::processor::Processor;
use crate::processor::ProcessorContext;
use crate::processor::ProcessorSupplier;
use crate::processor::VecDequeInbox;
use crate::snapshot::SnapshotEntry;
use crate::snapshot::SnapshotKey;

/// Outbox with fixed bucket capacities that keeps everything it
/// accepted until drained.
pub struct TestOutbox {
    buckets: Vec<VecDeque<Item>>,
    capacities: Vec<usize>,
    snapshot: VecDeque<(SnapshotKey, Value)>,
    snapshot_capacity: usize,
    /// Buckets that already took the item of an unfinished
    /// multi-bucket offer.
    accepted: Vec<bool>,
    rejections: Option<fastrand::Rng>,
}

impl TestOutbox {
    /// One bucket per capacity. The snapshot bucket holds one entry.
    pub fn new(capacities: Vec<usize>) -> Self {
        Self {
            buckets: capacities.iter().map(|_| VecDeque::new()).collect(),
            accepted: vec![false; capacities.len()],
            capacities,
            snapshot: VecDeque::new(),
            snapshot_capacity: 1,
            rejections: None,
        }
    }

    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity;
        self
    }

    /// Reject about half of all offers regardless of free space.
    pub fn with_random_rejections(mut self, seed: u64) -> Self {
        self.rejections = Some(fastrand::Rng::with_seed(seed));
        self
    }

    pub fn len(&self, ordinal: usize) -> usize {
        self.buckets[ordinal].len()
    }

    pub fn drain(&mut self, ordinal: usize) -> Vec<Item> {
        self.buckets[ordinal].drain(..).collect()
    }

    pub fn drain_snapshot(&mut self) -> Vec<(SnapshotKey, Value)> {
        self.snapshot.drain(..).collect()
    }

    fn reject_randomly(&mut self) -> bool {
        self.rejections.as_mut().map_or(false, |rng| rng.bool())
    }

    fn has_space(&self, ordinal: usize) -> bool {
        self.buckets[ordinal].len() < self.capacities[ordinal]
    }
}

impl Outbox for TestOutbox {
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn offer(&mut self, ordinal: usize, item: &Item) -> bool {
        self.offer_to(&[ordinal], item)
    }

    fn offer_to(&mut self, ordinals: &[usize], item: &Item) -> bool {
        assert!(
            ordinals.iter().all(|o| *o < self.buckets.len()),
            "offer to {ordinals:?}, but there are only {} buckets",
            self.buckets.len()
        );
        if self.reject_randomly() {
            return false;
        }
        let mut all_accepted = true;
        for &ordinal in ordinals {
            if self.accepted[ordinal] {
                continue;
            }
            if self.has_space(ordinal) {
                self.buckets[ordinal].push_back(item.clone());
                self.accepted[ordinal] = true;
            } else {
                all_accepted = false;
            }
        }
        if all_accepted {
            self.accepted.iter_mut().for_each(|a| *a = false);
        }
        all_accepted
    }

    fn offer_to_snapshot(&mut self, key: &SnapshotKey, value: &Value) -> bool {
        if self.reject_randomly() || self.snapshot.len() >= self.snapshot_capacity {
            return false;
        }
        self.snapshot.push_back((key.clone(), value.clone()));
        true
    }
}

/// How many calls in a row may pass without any visible progress
/// before a processor is considered stuck.
const MAX_IDLE_CALLS: usize = 1000;

/// Builder-style harness that runs one processor over a list of
/// input items on edge 0 and collects everything it emits to bucket 0.
///
/// ```
/// use flowcore::errors::HookResult;
/// use flowcore::item::Item;
/// use flowcore::processor::logic::Emitter;
/// use flowcore::processor::logic::LogicProcessor;
/// use flowcore::processor::logic::ProcessorLogic;
/// use flowcore::testing::TestSupport;
/// use serde_json::Value;
///
/// struct Double;
///
/// impl ProcessorLogic for Double {
///     fn try_process(
///         &mut self,
///         _ordinal: usize,
///         item: &Value,
///         emitter: &mut Emitter<'_>,
///     ) -> HookResult<bool> {
///         let n = item.as_i64().unwrap_or(0);
///         Ok(emitter.try_emit(&Item::Data((n * 2).into())))
///     }
/// }
///
/// TestSupport::verify_processor(|_| LogicProcessor::boxed(Double))
///     .input(vec![Item::Data(1.into()), Item::Data(2.into())])
///     .expect_output(vec![Item::Data(2.into()), Item::Data(4.into())])
///     .verify();
/// ```
pub struct TestSupport {
    supplier: Arc<dyn ProcessorSupplier>,
    context: ProcessorContext,
    input: Vec<Item>,
    expected: Vec<Item>,
    snapshots: bool,
    call_complete: bool,
    rejection_seed: Option<u64>,
}

impl TestSupport {
    pub fn verify_processor<F>(supplier: F) -> Self
    where
        F: Fn(&ProcessorContext) -> Box<dyn Processor> + Send + Sync + 'static,
    {
        Self::verify_supplier(Arc::new(supplier))
    }

    pub fn verify_supplier(supplier: Arc<dyn ProcessorSupplier>) -> Self {
        Self {
            supplier,
            context: ProcessorContext::standalone("test"),
            input: Vec::new(),
            expected: Vec::new(),
            snapshots: true,
            call_complete: true,
            rejection_seed: None,
        }
    }

    pub fn input(mut self, input: Vec<Item>) -> Self {
        self.input = input;
        self
    }

    pub fn expect_output(mut self, expected: Vec<Item>) -> Self {
        self.expected = expected;
        self
    }

    pub fn context(mut self, context: ProcessorContext) -> Self {
        self.context = context;
        self
    }

    /// Only run without snapshots, for processors with no snapshot
    /// support.
    pub fn disable_snapshots(mut self) -> Self {
        self.snapshots = false;
        self
    }

    /// Stop after the input, as for a processor on an infinite stream.
    pub fn disable_complete_call(mut self) -> Self {
        self.call_complete = false;
        self
    }

    pub fn random_rejections(mut self, seed: u64) -> Self {
        self.rejection_seed = Some(seed);
        self
    }

    /// Run once without and, unless disabled, once with snapshots and
    /// compare both outputs with the expected output.
    ///
    /// Panics on any difference or failure.
    pub fn verify(self) {
        let output = self
            .run(false)
            .unwrap_or_else(|err| panic!("processor failed: {err}"));
        assert_eq!(output, self.expected, "output without snapshots");
        if self.snapshots {
            let output = self
                .run(true)
                .unwrap_or_else(|err| panic!("processor failed with snapshots: {err}"));
            assert_eq!(output, self.expected, "output with snapshot and restore");
        }
    }

    /// Output of one run. With `restore_between_items` the state is
    /// saved and restored into a fresh instance after every input item.
    pub fn run(&self, restore_between_items: bool) -> Result<Vec<Item>, ExecutionError> {
        let mut outbox = self.new_outbox();
        let mut output = Vec::new();
        let mut processor = self.new_processor()?;
        let mut inbox = VecDequeInbox::new();
        let mut idle = 0;

        for item in &self.input {
            inbox.push(item.clone());
            while !inbox.is_empty() {
                let before = inbox.len();
                processor
                    .process(0, &mut inbox, &mut outbox)
                    .reraise("error processing test input")?;
                let emitted = drain_into(&mut outbox, &mut output);
                check_progress(&mut idle, inbox.len() < before || emitted)?;
            }
            if restore_between_items {
                processor = self.snapshot_and_restore(processor, &mut outbox, &mut output)?;
            }
        }

        if self.call_complete {
            loop {
                let done = processor
                    .complete(&mut outbox)
                    .reraise("error completing test processor")?;
                let emitted = drain_into(&mut outbox, &mut output);
                if done {
                    break;
                }
                check_progress(&mut idle, emitted)?;
            }
        }
        Ok(output)
    }

    fn new_outbox(&self) -> TestOutbox {
        let outbox = TestOutbox::new(vec![1]);
        match self.rejection_seed {
            Some(seed) => outbox.with_random_rejections(seed),
            None => outbox,
        }
    }

    fn new_processor(&self) -> Result<Box<dyn Processor>, ExecutionError> {
        let mut processor = self
            .supplier
            .get(&self.context)
            .reraise("error creating test processor")?;
        processor
            .init(&self.context)
            .reraise("error initializing test processor")?;
        Ok(processor)
    }

    fn snapshot_and_restore(
        &self,
        mut processor: Box<dyn Processor>,
        outbox: &mut TestOutbox,
        output: &mut Vec<Item>,
    ) -> Result<Box<dyn Processor>, ExecutionError> {
        let mut entries = Vec::new();
        let mut idle = 0;
        loop {
            let done = processor
                .save_snapshot(outbox)
                .reraise("error saving test snapshot")?;
            let written = outbox.drain_snapshot();
            let progress = !written.is_empty();
            entries.extend(
                written
                    .into_iter()
                    .map(|(key, value)| SnapshotEntry::new(key, value)),
            );
            drain_into(outbox, output);
            if done {
                break;
            }
            check_progress(&mut idle, progress)?;
        }
        drop(processor);

        let mut restored = self.new_processor()?;
        let mut inbox = VecDequeInbox::from(entries);
        if !inbox.is_empty() {
            restored
                .restore_snapshot(&mut inbox)
                .reraise("error restoring test snapshot")?;
            if !inbox.is_empty() {
                return Err(ExecutionError::ProtocolViolation(format!(
                    "{} snapshot entries were not consumed on restore",
                    inbox.len()
                )));
            }
        }
        loop {
            let done = restored
                .finish_snapshot_restore(outbox)
                .reraise("error finishing test restore")?;
            let emitted = drain_into(outbox, output);
            if done {
                break;
            }
            check_progress(&mut idle, emitted)?;
        }
        Ok(restored)
    }
}

fn drain_into(outbox: &mut TestOutbox, output: &mut Vec<Item>) -> bool {
    let drained = outbox.drain(0);
    let emitted = !drained.is_empty();
    output.extend(drained);
    emitted
}

fn check_progress(idle: &mut usize, progress: bool) -> Result<(), ExecutionError> {
    if progress {
        *idle = 0;
        return Ok(());
    }
    *idle += 1;
    if *idle > MAX_IDLE_CALLS {
        Err(ExecutionError::ProtocolViolation(format!(
            "processor made no progress in {MAX_IDLE_CALLS} calls"
        )))
    } else {
        Ok(())
    }
}

#[test]
fn multi_bucket_offer_is_not_duplicated_on_retry() {
    let mut outbox = TestOutbox::new(vec![1, 2]);
    assert!(outbox.offer(0, &Item::Data(0.into())));
    // Bucket 0 is full, bucket 1 takes the item.
    assert!(!outbox.offer_to(&[0, 1], &Item::Data(1.into())));
    assert_eq!(outbox.len(1), 1);
    outbox.drain(0);
    assert!(outbox.offer_to(&[0, 1], &Item::Data(1.into())));
    assert_eq!(outbox.drain(0), vec![Item::Data(1.into())]);
    assert_eq!(outbox.drain(1), vec![Item::Data(1.into())]);
}

#[test]
fn snapshot_bucket_is_bounded() {
    let mut outbox = TestOutbox::new(vec![]).with_snapshot_capacity(2);
    let key = SnapshotKey::Broadcast("k".into());
    assert!(outbox.offer_to_snapshot(&key, &1.into()));
    assert!(outbox.offer_to_snapshot(&key, &2.into()));
    assert!(!outbox.offer_to_snapshot(&key, &3.into()));
    assert_eq!(outbox.drain_snapshot().len(), 2);
    assert_eq!(outbox.bucket_count(), 0);
}

#[cfg(test)]
struct RunningSum {
    sum: i64,
}

#[cfg(test)]
impl crate::processor::logic::ProcessorLogic for RunningSum {
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &Value,
        emitter: &mut crate::processor::logic::Emitter<'_>,
    ) -> crate::errors::HookResult<bool> {
        let next = self.sum + item.as_i64().unwrap_or(0);
        if emitter.try_emit(&Item::Data(next.into())) {
            self.sum = next;
            return Ok(true);
        }
        Ok(false)
    }

    fn save_snapshot(
        &mut self,
        emitter: &mut crate::processor::logic::Emitter<'_>,
    ) -> crate::errors::HookResult<bool> {
        Ok(emitter.try_emit_to_snapshot(&SnapshotKey::Broadcast("sum".into()), &self.sum.into()))
    }

    fn restore_from_snapshot(
        &mut self,
        _key: SnapshotKey,
        value: Value,
    ) -> crate::errors::HookResult<()> {
        self.sum = value.as_i64().unwrap_or(0);
        Ok(())
    }
}

#[test]
fn harness_restores_state_between_items() {
    use crate::processor::logic::LogicProcessor;

    TestSupport::verify_processor(|_| LogicProcessor::boxed(RunningSum { sum: 0 }))
        .input((1..=4).map(|i: i64| Item::Data(i.into())).collect())
        .expect_output([1, 3, 6, 10].map(|i: i64| Item::Data(i.into())).to_vec())
        .random_rejections(7)
        .verify();
}

#[test]
fn harness_detects_lost_state() {
    use crate::processor::logic::LogicProcessor;
    use crate::processor::logic::ProcessorLogic;

    struct Forgetful(RunningSum);
    impl ProcessorLogic for Forgetful {
        fn try_process(
            &mut self,
            ordinal: usize,
            item: &Value,
            emitter: &mut crate::processor::logic::Emitter<'_>,
        ) -> crate::errors::HookResult<bool> {
            self.0.try_process(ordinal, item, emitter)
        }
    }

    let support = TestSupport::verify_processor(|_| {
        LogicProcessor::boxed(Forgetful(RunningSum { sum: 0 }))
    })
    .input(vec![Item::Data(1.into()), Item::Data(1.into())]);
    assert_eq!(
        support.run(false).unwrap(),
        vec![Item::Data(1.into()), Item::Data(2.into())]
    );
    assert_eq!(
        support.run(true).unwrap(),
        vec![Item::Data(1.into()), Item::Data(1.into())]
    );
}
