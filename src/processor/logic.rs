//! Hook-based processors with resumable emission.
//!
//! Implement [`ProcessorLogic`] to describe what to do with one item
//! and wrap it in [`LogicProcessor`] to get a [`Processor`]. Hooks
//! receive an [`Emitter`] for output. The emitter keeps the item the
//! outbox rejected last and offers it again before anything else, so
//! a hook that returns `false` after a rejection loses and duplicates
//! nothing when it is called again.

use serde_json::Value;

use crate::errors::ExecutionError;
use crate::errors::HookResult;
use crate::item::Item;
use crate::item::Watermark;
use crate::snapshot::SnapshotEntry;
use crate::snapshot::SnapshotKey;

use super::Inbox;
use super::Outbox;
use super::Processor;
use super::ProcessorContext;

/// Items the outbox has not accepted yet. Only the emission routines
/// read and clear these.
#[derive(Debug, Default)]
pub(crate) struct PendingEmission {
    item: Option<Item>,
    snapshot_entry: Option<(SnapshotKey, Value)>,
}

/// Output handle given to [`ProcessorLogic`] hooks.
pub struct Emitter<'a> {
    outbox: &'a mut dyn Outbox,
    pending: &'a mut PendingEmission,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(outbox: &'a mut dyn Outbox, pending: &'a mut PendingEmission) -> Self {
        Self { outbox, pending }
    }

    pub fn bucket_count(&self) -> usize {
        self.outbox.bucket_count()
    }

    /// Offer to all edge buckets.
    pub fn try_emit(&mut self, item: &Item) -> bool {
        self.outbox.offer_all(item)
    }

    pub fn try_emit_to(&mut self, ordinal: usize, item: &Item) -> bool {
        self.outbox.offer(ordinal, item)
    }

    pub fn try_emit_to_many(&mut self, ordinals: &[usize], item: &Item) -> bool {
        self.outbox.offer_to(ordinals, item)
    }

    pub fn try_emit_to_snapshot(&mut self, key: &SnapshotKey, value: &Value) -> bool {
        self.outbox.offer_to_snapshot(key, value)
    }

    fn offer(&mut self, ordinals: Option<&[usize]>, item: &Item) -> bool {
        match ordinals {
            Some(ordinals) => self.outbox.offer_to(ordinals, item),
            None => self.outbox.offer_all(item),
        }
    }

    /// Emit items of `traverser` to all edges until it is exhausted or
    /// the outbox is full. Returns whether it was exhausted.
    pub fn emit_from_traverser<I>(&mut self, traverser: &mut I) -> bool
    where
        I: Iterator<Item = Item> + ?Sized,
    {
        self.emit_from_traverser_to(None, traverser, |_| {})
    }

    /// Emit items of `traverser` to `ordinals` (all edges on `None`),
    /// calling `on_emit` for every accepted item.
    ///
    /// The first rejected item is kept and offered before pulling the
    /// next one on the following call.
    pub fn emit_from_traverser_to<I, F>(
        &mut self,
        ordinals: Option<&[usize]>,
        traverser: &mut I,
        mut on_emit: F,
    ) -> bool
    where
        I: Iterator<Item = Item> + ?Sized,
        F: FnMut(&Item),
    {
        let mut item = match self.pending.item.take().or_else(|| traverser.next()) {
            Some(item) => item,
            None => return true,
        };
        loop {
            if !self.offer(ordinals, &item) {
                self.pending.item = Some(item);
                return false;
            }
            on_emit(&item);
            item = match traverser.next() {
                Some(item) => item,
                None => return true,
            };
        }
    }

    /// Like [`Emitter::emit_from_traverser`], for snapshot entries.
    pub fn emit_from_traverser_to_snapshot<I>(&mut self, traverser: &mut I) -> bool
    where
        I: Iterator<Item = (SnapshotKey, Value)> + ?Sized,
    {
        let mut entry = match self.pending.snapshot_entry.take().or_else(|| traverser.next()) {
            Some(entry) => entry,
            None => return true,
        };
        loop {
            if !self.outbox.offer_to_snapshot(&entry.0, &entry.1) {
                self.pending.snapshot_entry = Some(entry);
                return false;
            }
            entry = match traverser.next() {
                Some(entry) => entry,
                None => return true,
            };
        }
    }
}

/// What a processor does, without the bookkeeping of how to
/// cooperate with a bounded outbox.
///
/// Override [`ProcessorLogic::try_process`], or the ordinal-specific
/// hooks, to handle data items. Every hook returning `bool` returns
/// `false` to be called again later with the same arguments.
pub trait ProcessorLogic: Send {
    fn init(&mut self, _context: &ProcessorContext) -> HookResult<()> {
        Ok(())
    }

    fn is_cooperative(&self) -> bool {
        true
    }

    /// Handle a data item from edge `ordinal`. On `false` the item
    /// stays at the front of the inbox.
    fn try_process(
        &mut self,
        _ordinal: usize,
        _item: &Value,
        _emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        Err(ExecutionError::not_implemented("try_process").into())
    }

    fn try_process0(&mut self, item: &Value, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.try_process(0, item, emitter)
    }

    fn try_process1(&mut self, item: &Value, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.try_process(1, item, emitter)
    }

    fn try_process2(&mut self, item: &Value, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.try_process(2, item, emitter)
    }

    fn try_process3(&mut self, item: &Value, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.try_process(3, item, emitter)
    }

    fn try_process4(&mut self, item: &Value, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.try_process(4, item, emitter)
    }

    /// Handle a watermark from edge `ordinal`. Forwards it to all
    /// edges by default.
    fn try_process_wm(
        &mut self,
        _ordinal: usize,
        wm: Watermark,
        emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        Ok(emitter.try_emit(&Item::Watermark(wm)))
    }

    fn complete(&mut self, _emitter: &mut Emitter<'_>) -> HookResult<bool> {
        Ok(true)
    }

    fn save_snapshot(&mut self, _emitter: &mut Emitter<'_>) -> HookResult<bool> {
        Ok(true)
    }

    /// Take over one restored entry. Only called for processors that
    /// wrote snapshot entries.
    fn restore_from_snapshot(&mut self, _key: SnapshotKey, _value: Value) -> HookResult<()> {
        Err(ExecutionError::not_implemented("restore_from_snapshot").into())
    }

    fn finish_snapshot_restore(&mut self, _emitter: &mut Emitter<'_>) -> HookResult<bool> {
        Ok(true)
    }
}

/// Runs a [`ProcessorLogic`] as a [`Processor`].
pub struct LogicProcessor<L> {
    logic: L,
    pending: PendingEmission,
}

impl<L: ProcessorLogic> LogicProcessor<L> {
    pub fn new(logic: L) -> Self {
        Self {
            logic,
            pending: PendingEmission::default(),
        }
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }
}

impl<L: ProcessorLogic + 'static> LogicProcessor<L> {
    pub fn boxed(logic: L) -> Box<dyn Processor> {
        Box::new(Self::new(logic))
    }
}

impl<L: ProcessorLogic> Processor for LogicProcessor<L> {
    fn init(&mut self, context: &ProcessorContext) -> HookResult<()> {
        self.logic.init(context)
    }

    fn is_cooperative(&self) -> bool {
        self.logic.is_cooperative()
    }

    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut dyn Inbox<Item>,
        outbox: &mut dyn Outbox,
    ) -> HookResult<()> {
        let mut emitter = Emitter::new(outbox, &mut self.pending);
        while let Some(item) = inbox.peek() {
            let done = match item {
                Item::Watermark(wm) => self.logic.try_process_wm(ordinal, *wm, &mut emitter)?,
                Item::Data(value) => match ordinal {
                    0 => self.logic.try_process0(value, &mut emitter)?,
                    1 => self.logic.try_process1(value, &mut emitter)?,
                    2 => self.logic.try_process2(value, &mut emitter)?,
                    3 => self.logic.try_process3(value, &mut emitter)?,
                    4 => self.logic.try_process4(value, &mut emitter)?,
                    _ => self.logic.try_process(ordinal, value, &mut emitter)?,
                },
            };
            if !done {
                return Ok(());
            }
            inbox.remove();
        }
        Ok(())
    }

    fn complete(&mut self, outbox: &mut dyn Outbox) -> HookResult<bool> {
        self.logic
            .complete(&mut Emitter::new(outbox, &mut self.pending))
    }

    fn save_snapshot(&mut self, outbox: &mut dyn Outbox) -> HookResult<bool> {
        self.logic
            .save_snapshot(&mut Emitter::new(outbox, &mut self.pending))
    }

    fn restore_snapshot(&mut self, inbox: &mut dyn Inbox<SnapshotEntry>) -> HookResult<()> {
        while let Some(SnapshotEntry { key, value }) = inbox.poll() {
            self.logic.restore_from_snapshot(key, value)?;
        }
        Ok(())
    }

    fn finish_snapshot_restore(&mut self, outbox: &mut dyn Outbox) -> HookResult<bool> {
        self.logic
            .finish_snapshot_restore(&mut Emitter::new(outbox, &mut self.pending))
    }
}

#[cfg(test)]
struct Passthrough;

#[cfg(test)]
impl ProcessorLogic for Passthrough {
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &Value,
        emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        Ok(emitter.try_emit(&Item::Data(item.clone())))
    }
}

#[test]
fn traverser_emission_survives_rejections() {
    use crate::testing::TestOutbox;

    let expected: Vec<Item> = (0..50).map(|i| Item::Data(serde_json::json!(i))).collect();
    let mut traverser = expected.clone().into_iter();
    let mut outbox = TestOutbox::new(vec![1]);
    let mut pending = PendingEmission::default();
    let mut received = Vec::new();
    let mut emitted = 0;

    loop {
        let done = {
            let mut emitter = Emitter::new(&mut outbox, &mut pending);
            emitter.emit_from_traverser_to(None, &mut traverser, |_| emitted += 1)
        };
        received.extend(outbox.drain(0));
        if done {
            break;
        }
    }

    assert_eq!(received, expected);
    assert_eq!(emitted, 50);
}

#[test]
fn rejected_item_stays_in_inbox() {
    use crate::item::Item;
    use crate::processor::VecDequeInbox;
    use crate::testing::TestOutbox;

    let mut processor = LogicProcessor::new(Passthrough);
    let mut inbox = VecDequeInbox::from(vec![Item::Data(1.into()), Item::Data(2.into())]);
    let mut outbox = TestOutbox::new(vec![1]);

    processor.process(0, &mut inbox, &mut outbox).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(outbox.drain(0), vec![Item::Data(1.into())]);

    processor.process(0, &mut inbox, &mut outbox).unwrap();
    assert!(inbox.is_empty());
    assert_eq!(outbox.drain(0), vec![Item::Data(2.into())]);
}

#[test]
fn default_watermark_handling_forwards_in_order() {
    use crate::processor::VecDequeInbox;
    use crate::testing::TestOutbox;

    let mut processor = LogicProcessor::new(Passthrough);
    let mut inbox = VecDequeInbox::from(vec![Item::wm(4), Item::wm(8), Item::wm(12)]);
    let mut outbox = TestOutbox::new(vec![1, 1]);
    let mut received = Vec::new();
    while !inbox.is_empty() {
        processor.process(0, &mut inbox, &mut outbox).unwrap();
        let to_first = outbox.drain(0);
        assert_eq!(to_first, outbox.drain(1));
        received.extend(to_first);
    }
    assert_eq!(received, vec![Item::wm(4), Item::wm(8), Item::wm(12)]);
}

#[test]
fn missing_hooks_fail() {
    use crate::processor::VecDequeInbox;
    use crate::snapshot::SnapshotKey;
    use crate::testing::TestOutbox;

    struct Nothing;
    impl ProcessorLogic for Nothing {}

    let mut processor = LogicProcessor::new(Nothing);
    let mut outbox = TestOutbox::new(vec![1]);
    let mut inbox = VecDequeInbox::from(vec![Item::Data(1.into())]);
    assert!(processor.process(0, &mut inbox, &mut outbox).is_err());

    let mut restore = VecDequeInbox::from(vec![SnapshotEntry::new(
        SnapshotKey::Broadcast(1.into()),
        2.into(),
    )]);
    assert!(processor.restore_snapshot(&mut restore).is_err());
}
