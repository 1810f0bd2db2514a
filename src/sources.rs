//! Bounded sources that emit their whole input from
//! [`ProcessorLogic::complete`] and remember how far they got in
//! snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use serde_json::Value;

use crate::errors::ExecutionError;
use crate::errors::HookResult;
use crate::item::Item;
use crate::processor::logic::Emitter;
use crate::processor::logic::ProcessorLogic;
use crate::processor::ProcessorContext;
use crate::snapshot::SnapshotKey;

fn offset_from(value: &Value) -> HookResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| ExecutionError::ProtocolViolation(format!("{value} is not an offset")).into())
}

/// Emits the items of a shared list.
///
/// Instance `i` of `n` emits the items at indexes `i, i + n, ...`.
/// The number of emitted items is saved under a broadcast key holding
/// the global index, so each instance finds its own offset on restore.
pub struct ListSourceP {
    items: Vec<Value>,
    global_index: usize,
    offset: usize,
}

impl ListSourceP {
    pub fn new(list: &Arc<Vec<Value>>, context: &ProcessorContext) -> Self {
        let total = context.total_parallelism.max(1);
        let items = list
            .iter()
            .skip(context.global_index)
            .step_by(total)
            .cloned()
            .collect();
        Self {
            items,
            global_index: context.global_index,
            offset: 0,
        }
    }
}

impl ProcessorLogic for ListSourceP {
    fn complete(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        while let Some(item) = self.items.get(self.offset) {
            if !emitter.try_emit(&Item::Data(item.clone())) {
                return Ok(false);
            }
            self.offset += 1;
        }
        Ok(true)
    }

    fn save_snapshot(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        Ok(emitter.try_emit_to_snapshot(
            &SnapshotKey::Broadcast(json!(self.global_index)),
            &json!(self.offset),
        ))
    }

    fn restore_from_snapshot(&mut self, key: SnapshotKey, value: Value) -> HookResult<()> {
        if key.value() == &json!(self.global_index) {
            self.offset = offset_from(&value)? as usize;
        }
        Ok(())
    }
}

/// Emits `[partition, seq]` for `seq` in `0..count` in each of its
/// partitions.
///
/// Partition `p` belongs to the instance with global index
/// `p % total_parallelism`. The generator always emits from the
/// partition that is furthest behind, so `seq` is non-decreasing in
/// its output and can serve as an event timestamp.
///
/// Offsets are saved under broadcast keys. On restore every instance
/// sees all offsets and keeps those of the partitions it owns now,
/// which may differ from before when the parallelism changed.
pub struct SequenceGeneratorP {
    count: u64,
    /// Next `seq` per owned partition.
    offsets: BTreeMap<usize, u64>,
    /// Partition emitted next, `None` once all are exhausted.
    cursor: Option<usize>,
    /// Partition whose offset is saved next.
    snapshot_cursor: Option<usize>,
}

impl SequenceGeneratorP {
    pub fn new(partition_count: usize, count: u64, context: &ProcessorContext) -> Self {
        let total = context.total_parallelism.max(1);
        let offsets = (0..partition_count)
            .filter(|p| p % total == context.global_index)
            .map(|p| (p, 0))
            .collect();
        let mut generator = Self {
            count,
            offsets,
            cursor: None,
            snapshot_cursor: None,
        };
        generator.advance_cursor();
        generator
    }

    fn advance_cursor(&mut self) {
        self.cursor = self
            .offsets
            .iter()
            .filter(|(_, offset)| **offset < self.count)
            .min_by_key(|(partition, offset)| (**offset, **partition))
            .map(|(partition, _)| *partition);
    }
}

impl ProcessorLogic for SequenceGeneratorP {
    fn complete(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        while let Some(partition) = self.cursor {
            let offset = self.offsets.get(&partition).copied().unwrap_or(self.count);
            if !emitter.try_emit(&Item::Data(json!([partition, offset]))) {
                return Ok(false);
            }
            self.offsets.insert(partition, offset + 1);
            self.advance_cursor();
        }
        Ok(true)
    }

    fn save_snapshot(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        let mut pending = match self.snapshot_cursor.take() {
            Some(partition) => self.offsets.range(partition..),
            None => self.offsets.range(..),
        };
        while let Some((partition, offset)) = pending.next() {
            if !emitter.try_emit_to_snapshot(&SnapshotKey::Broadcast(json!(partition)), &json!(offset))
            {
                self.snapshot_cursor = Some(*partition);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn restore_from_snapshot(&mut self, key: SnapshotKey, value: Value) -> HookResult<()> {
        let Some(partition) = key.value().as_u64() else {
            return Err(ExecutionError::ProtocolViolation(format!(
                "{} is not a partition",
                key.value()
            ))
            .into());
        };
        if let Some(offset) = self.offsets.get_mut(&(partition as usize)) {
            *offset = offset_from(&value)?;
        }
        Ok(())
    }

    fn finish_snapshot_restore(&mut self, _emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.advance_cursor();
        Ok(true)
    }
}

#[cfg(test)]
fn drain_complete(processor: &mut dyn crate::processor::Processor, limit: usize) -> Vec<Value> {
    use crate::testing::TestOutbox;

    let mut outbox = TestOutbox::new(vec![3]);
    let mut output = Vec::new();
    while output.len() < limit {
        let done = processor.complete(&mut outbox).unwrap();
        output.extend(outbox.drain(0).into_iter().map(|item| item.decode().unwrap()));
        if done {
            break;
        }
    }
    output
}

#[test]
fn list_source_splits_by_global_index() {
    use crate::processor::logic::LogicProcessor;

    let list = Arc::new((0..10).map(Value::from).collect::<Vec<_>>());
    let mut all = Vec::new();
    for i in 0..3 {
        let context = ProcessorContext::standalone("list").with_index(i, 3);
        let mut source = LogicProcessor::new(ListSourceP::new(&list, &context));
        all.extend(drain_complete(&mut source, usize::MAX));
    }
    all.sort_by_key(|v| v.as_i64());
    assert_eq!(all, *list);
}

#[test]
fn generator_owns_disjoint_partitions() {
    use crate::processor::logic::LogicProcessor;

    let mut seen = Vec::new();
    for i in 0..2 {
        let context = ProcessorContext::standalone("gen").with_index(i, 2);
        let mut generator = LogicProcessor::new(SequenceGeneratorP::new(5, 3, &context));
        let output = drain_complete(&mut generator, usize::MAX);
        // Offsets never go back.
        let seqs: Vec<_> = output.iter().map(|v| v[1].as_u64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[0] <= w[1]));
        seen.extend(output);
    }
    assert_eq!(seen.len(), 15);
    let partitions: std::collections::BTreeSet<_> =
        seen.iter().map(|v| v[0].as_u64().unwrap()).collect();
    assert_eq!(partitions.len(), 5);
}

#[test]
fn generator_resumes_from_snapshot() {
    use crate::processor::logic::LogicProcessor;
    use crate::processor::Processor;
    use crate::processor::VecDequeInbox;
    use crate::snapshot::SnapshotEntry;
    use crate::testing::TestOutbox;

    let context = ProcessorContext::standalone("gen");
    let mut first = LogicProcessor::new(SequenceGeneratorP::new(4, 10, &context));
    let before = drain_complete(&mut first, 13);

    let mut outbox = TestOutbox::new(vec![3]).with_snapshot_capacity(1);
    let mut entries = Vec::new();
    while !first.save_snapshot(&mut outbox).unwrap() {
        entries.extend(outbox.drain_snapshot());
    }
    entries.extend(outbox.drain_snapshot());
    assert_eq!(entries.len(), 4);

    let mut second = LogicProcessor::new(SequenceGeneratorP::new(4, 10, &context));
    let mut inbox = VecDequeInbox::from(
        entries
            .into_iter()
            .map(|(key, value)| SnapshotEntry::new(key, value))
            .collect::<Vec<_>>(),
    );
    second.restore_snapshot(&mut inbox).unwrap();
    assert!(second.finish_snapshot_restore(&mut outbox).unwrap());
    let after = drain_complete(&mut second, usize::MAX);

    let mut all: Vec<_> = before.into_iter().chain(after).collect();
    assert_eq!(all.len(), 40);
    all.sort_by_key(|v| (v[0].as_u64(), v[1].as_u64()));
    all.dedup();
    assert_eq!(all.len(), 40);
}
