//! Keyed sliding-window aggregation closed by watermarks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use serde_json::Value;

use crate::errors::ExecutionError;
use crate::errors::HookResult;
use crate::item::Item;
use crate::item::Watermark;
use crate::processor::logic::Emitter;
use crate::processor::logic::ProcessorLogic;
use crate::snapshot::SnapshotKey;

use super::AggregateOperation;
use super::TimestampedEntry;
use super::WindowDefinition;

pub type KeyFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type TimestampFn = Arc<dyn Fn(&Value) -> Option<i64> + Send + Sync>;

/// Key of the broadcast snapshot entry with the emission progress.
const PROGRESS_KEY: &str = "sliding-window-progress";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    /// Emit one entry per frame and key.
    Frames,
    /// Combine frames and emit one entry per window and key.
    Windows,
}

/// Accumulators of one frame, by the JSON text of the key.
type Frame = BTreeMap<String, (Value, Value)>;

/// Groups items by key and frame and emits aggregated results as
/// [`TimestampedEntry`]s once a watermark has passed them.
///
/// In frame mode ([`SlidingWindowP::frames`]) a watermark `wm`
/// closes every frame ending at or before `wm`. In window mode
/// ([`SlidingWindowP::windows`]) it closes every window ending at or
/// before `wm`. Closed results are emitted in timestamp order, then
/// the watermark is forwarded. Items that belong to an already closed
/// frame are dropped.
///
/// [`ProcessorLogic::complete`] closes everything that is left. It
/// only visits frames that exist, so sparse or far-apart timestamps
/// don't make it slow.
pub struct SlidingWindowP {
    mode: Mode,
    definition: WindowDefinition,
    key_fn: KeyFn,
    timestamp_fn: TimestampFn,
    operation: Arc<dyn AggregateOperation>,
    frames: BTreeMap<i64, Frame>,
    /// End of the next window to emit in window mode.
    next_window: Option<i64>,
    /// Results of the window at `next_window` already emitted.
    window_cursor: usize,
    /// Highest watermark forwarded. Frames up to it are closed.
    closed_up_to: i64,
    restored_closed_up_to: Option<i64>,
    snapshot_output: Option<std::vec::IntoIter<(SnapshotKey, Value)>>,
}

impl SlidingWindowP {
    fn new<K, T>(
        mode: Mode,
        definition: WindowDefinition,
        key_fn: K,
        timestamp_fn: T,
        operation: Arc<dyn AggregateOperation>,
    ) -> Self
    where
        K: Fn(&Value) -> Value + Send + Sync + 'static,
        T: Fn(&Value) -> Option<i64> + Send + Sync + 'static,
    {
        Self {
            mode,
            definition,
            key_fn: Arc::new(key_fn),
            timestamp_fn: Arc::new(timestamp_fn),
            operation,
            frames: BTreeMap::new(),
            next_window: None,
            window_cursor: 0,
            closed_up_to: i64::MIN,
            restored_closed_up_to: None,
            snapshot_output: None,
        }
    }

    /// Emit per-frame accumulations, the first stage of a two-stage
    /// aggregation.
    pub fn frames<K, T>(
        definition: WindowDefinition,
        key_fn: K,
        timestamp_fn: T,
        operation: Arc<dyn AggregateOperation>,
    ) -> Self
    where
        K: Fn(&Value) -> Value + Send + Sync + 'static,
        T: Fn(&Value) -> Option<i64> + Send + Sync + 'static,
    {
        Self::new(Mode::Frames, definition, key_fn, timestamp_fn, operation)
    }

    /// Emit finished sliding windows.
    pub fn windows<K, T>(
        definition: WindowDefinition,
        key_fn: K,
        timestamp_fn: T,
        operation: Arc<dyn AggregateOperation>,
    ) -> Self
    where
        K: Fn(&Value) -> Value + Send + Sync + 'static,
        T: Fn(&Value) -> Option<i64> + Send + Sync + 'static,
    {
        Self::new(Mode::Windows, definition, key_fn, timestamp_fn, operation)
    }

    /// Whether no accumulator is held.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn accumulate(&mut self, frame_ts: i64, key: Value, item: &Value) {
        let operation = &self.operation;
        let (_, acc) = self
            .frames
            .entry(frame_ts)
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| (key, operation.create()));
        operation.accumulate(acc, item);
    }

    fn combine(&mut self, frame_ts: i64, key: Value, other: &Value) {
        let operation = &self.operation;
        let (_, acc) = self
            .frames
            .entry(frame_ts)
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| (key, operation.create()));
        operation.combine(acc, other);
    }

    /// Emit everything closed by `limit`. Returns whether all of it
    /// was emitted.
    fn emit_closed(&mut self, limit: i64, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        match self.mode {
            Mode::Frames => self.emit_closed_frames(limit, emitter),
            Mode::Windows => self.emit_closed_windows(limit, emitter),
        }
    }

    fn emit_closed_frames(&mut self, limit: i64, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        while let Some(mut frame) = self.frames.first_entry() {
            let frame_ts = *frame.key();
            if frame_ts > limit {
                break;
            }
            // Accumulators leave the state only once their result was
            // accepted, so a snapshot in between loses nothing.
            while let Some((key, acc)) = frame.get().values().next() {
                let value = self.operation.finish(acc);
                let entry = TimestampedEntry::new(frame_ts, key.clone(), value);
                if !emitter.try_emit(&Item::encode(&entry)?) {
                    return Ok(false);
                }
                frame.get_mut().pop_first();
            }
            frame.remove();
        }
        Ok(true)
    }

    fn emit_closed_windows(&mut self, limit: i64, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        let frame_length = self.definition.frame_length();
        let window_length = self.definition.window_length();
        loop {
            let Some(first_frame) = self.frames.keys().next().copied() else {
                break;
            };
            // Skip the windows that have no frames.
            let end = match self.next_window {
                Some(next) if next >= first_frame => next,
                _ => first_frame,
            };
            if end > limit {
                break;
            }
            self.next_window = Some(end);

            let results = self.window_results(end);
            for entry in results.iter().skip(self.window_cursor) {
                if !emitter.try_emit(&Item::encode(entry)?) {
                    return Ok(false);
                }
                self.window_cursor += 1;
            }
            self.window_cursor = 0;

            match end.checked_add(frame_length) {
                Some(next) => {
                    // Frames up to `end - window_length + frame_length`
                    // are in no later window.
                    let keep_from =
                        end as i128 - window_length as i128 + frame_length as i128 + 1;
                    let keep_from = keep_from.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
                    self.frames = self.frames.split_off(&keep_from);
                    self.next_window = Some(next);
                }
                // No window ends after `end`.
                None => {
                    self.frames.clear();
                    self.next_window = Some(i64::MAX);
                }
            }
        }
        Ok(true)
    }

    /// Combined results of the window ending at `end`, ordered by key.
    fn window_results(&self, end: i64) -> Vec<TimestampedEntry> {
        let start = end as i128 - self.definition.window_length() as i128 + 1;
        let start = start.max(i64::MIN as i128) as i64;
        let mut combined = Frame::new();
        for frame in self.frames.range(start..=end).map(|(_, f)| f) {
            for (text, (key, acc)) in frame {
                let (_, window_acc) = combined
                    .entry(text.clone())
                    .or_insert_with(|| (key.clone(), self.operation.create()));
                self.operation.combine(window_acc, acc);
            }
        }
        combined
            .into_values()
            .map(|(key, acc)| TimestampedEntry::new(end, key, self.operation.finish(&acc)))
            .collect()
    }

    fn snapshot_entries(&self) -> Vec<(SnapshotKey, Value)> {
        let mut entries: Vec<_> = self
            .frames
            .iter()
            .flat_map(|(frame_ts, frame)| {
                frame.values().map(move |(key, acc)| {
                    (
                        SnapshotKey::Partitioned(key.clone()),
                        json!({ "frame": frame_ts, "acc": acc }),
                    )
                })
            })
            .collect();
        entries.push((
            SnapshotKey::Broadcast(json!(PROGRESS_KEY)),
            json!({ "next_window": self.next_window, "closed_up_to": self.closed_up_to }),
        ));
        entries
    }
}

fn field<'a>(value: &'a Value, name: &str) -> HookResult<&'a Value> {
    value
        .get(name)
        .ok_or_else(|| ExecutionError::ProtocolViolation(format!("{value} has no `{name}`")).into())
}

impl ProcessorLogic for SlidingWindowP {
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &Value,
        _emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        let ts = (self.timestamp_fn)(item).ok_or_else(|| {
            ExecutionError::ProtocolViolation(format!("{item} has no timestamp"))
        })?;
        let frame_ts = self.definition.higher_frame_ts(ts);
        if frame_ts <= self.closed_up_to {
            tracing::trace!("Dropping late item in closed frame {frame_ts}");
            return Ok(true);
        }
        let key = (self.key_fn)(item);
        self.accumulate(frame_ts, key, item);
        Ok(true)
    }

    fn try_process_wm(
        &mut self,
        _ordinal: usize,
        wm: Watermark,
        emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        if !self.emit_closed(wm.timestamp(), emitter)? {
            return Ok(false);
        }
        if !emitter.try_emit(&Item::Watermark(wm)) {
            return Ok(false);
        }
        self.closed_up_to = self.closed_up_to.max(wm.timestamp());
        Ok(true)
    }

    fn complete(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        self.emit_closed(i64::MAX, emitter)
    }

    fn save_snapshot(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        let mut output = match self.snapshot_output.take() {
            Some(output) => output,
            None => self.snapshot_entries().into_iter(),
        };
        if emitter.emit_from_traverser_to_snapshot(&mut output) {
            return Ok(true);
        }
        self.snapshot_output = Some(output);
        Ok(false)
    }

    fn restore_from_snapshot(&mut self, key: SnapshotKey, value: Value) -> HookResult<()> {
        match key {
            SnapshotKey::Broadcast(_) => {
                // Every instance saved its own progress. Resume from
                // the one that got least far.
                if let Some(next) = field(&value, "next_window")?.as_i64() {
                    self.next_window = Some(self.next_window.map_or(next, |n| n.min(next)));
                }
                let closed = field(&value, "closed_up_to")?.as_i64().unwrap_or(i64::MIN);
                self.restored_closed_up_to =
                    Some(self.restored_closed_up_to.map_or(closed, |c| c.min(closed)));
            }
            SnapshotKey::Partitioned(key) => {
                let frame_ts = field(&value, "frame")?.as_i64().ok_or_else(|| {
                    ExecutionError::ProtocolViolation(format!("bad frame in {value}"))
                })?;
                self.combine(frame_ts, key, field(&value, "acc")?);
            }
        }
        Ok(())
    }

    fn finish_snapshot_restore(&mut self, _emitter: &mut Emitter<'_>) -> HookResult<bool> {
        if let Some(closed) = self.restored_closed_up_to.take() {
            self.closed_up_to = closed;
        }
        Ok(true)
    }
}

#[cfg(test)]
fn counting_frames(definition: WindowDefinition) -> SlidingWindowP {
    SlidingWindowP::frames(
        definition,
        |_| json!("key"),
        |item| item[0].as_i64(),
        Arc::new(super::Counting),
    )
}

#[cfg(test)]
fn frame(ts: i64, count: i64) -> Item {
    Item::encode(&TimestampedEntry::new(ts, json!("key"), json!(count))).unwrap()
}

#[cfg(test)]
fn event(ts: i64) -> Item {
    Item::Data(json!([ts, 1]))
}

#[test]
fn frames_close_on_watermarks() {
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    let definition = WindowDefinition::tumbling(4).unwrap();
    TestSupport::verify_processor(move |_| LogicProcessor::boxed(counting_frames(definition)))
        .input(vec![
            event(0),
            event(1),
            Item::wm(4),
            event(4),
            event(5),
            event(8),
            event(8),
            Item::wm(8),
            event(8),
            Item::wm(12),
            Item::wm(16),
            Item::wm(20),
        ])
        .expect_output(vec![
            frame(4, 2),
            Item::wm(4),
            frame(8, 2),
            Item::wm(8),
            frame(12, 3),
            Item::wm(12),
            Item::wm(16),
            Item::wm(20),
        ])
        .random_rejections(3)
        .verify();
}

#[test]
fn state_is_empty_once_frames_closed() {
    use crate::processor::logic::LogicProcessor;
    use crate::processor::Inbox;
    use crate::processor::Processor;
    use crate::processor::VecDequeInbox;
    use crate::testing::TestOutbox;

    let definition = WindowDefinition::tumbling(4).unwrap();
    let mut processor = LogicProcessor::new(counting_frames(definition));
    let mut inbox = VecDequeInbox::from(vec![event(0), event(5), event(9), Item::wm(12)]);
    let mut outbox = TestOutbox::new(vec![16]);
    processor.process(0, &mut inbox, &mut outbox).unwrap();
    assert!(inbox.is_empty());
    assert_eq!(
        outbox.drain(0),
        vec![frame(4, 1), frame(8, 1), frame(12, 1), Item::wm(12)]
    );
    assert!(processor.logic().is_empty());
}

#[test]
fn watermarks_pass_without_events() {
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    let definition = WindowDefinition::tumbling(4).unwrap();
    TestSupport::verify_processor(move |_| LogicProcessor::boxed(counting_frames(definition)))
        .input(vec![Item::wm(4), Item::wm(8), Item::wm(12)])
        .expect_output(vec![Item::wm(4), Item::wm(8), Item::wm(12)])
        .verify();
}

#[test]
fn complete_flushes_pending_frames_in_order() {
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    let definition = WindowDefinition::tumbling(4).unwrap();
    TestSupport::verify_processor(move |_| LogicProcessor::boxed(counting_frames(definition)))
        .input(vec![event(0), event(1), event(4), event(8), Item::wm(4)])
        .expect_output(vec![frame(4, 2), Item::wm(4), frame(8, 1), frame(12, 1)])
        .verify();

    // Far-apart timestamps must not be walked one frame at a time.
    TestSupport::verify_processor(move |_| LogicProcessor::boxed(counting_frames(definition)))
        .input(vec![event(0), event(i64::MAX - 2)])
        .expect_output(vec![frame(4, 1), frame(i64::MAX, 1)])
        .verify();
}

#[test]
fn late_items_are_dropped() {
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    let definition = WindowDefinition::tumbling(4).unwrap();
    TestSupport::verify_processor(move |_| LogicProcessor::boxed(counting_frames(definition)))
        .input(vec![Item::wm(8), event(2), event(8)])
        .expect_output(vec![Item::wm(8), frame(12, 1)])
        .verify();
}

#[test]
fn sliding_windows_combine_frames() {
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    // Windows of 4 sliding by 2: frames end at 2, 4, 6, ...
    let definition = WindowDefinition::sliding(4, 2).unwrap();
    let window = |ts, count| frame(ts, count);
    TestSupport::verify_processor(move |_| {
        LogicProcessor::boxed(SlidingWindowP::windows(
            definition,
            |_| json!("key"),
            |item| item[0].as_i64(),
            Arc::new(super::Counting),
        ))
    })
    .input(vec![event(0), event(1), event(2), Item::wm(4), event(5)])
    .expect_output(vec![
        window(2, 2),
        window(4, 3),
        Item::wm(4),
        window(6, 2),
        window(8, 1),
    ])
    .verify();
}

#[test]
fn windows_at_timestamp_extremes() {
    use crate::processor::logic::LogicProcessor;
    use crate::processor::ProcessorContext;
    use crate::testing::TestSupport;

    let definition = WindowDefinition::sliding(4, 2).unwrap();
    let windows = move |_: &ProcessorContext| {
        LogicProcessor::boxed(SlidingWindowP::windows(
            definition,
            |_| json!("key"),
            |item| item[0].as_i64(),
            Arc::new(super::Counting),
        ))
    };

    // The last window ends at the top frame and completion stops there.
    TestSupport::verify_processor(windows)
        .input(vec![event(i64::MAX - 1)])
        .expect_output(vec![frame(i64::MAX, 1)])
        .verify();

    // The lowest frame stays for the next window.
    TestSupport::verify_processor(windows)
        .input(vec![event(i64::MIN), event(i64::MIN + 1)])
        .expect_output(vec![frame(i64::MIN + 2, 2), frame(i64::MIN + 4, 2)])
        .verify();

    TestSupport::verify_processor(move |_| LogicProcessor::boxed(counting_frames(definition)))
        .input(vec![event(i64::MIN), Item::wm(i64::MIN + 2)])
        .expect_output(vec![frame(i64::MIN + 2, 1), Item::wm(i64::MIN + 2)])
        .verify();
}

#[test]
fn restored_partials_of_a_key_merge() {
    use crate::processor::logic::LogicProcessor;
    use crate::processor::Processor;
    use crate::processor::VecDequeInbox;
    use crate::snapshot::SnapshotEntry;
    use crate::testing::TestOutbox;

    // Two members held partial counts of the same key and frame.
    let definition = WindowDefinition::tumbling(4).unwrap();
    let mut processor = LogicProcessor::new(counting_frames(definition));
    let mut entries = VecDequeInbox::from(vec![
        SnapshotEntry::new(
            SnapshotKey::Partitioned(json!("key")),
            json!({ "frame": 4, "acc": 2 }),
        ),
        SnapshotEntry::new(
            SnapshotKey::Partitioned(json!("key")),
            json!({ "frame": 4, "acc": 3 }),
        ),
    ]);
    processor.restore_snapshot(&mut entries).unwrap();
    let mut outbox = TestOutbox::new(vec![16]);
    assert!(processor.finish_snapshot_restore(&mut outbox).unwrap());
    assert!(processor.complete(&mut outbox).unwrap());
    assert_eq!(outbox.drain(0), vec![frame(4, 5)]);
}
