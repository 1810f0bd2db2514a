//! Watermarks from item timestamps.

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

use super::sliding_window::TimestampFn;
use super::WindowDefinition;

/// Watermark trailing the highest timestamp seen by a fixed lag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WatermarkPolicy {
    lag: i64,
    top: i64,
}

impl WatermarkPolicy {
    pub fn with_fixed_lag(lag: i64) -> Self {
        Self { lag, top: i64::MIN }
    }

    /// Report a timestamp and return the current watermark.
    pub fn report_event(&mut self, ts: i64) -> i64 {
        self.top = self.top.max(ts);
        self.current()
    }

    pub fn current(&self) -> i64 {
        self.top.saturating_sub(self.lag)
    }
}

/// Inserts watermarks into a stream of timestamped items.
///
/// Watermarks are only emitted when they reach a new frame boundary
/// of the window definition, so downstream windows see one watermark
/// per frame instead of one per item. An item behind the last emitted
/// watermark is late and dropped.
pub struct InsertWatermarksP {
    timestamp_fn: TimestampFn,
    policy: WatermarkPolicy,
    definition: WindowDefinition,
    global_index: usize,
    last_emitted: i64,
    pending: Option<std::vec::IntoIter<Item>>,
    restored: Option<(i64, i64)>,
}

impl InsertWatermarksP {
    pub fn new<T>(
        timestamp_fn: T,
        policy: WatermarkPolicy,
        definition: WindowDefinition,
        context: &ProcessorContext,
    ) -> Self
    where
        T: Fn(&Value) -> Option<i64> + Send + Sync + 'static,
    {
        Self {
            timestamp_fn: Arc::new(timestamp_fn),
            policy,
            definition,
            global_index: context.global_index,
            last_emitted: i64::MIN,
            pending: None,
            restored: None,
        }
    }

    fn output_for(&mut self, item: &Value) -> HookResult<Vec<Item>> {
        let ts = (self.timestamp_fn)(item)
            .ok_or_else(|| ExecutionError::ProtocolViolation(format!("{item} has no timestamp")))?;
        if ts < self.last_emitted {
            tracing::trace!("Dropping late item at {ts}, watermark is {}", self.last_emitted);
            return Ok(Vec::new());
        }
        let wm = self.definition.floor_frame_ts(self.policy.report_event(ts));
        let mut output = Vec::with_capacity(2);
        if wm > self.last_emitted {
            self.last_emitted = wm;
            output.push(Item::wm(wm));
        }
        output.push(Item::Data(item.clone()));
        Ok(output)
    }
}

impl ProcessorLogic for InsertWatermarksP {
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &Value,
        emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        let mut output = match self.pending.take() {
            Some(output) => output,
            None => self.output_for(item)?.into_iter(),
        };
        if emitter.emit_from_traverser(&mut output) {
            return Ok(true);
        }
        self.pending = Some(output);
        Ok(false)
    }

    fn save_snapshot(&mut self, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        Ok(emitter.try_emit_to_snapshot(
            &SnapshotKey::Broadcast(json!(["insert-watermarks", self.global_index])),
            &json!({ "top": self.policy.top, "last_emitted": self.last_emitted }),
        ))
    }

    /// Keeps the lowest restored state of all instances, as items of
    /// any of them may be routed here now.
    fn restore_from_snapshot(&mut self, _key: SnapshotKey, value: Value) -> HookResult<()> {
        let read = |name: &str| {
            value[name].as_i64().ok_or_else(|| {
                ExecutionError::ProtocolViolation(format!("{value} has no `{name}`"))
            })
        };
        let (top, last_emitted) = (read("top")?, read("last_emitted")?);
        self.restored = Some(match self.restored {
            Some((t, l)) => (t.min(top), l.min(last_emitted)),
            None => (top, last_emitted),
        });
        Ok(())
    }

    fn finish_snapshot_restore(&mut self, _emitter: &mut Emitter<'_>) -> HookResult<bool> {
        if let Some((top, last_emitted)) = self.restored.take() {
            self.policy.top = top;
            self.last_emitted = last_emitted;
        }
        Ok(true)
    }
}

#[test]
fn watermarks_follow_frames_and_late_items_drop() {
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    let definition = WindowDefinition::tumbling(4).unwrap();
    let event = |ts: i64| Item::Data(json!([ts]));
    TestSupport::verify_processor(move |context| {
        LogicProcessor::boxed(InsertWatermarksP::new(
            |item| item[0].as_i64(),
            WatermarkPolicy::with_fixed_lag(1),
            definition,
            context,
        ))
    })
    .input(vec![event(4), event(6), event(5), event(3), event(13)])
    .expect_output(vec![
        Item::wm(0),
        event(4),
        Item::wm(4),
        event(6),
        event(5),
        Item::wm(12),
        event(13),
    ])
    .random_rejections(11)
    .verify();
}

#[test]
fn lag_is_applied_to_the_top_timestamp() {
    let mut policy = WatermarkPolicy::with_fixed_lag(3);
    assert_eq!(policy.current(), i64::MIN);
    assert_eq!(policy.report_event(10), 7);
    assert_eq!(policy.report_event(8), 7);
}
