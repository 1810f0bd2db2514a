//! Event-time windowing.
//!
//! Architecture
//! ------------
//!
//! Windowing is split into two processors:
//! [`insert_watermarks::InsertWatermarksP`] assigns watermarks to a
//! stream of timestamped items, and [`sliding_window::SlidingWindowP`]
//! groups items by key into windows that are closed by those
//! watermarks.
//!
//! Time is cut into tumbling *frames* of
//! [`WindowDefinition::frame_length`]. A frame is identified by its
//! end timestamp, which is exclusive: an item with timestamp `ts`
//! belongs to the frame [`WindowDefinition::higher_frame_ts`]. A
//! sliding window is a run of consecutive frames, so items are only
//! ever accumulated once per frame and windows are built by combining
//! frame accumulators.
//!
//! Accumulators are JSON values so that they can be written to
//! snapshots and sent between stages as they are.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::ExecutionError;

pub mod insert_watermarks;
pub mod sliding_window;

/// Frame and window lengths, in the unit of item timestamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDefinition {
    frame_length: i64,
    frame_offset: i64,
    window_length: i64,
}

impl WindowDefinition {
    /// Windows of `window_length` starting every `slide_by`.
    ///
    /// The window length must be a multiple of the slide.
    pub fn sliding(window_length: i64, slide_by: i64) -> Result<Self, ExecutionError> {
        if slide_by <= 0 || window_length <= 0 {
            return Err(ExecutionError::Config(format!(
                "window length {window_length} and slide {slide_by} must be positive"
            )));
        }
        if window_length % slide_by != 0 {
            return Err(ExecutionError::Config(format!(
                "window length {window_length} is not a multiple of slide {slide_by}"
            )));
        }
        Ok(Self {
            frame_length: slide_by,
            frame_offset: 0,
            window_length,
        })
    }

    /// Adjacent, non-overlapping windows.
    pub fn tumbling(window_length: i64) -> Result<Self, ExecutionError> {
        Self::sliding(window_length, window_length)
    }

    /// Shift frame boundaries by `offset`.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.frame_offset = offset.rem_euclid(self.frame_length);
        self
    }

    pub fn frame_length(&self) -> i64 {
        self.frame_length
    }

    pub fn frame_offset(&self) -> i64 {
        self.frame_offset
    }

    pub fn window_length(&self) -> i64 {
        self.window_length
    }

    pub fn is_tumbling(&self) -> bool {
        self.window_length == self.frame_length
    }

    /// Highest frame boundary that is not above `ts`.
    pub fn floor_frame_ts(&self, ts: i64) -> i64 {
        let into_frame =
            (ts as i128 - self.frame_offset as i128).rem_euclid(self.frame_length as i128);
        (ts as i128 - into_frame).max(i64::MIN as i128) as i64
    }

    /// End of the frame `ts` belongs to.
    ///
    /// Saturates at [`i64::MAX`].
    pub fn higher_frame_ts(&self, ts: i64) -> i64 {
        self.floor_frame_ts(ts).saturating_add(self.frame_length)
    }
}

/// Result of an aggregation for one key and one frame or window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEntry {
    pub timestamp: i64,
    pub key: Value,
    pub value: Value,
}

impl TimestampedEntry {
    pub fn new(timestamp: i64, key: Value, value: Value) -> Self {
        Self {
            timestamp,
            key,
            value,
        }
    }
}

/// How to fold items into an accumulator and combine accumulators.
pub trait AggregateOperation: Send + Sync {
    fn create(&self) -> Value;

    fn accumulate(&self, acc: &mut Value, item: &Value);

    /// Merge `other` into `acc`. Accumulators of different frames
    /// and of different instances are combined with this.
    fn combine(&self, acc: &mut Value, other: &Value);

    fn finish(&self, acc: &Value) -> Value {
        acc.clone()
    }
}

/// Counts items.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counting;

impl AggregateOperation for Counting {
    fn create(&self) -> Value {
        Value::from(0)
    }

    fn accumulate(&self, acc: &mut Value, _item: &Value) {
        *acc = Value::from(acc.as_i64().unwrap_or(0) + 1);
    }

    fn combine(&self, acc: &mut Value, other: &Value) {
        *acc = Value::from(acc.as_i64().unwrap_or(0) + other.as_i64().unwrap_or(0));
    }
}

/// Sums an integer extracted from each item. Items without one count
/// as zero.
pub struct Summing<F> {
    value_fn: F,
}

impl<F> Summing<F>
where
    F: Fn(&Value) -> Option<i64> + Send + Sync,
{
    pub fn new(value_fn: F) -> Self {
        Self { value_fn }
    }
}

impl<F> AggregateOperation for Summing<F>
where
    F: Fn(&Value) -> Option<i64> + Send + Sync,
{
    fn create(&self) -> Value {
        Value::from(0)
    }

    fn accumulate(&self, acc: &mut Value, item: &Value) {
        let add = (self.value_fn)(item).unwrap_or(0);
        *acc = Value::from(acc.as_i64().unwrap_or(0).wrapping_add(add));
    }

    fn combine(&self, acc: &mut Value, other: &Value) {
        *acc = Value::from(
            acc.as_i64()
                .unwrap_or(0)
                .wrapping_add(other.as_i64().unwrap_or(0)),
        );
    }
}

#[test]
fn frame_boundaries() {
    let def = WindowDefinition::tumbling(4).unwrap();
    assert_eq!(def.higher_frame_ts(0), 4);
    assert_eq!(def.higher_frame_ts(3), 4);
    assert_eq!(def.higher_frame_ts(4), 8);
    assert_eq!(def.higher_frame_ts(-1), 0);
    assert_eq!(def.floor_frame_ts(-5), -8);
    assert_eq!(def.higher_frame_ts(i64::MAX), i64::MAX);
    assert_eq!(def.floor_frame_ts(i64::MIN), i64::MIN);

    let shifted = def.with_offset(1);
    assert_eq!(shifted.floor_frame_ts(0), -3);
    assert_eq!(shifted.higher_frame_ts(1), 5);
}

#[test]
fn window_length_must_fit_frames() {
    assert!(WindowDefinition::sliding(10, 3).is_err());
    assert!(WindowDefinition::sliding(10, 0).is_err());
    let def = WindowDefinition::sliding(12, 4).unwrap();
    assert!(!def.is_tumbling());
    assert_eq!(def.frame_length(), 4);
}

#[test]
fn summing_combines() {
    let op = Summing::new(|item: &Value| item.as_i64());
    let mut left = op.create();
    op.accumulate(&mut left, &Value::from(3));
    op.accumulate(&mut left, &Value::from("x"));
    let mut right = op.create();
    op.accumulate(&mut right, &Value::from(4));
    op.combine(&mut left, &right);
    assert_eq!(op.finish(&left), Value::from(7));
}
