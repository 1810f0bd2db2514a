//! One-to-many emission helper.

use serde_json::Value;

use crate::errors::HookResult;
use crate::item::Item;

use super::logic::Emitter;

/// Binds a one-item-to-many-items function and the target edges.
///
/// Use it from [`super::logic::ProcessorLogic::try_process`]: the
/// output of an input item is created on the first call for it and
/// the item only counts as processed once all of its output was
/// accepted.
///
/// ```
/// use flowcore::errors::HookResult;
/// use flowcore::item::Item;
/// use flowcore::processor::flat_map::FlatMapper;
/// use flowcore::processor::logic::Emitter;
/// use flowcore::processor::logic::ProcessorLogic;
/// use serde_json::Value;
///
/// type Output = std::vec::IntoIter<Item>;
/// type Mapper = fn(&Value) -> HookResult<Output>;
///
/// fn twice(item: &Value) -> HookResult<Output> {
///     Ok(vec![Item::Data(item.clone()), Item::Data(item.clone())].into_iter())
/// }
///
/// struct Twice(FlatMapper<Mapper, Output>);
///
/// impl ProcessorLogic for Twice {
///     fn try_process(
///         &mut self,
///         _ordinal: usize,
///         item: &Value,
///         emitter: &mut Emitter<'_>,
///     ) -> HookResult<bool> {
///         self.0.try_process(item, emitter)
///     }
/// }
///
/// let _twice = Twice(FlatMapper::new(twice as Mapper));
/// ```
pub struct FlatMapper<F, I> {
    ordinals: Option<Vec<usize>>,
    mapper: F,
    output: Option<I>,
}

impl<F, I> FlatMapper<F, I>
where
    F: FnMut(&Value) -> HookResult<I>,
    I: Iterator<Item = Item>,
{
    /// Emit to all edges.
    pub fn new(mapper: F) -> Self {
        Self {
            ordinals: None,
            mapper,
            output: None,
        }
    }

    /// Emit to the given edges only.
    pub fn to_ordinals(ordinals: Vec<usize>, mapper: F) -> Self {
        Self {
            ordinals: Some(ordinals),
            mapper,
            output: None,
        }
    }

    /// Returns whether all output of `item` was emitted. Call again
    /// with the same item on `false`.
    pub fn try_process(&mut self, item: &Value, emitter: &mut Emitter<'_>) -> HookResult<bool> {
        let mut output = match self.output.take() {
            Some(output) => output,
            None => (self.mapper)(item)?,
        };
        if emitter.emit_from_traverser_to(self.ordinals.as_deref(), &mut output, |_| {}) {
            Ok(true)
        } else {
            self.output = Some(output);
            Ok(false)
        }
    }
}

#[test]
fn flat_map_advances_only_after_full_output() {
    use super::logic::PendingEmission;
    use crate::testing::TestOutbox;

    let mut mapper = FlatMapper::to_ordinals(vec![1], |item: &Value| -> HookResult<_> {
        let n = item.as_i64().unwrap_or(0);
        Ok((0..n).map(|i| Item::Data(i.into())))
    });
    let mut outbox = TestOutbox::new(vec![4, 2]);
    let mut pending = PendingEmission::default();
    let mut calls = 0;
    let mut received = Vec::new();

    for input in [3, 0, 5] {
        loop {
            calls += 1;
            let done = {
                let mut emitter = Emitter::new(&mut outbox, &mut pending);
                mapper.try_process(&input.into(), &mut emitter).unwrap()
            };
            assert!(outbox.drain(0).is_empty());
            received.extend(outbox.drain(1));
            if done {
                break;
            }
        }
    }

    let expected: Vec<Item> = [0, 1, 2, 0, 1, 2, 3, 4]
        .into_iter()
        .map(|i: i64| Item::Data(i.into()))
        .collect();
    assert_eq!(received, expected);
    // 3 items take 2 calls at capacity 2, the empty output 1, 5 items 3.
    assert_eq!(calls, 6);
}
