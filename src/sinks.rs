//! Sinks writing into shared in-process collections.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde_json::Value;

use crate::errors::ExecutionError;
use crate::errors::HookResult;
use crate::processor::logic::Emitter;
use crate::processor::logic::ProcessorLogic;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Appends every data item to a shared list.
pub struct CollectSinkP {
    list: Arc<Mutex<Vec<Value>>>,
}

impl CollectSinkP {
    pub fn new(list: Arc<Mutex<Vec<Value>>>) -> Self {
        Self { list }
    }

    /// Sink into a list nobody reads.
    pub fn detached() -> Self {
        Self::new(Arc::default())
    }
}

impl ProcessorLogic for CollectSinkP {
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &Value,
        _emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        lock(&self.list).push(item.clone());
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct SinkMapInner {
    entries: BTreeMap<String, (Value, Value)>,
    overwrites: usize,
}

/// Shared map written by [`MapSinkP`].
///
/// Keys are compared by their JSON text.
#[derive(Debug, Clone, Default)]
pub struct SinkMap {
    inner: Arc<Mutex<SinkMapInner>>,
}

impl SinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert and return the previous value of the key.
    pub fn put(&self, key: Value, value: Value) -> Option<Value> {
        let mut inner = lock(&self.inner);
        let previous = inner
            .entries
            .insert(key.to_string(), (key, value))
            .map(|(_, value)| value);
        if previous.is_some() {
            inner.overwrites += 1;
        }
        previous
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        lock(&self.inner)
            .entries
            .get(&key.to_string())
            .map(|(_, value)| value.clone())
    }

    pub fn keys(&self) -> Vec<Value> {
        lock(&self.inner)
            .entries
            .values()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many puts replaced an existing key.
    pub fn overwrites(&self) -> usize {
        lock(&self.inner).overwrites
    }
}

pub type EntryFn = Arc<dyn Fn(&Value) -> (Value, Value) + Send + Sync>;

/// Idempotent sink putting `(key, value)` of every item into a
/// [`SinkMap`].
///
/// Writing the same entry again is allowed and counted as an
/// overwrite. Writing a different value for a key that is already in
/// the map fails the processor: a replay after a restart must produce
/// the same results.
pub struct MapSinkP {
    map: SinkMap,
    entry_fn: EntryFn,
}

impl MapSinkP {
    pub fn new<F>(map: SinkMap, entry_fn: F) -> Self
    where
        F: Fn(&Value) -> (Value, Value) + Send + Sync + 'static,
    {
        Self {
            map,
            entry_fn: Arc::new(entry_fn),
        }
    }

    /// Use the whole item as the key and `true` as the value.
    pub fn set(map: SinkMap) -> Self {
        Self::new(map, |item| (item.clone(), Value::Bool(true)))
    }
}

impl ProcessorLogic for MapSinkP {
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &Value,
        _emitter: &mut Emitter<'_>,
    ) -> HookResult<bool> {
        let (key, value) = (self.entry_fn)(item);
        if let Some(previous) = self.map.put(key.clone(), value.clone()) {
            if previous != value {
                return Err(ExecutionError::ProtocolViolation(format!(
                    "value for {key} changed from {previous} to {value}"
                ))
                .into());
            }
        }
        Ok(true)
    }
}

#[test]
fn collect_sink_keeps_order() {
    use crate::item::Item;
    use crate::processor::logic::LogicProcessor;
    use crate::testing::TestSupport;

    let list: Arc<Mutex<Vec<Value>>> = Arc::default();
    let target = list.clone();
    let output = TestSupport::verify_processor(move |_| {
        LogicProcessor::boxed(CollectSinkP::new(target.clone()))
    })
    .input((0..5).map(|i| Item::Data(i.into())).collect())
    .run(false)
    .unwrap();
    assert!(output.is_empty());
    assert_eq!(*lock(&list), (0..5).map(Value::from).collect::<Vec<_>>());
}

#[test]
fn map_sink_counts_duplicates_and_rejects_changes() {
    use serde_json::json;

    use crate::processor::logic::LogicProcessor;
    use crate::processor::Processor;
    use crate::processor::VecDequeInbox;
    use crate::testing::TestOutbox;

    let map = SinkMap::new();
    let mut sink =
        LogicProcessor::new(MapSinkP::new(map.clone(), |item| (item[0].clone(), item[1].clone())));
    let mut outbox = TestOutbox::new(vec![]);
    let mut inbox = VecDequeInbox::from(vec![
        json!(["a", 1]).into(),
        json!(["b", 2]).into(),
        json!(["a", 1]).into(),
    ]);
    sink.process(0, &mut inbox, &mut outbox).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.overwrites(), 1);
    assert_eq!(map.get(&json!("a")), Some(json!(1)));

    let mut inbox = VecDequeInbox::from(vec![json!(["a", 5]).into()]);
    assert!(sink.process(0, &mut inbox, &mut outbox).is_err());
}
