//! Bounded queues between tasklets, and both of their ends.
//!
//! Every producer instance of an edge owns a sender into every
//! consumer instance it can reach. A consumer sees one queue per local
//! producer plus one per remote node for distributed edges. Nothing
//! here ever waits: a full queue rejects the offer and an empty queue
//! yields nothing.
//!
//! Besides data, queues carry the control items the snapshot and
//! completion protocol need: watermarks, [`QueuedItem::Barrier`] and
//! [`QueuedItem::Done`]. Control items always go to every consumer.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::error::TrySendError;

use crate::item::Item;
use crate::item::Watermark;
use crate::processor::Outbox;
use crate::processor::VecDequeInbox;
use crate::snapshot::owner_of_partition;
use crate::snapshot::partition_of;
use crate::snapshot::SnapshotEntry;
use crate::snapshot::SnapshotId;
use crate::snapshot::SnapshotKey;

use super::plan::Routing;

/// Element of a conveyor queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum QueuedItem {
    Item(Item),
    /// Everything before this was part of the state saved for the
    /// snapshot.
    Barrier(SnapshotId),
    /// The producer will not send anything else.
    Done,
}

pub(crate) type QueueSender = mpsc::Sender<QueuedItem>;
pub(crate) type QueueReceiver = mpsc::Receiver<QueuedItem>;

pub(crate) fn queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Returns `false` if the queue is full. A queue whose consumer is
/// gone swallows everything.
pub(crate) fn try_offer(sender: &QueueSender, item: &QueuedItem) -> bool {
    if sender.capacity() == 0 && !sender.is_closed() {
        return false;
    }
    match sender.try_send(item.clone()) {
        Ok(()) | Err(TrySendError::Closed(_)) => true,
        Err(TrySendError::Full(_)) => false,
    }
}

#[derive(Debug)]
struct InboundQueue {
    receiver: QueueReceiver,
    watermark: i64,
    barrier: Option<SnapshotId>,
    done: bool,
}

/// What a drain found besides items.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DrainOutcome {
    pub(crate) made_progress: bool,
    /// All queues delivered this barrier or are done.
    pub(crate) barrier: Option<SnapshotId>,
    /// All queues are done.
    pub(crate) is_done: bool,
}

/// Consumer end of one inbound edge of one instance.
///
/// Merges the queues of all producers. Watermarks are coalesced: the
/// minimum over the unfinished queues is forwarded whenever it
/// advances. Barriers are aligned: when draining with `align`, a
/// queue that delivered its barrier is not drained further until all
/// queues did. Without it, items behind a barrier are let through,
/// which only gives at-least-once guarantees.
#[derive(Debug)]
pub(crate) struct InboundEdgeStream {
    ordinal: usize,
    priority: i32,
    queues: Vec<InboundQueue>,
    forwarded_wm: Option<i64>,
    next_queue: usize,
}

impl InboundEdgeStream {
    pub(crate) fn new(ordinal: usize, priority: i32, receivers: Vec<QueueReceiver>) -> Self {
        Self {
            ordinal,
            priority,
            queues: receivers
                .into_iter()
                .map(|receiver| InboundQueue {
                    receiver,
                    watermark: i64::MIN,
                    barrier: None,
                    done: false,
                })
                .collect(),
            forwarded_wm: None,
            next_queue: 0,
        }
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn is_done(&self) -> bool {
        self.queues.iter().all(|q| q.done)
    }

    /// Move whatever is available into `dest`.
    pub(crate) fn drain_to(&mut self, dest: &mut VecDequeInbox<Item>, align: bool) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let count = self.queues.len();
        for n in 0..count {
            let idx = (self.next_queue + n) % count;
            let queue = &self.queues[idx];
            if queue.done || (align && queue.barrier.is_some()) {
                continue;
            }
            loop {
                let queued = match self.queues[idx].receiver.try_recv() {
                    Ok(queued) => queued,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => QueuedItem::Done,
                };
                outcome.made_progress = true;
                match queued {
                    QueuedItem::Item(Item::Watermark(wm)) => {
                        self.queues[idx].watermark = wm.0;
                        self.forward_watermark(dest);
                    }
                    QueuedItem::Item(item) => dest.push(item),
                    QueuedItem::Barrier(id) => {
                        self.queues[idx].barrier = Some(id);
                        if align {
                            break;
                        }
                    }
                    QueuedItem::Done => {
                        self.queues[idx].done = true;
                        self.forward_watermark(dest);
                        break;
                    }
                }
            }
        }
        self.next_queue = (self.next_queue + 1) % count.max(1);

        outcome.barrier = self.aligned_barrier();
        outcome.is_done = self.is_done();
        outcome
    }

    /// The barrier all queues agree on, which resets them.
    fn aligned_barrier(&mut self) -> Option<SnapshotId> {
        let id = self.queues.iter().find_map(|q| q.barrier)?;
        if self.queues.iter().all(|q| q.done || q.barrier.is_some()) {
            self.queues.iter_mut().for_each(|q| q.barrier = None);
            Some(id)
        } else {
            None
        }
    }

    fn forward_watermark(&mut self, dest: &mut VecDequeInbox<Item>) {
        let min = self
            .queues
            .iter()
            .filter(|q| !q.done)
            .map(|q| q.watermark)
            .min();
        if let Some(min) = min {
            if min > i64::MIN && self.forwarded_wm.map_or(true, |fwd| min > fwd) {
                self.forwarded_wm = Some(min);
                dest.push(Item::Watermark(Watermark(min)));
            }
        }
    }
}

/// Producer end of one outbound edge of one instance.
pub(crate) struct OutboundCollector {
    routing: Routing,
    partition_count: usize,
    /// Indexed by consumer index.
    targets: Vec<QueueSender>,
    /// Targets that already took the current broadcast item.
    accepted: Vec<bool>,
    control_accepted: Vec<bool>,
    next_target: usize,
}

impl OutboundCollector {
    pub(crate) fn new(routing: Routing, partition_count: usize, targets: Vec<QueueSender>) -> Self {
        Self {
            routing,
            partition_count,
            accepted: vec![false; targets.len()],
            control_accepted: vec![false; targets.len()],
            targets,
            next_target: 0,
        }
    }

    pub(crate) fn offer(&mut self, item: &Item) -> bool {
        let value = match item {
            Item::Data(value) => value,
            Item::Watermark(_) => {
                return broadcast(
                    &self.targets,
                    &mut self.accepted,
                    &QueuedItem::Item(item.clone()),
                )
            }
        };
        let count = self.targets.len();
        if count == 0 {
            return true;
        }
        match &self.routing {
            Routing::Unicast => {
                let queued = QueuedItem::Item(item.clone());
                for n in 0..count {
                    let idx = (self.next_target + n) % count;
                    if try_offer(&self.targets[idx], &queued) {
                        self.next_target = (idx + 1) % count;
                        return true;
                    }
                }
                false
            }
            Routing::Partitioned(key_fn) => {
                let idx = self.owner_of(&key_fn(value));
                try_offer(&self.targets[idx], &QueuedItem::Item(item.clone()))
            }
            Routing::Broadcast => broadcast(
                &self.targets,
                &mut self.accepted,
                &QueuedItem::Item(item.clone()),
            ),
            Routing::AllToOne => try_offer(&self.targets[0], &QueuedItem::Item(item.clone())),
        }
    }

    /// Send a barrier or done marker to every target.
    pub(crate) fn offer_control(&mut self, queued: &QueuedItem) -> bool {
        broadcast(&self.targets, &mut self.control_accepted, queued)
    }

    fn owner_of(&self, key: &Value) -> usize {
        owner_of_partition(partition_of(key, self.partition_count), self.targets.len())
    }
}

fn broadcast(targets: &[QueueSender], accepted: &mut [bool], queued: &QueuedItem) -> bool {
    let mut all = true;
    for (target, accepted) in targets.iter().zip(accepted.iter_mut()) {
        if *accepted {
            continue;
        }
        if try_offer(target, queued) {
            *accepted = true;
        } else {
            all = false;
        }
    }
    if all {
        accepted.iter_mut().for_each(|a| *a = false);
    }
    all
}

/// The [`Outbox`] a processor tasklet hands to its processor.
pub(crate) struct OutboxImpl {
    collectors: Vec<OutboundCollector>,
    accepted: Vec<bool>,
    control_accepted: Vec<bool>,
    snapshot: Vec<SnapshotEntry>,
    snapshot_capacity: usize,
    items_out: u64,
}

impl OutboxImpl {
    pub(crate) fn new(collectors: Vec<OutboundCollector>, snapshot_capacity: usize) -> Self {
        Self {
            accepted: vec![false; collectors.len()],
            control_accepted: vec![false; collectors.len()],
            collectors,
            snapshot: Vec::new(),
            snapshot_capacity: snapshot_capacity.max(1),
            items_out: 0,
        }
    }

    /// Send a barrier or done marker downstream on every edge.
    pub(crate) fn offer_control(&mut self, queued: &QueuedItem) -> bool {
        let mut all = true;
        for (collector, accepted) in self
            .collectors
            .iter_mut()
            .zip(self.control_accepted.iter_mut())
        {
            if *accepted {
                continue;
            }
            if collector.offer_control(queued) {
                *accepted = true;
            } else {
                all = false;
            }
        }
        if all {
            self.control_accepted.iter_mut().for_each(|a| *a = false);
        }
        all
    }

    pub(crate) fn has_snapshot_entries(&self) -> bool {
        !self.snapshot.is_empty()
    }

    pub(crate) fn take_snapshot_entries(&mut self) -> Vec<SnapshotEntry> {
        std::mem::take(&mut self.snapshot)
    }

    /// Data items accepted since the last call.
    pub(crate) fn take_items_out(&mut self) -> u64 {
        std::mem::take(&mut self.items_out)
    }

    fn collector(&mut self, ordinal: usize) -> &mut OutboundCollector {
        let count = self.collectors.len();
        match self.collectors.get_mut(ordinal) {
            Some(collector) => collector,
            None => panic!("offer to ordinal {ordinal}, but there are only {count} outbound edges"),
        }
    }
}

impl Outbox for OutboxImpl {
    fn bucket_count(&self) -> usize {
        self.collectors.len()
    }

    fn offer(&mut self, ordinal: usize, item: &Item) -> bool {
        let accepted = self.collector(ordinal).offer(item);
        if accepted && !item.is_watermark() {
            self.items_out += 1;
        }
        accepted
    }

    fn offer_to(&mut self, ordinals: &[usize], item: &Item) -> bool {
        let mut all = true;
        for &ordinal in ordinals {
            if self.accepted.get(ordinal).copied().unwrap_or(false) {
                continue;
            }
            if self.collector(ordinal).offer(item) {
                self.accepted[ordinal] = true;
            } else {
                all = false;
            }
        }
        if all {
            self.accepted.iter_mut().for_each(|a| *a = false);
            if !item.is_watermark() {
                self.items_out += 1;
            }
        }
        all
    }

    fn offer_to_snapshot(&mut self, key: &SnapshotKey, value: &Value) -> bool {
        if self.snapshot.len() >= self.snapshot_capacity {
            return false;
        }
        self.snapshot
            .push(SnapshotEntry::new(key.clone(), value.clone()));
        true
    }
}

#[cfg(test)]
fn drain_all(stream: &mut InboundEdgeStream, align: bool) -> (Vec<Item>, DrainOutcome) {
    let mut inbox = VecDequeInbox::new();
    let outcome = stream.drain_to(&mut inbox, align);
    let mut items = Vec::new();
    while let Some(item) = crate::processor::Inbox::poll(&mut inbox) {
        items.push(item);
    }
    (items, outcome)
}

#[test]
fn watermarks_are_coalesced_to_the_minimum() {
    let (tx_a, rx_a) = queue(8);
    let (tx_b, rx_b) = queue(8);
    let mut stream = InboundEdgeStream::new(0, 0, vec![rx_a, rx_b]);
    let drain_all = |stream: &mut InboundEdgeStream| drain_all(stream, true);

    assert!(try_offer(&tx_a, &QueuedItem::Item(Item::wm(10))));
    let (items, _) = drain_all(&mut stream);
    assert!(items.is_empty(), "b has no watermark yet");

    assert!(try_offer(&tx_b, &QueuedItem::Item(Item::wm(5))));
    assert_eq!(drain_all(&mut stream).0, vec![Item::wm(5)]);

    assert!(try_offer(&tx_b, &QueuedItem::Item(Item::wm(12))));
    assert_eq!(drain_all(&mut stream).0, vec![Item::wm(10)]);

    // A finished queue stops holding the others back.
    assert!(try_offer(&tx_a, &QueuedItem::Done));
    assert_eq!(drain_all(&mut stream).0, vec![Item::wm(12)]);
    assert!(try_offer(&tx_b, &QueuedItem::Done));
    let (items, outcome) = drain_all(&mut stream);
    assert!(items.is_empty());
    assert!(outcome.is_done);
}

#[test]
fn exactly_once_aligns_barriers() {
    let (tx_a, rx_a) = queue(8);
    let (tx_b, rx_b) = queue(8);
    let mut stream = InboundEdgeStream::new(0, 0, vec![rx_a, rx_b]);
    let drain_all = |stream: &mut InboundEdgeStream| drain_all(stream, true);

    for queued in [
        QueuedItem::Item(Item::Data(1.into())),
        QueuedItem::Barrier(SnapshotId(0)),
        QueuedItem::Item(Item::Data(2.into())),
    ] {
        assert!(try_offer(&tx_a, &queued));
    }
    let (items, outcome) = drain_all(&mut stream);
    assert_eq!(items, vec![Item::Data(1.into())]);
    assert_eq!(outcome.barrier, None);

    assert!(try_offer(&tx_b, &QueuedItem::Item(Item::Data(3.into()))));
    assert!(try_offer(&tx_b, &QueuedItem::Barrier(SnapshotId(0))));
    let (items, outcome) = drain_all(&mut stream);
    assert_eq!(items, vec![Item::Data(3.into())]);
    assert_eq!(outcome.barrier, Some(SnapshotId(0)));

    // After alignment the item behind the barrier flows again.
    assert_eq!(drain_all(&mut stream).0, vec![Item::Data(2.into())]);
}

#[test]
fn unaligned_drain_passes_barriers() {
    let (tx_a, rx_a) = queue(8);
    let (_tx_b, rx_b) = queue(8);
    let mut stream = InboundEdgeStream::new(0, 0, vec![rx_a, rx_b]);
    assert!(try_offer(&tx_a, &QueuedItem::Barrier(SnapshotId(3))));
    assert!(try_offer(&tx_a, &QueuedItem::Item(Item::Data(1.into()))));
    let (items, outcome) = drain_all(&mut stream, false);
    assert_eq!(items, vec![Item::Data(1.into())]);
    assert_eq!(outcome.barrier, None);
}

#[test]
fn partitioned_routing_is_stable() {
    use std::sync::Arc;

    let (senders, mut receivers): (Vec<_>, Vec<_>) = (0..3).map(|_| queue(16)).unzip();
    let mut collector = OutboundCollector::new(
        Routing::Partitioned(Arc::new(|v: &Value| v["k"].clone())),
        271,
        senders,
    );
    for i in 0..10 {
        let item = Item::Data(serde_json::json!({"k": "same", "i": i}));
        assert!(collector.offer(&item));
    }
    let counts: Vec<usize> = receivers
        .iter_mut()
        .map(|rx| std::iter::from_fn(|| rx.try_recv().ok()).count())
        .collect();
    assert_eq!(counts.iter().sum::<usize>(), 10);
    assert!(counts.contains(&10));
}

#[test]
fn broadcast_retry_does_not_duplicate() {
    let (tx_a, mut rx_a) = queue(1);
    let (tx_b, mut rx_b) = queue(1);
    let mut collector = OutboundCollector::new(Routing::Broadcast, 271, vec![tx_a, tx_b]);
    assert!(collector.offer(&Item::Data(0.into())));
    rx_a.try_recv().unwrap();
    // Only a has space.
    assert!(!collector.offer(&Item::Data(1.into())));
    rx_b.try_recv().unwrap();
    assert!(collector.offer(&Item::Data(1.into())));
    assert_eq!(
        rx_a.try_recv().unwrap(),
        QueuedItem::Item(Item::Data(1.into()))
    );
    assert_eq!(
        rx_b.try_recv().unwrap(),
        QueuedItem::Item(Item::Data(1.into()))
    );
    assert!(rx_a.try_recv().is_err());
}

#[test]
fn unicast_spills_to_free_queues() {
    let (tx_a, mut rx_a) = queue(1);
    let (tx_b, mut rx_b) = queue(1);
    let mut collector = OutboundCollector::new(Routing::Unicast, 271, vec![tx_a, tx_b]);
    assert!(collector.offer(&Item::Data(0.into())));
    assert!(collector.offer(&Item::Data(1.into())));
    assert!(!collector.offer(&Item::Data(2.into())));
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_ok());
}
