//! Distributed edges.
//!
//! A producer instance routes items for a consumer on another node into
//! a local queue like any other. A [`SenderTasklet`] per (edge, remote
//! node) drains those queues, one merged stream per remote consumer,
//! and ships the items as [`Packet`]s through a [`Transport`]. On the
//! other side the packet is routed by (vertex, ordinal, sender address)
//! to a [`ReceiverTasklet`], which pushes the items into the consumer's
//! queue for that sender node with the usual backpressure.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::Weak;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cluster::Address;
use crate::errors::tracked_err;
use crate::errors::ExecutionError;
use crate::item::Item;
use crate::processor::Inbox;
use crate::processor::VecDequeInbox;

use super::conveyor::try_offer;
use super::conveyor::InboundEdgeStream;
use super::conveyor::QueueSender;
use super::conveyor::QueuedItem;
use super::ExecutionId;
use super::ProgressState;
use super::ProgressTracker;
use super::Tasklet;

/// Batch of queue items for one consumer instance on another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub execution_id: ExecutionId,
    /// Consuming vertex.
    pub vertex: String,
    /// Input ordinal of the consuming vertex.
    pub ordinal: usize,
    /// Node that sent the packet.
    pub source: Address,
    /// Local index of the consumer instance on the receiving node.
    pub dest_index: usize,
    /// JSON encoded queue items.
    pub payload: Vec<u8>,
}

impl Packet {
    pub(crate) fn decode_items(&self) -> Result<Vec<QueuedItem>, ExecutionError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Where a node accepts packets.
pub trait PacketHandler: Send + Sync {
    fn handle_packet(&self, packet: Packet) -> Result<(), ExecutionError>;
}

/// Delivers packets to other nodes.
pub trait Transport: Send + Sync {
    /// Must not block. Fails with [`ExecutionError::TopologyChanged`]
    /// if the node is unreachable.
    fn send(&self, dest: &Address, packet: Packet) -> Result<(), ExecutionError>;
}

/// Transport between nodes living in the same process.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<Address, Weak<dyn PacketHandler>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&self, address: Address, handler: &Arc<H>)
    where
        H: PacketHandler + 'static,
    {
        let handler: Arc<dyn PacketHandler> = handler.clone();
        self.nodes
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(address, Arc::downgrade(&handler));
    }

    /// Packets to `address` fail from now on, like to a crashed node.
    pub fn unregister(&self, address: &Address) {
        self.nodes
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(address);
    }
}

impl Transport for LocalTransport {
    fn send(&self, dest: &Address, packet: Packet) -> Result<(), ExecutionError> {
        let handler = self
            .nodes
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(dest)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ExecutionError::TopologyChanged(format!("{dest} is unreachable")))?;
        handler.handle_packet(packet)
    }
}

/// Identifies the receiver tasklet a packet is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct InletKey {
    pub(crate) vertex: String,
    pub(crate) ordinal: usize,
    pub(crate) source: Address,
}

impl InletKey {
    pub(crate) fn of(packet: &Packet) -> Self {
        Self {
            vertex: packet.vertex.clone(),
            ordinal: packet.ordinal,
            source: packet.source.clone(),
        }
    }
}

struct RemoteConsumer {
    stream: InboundEdgeStream,
    inbox: VecDequeInbox<Item>,
    done_sent: bool,
}

/// Ships everything local producers route to consumers on one other
/// node.
pub(crate) struct SenderTasklet {
    name: String,
    execution_id: ExecutionId,
    vertex: String,
    ordinal: usize,
    local: Address,
    dest: Address,
    transport: Arc<dyn Transport>,
    consumers: Vec<RemoteConsumer>,
    align: bool,
}

impl SenderTasklet {
    /// `streams[i]` merges the queues of all local producers into the
    /// consumer with local index `i` on `dest`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        execution_id: ExecutionId,
        vertex: String,
        ordinal: usize,
        local: Address,
        dest: Address,
        transport: Arc<dyn Transport>,
        streams: Vec<InboundEdgeStream>,
        align: bool,
    ) -> Self {
        Self {
            name: format!("sender {vertex}#{ordinal} to {dest}"),
            execution_id,
            vertex,
            ordinal,
            local,
            dest,
            transport,
            consumers: streams
                .into_iter()
                .map(|stream| RemoteConsumer {
                    stream,
                    inbox: VecDequeInbox::new(),
                    done_sent: false,
                })
                .collect(),
            align,
        }
    }
}

impl Tasklet for SenderTasklet {
    fn call(&mut self) -> Result<ProgressState, ExecutionError> {
        let mut progress = ProgressTracker::new();
        for (dest_index, consumer) in self.consumers.iter_mut().enumerate() {
            if consumer.done_sent {
                continue;
            }
            let outcome = consumer.stream.drain_to(&mut consumer.inbox, self.align);
            let mut batch = Vec::with_capacity(consumer.inbox.len() + 1);
            while let Some(item) = consumer.inbox.remove() {
                batch.push(QueuedItem::Item(item));
            }
            if let Some(id) = outcome.barrier {
                batch.push(QueuedItem::Barrier(id));
            }
            if outcome.is_done {
                batch.push(QueuedItem::Done);
                consumer.done_sent = true;
            } else {
                progress.not_done();
            }
            if batch.is_empty() {
                continue;
            }
            let packet = Packet {
                execution_id: self.execution_id,
                vertex: self.vertex.clone(),
                ordinal: self.ordinal,
                source: self.local.clone(),
                dest_index,
                payload: serde_json::to_vec(&batch)?,
            };
            tracing::trace!("{} sending {} items", self.name, batch.len());
            self.transport.send(&self.dest, packet)?;
            progress.made_progress(true);
        }
        Ok(progress.to_progress_state())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

struct LocalConsumer {
    queue: QueueSender,
    pending: VecDeque<QueuedItem>,
    done: bool,
}

/// Feeds packets from one other node into local consumer queues.
pub(crate) struct ReceiverTasklet {
    name: String,
    incoming: mpsc::UnboundedReceiver<Packet>,
    consumers: Vec<LocalConsumer>,
}

impl ReceiverTasklet {
    /// `queues[i]` is the queue of the consumer with local index `i`
    /// reserved for the sending node.
    pub(crate) fn new(
        name: String,
        incoming: mpsc::UnboundedReceiver<Packet>,
        queues: Vec<QueueSender>,
    ) -> Self {
        Self {
            name,
            incoming,
            consumers: queues
                .into_iter()
                .map(|queue| LocalConsumer {
                    queue,
                    pending: VecDeque::new(),
                    done: false,
                })
                .collect(),
        }
    }
}

impl Tasklet for ReceiverTasklet {
    fn call(&mut self) -> Result<ProgressState, ExecutionError> {
        let mut progress = ProgressTracker::new();
        while let Ok(packet) = self.incoming.try_recv() {
            let items = packet.decode_items()?;
            let name = &self.name;
            let consumer = self.consumers.get_mut(packet.dest_index).ok_or_else(|| {
                tracked_err(&format!("{name} got a packet for {}", packet.dest_index))
            })?;
            consumer.pending.extend(items);
            progress.made_progress(true);
        }
        for consumer in &mut self.consumers {
            while let Some(front) = consumer.pending.front() {
                if !try_offer(&consumer.queue, front) {
                    break;
                }
                if matches!(front, QueuedItem::Done) {
                    consumer.done = true;
                }
                consumer.pending.pop_front();
                progress.made_progress(true);
            }
            if !consumer.done {
                progress.not_done();
            }
        }
        Ok(progress.to_progress_state())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
struct Loopback(mpsc::UnboundedSender<Packet>);

#[cfg(test)]
impl PacketHandler for Loopback {
    fn handle_packet(&self, packet: Packet) -> Result<(), ExecutionError> {
        self.0
            .send(packet)
            .map_err(|_| ExecutionError::TopologyChanged("gone".into()))
    }
}

#[test]
fn sender_to_receiver_keeps_order_and_markers() {
    use super::conveyor::queue;
    use crate::snapshot::SnapshotId;
    use serde_json::json;

    let remote = Address::new("10.0.0.2", 5701);
    let (packets_tx, packets_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(Loopback(packets_tx));
    let transport = Arc::new(LocalTransport::new());
    transport.register(remote.clone(), &handler);

    let (producer, producer_rx) = queue(8);
    let mut sender = SenderTasklet::new(
        ExecutionId(1),
        "sink".into(),
        0,
        Address::new("10.0.0.1", 5701),
        remote,
        transport,
        vec![InboundEdgeStream::new(0, 0, vec![producer_rx])],
        true,
    );
    let (consumer, mut consumer_rx) = queue(8);
    let mut receiver = ReceiverTasklet::new("receiver".into(), packets_rx, vec![consumer]);

    for queued in [
        QueuedItem::Item(Item::Data(json!(1))),
        QueuedItem::Item(Item::wm(5)),
        QueuedItem::Barrier(SnapshotId(0)),
        QueuedItem::Item(Item::Data(json!(2))),
        QueuedItem::Done,
    ] {
        assert!(try_offer(&producer, &queued));
    }
    // Stops at the barrier first, so two rounds are needed.
    assert_eq!(sender.call().unwrap(), ProgressState::MADE_PROGRESS);
    assert_eq!(sender.call().unwrap(), ProgressState::DONE);
    assert_eq!(receiver.call().unwrap(), ProgressState::DONE);

    let mut received = Vec::new();
    while let Ok(queued) = consumer_rx.try_recv() {
        received.push(queued);
    }
    assert_eq!(
        received,
        vec![
            QueuedItem::Item(Item::Data(json!(1))),
            QueuedItem::Item(Item::wm(5)),
            QueuedItem::Barrier(SnapshotId(0)),
            QueuedItem::Item(Item::Data(json!(2))),
            QueuedItem::Done,
        ]
    );
}

#[test]
fn receiver_applies_backpressure() {
    use super::conveyor::queue;
    use serde_json::json;

    let (packets_tx, packets_rx) = mpsc::unbounded_channel();
    let (consumer, mut consumer_rx) = queue(1);
    let mut receiver = ReceiverTasklet::new("receiver".into(), packets_rx, vec![consumer]);
    let items = vec![
        QueuedItem::Item(Item::Data(json!("a"))),
        QueuedItem::Item(Item::Data(json!("b"))),
        QueuedItem::Done,
    ];
    packets_tx
        .send(Packet {
            execution_id: ExecutionId(1),
            vertex: "sink".into(),
            ordinal: 0,
            source: Address::new("10.0.0.2", 5701),
            dest_index: 0,
            payload: serde_json::to_vec(&items).unwrap(),
        })
        .unwrap();

    let mut received = Vec::new();
    loop {
        let state = receiver.call().unwrap();
        while let Ok(queued) = consumer_rx.try_recv() {
            received.push(queued);
        }
        if state.is_done {
            break;
        }
    }
    assert_eq!(received, items);
}

#[test]
fn unreachable_node_is_a_topology_change() {
    let transport = LocalTransport::new();
    let packet = Packet {
        execution_id: ExecutionId(1),
        vertex: "sink".into(),
        ordinal: 0,
        source: Address::new("10.0.0.1", 5701),
        dest_index: 0,
        payload: Vec::new(),
    };
    assert!(matches!(
        transport.send(&Address::new("10.0.0.9", 5701), packet),
        Err(ExecutionError::TopologyChanged(_))
    ));
}
