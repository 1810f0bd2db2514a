//! One execution attempt of a job on one node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cluster::Address;
use crate::cluster::JobResources;
use crate::cluster::MemberInfo;
use crate::config::InstanceConfig;
use crate::config::ProcessingGuarantee;
use crate::errors::ExecutionError;
use crate::errors::ResultExt;
use crate::processor::ProcessorContext;
use crate::snapshot::is_restored_to;
use crate::snapshot::repository::SnapshotRepository;
use crate::snapshot::SnapshotId;

use super::completion::CompletionFuture;
use super::conveyor::queue;
use super::conveyor::InboundEdgeStream;
use super::conveyor::OutboundCollector;
use super::conveyor::OutboxImpl;
use super::conveyor::QueueReceiver;
use super::conveyor::QueueSender;
use super::network::InletKey;
use super::network::Packet;
use super::network::ReceiverTasklet;
use super::network::SenderTasklet;
use super::network::Transport;
use super::plan::Edge;
use super::plan::ExecutionPlan;
use super::processor_tasklet::ProcessorTasklet;
use super::processor_tasklet::TaskletSetup;
use super::service::ExecutionHandle;
use super::service::TaskletExecutionService;
use super::snapshot_context::SnapshotContext;
use super::ExecutionId;
use super::JobId;
use super::Tasklet;

/// What every execution on a node shares.
pub struct NodeServices {
    pub address: Address,
    pub config: InstanceConfig,
    pub scheduler: Arc<TaskletExecutionService>,
    pub transport: Arc<dyn Transport>,
    pub repository: SnapshotRepository,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    Created,
    Initialized,
    /// Building the tasklets failed. Can still be cancelled and
    /// completed, executing it fails with the initialization error.
    InitializationFailed,
    Running,
    /// A terminal signal was observed and tasklets are being stopped.
    Completing,
    Completed,
}

/// Serializable view of a context for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub coordinator: Address,
    pub participants: Vec<Address>,
    pub state: ExecutionState,
    pub tasklet_count: usize,
    pub created_at: DateTime<Utc>,
    /// Failure, if completed with one.
    pub error: Option<String>,
}

struct Inner {
    state: ExecutionState,
    tasklets: Option<Vec<Box<dyn Tasklet>>>,
    tasklet_count: usize,
    init_error: Option<ExecutionError>,
    handle: Option<ExecutionHandle>,
    snapshots: Option<Arc<SnapshotContext>>,
    inlets: HashMap<InletKey, mpsc::UnboundedSender<Packet>>,
}

/// Owns the tasklets of one execution on this node and tracks its
/// lifecycle.
///
/// `Created → Initialized | InitializationFailed → Running →
/// Completing → Completed`. The completion future resolves exactly
/// once, when all local tasklets stopped or when the execution was
/// cancelled before it ever ran.
pub struct ExecutionContext {
    job_id: JobId,
    execution_id: ExecutionId,
    coordinator: Address,
    participants: Vec<MemberInfo>,
    services: Arc<NodeServices>,
    inner: Mutex<Inner>,
    completion: CompletionFuture,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        job_id: JobId,
        execution_id: ExecutionId,
        coordinator: Address,
        participants: Vec<MemberInfo>,
        services: Arc<NodeServices>,
    ) -> Self {
        Self {
            job_id,
            execution_id,
            coordinator,
            participants,
            services,
            inner: Mutex::new(Inner {
                state: ExecutionState::Created,
                tasklets: None,
                tasklet_count: 0,
                init_error: None,
                handle: None,
                snapshots: None,
                inlets: HashMap::new(),
            }),
            completion: CompletionFuture::new(),
            created_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn coordinator(&self) -> &Address {
        &self.coordinator
    }

    pub fn participants(&self) -> &[MemberInfo] {
        &self.participants
    }

    pub fn state(&self) -> ExecutionState {
        if self.completion.is_done() {
            ExecutionState::Completed
        } else {
            self.lock().state
        }
    }

    /// Resolves once the execution completed on this node.
    pub fn completion_future(&self) -> CompletionFuture {
        self.completion.clone()
    }

    /// Build the tasklets for this node's share of `plan`.
    ///
    /// Can be called once. On failure the context moves to
    /// [`ExecutionState::InitializationFailed`].
    #[tracing::instrument(skip_all, fields(execution = %self.execution_id))]
    pub fn initialize(
        &self,
        plan: ExecutionPlan,
        resources: Arc<JobResources>,
    ) -> Result<(), ExecutionError> {
        let mut inner = self.lock();
        if inner.state != ExecutionState::Created {
            return Err(ExecutionError::ProtocolViolation(format!(
                "{} initialized twice",
                self.execution_id
            )));
        }
        match self.build(&plan, resources) {
            Ok(built) => {
                tracing::info!(
                    "Initialized {} of {} with {} tasklets",
                    self.execution_id,
                    self.job_id,
                    built.tasklets.len()
                );
                inner.tasklet_count = built.tasklets.len();
                inner.tasklets = Some(built.tasklets);
                inner.snapshots = Some(built.snapshots);
                inner.inlets = built.inlets;
                inner.state = ExecutionState::Initialized;
                Ok(())
            }
            Err(err) => {
                tracing::error!("Unable to initialize {}: {err}", self.execution_id);
                inner.init_error = Some(err.clone());
                inner.state = ExecutionState::InitializationFailed;
                Err(err)
            }
        }
    }

    /// Start the tasklets. `done_callback` is called with the returned
    /// future.
    ///
    /// Errors are reported through the future. Calling it again
    /// returns the same future.
    pub fn execute<F>(&self, done_callback: F) -> CompletionFuture
    where
        F: FnOnce(&CompletionFuture),
    {
        let mut started = None;
        let early_result = {
            let mut inner = self.lock();
            match inner.state {
                ExecutionState::Initialized => {
                    let tasklets = inner.tasklets.take().unwrap_or_default();
                    let name = format!("{} of {}", self.execution_id, self.job_id);
                    match self.services.scheduler.begin_execute(name, tasklets) {
                        Ok(handle) => {
                            started = Some((handle.clone(), inner.snapshots.clone()));
                            inner.handle = Some(handle);
                            inner.state = ExecutionState::Running;
                            tracing::info!("Started {} of {}", self.execution_id, self.job_id);
                            None
                        }
                        Err(err) => {
                            inner.state = ExecutionState::Completing;
                            Some(Err(err))
                        }
                    }
                }
                ExecutionState::InitializationFailed => {
                    inner.state = ExecutionState::Completing;
                    Some(Err(inner.init_error.clone().unwrap_or_else(|| {
                        ExecutionError::ProtocolViolation("initialization failed".into())
                    })))
                }
                ExecutionState::Created => Some(Err(ExecutionError::ProtocolViolation(format!(
                    "{} executed before it was initialized",
                    self.execution_id
                )))),
                ExecutionState::Running
                | ExecutionState::Completing
                | ExecutionState::Completed => None,
            }
        };
        // Callbacks of the future must not run under the lock.
        if let Some((handle, snapshots)) = started {
            let completion = self.completion.clone();
            handle.future().when_complete(move |result| {
                if let (Some(snapshots), Err(err)) = (snapshots, result) {
                    snapshots.cancel(err.clone());
                }
                completion.complete(result.clone());
            });
        }
        if let Some(result) = early_result {
            self.completion.complete(result);
        }
        done_callback(&self.completion);
        self.completion.clone()
    }

    /// Stop the execution. The future resolves once no tasklet runs
    /// anymore.
    pub fn cancel(&self) -> CompletionFuture {
        self.cancel_with(ExecutionError::Cancelled)
    }

    /// Like [`ExecutionContext::cancel`], but complete with `reason`
    /// unless the execution failed already.
    pub fn cancel_with(&self, reason: ExecutionError) -> CompletionFuture {
        if self.completion.is_done() {
            return self.completion.clone();
        }
        let early_result = {
            let mut inner = self.lock();
            match inner.state {
                ExecutionState::Running => {
                    tracing::info!("Cancelling {}: {reason}", self.execution_id);
                    if let Some(handle) = &inner.handle {
                        handle.cancel_with(reason.clone());
                    }
                    if let Some(snapshots) = &inner.snapshots {
                        snapshots.cancel(reason);
                    }
                    inner.state = ExecutionState::Completing;
                    None
                }
                ExecutionState::Created
                | ExecutionState::Initialized
                | ExecutionState::InitializationFailed => {
                    tracing::info!("Cancelling {} before it ran: {reason}", self.execution_id);
                    // Tasklets were never handed out, drop them here.
                    inner.tasklets = None;
                    inner.inlets.clear();
                    inner.state = ExecutionState::Completing;
                    Some(Err(reason))
                }
                ExecutionState::Completing | ExecutionState::Completed => None,
            }
        };
        if let Some(result) = early_result {
            self.completion.complete(result);
        }
        self.completion.clone()
    }

    /// Was this context initialized for `job_id` by `coordinator`.
    pub fn verify(&self, coordinator: &Address, job_id: JobId) -> bool {
        &self.coordinator == coordinator && self.job_id == job_id
    }

    pub fn is_coordinator_or_participating(&self, address: &Address) -> bool {
        &self.coordinator == address || self.participants.iter().any(|m| &m.address == address)
    }

    /// Ask local processors to save their state for `snapshot_id`.
    ///
    /// Resolves once every local processor tasklet wrote its state or
    /// finished.
    pub fn begin_snapshot(&self, snapshot_id: SnapshotId) -> CompletionFuture {
        let snapshots = self.lock().snapshots.clone();
        let started = match snapshots {
            _ if self.completion.is_done() => Err(ExecutionError::ProtocolViolation(format!(
                "{snapshot_id} requested after {} completed",
                self.execution_id
            ))),
            Some(snapshots) => snapshots.start_snapshot(snapshot_id),
            None => Err(ExecutionError::ProtocolViolation(format!(
                "{snapshot_id} requested before {} was initialized",
                self.execution_id
            ))),
        };
        started.unwrap_or_else(|err| CompletionFuture::completed(Err(err)))
    }

    /// Hand a packet from another node to its receiver tasklet.
    pub fn deliver_packet(&self, packet: Packet) -> Result<(), ExecutionError> {
        let inner = self.lock();
        let inlet = inner.inlets.get(&InletKey::of(&packet)).ok_or_else(|| {
            ExecutionError::ProtocolViolation(format!(
                "{} has no receiver for {}#{} from {}",
                self.execution_id, packet.vertex, packet.ordinal, packet.source
            ))
        })?;
        // The receiver is only gone once the execution is over.
        let _ = inlet.send(packet);
        Ok(())
    }

    pub fn summary(&self) -> ExecutionSummary {
        let state = self.state();
        let inner = self.lock();
        ExecutionSummary {
            job_id: self.job_id,
            execution_id: self.execution_id,
            coordinator: self.coordinator.clone(),
            participants: self
                .participants
                .iter()
                .map(|m| m.address.clone())
                .collect(),
            state,
            tasklet_count: inner.tasklet_count,
            created_at: self.created_at,
            error: self
                .completion
                .result()
                .and_then(Result::err)
                .map(|err| err.to_string()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn build(
        &self,
        plan: &ExecutionPlan,
        resources: Arc<JobResources>,
    ) -> Result<Built, ExecutionError> {
        plan.dag.validate()?;
        match plan.members.get(plan.member_index) {
            Some(member) if member.address == self.services.address => {}
            _ => {
                return Err(ExecutionError::ProtocolViolation(format!(
                    "plan member {} is not {}",
                    plan.member_index, self.services.address
                )))
            }
        }
        let mut wiring = Wiring::new(self, plan);
        for vertex in plan.dag.vertices() {
            for edge in plan.dag.outbound_edges(&vertex.name) {
                wiring.connect(edge)?;
            }
        }
        let Wiring {
            mut outbound,
            mut inbound,
            mut tasklets,
            inlets,
            ..
        } = wiring;

        let processor_count = plan
            .dag
            .vertices()
            .iter()
            .map(|v| v.local_parallelism)
            .sum();
        let snapshots = Arc::new(SnapshotContext::new(processor_count));
        let repository = &self.services.repository;
        for vertex in plan.dag.vertices() {
            let total_parallelism = plan.total_parallelism(vertex);
            let restore_entries = plan
                .restore_snapshot
                .map(|id| repository.entries(self.job_id, id, &vertex.name))
                .transpose()?;
            let collectors = outbound.remove(&vertex.name).unwrap_or_default();
            let streams = inbound.remove(&vertex.name).unwrap_or_default();
            let instances = collectors.into_iter().zip(streams).enumerate();
            for (local_index, (collectors, instreams)) in instances {
                let global_index = plan.global_index(vertex, local_index);
                let context = ProcessorContext {
                    job_id: self.job_id,
                    execution_id: self.execution_id,
                    vertex_name: vertex.name.clone(),
                    global_index,
                    local_index,
                    local_parallelism: vertex.local_parallelism,
                    total_parallelism,
                    member_index: plan.member_index,
                    member_count: plan.member_count(),
                    partition_count: plan.job_config.partition_count,
                    processing_guarantee: plan.job_config.processing_guarantee,
                    resources: resources.clone(),
                };
                let processor = vertex.supplier.get(&context).reraise_with(|| {
                    format!("error creating processor {}#{global_index}", vertex.name)
                })?;
                let restore = restore_entries.as_ref().map(|entries| {
                    entries
                        .iter()
                        .filter(|entry| {
                            is_restored_to(
                                &entry.key,
                                vertex.restore_policy,
                                global_index,
                                total_parallelism,
                                plan.job_config.partition_count,
                            )
                        })
                        .cloned()
                        .collect()
                });
                tasklets.push(Box::new(ProcessorTasklet::new(TaskletSetup {
                    context,
                    processor,
                    instreams,
                    outbox: OutboxImpl::new(
                        collectors,
                        self.services.config.snapshot_bucket_capacity,
                    ),
                    restore,
                    snapshots: snapshots.clone(),
                    repository: repository.clone(),
                })));
            }
        }
        Ok(Built {
            tasklets,
            snapshots,
            inlets,
        })
    }
}

struct Built {
    tasklets: Vec<Box<dyn Tasklet>>,
    snapshots: Arc<SnapshotContext>,
    inlets: HashMap<InletKey, mpsc::UnboundedSender<Packet>>,
}

fn per_instance<T>(n: usize) -> Vec<Vec<T>> {
    (0..n).map(|_| Vec::new()).collect()
}

/// Creates the queues of every edge and collects both of their ends
/// per processor instance.
struct Wiring<'a> {
    context: &'a ExecutionContext,
    plan: &'a ExecutionPlan,
    /// Collectors per local instance, in outbound ordinal order.
    outbound: HashMap<String, Vec<Vec<OutboundCollector>>>,
    /// Inbound streams per local instance.
    inbound: HashMap<String, Vec<Vec<InboundEdgeStream>>>,
    tasklets: Vec<Box<dyn Tasklet>>,
    inlets: HashMap<InletKey, mpsc::UnboundedSender<Packet>>,
}

impl<'a> Wiring<'a> {
    fn new(context: &'a ExecutionContext, plan: &'a ExecutionPlan) -> Self {
        let vertices = plan.dag.vertices();
        Self {
            context,
            plan,
            outbound: vertices
                .iter()
                .map(|v| (v.name.clone(), per_instance(v.local_parallelism)))
                .collect(),
            inbound: vertices
                .iter()
                .map(|v| (v.name.clone(), per_instance(v.local_parallelism)))
                .collect(),
            tasklets: Vec::new(),
            inlets: HashMap::new(),
        }
    }

    fn connect(&mut self, edge: &Edge) -> Result<(), ExecutionError> {
        let plan = self.plan;
        let context = self.context;
        let services = &context.services;
        let unknown = |name: &str| ExecutionError::ProtocolViolation(format!("no vertex {name:?}"));
        let source = plan
            .dag
            .get_vertex(&edge.source)
            .ok_or_else(|| unknown(&edge.source))?;
        let dest = plan
            .dag
            .get_vertex(&edge.dest)
            .ok_or_else(|| unknown(&edge.dest))?;
        let queue_size = edge.queue_size.unwrap_or(services.config.queue_size);
        let (member_count, local_member) = if edge.distributed {
            (plan.member_count(), plan.member_index)
        } else {
            (1, 0)
        };

        // Producer `p` reaches consumer with global index `c` through
        // `targets[p][c]`.
        let mut targets: Vec<Vec<QueueSender>> =
            (0..source.local_parallelism).map(|_| Vec::new()).collect();
        let mut local_inputs: Vec<Vec<QueueReceiver>> =
            (0..dest.local_parallelism).map(|_| Vec::new()).collect();
        let mut remote_inputs: HashMap<usize, Vec<Vec<QueueReceiver>>> = HashMap::new();
        for member in 0..member_count {
            for consumer in 0..dest.local_parallelism {
                for producer_targets in &mut targets {
                    let (tx, rx) = queue(queue_size);
                    producer_targets.push(tx);
                    if member == local_member {
                        local_inputs[consumer].push(rx);
                    } else {
                        remote_inputs.entry(member).or_insert_with(|| {
                            (0..dest.local_parallelism).map(|_| Vec::new()).collect()
                        })[consumer]
                            .push(rx);
                    }
                }
            }
        }

        let align = plan.job_config.processing_guarantee == ProcessingGuarantee::ExactlyOnce;
        for member in 0..member_count {
            let Some(inputs) = remote_inputs.remove(&member) else {
                continue;
            };
            let remote = plan.members[member].address.clone();
            let streams = inputs
                .into_iter()
                .map(|rx| InboundEdgeStream::new(edge.dest_ordinal, edge.priority, rx))
                .collect();
            self.tasklets.push(Box::new(SenderTasklet::new(
                context.execution_id,
                edge.dest.clone(),
                edge.dest_ordinal,
                services.address.clone(),
                remote.clone(),
                services.transport.clone(),
                streams,
                align,
            )));

            let (packet_tx, packet_rx) = mpsc::unbounded_channel();
            let mut queues = Vec::with_capacity(dest.local_parallelism);
            for inputs in &mut local_inputs {
                let (tx, rx) = queue(queue_size);
                inputs.push(rx);
                queues.push(tx);
            }
            self.tasklets.push(Box::new(ReceiverTasklet::new(
                format!("receiver {}#{} from {remote}", edge.dest, edge.dest_ordinal),
                packet_rx,
                queues,
            )));
            self.inlets.insert(
                InletKey {
                    vertex: edge.dest.clone(),
                    ordinal: edge.dest_ordinal,
                    source: remote,
                },
                packet_tx,
            );
        }

        let partition_count = plan.job_config.partition_count;
        if let Some(instances) = self.outbound.get_mut(&edge.source) {
            for (collectors, targets) in instances.iter_mut().zip(targets) {
                collectors.push(OutboundCollector::new(
                    edge.routing.clone(),
                    partition_count,
                    targets,
                ));
            }
        }
        if let Some(instances) = self.inbound.get_mut(&edge.dest) {
            for (streams, receivers) in instances.iter_mut().zip(local_inputs) {
                streams.push(InboundEdgeStream::new(
                    edge.dest_ordinal,
                    edge.priority,
                    receivers,
                ));
            }
        }
        Ok(())
    }
}
