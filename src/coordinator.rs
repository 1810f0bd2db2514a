//! Drives a job over the nodes of a cluster.
//!
//! The coordinator runs on the master. For every attempt to run the
//! job it picks a fresh [`ExecutionId`], restores from the newest
//! successful snapshot if there is one, initializes the execution on
//! every member and then starts it everywhere. While the execution
//! runs, [`JobCoordinator::run_snapshots`] takes a snapshot every
//! [`JobConfig::snapshot_interval_millis`].

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::Address;
use crate::cluster::MembershipProvider;
use crate::config::JobConfig;
use crate::errors::ExecutionError;
use crate::execution::completion::all_of;
use crate::execution::completion::CompletionFuture;
use crate::execution::completion::CompletionResult;
use crate::execution::context::ExecutionContext;
use crate::execution::plan::Dag;
use crate::execution::plan::ExecutionPlan;
use crate::execution::ExecutionId;
use crate::execution::JobId;
use crate::job_execution_service::JobExecutionService;
use crate::snapshot::repository::SnapshotRepository;
use crate::snapshot::SnapshotId;

/// One running attempt of the job.
pub struct JobExecution {
    pub execution_id: ExecutionId,
    pub restored_from: Option<SnapshotId>,
    contexts: Vec<Arc<ExecutionContext>>,
    future: CompletionFuture,
}

impl JobExecution {
    /// Completes once the execution completed on every member, with
    /// the first failure.
    pub fn future(&self) -> &CompletionFuture {
        &self.future
    }

    /// Stop the execution on every member.
    pub fn cancel(&self) {
        for context in &self.contexts {
            context.cancel();
        }
    }
}

pub struct JobCoordinator {
    job_id: JobId,
    dag: Arc<Dag>,
    config: JobConfig,
    membership: Arc<dyn MembershipProvider>,
    nodes: HashMap<Address, Arc<JobExecutionService>>,
    repository: SnapshotRepository,
    next_execution: AtomicU64,
}

impl JobCoordinator {
    pub fn new(
        job_id: JobId,
        dag: Dag,
        config: JobConfig,
        membership: Arc<dyn MembershipProvider>,
        nodes: impl IntoIterator<Item = Arc<JobExecutionService>>,
        repository: SnapshotRepository,
    ) -> Self {
        Self {
            job_id,
            dag: Arc::new(dag),
            config,
            membership,
            nodes: nodes
                .into_iter()
                .map(|node| (node.address().clone(), node))
                .collect(),
            repository,
            next_execution: AtomicU64::new(job_id.0 << 16),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Initialize and start a new execution on all current members.
    #[tracing::instrument(skip(self), fields(job = %self.job_id))]
    pub fn start(&self) -> Result<JobExecution, ExecutionError> {
        self.dag.validate()?;
        let members = self.membership.members();
        let coordinator = self
            .membership
            .master_address()
            .ok_or_else(|| ExecutionError::TopologyChanged("there is no master".into()))?;
        let version = self.membership.member_list_version();
        let execution_id = ExecutionId(self.next_execution.fetch_add(1, Ordering::Relaxed));
        let restored_from = if self.config.snapshots_enabled() {
            self.repository
                .latest_successful(self.job_id)?
                .map(|record| record.snapshot_id)
        } else {
            None
        };
        tracing::info!(
            "Starting {execution_id} on {} members, restoring {restored_from:?}",
            members.len()
        );

        let nodes = members
            .iter()
            .map(|member| {
                self.nodes.get(&member.address).cloned().ok_or_else(|| {
                    ExecutionError::TopologyChanged(format!("{} has no node", member.address))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut contexts = Vec::with_capacity(nodes.len());
        for (member_index, node) in nodes.iter().enumerate() {
            let plan = ExecutionPlan {
                dag: self.dag.clone(),
                members: members.clone(),
                member_index,
                job_config: self.config.clone(),
                restore_snapshot: restored_from,
            };
            let res = node.init_execution(
                self.job_id,
                execution_id,
                &coordinator,
                version,
                &members,
                plan,
            );
            match res {
                Ok(context) => contexts.push(context),
                Err(err) => {
                    tracing::warn!("Unable to initialize {execution_id}: {err}");
                    for node in &nodes {
                        node.complete_execution(execution_id, Some(err.clone()));
                    }
                    return Err(err);
                }
            }
        }

        let mut futures = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match node.execute(&coordinator, self.job_id, execution_id, |_| {}) {
                Ok(future) => futures.push(future),
                Err(err) => {
                    tracing::warn!("Unable to start {execution_id}: {err}");
                    for node in &nodes {
                        if let Some(context) = node.get_execution_context(execution_id) {
                            context.cancel();
                        }
                        node.complete_execution(execution_id, Some(err.clone()));
                    }
                    return Err(err);
                }
            }
        }
        Ok(JobExecution {
            execution_id,
            restored_from,
            contexts,
            future: all_of(futures),
        })
    }

    /// Run one snapshot round and wait for it.
    pub fn take_snapshot(&self, execution: &JobExecution) -> Result<SnapshotId, ExecutionError> {
        let record = self.repository.register_snapshot(self.job_id)?;
        let id = record.snapshot_id;
        tracing::debug!("Taking {id} of {}", execution.execution_id);
        let futures = execution
            .contexts
            .iter()
            .map(|context| context.begin_snapshot(id))
            .collect();
        all_of(futures).join()?;
        self.repository.set_successful(self.job_id, id)?;
        Ok(id)
    }

    /// Take snapshots at the configured interval until the execution
    /// completes. Returns the execution's result.
    pub fn run_snapshots(&self, execution: &JobExecution) -> CompletionResult {
        let interval = Duration::from_millis(self.config.snapshot_interval_millis);
        loop {
            if let Some(result) = execution.future.join_timeout(interval) {
                return result;
            }
            if !self.config.snapshots_enabled() {
                continue;
            }
            if let Err(err) = self.take_snapshot(execution) {
                tracing::warn!("Snapshot of {} failed: {err}", execution.execution_id);
            }
        }
    }

    /// Forget the execution on every node.
    pub fn complete(&self, execution: &JobExecution, error: Option<ExecutionError>) {
        for node in self.nodes.values() {
            node.complete_execution(execution.execution_id, error.clone());
        }
    }

    /// Start, snapshot and restart on restartable failures until the
    /// job completes or fails for good.
    pub fn run_to_completion(&self, max_attempts: usize) -> CompletionResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.start() {
                Ok(execution) => {
                    let result = self.run_snapshots(&execution);
                    self.complete(&execution, result.clone().err());
                    result
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    if self.config.snapshots_enabled() {
                        self.repository.delete_all(self.job_id)?;
                    }
                    return Ok(());
                }
                Err(err) if err.is_restartable() && attempt < max_attempts => {
                    tracing::warn!("Restarting {} after: {err}", self.job_id);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Generator that stops emitting after a few calls until released.
#[cfg(test)]
struct Throttled {
    inner: crate::sources::SequenceGeneratorP,
    calls: usize,
    release: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl crate::processor::logic::ProcessorLogic for Throttled {
    fn complete(
        &mut self,
        emitter: &mut crate::processor::logic::Emitter<'_>,
    ) -> crate::errors::HookResult<bool> {
        if self.calls >= 5 && !self.release.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.calls += 1;
        self.inner.complete(emitter)
    }

    fn save_snapshot(
        &mut self,
        emitter: &mut crate::processor::logic::Emitter<'_>,
    ) -> crate::errors::HookResult<bool> {
        self.inner.save_snapshot(emitter)
    }

    fn restore_from_snapshot(
        &mut self,
        key: crate::snapshot::SnapshotKey,
        value: serde_json::Value,
    ) -> crate::errors::HookResult<()> {
        self.inner.restore_from_snapshot(key, value)
    }

    fn finish_snapshot_restore(
        &mut self,
        emitter: &mut crate::processor::logic::Emitter<'_>,
    ) -> crate::errors::HookResult<bool> {
        self.inner.finish_snapshot_restore(emitter)
    }
}

#[test]
fn restart_resumes_from_the_latest_snapshot() {
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    use serde_json::json;

    use crate::cluster::ClusterView;
    use crate::cluster::MemberInfo;
    use crate::config::InstanceConfig;
    use crate::execution::context::NodeServices;
    use crate::execution::network::LocalTransport;
    use crate::execution::plan::Edge;
    use crate::execution::plan::Vertex;
    use crate::execution::service::TaskletExecutionService;
    use crate::processor::logic::LogicProcessor;
    use crate::sinks::MapSinkP;
    use crate::sinks::SinkMap;
    use crate::snapshot::store::InMemSnapshotStore;
    use crate::sources::SequenceGeneratorP;
    use crate::window::insert_watermarks::InsertWatermarksP;
    use crate::window::insert_watermarks::WatermarkPolicy;
    use crate::window::sliding_window::SlidingWindowP;
    use crate::window::Counting;
    use crate::window::WindowDefinition;

    let members: Vec<_> = (0..2)
        .map(|i| MemberInfo::new(Address::new("127.0.0.1", 6701 + i), format!("m{i}")))
        .collect();
    let view = Arc::new(ClusterView::new(members.clone()));
    let transport = Arc::new(LocalTransport::new());
    let repository = SnapshotRepository::new(Arc::new(InMemSnapshotStore::new()));
    let config = InstanceConfig {
        cooperative_thread_count: 2,
        queue_size: 16,
        ..InstanceConfig::default()
    };
    let nodes: Vec<_> = members
        .iter()
        .map(|member| {
            let services = Arc::new(NodeServices {
                address: member.address.clone(),
                config: config.clone(),
                scheduler: Arc::new(TaskletExecutionService::new(&config).unwrap()),
                transport: transport.clone(),
                repository: repository.clone(),
            });
            let node = Arc::new(JobExecutionService::new(services, view.clone()));
            transport.register(member.address.clone(), &node);
            node
        })
        .collect();

    const PARTITIONS: usize = 8;
    const COUNT: u64 = 300;
    let definition = WindowDefinition::tumbling(3).unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let generator_release = release.clone();
    let sink = SinkMap::new();
    let sink_map = sink.clone();
    let dag = Dag::new()
        .vertex(Vertex::from_fn("numbers", 1, move |ctx| {
            LogicProcessor::boxed(Throttled {
                inner: SequenceGeneratorP::new(PARTITIONS, COUNT, ctx),
                calls: 0,
                release: generator_release.clone(),
            })
        }))
        .vertex(Vertex::from_fn("watermarks", 1, move |ctx| {
            LogicProcessor::boxed(InsertWatermarksP::new(
                |item| item[1].as_i64(),
                WatermarkPolicy::with_fixed_lag(0),
                definition,
                ctx,
            ))
        }))
        .vertex(Vertex::from_fn("aggregate", 1, move |_| {
            LogicProcessor::boxed(SlidingWindowP::windows(
                definition,
                |item| item[0].clone(),
                |item| item[1].as_i64(),
                Arc::new(Counting),
            ))
        }))
        .vertex(Vertex::from_fn("sink", 1, move |_| {
            LogicProcessor::boxed(MapSinkP::new(sink_map.clone(), |entry| {
                (
                    json!([entry["timestamp"], entry["key"]]),
                    entry["value"].clone(),
                )
            }))
        }))
        .edge(Edge::between("numbers", "watermarks"))
        .edge(
            Edge::between("watermarks", "aggregate")
                .partitioned(|item| item[0].clone())
                .distributed(),
        )
        .edge(Edge::between("aggregate", "sink"));
    let coordinator = JobCoordinator::new(
        JobId(9),
        dag,
        JobConfig::default(),
        view.clone(),
        nodes,
        repository.clone(),
    );

    let first = coordinator.start().unwrap();
    let started = Instant::now();
    while sink.is_empty() && started.elapsed() < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(5));
    }
    let snapshot = coordinator.take_snapshot(&first).unwrap();
    first.cancel();
    assert!(first.future().join().is_err());
    coordinator.complete(&first, Some(ExecutionError::Cancelled));

    release.store(true, Ordering::Release);
    let second = coordinator.start().unwrap();
    assert_eq!(second.restored_from, Some(snapshot));
    assert_ne!(second.execution_id, first.execution_id);
    second.future().join().unwrap();
    coordinator.complete(&second, None);

    let mut expected = std::collections::BTreeMap::new();
    for partition in 0..PARTITIONS {
        for ts in 0..COUNT as i64 {
            let frame = definition.higher_frame_ts(ts);
            *expected.entry((frame, partition)).or_insert(0i64) += 1;
        }
    }
    assert_eq!(sink.len(), expected.len());
    for ((frame, partition), count) in expected {
        assert_eq!(sink.get(&json!([frame, partition])), Some(json!(count)));
    }
}

#[test]
fn start_fails_cleanly_without_a_node() {
    use crate::cluster::ClusterView;
    use crate::cluster::MemberInfo;
    use crate::snapshot::store::InMemSnapshotStore;

    let view = Arc::new(ClusterView::new(vec![MemberInfo::new(
        Address::new("127.0.0.1", 7701),
        "m0",
    )]));
    let coordinator = JobCoordinator::new(
        JobId(1),
        Dag::new(),
        JobConfig::default(),
        view,
        Vec::new(),
        SnapshotRepository::new(Arc::new(InMemSnapshotStore::new())),
    );
    assert!(matches!(
        coordinator.start(),
        Err(ExecutionError::TopologyChanged(_))
    ));
}
