//! The per-node authority over which executions exist.
//!
//! A [`JobExecutionService`] is created once at node startup. The
//! coordinator calls [`JobExecutionService::init_execution`] and then
//! [`JobExecutionService::execute`] on every participant, and
//! [`JobExecutionService::complete_execution`] once the execution is
//! over. Before registering anything, `init_execution` checks that
//! the node and the coordinator agree on the cluster: the caller must
//! be the master this node knows, this node must not lag behind the
//! coordinator's member list, and every participant must be a member.
//!
//! At most one execution per job is active on a node. A second
//! execution of the same job is a race between restart attempts and
//! is answered with a retryable error until the first one completed.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use crate::cluster::Address;
use crate::cluster::JobResources;
use crate::cluster::MemberInfo;
use crate::cluster::MembershipProvider;
use crate::errors::ExecutionError;
use crate::execution::completion::CompletionFuture;
use crate::execution::context::ExecutionContext;
use crate::execution::context::ExecutionSummary;
use crate::execution::context::NodeServices;
use crate::execution::network::Packet;
use crate::execution::network::PacketHandler;
use crate::execution::plan::ExecutionPlan;
use crate::execution::ExecutionId;
use crate::execution::JobId;

/// Builds the resources of a job the first time one of its executions
/// reaches this node.
pub type ResourceFactory = Arc<dyn Fn(JobId) -> JobResources + Send + Sync>;

pub struct JobExecutionService {
    services: Arc<NodeServices>,
    membership: Arc<dyn MembershipProvider>,
    resource_factory: ResourceFactory,
    /// Lock order: `active_jobs` before `contexts`.
    active_jobs: Mutex<HashMap<JobId, ExecutionId>>,
    contexts: Mutex<HashMap<ExecutionId, Arc<ExecutionContext>>>,
    job_resources: Mutex<HashMap<JobId, Arc<OnceLock<Arc<JobResources>>>>>,
    is_running: AtomicBool,
}

impl JobExecutionService {
    pub fn new(services: Arc<NodeServices>, membership: Arc<dyn MembershipProvider>) -> Self {
        Self {
            services,
            membership,
            resource_factory: Arc::new(|job_id| JobResources::new(job_id, HashMap::new())),
            active_jobs: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            job_resources: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        }
    }

    pub fn with_resource_factory(mut self, factory: ResourceFactory) -> Self {
        self.resource_factory = factory;
        self
    }

    pub fn address(&self) -> &Address {
        &self.services.address
    }

    pub fn services(&self) -> &Arc<NodeServices> {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Register and initialize an execution.
    ///
    /// The context stays registered if its initialization fails, so it
    /// can be completed like any other.
    #[tracing::instrument(skip(self, participants, plan), fields(node = %self.services.address))]
    pub fn init_execution(
        &self,
        job_id: JobId,
        execution_id: ExecutionId,
        coordinator: &Address,
        coordinator_member_list_version: u64,
        participants: &[MemberInfo],
        plan: ExecutionPlan,
    ) -> Result<Arc<ExecutionContext>, ExecutionError> {
        if !self.is_running() {
            return Err(ExecutionError::InstanceNotActive);
        }
        self.verify_master(coordinator)?;

        let local_version = self.membership.member_list_version();
        if coordinator_member_list_version > local_version {
            self.membership.trigger_member_list_publish();
            return Err(ExecutionError::Retryable(format!(
                "member list of {} is at version {local_version}, \
                 coordinator {coordinator} has {coordinator_member_list_version}",
                self.services.address
            )));
        }
        if let Some(missing) = participants
            .iter()
            .find(|m| self.membership.member(&m.address, &m.uuid).is_none())
        {
            return Err(ExecutionError::TopologyChanged(format!(
                "participant {} is not a member at version {local_version}",
                missing.address
            )));
        }

        let context = {
            let mut active_jobs = self.active_jobs.lock().unwrap_or_else(|err| err.into_inner());
            let mut contexts = self.contexts.lock().unwrap_or_else(|err| err.into_inner());
            match active_jobs.get(&job_id) {
                Some(active) if *active == execution_id => {
                    return Err(ExecutionError::AlreadyExists(execution_id));
                }
                Some(active) => {
                    return Err(ExecutionError::Retryable(format!(
                        "{job_id} still has {active} on {}",
                        self.services.address
                    )));
                }
                None => {}
            }
            if contexts.contains_key(&execution_id) {
                return Err(ExecutionError::AlreadyExists(execution_id));
            }
            let context = Arc::new(ExecutionContext::new(
                job_id,
                execution_id,
                coordinator.clone(),
                participants.to_vec(),
                self.services.clone(),
            ));
            active_jobs.insert(job_id, execution_id);
            contexts.insert(execution_id, context.clone());
            context
        };

        let resources = self.get_job_resources(job_id);
        context.initialize(plan, resources)?;
        Ok(context)
    }

    /// Start a registered execution.
    pub fn execute<F>(
        &self,
        coordinator: &Address,
        job_id: JobId,
        execution_id: ExecutionId,
        done_callback: F,
    ) -> Result<CompletionFuture, ExecutionError>
    where
        F: FnOnce(&CompletionFuture),
    {
        if !self.is_running() {
            return Err(ExecutionError::InstanceNotActive);
        }
        self.verify_master(coordinator)?;
        let context = self
            .get_execution_context(execution_id)
            .ok_or(ExecutionError::NotFound(execution_id))?;
        if !context.verify(coordinator, job_id) {
            return Err(ExecutionError::IdentityMismatch {
                execution_id,
                job_id,
                coordinator: coordinator.clone(),
            });
        }
        Ok(context.execute(done_callback))
    }

    /// Forget an execution and its job's resources.
    ///
    /// Completing an execution that is not registered is a no-op.
    pub fn complete_execution(&self, execution_id: ExecutionId, error: Option<ExecutionError>) {
        let context = {
            let mut active_jobs = self.active_jobs.lock().unwrap_or_else(|err| err.into_inner());
            let mut contexts = self.contexts.lock().unwrap_or_else(|err| err.into_inner());
            let Some(context) = contexts.remove(&execution_id) else {
                tracing::debug!("{execution_id} already completed on {}", self.services.address);
                return;
            };
            if active_jobs.get(&context.job_id()) == Some(&execution_id) {
                active_jobs.remove(&context.job_id());
            }
            context
        };
        self.job_resources
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&context.job_id());
        // Make sure no tasklet outlives its registration.
        context.cancel_with(error.clone().unwrap_or(ExecutionError::Cancelled));
        match error {
            Some(err) => tracing::info!("Completed {execution_id} with error: {err}"),
            None => tracing::info!("Completed {execution_id}"),
        }
    }

    /// Cancel every execution `address` took part in and complete it
    /// with [`ExecutionError::TopologyChanged`] once it stopped.
    pub fn on_member_leave(self: &Arc<Self>, address: &Address) {
        let affected: Vec<_> = self
            .contexts
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .filter(|c| c.is_coordinator_or_participating(address))
            .cloned()
            .collect();
        for context in affected {
            let reason = ExecutionError::TopologyChanged(format!("{address} left the cluster"));
            tracing::warn!("Cancelling {}: {reason}", context.execution_id());
            let service = Arc::downgrade(self);
            let execution_id = context.execution_id();
            context
                .cancel_with(reason.clone())
                .when_complete(move |_| {
                    if let Some(service) = service.upgrade() {
                        service.complete_execution(execution_id, Some(reason));
                    }
                });
        }
    }

    /// Stop accepting work, then cancel and complete every execution
    /// with [`ExecutionError::InstanceNotActive`].
    pub fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down job execution service on {}", self.services.address);
        let contexts: Vec<_> = self
            .contexts
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .cloned()
            .collect();
        for context in contexts {
            context.cancel_with(ExecutionError::InstanceNotActive);
            self.complete_execution(context.execution_id(), Some(ExecutionError::InstanceNotActive));
        }
        self.services.scheduler.shutdown();
    }

    pub fn get_execution_context(&self, execution_id: ExecutionId) -> Option<Arc<ExecutionContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(&execution_id)
            .cloned()
    }

    /// Resources of a job, built at most once while the job has an
    /// execution on this node.
    pub fn get_job_resources(&self, job_id: JobId) -> Arc<JobResources> {
        let cell = self
            .job_resources
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .entry(job_id)
            .or_default()
            .clone();
        // Built outside the map lock; concurrent callers wait on the
        // cell.
        cell.get_or_init(|| {
            tracing::debug!("Creating resources of {job_id}");
            Arc::new((self.resource_factory)(job_id))
        })
        .clone()
    }

    pub fn executions(&self) -> Vec<ExecutionSummary> {
        let mut summaries: Vec<_> = self
            .contexts
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .map(|c| c.summary())
            .collect();
        summaries.sort_by_key(|s| s.execution_id);
        summaries
    }

    fn verify_master(&self, coordinator: &Address) -> Result<(), ExecutionError> {
        let master = self.membership.master_address();
        if master.as_ref() != Some(coordinator) {
            return Err(ExecutionError::IllegalCoordinator {
                coordinator: coordinator.clone(),
                master,
            });
        }
        Ok(())
    }
}

impl PacketHandler for JobExecutionService {
    fn handle_packet(&self, packet: Packet) -> Result<(), ExecutionError> {
        match self.get_execution_context(packet.execution_id) {
            Some(context) => context.deliver_packet(packet),
            None => {
                tracing::debug!(
                    "Dropping packet for unknown {} on {}",
                    packet.execution_id,
                    self.services.address
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_cluster {
    use std::sync::Arc;

    use crate::cluster::Address;
    use crate::cluster::ClusterView;
    use crate::cluster::MemberInfo;
    use crate::config::InstanceConfig;
    use crate::config::JobConfig;
    use crate::execution::context::NodeServices;
    use crate::execution::network::LocalTransport;
    use crate::execution::plan::Dag;
    use crate::execution::plan::ExecutionPlan;
    use crate::execution::plan::Vertex;
    use crate::execution::service::TaskletExecutionService;
    use crate::processor::logic::LogicProcessor;
    use crate::sinks::CollectSinkP;
    use crate::snapshot::repository::SnapshotRepository;
    use crate::snapshot::store::InMemSnapshotStore;

    use super::JobExecutionService;

    pub(crate) struct TestCluster {
        pub(crate) view: Arc<ClusterView>,
        pub(crate) members: Vec<MemberInfo>,
        pub(crate) nodes: Vec<Arc<JobExecutionService>>,
    }

    impl TestCluster {
        pub(crate) fn new(size: usize) -> Self {
            let members: Vec<_> = (0..size)
                .map(|i| MemberInfo::new(Address::new("127.0.0.1", 5701 + i as u16), format!("m{i}")))
                .collect();
            let view = Arc::new(ClusterView::new(members.clone()));
            let transport = Arc::new(LocalTransport::new());
            let repository = SnapshotRepository::new(Arc::new(InMemSnapshotStore::new()));
            let config = InstanceConfig {
                cooperative_thread_count: 1,
                ..InstanceConfig::default()
            };
            let nodes = members
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
            Self {
                view,
                members,
                nodes,
            }
        }

        pub(crate) fn master(&self) -> Address {
            self.members[0].address.clone()
        }

        /// A plan whose single vertex never gets input, so it completes
        /// right away once executed.
        pub(crate) fn plan(&self, member_index: usize) -> ExecutionPlan {
            let dag = Dag::new().vertex(Vertex::from_fn("sink", 1, |_| {
                LogicProcessor::boxed(CollectSinkP::detached())
            }));
            ExecutionPlan {
                dag: Arc::new(dag),
                members: self.members.clone(),
                member_index,
                job_config: JobConfig::default(),
                restore_snapshot: None,
            }
        }
    }
}

#[test]
fn non_master_cannot_init() {
    use crate::execution::context::ExecutionState;

    let cluster = test_cluster::TestCluster::new(2);
    let impostor = cluster.members[1].address.clone();
    let res = cluster.nodes[0].init_execution(
        JobId(1),
        ExecutionId(1),
        &impostor,
        1,
        &cluster.members,
        cluster.plan(0),
    );
    assert!(matches!(res, Err(ExecutionError::IllegalCoordinator { .. })));
    assert!(cluster.nodes[0].get_execution_context(ExecutionId(1)).is_none());

    let context = cluster.nodes[0]
        .init_execution(
            JobId(1),
            ExecutionId(1),
            &cluster.master(),
            1,
            &cluster.members,
            cluster.plan(0),
        )
        .unwrap();
    assert_eq!(context.state(), ExecutionState::Initialized);
}

#[test]
fn stale_member_list_is_retryable() {
    let cluster = test_cluster::TestCluster::new(2);
    let res = cluster.nodes[1].init_execution(
        JobId(1),
        ExecutionId(1),
        &cluster.master(),
        5,
        &cluster.members,
        cluster.plan(1),
    );
    assert!(matches!(res, Err(ExecutionError::Retryable(_))));
    assert_eq!(cluster.view.publish_requests(), 1);

    let stranger = MemberInfo::new(Address::new("10.9.9.9", 1), "x");
    let mut participants = cluster.members.clone();
    participants.push(stranger);
    let res = cluster.nodes[1].init_execution(
        JobId(1),
        ExecutionId(1),
        &cluster.master(),
        1,
        &participants,
        cluster.plan(1),
    );
    assert!(matches!(res, Err(ExecutionError::TopologyChanged(_))));
    assert!(cluster.nodes[1].executions().is_empty());
}

#[test]
fn second_execution_of_a_job_is_retryable() {
    let cluster = test_cluster::TestCluster::new(1);
    let node = &cluster.nodes[0];
    let master = cluster.master();
    let first = node
        .init_execution(JobId(7), ExecutionId(1), &master, 1, &cluster.members, cluster.plan(0))
        .unwrap();

    let res = node.init_execution(
        JobId(7),
        ExecutionId(2),
        &master,
        1,
        &cluster.members,
        cluster.plan(0),
    );
    assert!(matches!(res, Err(ExecutionError::Retryable(_))));
    assert!(node.get_execution_context(ExecutionId(2)).is_none());
    let registered = node.get_execution_context(ExecutionId(1)).unwrap();
    assert!(Arc::ptr_eq(&registered, &first));

    let res = node.init_execution(
        JobId(7),
        ExecutionId(1),
        &master,
        1,
        &cluster.members,
        cluster.plan(0),
    );
    assert!(matches!(res, Err(ExecutionError::AlreadyExists(_))));

    // Once the first one is gone the job can run again.
    node.complete_execution(ExecutionId(1), None);
    node.complete_execution(ExecutionId(1), None);
    assert!(node
        .init_execution(JobId(7), ExecutionId(2), &master, 1, &cluster.members, cluster.plan(0))
        .is_ok());
}

#[test]
fn execute_checks_identity() {
    let cluster = test_cluster::TestCluster::new(1);
    let node = &cluster.nodes[0];
    let master = cluster.master();
    node.init_execution(JobId(1), ExecutionId(1), &master, 1, &cluster.members, cluster.plan(0))
        .unwrap();

    assert!(matches!(
        node.execute(&master, JobId(1), ExecutionId(9), |_| {}),
        Err(ExecutionError::NotFound(_))
    ));
    assert!(matches!(
        node.execute(&master, JobId(2), ExecutionId(1), |_| {}),
        Err(ExecutionError::IdentityMismatch { .. })
    ));

    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();
    let future = node
        .execute(&master, JobId(1), ExecutionId(1), move |_| {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
    assert!(observed.load(Ordering::SeqCst));
    assert!(future.join().is_ok());
}

#[test]
fn failed_initialization_stays_registered() {
    use crate::execution::context::ExecutionState;
    use crate::execution::plan::Edge;

    let cluster = test_cluster::TestCluster::new(1);
    let node = &cluster.nodes[0];
    let master = cluster.master();
    let mut plan = cluster.plan(0);
    // Edge to a vertex that does not exist.
    plan.dag = Arc::new((*plan.dag).clone().edge(Edge::between("sink", "nowhere")));
    let res = node.init_execution(JobId(1), ExecutionId(1), &master, 1, &cluster.members, plan);
    assert!(res.is_err());

    let context = node.get_execution_context(ExecutionId(1)).unwrap();
    assert_eq!(context.state(), ExecutionState::InitializationFailed);
    let future = node
        .execute(&master, JobId(1), ExecutionId(1), |_| {})
        .unwrap();
    assert!(matches!(future.join(), Err(ExecutionError::ProtocolViolation(_))));
    assert!(context.cancel().is_done());
    node.complete_execution(ExecutionId(1), future.result().and_then(Result::err));
    assert!(node.get_execution_context(ExecutionId(1)).is_none());
}

#[test]
fn member_leave_affects_only_its_executions() {
    let cluster = test_cluster::TestCluster::new(2);
    let node = &cluster.nodes[0];
    let master = cluster.master();
    node.init_execution(JobId(1), ExecutionId(1), &master, 1, &cluster.members, cluster.plan(0))
        .unwrap();

    // Runs on the master alone.
    let alone = vec![cluster.members[0].clone()];
    let mut plan = cluster.plan(0);
    plan.members = alone.clone();
    node.init_execution(JobId(2), ExecutionId(2), &master, 1, &alone, plan)
        .unwrap();

    let leaving = cluster.members[1].address.clone();
    cluster.view.remove_member(&leaving);
    node.on_member_leave(&leaving);

    assert!(node.get_execution_context(ExecutionId(1)).is_none());
    let untouched = node.get_execution_context(ExecutionId(2)).unwrap();
    assert!(!untouched.completion_future().is_done());
}

#[test]
fn member_leave_stops_running_executions() {
    use std::time::Duration;
    use std::time::Instant;

    use crate::execution::plan::Dag;
    use crate::execution::plan::Edge;
    use crate::execution::plan::Vertex;
    use crate::processor::logic::LogicProcessor;
    use crate::sinks::CollectSinkP;

    let cluster = test_cluster::TestCluster::new(2);
    let master = cluster.master();
    let node = &cluster.nodes[1];
    // Never completes: the sink waits for input from a node that is
    // about to leave.
    let vertex = |name: &str| {
        Vertex::from_fn(name, 1, |_| LogicProcessor::boxed(CollectSinkP::detached()))
    };
    let mut plan = cluster.plan(1);
    plan.dag = Arc::new(
        Dag::new()
            .vertex(vertex("source"))
            .vertex(vertex("sink"))
            .edge(Edge::between("source", "sink").distributed()),
    );
    node.init_execution(JobId(1), ExecutionId(1), &master, 1, &cluster.members, plan)
        .unwrap();
    let future = node
        .execute(&master, JobId(1), ExecutionId(1), |_| {})
        .unwrap();
    assert!(future.join_timeout(Duration::from_millis(20)).is_none());

    node.on_member_leave(&master);
    assert!(matches!(
        future.join(),
        Err(ExecutionError::TopologyChanged(_))
    ));
    // Completion runs on the worker thread right after the future
    // resolved.
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.get_execution_context(ExecutionId(1)).is_some() {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
}

#[test]
fn resources_are_built_once() {
    use std::sync::atomic::AtomicUsize;

    let cluster = test_cluster::TestCluster::new(1);
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let services = cluster.nodes[0].services().clone();
    let node = Arc::new(
        JobExecutionService::new(services, cluster.view.clone()).with_resource_factory(Arc::new(
            move |job_id| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                JobResources::new(job_id, HashMap::new())
            },
        )),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let node = node.clone();
            std::thread::spawn(move || node.get_job_resources(JobId(3)))
        })
        .collect();
    let resources: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(resources.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[test]
fn shutdown_completes_everything() {
    let cluster = test_cluster::TestCluster::new(1);
    let node = &cluster.nodes[0];
    let master = cluster.master();
    let context = node
        .init_execution(JobId(1), ExecutionId(1), &master, 1, &cluster.members, cluster.plan(0))
        .unwrap();
    node.shutdown();
    assert!(matches!(
        context.completion_future().join(),
        Err(ExecutionError::InstanceNotActive)
    ));
    assert!(node.executions().is_empty());
    assert!(matches!(
        node.init_execution(JobId(2), ExecutionId(2), &master, 1, &cluster.members, cluster.plan(0)),
        Err(ExecutionError::InstanceNotActive)
    ));
}
