//! The job graph and what one node needs to know to run its share of
//! it.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::cluster::MemberInfo;
use crate::config::JobConfig;
use crate::errors::ExecutionError;
use crate::processor::Processor;
use crate::processor::ProcessorContext;
use crate::processor::ProcessorSupplier;
use crate::snapshot::SnapshotId;
use crate::snapshot::SnapshotRestorePolicy;

/// Extracts the partitioning key of a data item.
pub type KeyFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// How items of an edge are spread over the consumer instances.
#[derive(Clone)]
pub enum Routing {
    /// Any consumer with free space, rotating.
    Unicast,
    /// The consumer owning the partition of the item's key.
    Partitioned(KeyFn),
    /// Every consumer.
    Broadcast,
    /// The consumer with index 0.
    AllToOne,
}

impl fmt::Debug for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast => write!(f, "Unicast"),
            Self::Partitioned(_) => write!(f, "Partitioned"),
            Self::Broadcast => write!(f, "Broadcast"),
            Self::AllToOne => write!(f, "AllToOne"),
        }
    }
}

#[derive(Clone)]
pub struct Vertex {
    pub name: String,
    /// Instances on every node.
    pub local_parallelism: usize,
    pub supplier: Arc<dyn ProcessorSupplier>,
    pub restore_policy: SnapshotRestorePolicy,
}

impl Vertex {
    pub fn new(
        name: impl Into<String>,
        local_parallelism: usize,
        supplier: Arc<dyn ProcessorSupplier>,
    ) -> Self {
        Self {
            name: name.into(),
            local_parallelism,
            supplier,
            restore_policy: SnapshotRestorePolicy::default(),
        }
    }

    /// Vertex whose instances are created by a plain function.
    pub fn from_fn<F>(name: impl Into<String>, local_parallelism: usize, f: F) -> Self
    where
        F: Fn(&ProcessorContext) -> Box<dyn Processor> + Send + Sync + 'static,
    {
        Self::new(name, local_parallelism, Arc::new(f))
    }

    pub fn with_restore_policy(mut self, policy: SnapshotRestorePolicy) -> Self {
        self.restore_policy = policy;
        self
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("name", &self.name)
            .field("local_parallelism", &self.local_parallelism)
            .field("restore_policy", &self.restore_policy)
            .finish()
    }
}

/// Connection from an output ordinal of one vertex to an input
/// ordinal of another.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: String,
    pub source_ordinal: usize,
    pub dest: String,
    pub dest_ordinal: usize,
    pub routing: Routing,
    /// Whether consumers on other nodes receive items too. Local
    /// edges connect only the instances of one node.
    pub distributed: bool,
    /// Inbound edges with a lower value are drained to completion
    /// before any edge with a higher value.
    pub priority: i32,
    /// Overrides the node's queue size.
    pub queue_size: Option<usize>,
}

impl Edge {
    /// Local unicast edge from ordinal 0 to ordinal 0.
    pub fn between(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_ordinal: 0,
            dest: dest.into(),
            dest_ordinal: 0,
            routing: Routing::Unicast,
            distributed: false,
            priority: 0,
            queue_size: None,
        }
    }

    pub fn from_ordinal(mut self, ordinal: usize) -> Self {
        self.source_ordinal = ordinal;
        self
    }

    pub fn to_ordinal(mut self, ordinal: usize) -> Self {
        self.dest_ordinal = ordinal;
        self
    }

    pub fn partitioned<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.routing = Routing::Partitioned(Arc::new(key_fn));
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.routing = Routing::Broadcast;
        self
    }

    pub fn all_to_one(mut self) -> Self {
        self.routing = Routing::AllToOne;
        self
    }

    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }
}

/// Directed acyclic graph of vertices and edges.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex(mut self, vertex: Vertex) -> Self {
        self.vertices.push(vertex);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn get_vertex(&self, name: &str) -> Option<&Vertex> {
        self.vertices.iter().find(|v| v.name == name)
    }

    /// Inbound edges of a vertex sorted by ordinal.
    pub fn inbound_edges(&self, name: &str) -> Vec<&Edge> {
        let mut edges: Vec<_> = self.edges.iter().filter(|e| e.dest == name).collect();
        edges.sort_by_key(|e| e.dest_ordinal);
        edges
    }

    /// Outbound edges of a vertex sorted by ordinal.
    pub fn outbound_edges(&self, name: &str) -> Vec<&Edge> {
        let mut edges: Vec<_> = self.edges.iter().filter(|e| e.source == name).collect();
        edges.sort_by_key(|e| e.source_ordinal);
        edges
    }

    /// Check names, ordinals and that there is no cycle.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        let mut names = HashSet::new();
        for vertex in &self.vertices {
            if !names.insert(vertex.name.as_str()) {
                return Err(invalid(format!("duplicate vertex {:?}", vertex.name)));
            }
            if vertex.local_parallelism == 0 {
                return Err(invalid(format!(
                    "vertex {:?} has a local parallelism of 0",
                    vertex.name
                )));
            }
        }
        for edge in &self.edges {
            for end in [&edge.source, &edge.dest] {
                if !names.contains(end.as_str()) {
                    return Err(invalid(format!("edge refers to unknown vertex {end:?}")));
                }
            }
        }
        for vertex in &self.vertices {
            let inbound: Vec<_> = self
                .inbound_edges(&vertex.name)
                .iter()
                .map(|e| e.dest_ordinal)
                .collect();
            let outbound: Vec<_> = self
                .outbound_edges(&vertex.name)
                .iter()
                .map(|e| e.source_ordinal)
                .collect();
            for (dir, ordinals) in [("inbound", inbound), ("outbound", outbound)] {
                if ordinals.iter().enumerate().any(|(i, o)| i != *o) {
                    return Err(invalid(format!(
                        "{dir} ordinals of {:?} are not 0..n: {ordinals:?}",
                        vertex.name
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), ExecutionError> {
        let mut in_degree: HashMap<&str, usize> = self
            .vertices
            .iter()
            .map(|v| (v.name.as_str(), 0))
            .collect();
        for edge in &self.edges {
            *in_degree.entry(edge.dest.as_str()).or_default() += 1;
        }
        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(name) = ready.pop_front() {
            visited += 1;
            for edge in self.edges.iter().filter(|e| e.source == name) {
                if let Some(degree) = in_degree.get_mut(edge.dest.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(edge.dest.as_str());
                    }
                }
            }
        }
        if visited == self.vertices.len() {
            Ok(())
        } else {
            Err(invalid("the graph has a cycle".to_string()))
        }
    }
}

fn invalid(msg: String) -> ExecutionError {
    ExecutionError::ProtocolViolation(format!("invalid dag: {msg}"))
}

/// One node's instructions for an execution.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub dag: Arc<Dag>,
    /// Participants in order. Global processor indexes are laid out
    /// member by member.
    pub members: Vec<MemberInfo>,
    /// Position of the local node in `members`.
    pub member_index: usize,
    pub job_config: JobConfig,
    /// Snapshot to restore processor state from before any input.
    pub restore_snapshot: Option<SnapshotId>,
}

impl ExecutionPlan {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn global_index(&self, vertex: &Vertex, local_index: usize) -> usize {
        self.member_index * vertex.local_parallelism + local_index
    }

    pub fn total_parallelism(&self, vertex: &Vertex) -> usize {
        self.members.len() * vertex.local_parallelism
    }
}

#[test]
fn validation_catches_cycles_and_gaps() {
    use crate::processor::logic::LogicProcessor;
    use crate::sinks::CollectSinkP;

    let vertex = |name: &str| {
        Vertex::from_fn(name, 1, |_| LogicProcessor::boxed(CollectSinkP::detached()))
    };
    let dag = Dag::new()
        .vertex(vertex("a"))
        .vertex(vertex("b"))
        .edge(Edge::between("a", "b"));
    assert!(dag.validate().is_ok());
    assert_eq!(dag.inbound_edges("b").len(), 1);

    let cyclic = dag.clone().edge(Edge::between("b", "a"));
    assert!(cyclic.validate().is_err());

    let gap = Dag::new()
        .vertex(vertex("a"))
        .vertex(vertex("b"))
        .edge(Edge::between("a", "b").to_ordinal(1));
    assert!(gap.validate().is_err());

    let unknown = Dag::new().vertex(vertex("a")).edge(Edge::between("a", "c"));
    assert!(unknown.validate().is_err());
}
