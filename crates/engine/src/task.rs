//! A running task: its node DAG, edges, and lifecycle.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use strom_core::{EdgeType, Message, TaskDefinition, TASK_IN, TASK_OUT};
use strom_edge::{ChannelEdge, Edge, StatsEdge};
use strom_udf::UdfServer;

use crate::alert::AlertHandler;
use crate::error::EngineError;
use crate::ingest::Ingest;
use crate::node::NodeIo;
use crate::nodes;
use crate::timer::Timer;

/// Services and settings a task borrows from its owner.
pub struct TaskContext {
    /// Capacity of every edge allocated for the task.
    pub edge_capacity: usize,
    /// Named alert handler services available to alert nodes.
    pub handlers: HashMap<String, Arc<dyn AlertHandler>>,
    /// The ingest path loopback nodes write into.
    pub ingest: Option<Arc<dyn Ingest>>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            edge_capacity: 1000,
            handlers: HashMap::new(),
            ingest: None,
        }
    }
}

/// Nodes with durable state expose it as an opaque blob.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<u8>, EngineError>;
}

#[async_trait]
impl SnapshotProvider for UdfServer {
    async fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        Ok(UdfServer::snapshot(self).await?)
    }
}

/// Providers registered by nodes at build time, keyed by node id.
#[derive(Clone, Default)]
pub struct SnapshotRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<dyn SnapshotProvider>>>>,
}

impl SnapshotRegistry {
    pub(crate) fn register(&self, node_id: &str, provider: Arc<dyn SnapshotProvider>) {
        self.inner
            .lock()
            .unwrap()
            .insert(node_id.to_string(), provider);
    }

    async fn collect(&self) -> Result<HashMap<String, Vec<u8>>, EngineError> {
        let providers: Vec<(String, Arc<dyn SnapshotProvider>)> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(id, p)| (id.clone(), Arc::clone(p)))
            .collect();
        let mut blobs = HashMap::new();
        for (id, provider) in providers {
            blobs.insert(id, provider.snapshot().await?);
        }
        Ok(blobs)
    }
}

/// First-error bookkeeping shared by every node task.
pub(crate) struct TaskState {
    first_err: Mutex<Option<EngineError>>,
    edges: Vec<Arc<dyn Edge>>,
    cancel: CancellationToken,
}

impl TaskState {
    /// Record the first error, abort every edge, cancel every node.
    /// Later errors are suppressed.
    pub(crate) fn fail(&self, err: EngineError) {
        {
            let mut first = self.first_err.lock().unwrap();
            if first.is_none() {
                *first = Some(err);
            }
        }
        for edge in &self.edges {
            edge.abort();
        }
        self.cancel.cancel();
    }

    fn take_error(&self) -> Option<EngineError> {
        self.first_err.lock().unwrap().take()
    }
}

/// Point-in-time counters of a running task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStats {
    pub task: String,
    pub nodes: Vec<NodeStats>,
    pub edges: Vec<EdgeStats>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStats {
    pub node: String,
    pub avg_exec_time_ns: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EdgeStats {
    pub from: String,
    pub to: String,
    pub collected: i64,
    pub emitted: i64,
    pub groups: usize,
}

/// A task instantiated from its definition: edges allocated, nodes
/// started, the whole thing one unit of start, collect, stop, abort,
/// and snapshot.
pub struct ExecutingTask {
    def: TaskDefinition,
    ctx: TaskContext,
    sources: Vec<Arc<StatsEdge>>,
    output: Option<Arc<StatsEdge>>,
    edges: Vec<(String, String, Arc<StatsEdge>)>,
    timers: HashMap<String, Timer>,
    state: Arc<TaskState>,
    handles: Vec<JoinHandle<()>>,
    snapshots: SnapshotRegistry,
    started: bool,
}

impl std::fmt::Debug for ExecutingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutingTask")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl ExecutingTask {
    /// Validate the definition and allocate one edge per connection;
    /// nodes start in [`start`].
    ///
    /// [`start`]: ExecutingTask::start
    pub fn new(def: TaskDefinition, ctx: TaskContext) -> Result<Self, EngineError> {
        def.validate()?;
        let out_types = resolve_edge_types(&def)?;

        let mut edges: Vec<(String, String, Arc<StatsEdge>)> = Vec::new();
        let mut sources = Vec::new();
        let mut output: Option<Arc<StatsEdge>> = None;
        for (from, to) in &def.edges {
            let edge_type = if from == TASK_IN {
                def.kind
            } else {
                *out_types
                    .get(from.as_str())
                    .ok_or_else(|| EngineError::node(from, "untyped edge source"))?
            };
            let edge = Arc::new(StatsEdge::new(Arc::new(ChannelEdge::new(
                edge_type,
                ctx.edge_capacity,
            ))));
            if from == TASK_IN {
                sources.push(Arc::clone(&edge));
            }
            if to == TASK_OUT {
                if output.is_some() {
                    return Err(EngineError::node(
                        from,
                        "at most one edge may target \"out\"",
                    ));
                }
                output = Some(Arc::clone(&edge));
            }
            edges.push((from.clone(), to.clone(), edge));
        }

        let all: Vec<Arc<dyn Edge>> = edges
            .iter()
            .map(|(_, _, e)| Arc::clone(e) as Arc<dyn Edge>)
            .collect();
        let state = Arc::new(TaskState {
            first_err: Mutex::new(None),
            edges: all,
            cancel: CancellationToken::new(),
        });
        let timers = def
            .nodes
            .iter()
            .map(|n| (n.id.clone(), Timer::default()))
            .collect();

        Ok(Self {
            def,
            ctx,
            sources,
            output,
            edges,
            timers,
            state,
            handles: Vec::new(),
            snapshots: SnapshotRegistry::default(),
            started: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    /// The task's output edge, when the definition routes one to `"out"`.
    pub fn output(&self) -> Option<Arc<StatsEdge>> {
        self.output.clone()
    }

    /// Start every node, leaves first, so each consumer is draining
    /// before its producer starts. `restore` carries per-node snapshot
    /// blobs to replay before data flows.
    pub async fn start(
        &mut self,
        mut restore: HashMap<String, Vec<u8>>,
    ) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::node(&self.def.id, "task already started"));
        }
        self.started = true;
        info!(task = %self.def.id, nodes = self.def.nodes.len(), "starting task");

        let order: Vec<String> = self
            .def
            .start_order()
            .into_iter()
            .map(str::to_string)
            .collect();
        for id in order {
            let node_def = self
                .def
                .nodes
                .iter()
                .find(|n| n.id == id)
                .ok_or_else(|| EngineError::node(&id, "unknown node in start order"))?
                .clone();

            let ins: Vec<Arc<dyn Edge>> = self
                .edges
                .iter()
                .filter(|(_, to, _)| *to == id)
                .map(|(_, _, e)| Arc::clone(e) as Arc<dyn Edge>)
                .collect();
            let outs: Vec<Arc<dyn Edge>> = self
                .edges
                .iter()
                .filter(|(from, _, _)| *from == id)
                .map(|(_, _, e)| Arc::clone(e) as Arc<dyn Edge>)
                .collect();

            let io = NodeIo {
                task_id: self.def.id.clone(),
                node_id: id.clone(),
                ins,
                outs: outs.clone(),
                timer: self
                    .timers
                    .get(&id)
                    .cloned()
                    .unwrap_or_default(),
                cancel: self.state.cancel.child_token(),
            };
            let node =
                nodes::build(&node_def, io, &self.ctx, restore.remove(&id), &self.snapshots)
                    .await?;

            let state = Arc::clone(&self.state);
            let node_id = id.clone();
            self.handles.push(tokio::spawn(async move {
                match AssertUnwindSafe(node.run()).catch_unwind().await {
                    Ok(Ok(())) => {
                        for out in &outs {
                            let _ = out.close();
                        }
                    }
                    Ok(Err(e)) => {
                        error!(node = %node_id, error = %e, "node failed");
                        state.fail(e);
                    }
                    Err(panic) => {
                        let msg = panic_message(panic.as_ref());
                        error!(node = %node_id, panic = %msg, "node panicked");
                        state.fail(EngineError::Panic(format!("{node_id}: {msg}")));
                    }
                }
            }));
        }
        Ok(())
    }

    /// Feed one message into the task's source edge(s).
    pub async fn collect(&self, msg: Message) -> Result<(), EngineError> {
        self.collector().collect(msg).await
    }

    /// A cheap handle for feeding the task from elsewhere (ingest paths,
    /// loopbacks) without holding the task itself.
    pub fn collector(&self) -> TaskCollector {
        TaskCollector {
            task_id: self.def.id.clone(),
            sources: self.sources.clone(),
        }
    }

    /// Close the source edges, let the pipeline drain, and wait for
    /// every node. Returns the first node error, if any.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        for src in &self.sources {
            let _ = src.close();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        match self.state.take_error() {
            Some(err) => Err(err),
            None => {
                info!(task = %self.def.id, "task stopped");
                Ok(())
            }
        }
    }

    /// Abort every edge immediately; pending work is dropped.
    pub fn abort(&self) {
        self.state.fail(EngineError::Aborted);
    }

    /// Collect per-node snapshot blobs, keyed by node id.
    pub async fn snapshot(&self) -> Result<HashMap<String, Vec<u8>>, EngineError> {
        self.snapshots.collect().await
    }

    /// Aggregate per-node timing and per-edge traffic counters.
    pub fn stats(&self) -> TaskStats {
        let nodes = self
            .timers
            .iter()
            .map(|(id, timer)| NodeStats {
                node: id.clone(),
                avg_exec_time_ns: timer.average().as_nanos() as u64,
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .map(|(from, to, e)| {
                let mut groups = 0;
                e.read_group_stats(|_| groups += 1);
                EdgeStats {
                    from: from.clone(),
                    to: to.clone(),
                    collected: e.collected(),
                    emitted: e.emitted(),
                    groups,
                }
            })
            .collect();
        TaskStats {
            task: self.def.id.clone(),
            nodes,
            edges,
        }
    }
}

/// Feeds messages into a task's source edges.
#[derive(Clone)]
pub struct TaskCollector {
    task_id: String,
    sources: Vec<Arc<StatsEdge>>,
}

impl TaskCollector {
    pub async fn collect(&self, msg: Message) -> Result<(), EngineError> {
        if self.sources.is_empty() {
            return Err(EngineError::node(&self.task_id, "task has no source edge"));
        }
        let mut iter = self.sources.iter().peekable();
        while let Some(src) = iter.next() {
            if iter.peek().is_some() {
                src.collect(msg.clone()).await?;
            } else {
                src.collect(msg).await?;
                break;
            }
        }
        Ok(())
    }
}

/// Propagate edge types from the task source through the DAG, checking
/// node input requirements along the way.
fn resolve_edge_types(def: &TaskDefinition) -> Result<HashMap<&str, EdgeType>, EngineError> {
    let mut out_types: HashMap<&str, EdgeType> = HashMap::new();
    let mut order = def.start_order();
    order.reverse(); // producers before their consumers

    for id in order {
        let node = def
            .nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| EngineError::node(id, "unknown node"))?;

        let mut input: Option<EdgeType> = None;
        for (from, to) in &def.edges {
            if to != id {
                continue;
            }
            let ty = if from == TASK_IN {
                def.kind
            } else {
                *out_types
                    .get(from.as_str())
                    .ok_or_else(|| EngineError::node(from, "edge source not yet typed"))?
            };
            match input {
                None => input = Some(ty),
                Some(prev) if prev != ty => {
                    return Err(EngineError::node(
                        id,
                        "node inputs mix stream and batch edges",
                    ));
                }
                Some(_) => {}
            }
        }
        let input = input.unwrap_or(def.kind);

        if let Some(wanted) = node.spec.wants() {
            if wanted != input {
                return Err(EngineError::node(
                    id,
                    format!(
                        "{} node requires a {wanted} input, got {input}",
                        node.spec.kind_name()
                    ),
                ));
            }
        }
        out_types.insert(&node.id, node.spec.provides(input));
    }
    Ok(out_types)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
