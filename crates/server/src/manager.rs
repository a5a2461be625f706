//! Owns the defined tasks and routes ingested points to them.
//!
//! Definitions load from disk (or arrive via `define`) disabled; enabling
//! one instantiates an [`ExecutingTask`] and starts draining its output.
//! The manager is also the ingest path loopback nodes write back into,
//! so derived points re-enter distribution like any other write.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use strom_core::{point_from_json, Message, Point, TaskDefinition};
use strom_edge::Edge;
use strom_engine::{
    EngineError, ExecutingTask, Ingest, TaskCollector, TaskContext, Waiter, WaiterGroup,
};

use crate::error::ServerError;
use crate::state::{TaskControl, TaskSummary, WriteHandler};

struct Running {
    task: ExecutingTask,
    collector: TaskCollector,
}

struct ManagedTask {
    def: TaskDefinition,
    running: Option<Running>,
}

struct Inner {
    edge_capacity: usize,
    tasks: Mutex<HashMap<String, ManagedTask>>,
    /// Broadcasts whenever the task set or an enable state changes.
    changes: WaiterGroup,
}

#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(edge_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                edge_capacity,
                tasks: Mutex::new(HashMap::new()),
                changes: WaiterGroup::new(),
            }),
        }
    }

    /// Register a task definition, disabled. Redefining a running task
    /// is a conflict; disable it first.
    pub async fn define(&self, def: TaskDefinition) -> Result<(), ServerError> {
        def.validate()?;
        let mut tasks = self.inner.tasks.lock().await;
        if let Some(existing) = tasks.get(&def.id) {
            if existing.running.is_some() {
                return Err(ServerError::Conflict(format!(
                    "task {:?} is enabled, disable it before redefining",
                    def.id
                )));
            }
        }
        info!(task = %def.id, "task defined");
        tasks.insert(def.id.clone(), ManagedTask { def, running: None });
        self.inner.changes.broadcast();
        Ok(())
    }

    /// Load every task definition file in `dir`. Returns the number of
    /// tasks loaded; individual parse failures are logged and skipped.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, ServerError> {
        let mut loaded = 0;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "task directory not readable");
                return Ok(0);
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "cannot read task file");
                    continue;
                }
            };
            match serde_yaml::from_str::<TaskDefinition>(&text) {
                Ok(def) => match self.define(def).await {
                    Ok(()) => loaded += 1,
                    Err(e) => warn!(file = %path.display(), error = %e, "task rejected"),
                },
                Err(e) => warn!(file = %path.display(), error = %e, "task file invalid"),
            }
        }
        Ok(loaded)
    }

    /// Hand a point to every enabled task reading its (db, rp).
    async fn distribute(&self, point: Point) -> Result<(), EngineError> {
        let collectors: Vec<TaskCollector> = {
            let tasks = self.inner.tasks.lock().await;
            tasks
                .values()
                .filter(|t| {
                    t.def.dbrps.iter().any(|dbrp| {
                        dbrp.database == point.database
                            && dbrp.retention_policy == point.retention_policy
                    })
                })
                .filter_map(|t| t.running.as_ref().map(|r| r.collector.clone()))
                .collect()
        };
        for collector in collectors {
            if let Err(e) = collector.collect(Message::Point(point.clone())).await {
                warn!(error = %e, "task rejected point");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Ingest for TaskManager {
    async fn write_point(&self, point: Point) -> Result<(), EngineError> {
        self.distribute(point).await
    }
}

#[async_trait]
impl WriteHandler for TaskManager {
    /// Body format: one JSON point per line.
    async fn write(&self, db: &str, rp: &str, body: &[u8]) -> Result<(), ServerError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| ServerError::BadRequest("body is not valid UTF-8".into()))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut point = point_from_json(line)?;
            point.database = db.to_string();
            point.retention_policy = rp.to_string();
            self.distribute(point)
                .await
                .map_err(|e| ServerError::Internal(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskControl for TaskManager {
    async fn list(&self) -> Vec<TaskSummary> {
        let tasks = self.inner.tasks.lock().await;
        let mut out: Vec<TaskSummary> = tasks
            .values()
            .map(|t| TaskSummary {
                id: t.def.id.clone(),
                kind: t.def.kind,
                dbrps: t.def.dbrps.clone(),
                enabled: t.running.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    async fn get(&self, id: &str) -> Result<TaskSummary, ServerError> {
        let tasks = self.inner.tasks.lock().await;
        let t = tasks
            .get(id)
            .ok_or_else(|| ServerError::NotFound(format!("task {id:?}")))?;
        Ok(TaskSummary {
            id: t.def.id.clone(),
            kind: t.def.kind,
            dbrps: t.def.dbrps.clone(),
            enabled: t.running.is_some(),
        })
    }

    async fn enable(&self, id: &str) -> Result<(), ServerError> {
        let mut tasks = self.inner.tasks.lock().await;
        let t = tasks
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(format!("task {id:?}")))?;
        if t.running.is_some() {
            return Ok(());
        }

        let ctx = TaskContext {
            edge_capacity: self.inner.edge_capacity,
            handlers: HashMap::new(),
            ingest: Some(Arc::new(self.clone())),
        };
        let mut task = ExecutingTask::new(t.def.clone(), ctx)?;
        let output = task.output();
        task.start(HashMap::new()).await?;

        // Nothing downstream consumes "out" here; drain it so the task
        // never stalls on a full output edge.
        if let Some(output) = output {
            let task_id = id.to_string();
            tokio::spawn(async move {
                while let Some(msg) = output.emit().await {
                    debug!(task = %task_id, kind = %msg.kind(), "task output");
                }
            });
        }

        let collector = task.collector();
        t.running = Some(Running { task, collector });
        info!(task = %id, "task enabled");
        self.inner.changes.broadcast();
        Ok(())
    }

    async fn disable(&self, id: &str) -> Result<(), ServerError> {
        let mut tasks = self.inner.tasks.lock().await;
        let t = tasks
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(format!("task {id:?}")))?;
        let Some(mut running) = t.running.take() else {
            return Ok(());
        };
        match running.task.stop().await {
            Ok(()) => info!(task = %id, "task disabled"),
            Err(e) => warn!(task = %id, error = %e, "task stopped with error"),
        }
        self.inner.changes.broadcast();
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<serde_json::Value, ServerError> {
        let tasks = self.inner.tasks.lock().await;
        let t = tasks
            .get(id)
            .ok_or_else(|| ServerError::NotFound(format!("task {id:?}")))?;
        let running = t
            .running
            .as_ref()
            .ok_or_else(|| ServerError::Conflict(format!("task {id:?} is not enabled")))?;
        serde_json::to_value(running.task.stats())
            .map_err(|e| ServerError::Internal(e.to_string()))
    }

    async fn change_waiter(&self) -> Waiter {
        self.inner.changes.new_waiter().await
    }
}
