//! Concrete node implementations and the spec-to-node builder.

mod alert;
mod combine;
mod derivative;
mod filter;
mod flatten;
mod group_by;
mod join;
mod loopback;
mod mutate;
mod sample;
mod state;
mod udf;
mod union;
mod window;

use std::sync::Arc;
use std::time::Duration;

use strom_core::{NodeDef, NodeSpec, UdfSpec};
use strom_udf::{Hooks, ProcessWorker, UdfConfig, UdfServer};

use crate::alert::{AlertHandler, LogHandler};
use crate::error::EngineError;
use crate::node::{Node, NodeIo};
use crate::task::{SnapshotProvider, SnapshotRegistry, TaskContext};

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms as i64)
}

/// Instantiate one node from its spec. UDF nodes reach their worker and
/// complete init (and restore) here, so data can flow the moment the
/// node runs.
pub(crate) async fn build(
    def: &NodeDef,
    io: NodeIo,
    ctx: &TaskContext,
    restore: Option<Vec<u8>>,
    snapshots: &SnapshotRegistry,
) -> Result<Box<dyn Node>, EngineError> {
    let node: Box<dyn Node> = match &def.spec {
        NodeSpec::Where { predicate } => Box::new(filter::WhereNode {
            io,
            predicate: predicate.clone(),
        }),
        NodeSpec::Default { fields, tags } => Box::new(mutate::DefaultNode {
            io,
            fields: fields.clone(),
            tags: tags.clone(),
        }),
        NodeSpec::Delete { fields, tags } => Box::new(mutate::DeleteNode {
            io,
            fields: fields.clone(),
            tags: tags.clone(),
        }),
        NodeSpec::Derivative {
            field,
            unit_ms,
            non_negative,
            as_field,
        } => Box::new(derivative::DerivativeNode {
            io,
            field: field.clone(),
            unit: millis((*unit_ms).max(1)),
            non_negative: *non_negative,
            as_field: as_field.clone(),
        }),
        NodeSpec::Window {
            period_ms,
            every_ms,
            period_count,
            every_count,
        } => {
            let mode = if *every_count > 0 || *period_count > 0 {
                let every = if *every_count > 0 {
                    *every_count
                } else {
                    *period_count
                };
                let period = if *period_count > 0 {
                    *period_count
                } else {
                    *every_count
                };
                window::WindowMode::Count {
                    period: period as usize,
                    every: every as usize,
                }
            } else if *period_ms > 0 || *every_ms > 0 {
                let every = if *every_ms > 0 { *every_ms } else { *period_ms };
                let period = if *period_ms > 0 { *period_ms } else { *every_ms };
                window::WindowMode::Time {
                    period: millis(period),
                    every: millis(every),
                }
            } else {
                return Err(EngineError::node(
                    &io.node_id,
                    "window needs a period/every duration or count",
                ));
            };
            Box::new(window::WindowNode { io, mode })
        }
        NodeSpec::GroupBy { tags, by_name } => Box::new(group_by::GroupByNode {
            io,
            tags: tags.clone(),
            by_name: *by_name,
        }),
        NodeSpec::Flatten {
            tags,
            tolerance_ms,
            delimiter,
        } => Box::new(flatten::FlattenNode {
            io,
            tags: tags.clone(),
            tolerance: millis(*tolerance_ms),
            delimiter: delimiter.clone(),
        }),
        NodeSpec::Combine {
            k,
            names,
            tolerance_ms,
            max,
            delimiter,
        } => Box::new(combine::CombineNode {
            io,
            k: *k,
            names: names.clone(),
            tolerance: millis(*tolerance_ms),
            max: *max,
            delimiter: delimiter.clone(),
        }),
        NodeSpec::Union {} => Box::new(union::UnionNode { io }),
        NodeSpec::Join {
            names,
            tolerance_ms,
            delimiter,
        } => Box::new(join::JoinNode {
            io,
            names: names.clone(),
            tolerance: millis(*tolerance_ms),
            delimiter: delimiter.clone(),
        }),
        NodeSpec::StateCount {
            predicate,
            as_field,
        } => Box::new(state::StateTrackNode {
            io,
            predicate: predicate.clone(),
            as_field: as_field.clone(),
            mode: state::TrackMode::Count,
            unit: chrono::Duration::seconds(1),
        }),
        NodeSpec::StateDuration {
            predicate,
            as_field,
            unit_ms,
        } => Box::new(state::StateTrackNode {
            io,
            predicate: predicate.clone(),
            as_field: as_field.clone(),
            mode: state::TrackMode::Duration,
            unit: millis((*unit_ms).max(1)),
        }),
        NodeSpec::Sample { count, every_ms } => {
            let rate = if *count > 0 {
                sample::SampleRate::EveryCount(*count)
            } else if *every_ms > 0 {
                sample::SampleRate::EveryDuration(millis(*every_ms))
            } else {
                return Err(EngineError::node(
                    &io.node_id,
                    "sample needs a count or duration",
                ));
            };
            Box::new(sample::SampleNode { io, rate })
        }
        NodeSpec::Alert(spec) => {
            let mut handlers: Vec<Arc<dyn AlertHandler>> = Vec::new();
            for name in &spec.handlers {
                let handler = ctx.handlers.get(name).ok_or_else(|| {
                    EngineError::node(&io.node_id, format!("unknown alert handler {name:?}"))
                })?;
                handlers.push(Arc::clone(handler));
            }
            if handlers.is_empty() {
                handlers.push(Arc::new(LogHandler));
            }
            Box::new(alert::AlertNode {
                id_template: spec
                    .id
                    .clone()
                    .unwrap_or_else(|| "{task}:{node}:{group}".to_string()),
                message_template: spec
                    .message
                    .clone()
                    .unwrap_or_else(|| "{id} is {level}".to_string()),
                info: spec.info.clone(),
                warning: spec.warning.clone(),
                critical: spec.critical.clone(),
                state_changes_only: spec.state_changes_only,
                handlers,
                io,
            })
        }
        NodeSpec::Loopback {
            database,
            retention_policy,
            measurement,
            tags,
        } => {
            let ingest = ctx.ingest.clone().ok_or_else(|| {
                EngineError::node(&io.node_id, "loopback requires an ingest service")
            })?;
            Box::new(loopback::LoopbackNode {
                io,
                database: database.clone(),
                retention_policy: retention_policy.clone(),
                measurement: measurement.clone(),
                tags: tags.clone(),
                ingest,
            })
        }
        NodeSpec::Udf(spec) => build_udf(spec, io, restore, snapshots).await?,
    };
    Ok(node)
}

async fn build_udf(
    spec: &UdfSpec,
    io: NodeIo,
    restore: Option<Vec<u8>>,
    snapshots: &SnapshotRegistry,
) -> Result<Box<dyn Node>, EngineError> {
    let config = UdfConfig::new(&io.task_id, &io.node_id)
        .with_keepalive(Duration::from_millis(spec.keepalive_ms));

    let server = if let Some(path) = &spec.socket {
        socket_server(path, config, &io).await?
    } else if !spec.command.is_empty() {
        let ProcessWorker {
            stdout,
            stdin,
            handle,
        } = ProcessWorker::spawn(&spec.command)?;
        let terminated = handle.terminated();
        let handle = Arc::new(std::sync::Mutex::new(handle));
        let cancel = io.cancel.clone();
        let hooks = Hooks {
            on_abort: Box::new(move || cancel.cancel()),
            on_kill: Box::new(move || handle.lock().unwrap().kill()),
            terminated: Some(terminated),
        };
        Arc::new(UdfServer::start(config, stdout, stdin, hooks))
    } else {
        return Err(EngineError::node(
            &io.node_id,
            "udf needs a worker command or socket path",
        ));
    };

    server.init(&spec.options).await?;
    if let Some(blob) = restore {
        server.restore(blob).await?;
    }
    let output = server.take_output().ok_or_else(|| {
        EngineError::node(&io.node_id, "udf worker output already claimed")
    })?;
    snapshots.register(&io.node_id, Arc::clone(&server) as Arc<dyn SnapshotProvider>);

    Ok(Box::new(udf::UdfNode { io, server, output }))
}

#[cfg(unix)]
async fn socket_server(
    path: &str,
    config: UdfConfig,
    io: &NodeIo,
) -> Result<Arc<UdfServer>, EngineError> {
    let (read, write) = strom_udf::worker::connect_socket(path).await?;
    let cancel = io.cancel.clone();
    let hooks = Hooks {
        on_abort: Box::new(move || cancel.cancel()),
        on_kill: Box::new(|| {}),
        terminated: None,
    };
    Ok(Arc::new(UdfServer::start(config, read, write, hooks)))
}

#[cfg(not(unix))]
async fn socket_server(
    path: &str,
    _config: UdfConfig,
    io: &NodeIo,
) -> Result<Arc<UdfServer>, EngineError> {
    Err(EngineError::node(
        &io.node_id,
        format!("socket workers are unix-only, cannot reach {path:?}"),
    ))
}
