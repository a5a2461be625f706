//! Evaluates trigger conditions and dispatches alert events.
//!
//! Records pass through unchanged; the node's side effect is the event
//! stream sent to the configured handlers. Per group, the last level is
//! remembered so state-change detection works across evaluations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{
    BufferedBatch, DeleteGroup, Fields, GroupId, GroupInfo, Message, Point, Predicate, Tags,
};
use strom_edge::{Consumer, EdgeError, ForwardReceiver, ForwardingReceiver};

use crate::alert::{dispatch, render_template, AlertData, AlertEvent, AlertHandler, AlertLevel};
use crate::error::EngineError;
use crate::node::{Node, NodeIo, Timed};

pub(crate) struct AlertNode {
    pub io: NodeIo,
    pub id_template: String,
    pub message_template: String,
    pub info: Option<Predicate>,
    pub warning: Option<Predicate>,
    pub critical: Option<Predicate>,
    pub state_changes_only: bool,
    pub handlers: Vec<Arc<dyn AlertHandler>>,
}

struct AlertRecv {
    task_id: String,
    node_id: String,
    id_template: String,
    message_template: String,
    info: Option<Predicate>,
    warning: Option<Predicate>,
    critical: Option<Predicate>,
    state_changes_only: bool,
    handlers: Vec<Arc<dyn AlertHandler>>,
    levels: HashMap<GroupId, AlertLevel>,
}

impl AlertRecv {
    fn level_of(&self, fields: &Fields, tags: &Tags) -> AlertLevel {
        let matches =
            |p: &Option<Predicate>| p.as_ref().is_some_and(|p| p.eval(fields, tags));
        if matches(&self.critical) {
            AlertLevel::Critical
        } else if matches(&self.warning) {
            AlertLevel::Warning
        } else if matches(&self.info) {
            AlertLevel::Info
        } else {
            AlertLevel::Ok
        }
    }

    async fn evaluate(
        &mut self,
        group: GroupInfo,
        time: DateTime<Utc>,
        level: AlertLevel,
        data: AlertData,
    ) {
        let prev = self
            .levels
            .insert(group.id.clone(), level)
            .unwrap_or(AlertLevel::Ok);
        let changed = level != prev;

        // Nothing to say while a group stays OK.
        if level == AlertLevel::Ok && !changed {
            return;
        }
        if self.state_changes_only && !changed {
            return;
        }

        let mut vars = HashMap::new();
        vars.insert("task", self.task_id.clone());
        vars.insert("node", self.node_id.clone());
        vars.insert("group", group.id.to_string());
        vars.insert("level", level.to_string());
        let id = render_template(&self.id_template, &vars);
        vars.insert("id", id.clone());
        let message = render_template(&self.message_template, &vars);

        let event = AlertEvent {
            id,
            message,
            task: self.task_id.clone(),
            node: self.node_id.clone(),
            group,
            time,
            level,
            prev_level: prev,
            data,
        };
        dispatch(&self.handlers, &event).await;
    }
}

#[async_trait]
impl ForwardReceiver for AlertRecv {
    async fn point(&mut self, point: Point) -> Result<Option<Message>, EdgeError> {
        let level = self.level_of(&point.fields, &point.tags);
        self.evaluate(
            point.group_info(),
            point.time,
            level,
            AlertData::Point(point.clone()),
        )
        .await;
        Ok(Some(Message::Point(point)))
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<Option<Message>, EdgeError> {
        self.levels.remove(&delete.group.id);
        Ok(Some(Message::DeleteGroup(delete)))
    }
}

/// Whole-batch alert evaluation: the batch's level is the highest level
/// of any point in it.
#[async_trait]
impl strom_edge::Receiver for BatchAlertRecv {
    async fn buffered_batch(&mut self, batch: BufferedBatch) -> Result<(), EdgeError> {
        let level = batch
            .points
            .iter()
            .map(|p| self.recv.level_of(&p.fields, &p.tags))
            .max()
            .unwrap_or(AlertLevel::Ok);
        self.recv
            .evaluate(
                batch.begin.group_info(),
                batch.begin.tmax,
                level,
                AlertData::Batch(batch.clone()),
            )
            .await;
        self.forward.buffered_batch(batch).await
    }

    async fn begin_batch(&mut self, begin: strom_core::BeginBatch) -> Result<(), EdgeError> {
        self.open = Some(BufferedBatch::new(begin, Vec::new()));
        Ok(())
    }

    async fn batch_point(&mut self, point: strom_core::BatchPoint) -> Result<(), EdgeError> {
        match self.open.as_mut() {
            Some(batch) => {
                batch.push(point);
                Ok(())
            }
            None => Err(EdgeError::unexpected(
                strom_core::MessageKind::BatchPoint,
                "batch point outside begin/end framing",
            )),
        }
    }

    async fn end_batch(&mut self, _end: strom_core::EndBatch) -> Result<(), EdgeError> {
        match self.open.take() {
            Some(batch) => self.buffered_batch(batch).await,
            None => Err(EdgeError::unexpected(
                strom_core::MessageKind::EndBatch,
                "end batch outside begin/end framing",
            )),
        }
    }

    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        if let Some(msg) = self.recv.point(point).await? {
            self.forward.forward_one(msg).await?;
        }
        Ok(())
    }

    async fn barrier(&mut self, barrier: strom_core::Barrier) -> Result<(), EdgeError> {
        self.forward
            .forward_one(Message::Barrier(barrier))
            .await
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        if let Some(msg) = self.recv.delete_group(delete).await? {
            self.forward.forward_one(msg).await?;
        }
        Ok(())
    }

    async fn done(&mut self) {}
}

struct BatchAlertRecv {
    recv: AlertRecv,
    forward: Outs,
    open: Option<BufferedBatch>,
}

/// Minimal fan-out helper owning the output edges.
struct Outs {
    outs: Vec<Arc<dyn strom_edge::Edge>>,
}

impl Outs {
    async fn forward_one(&self, msg: Message) -> Result<(), EdgeError> {
        crate::node::fan_out(&self.outs, msg).await
    }

    async fn buffered_batch(&self, batch: BufferedBatch) -> Result<(), EdgeError> {
        self.forward_one(Message::BufferedBatch(batch)).await
    }
}

#[async_trait]
impl Node for AlertNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = AlertRecv {
            task_id: self.io.task_id.clone(),
            node_id: self.io.node_id.clone(),
            id_template: self.id_template,
            message_template: self.message_template,
            info: self.info,
            warning: self.warning,
            critical: self.critical,
            state_changes_only: self.state_changes_only,
            handlers: self.handlers,
            levels: HashMap::new(),
        };
        match input.edge_type() {
            strom_core::EdgeType::Stream => {
                let recv = Timed {
                    recv: ForwardingReceiver::new(self.io.outs.clone(), recv),
                    timer: self.io.timer.clone(),
                };
                Consumer::new(input, recv).run().await?;
            }
            strom_core::EdgeType::Batch => {
                let recv = Timed {
                    recv: BatchAlertRecv {
                        recv,
                        forward: Outs {
                            outs: self.io.outs.clone(),
                        },
                        open: None,
                    },
                    timer: self.io.timer.clone(),
                };
                Consumer::new(input, recv).run().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use strom_core::{CmpOp, Dimensions, EdgeType, FieldValue};
    use strom_edge::{ChannelEdge, Edge};
    use tokio_util::sync::CancellationToken;

    struct Recording {
        events: Mutex<Vec<(AlertLevel, AlertLevel, String)>>,
    }

    #[async_trait]
    impl AlertHandler for Recording {
        async fn handle(&self, event: &AlertEvent) -> Result<(), EngineError> {
            self.events
                .lock()
                .unwrap()
                .push((event.level, event.prev_level, event.id.clone()));
            Ok(())
        }
        fn name(&self) -> &str {
            "recording"
        }
    }

    fn point(t_secs: i64, v: f64) -> Message {
        Message::Point(Point::new(
            "cpu",
            "",
            "",
            Utc.timestamp_opt(t_secs, 0).unwrap(),
            [("usage".to_string(), FieldValue::Float(v))].into(),
            Tags::new(),
            Dimensions::none(),
        ))
    }

    async fn run_alert(
        state_changes_only: bool,
        msgs: Vec<Message>,
    ) -> (Vec<(AlertLevel, AlertLevel, String)>, usize) {
        let input: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        let output: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        for m in msgs {
            input.collect(m).await.unwrap();
        }
        input.close().unwrap();

        let handler = Arc::new(Recording {
            events: Mutex::new(Vec::new()),
        });
        let node = Box::new(AlertNode {
            io: NodeIo {
                task_id: "cpu-task".into(),
                node_id: "crit".into(),
                ins: vec![Arc::clone(&input)],
                outs: vec![Arc::clone(&output)],
                timer: Default::default(),
                cancel: CancellationToken::new(),
            },
            id_template: "{task}:{group}".into(),
            message_template: "{id} is {level}".into(),
            info: None,
            warning: Some(Predicate::Field {
                field: "usage".into(),
                op: CmpOp::Gte,
                value: FieldValue::Float(80.0),
            }),
            critical: Some(Predicate::Field {
                field: "usage".into(),
                op: CmpOp::Gte,
                value: FieldValue::Float(95.0),
            }),
            state_changes_only,
            handlers: vec![handler.clone()],
        });
        node.run().await.unwrap();
        output.close().unwrap();

        let mut passed = 0;
        while output.emit().await.is_some() {
            passed += 1;
        }
        let events = handler.events.lock().unwrap().clone();
        (events, passed)
    }

    #[tokio::test]
    async fn fires_on_level_changes_and_passes_data_through() {
        let msgs = vec![
            point(0, 50.0),  // OK, no event
            point(1, 85.0),  // WARNING
            point(2, 86.0),  // still WARNING, suppressed
            point(3, 99.0),  // CRITICAL
            point(4, 10.0),  // back to OK
        ];
        let (events, passed) = run_alert(true, msgs).await;
        assert_eq!(passed, 5, "alert passes every record through");
        assert_eq!(
            events,
            vec![
                (AlertLevel::Warning, AlertLevel::Ok, "cpu-task:".to_string()),
                (AlertLevel::Critical, AlertLevel::Warning, "cpu-task:".to_string()),
                (AlertLevel::Ok, AlertLevel::Critical, "cpu-task:".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn without_state_changes_only_every_bad_eval_fires() {
        let msgs = vec![point(0, 85.0), point(1, 86.0), point(2, 50.0)];
        let (events, _) = run_alert(false, msgs).await;
        // Two warnings plus the recovery event.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, AlertLevel::Warning);
        assert_eq!(events[1].0, AlertLevel::Warning);
        assert_eq!(events[2].0, AlertLevel::Ok);
    }
}
