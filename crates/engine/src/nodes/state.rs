//! Consecutive-state tracking: count and duration.
//!
//! Per group, a predicate is evaluated against every point. While it
//! holds, the running count (or elapsed duration in configured units)
//! is written to a field; the first point after it stops matching
//! carries -1 and resets the run.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{DeleteGroup, FieldValue, GroupId, Message, Point, Predicate};
use strom_edge::{Consumer, EdgeError, ForwardReceiver, ForwardingReceiver};

use crate::error::EngineError;
use crate::node::{Node, NodeIo, Timed};

#[derive(Clone, Copy)]
pub(crate) enum TrackMode {
    Count,
    Duration,
}

pub(crate) struct StateTrackNode {
    pub io: NodeIo,
    pub predicate: Predicate,
    pub as_field: String,
    pub mode: TrackMode,
    pub unit: chrono::Duration,
}

struct Run {
    count: i64,
    since: DateTime<Utc>,
}

struct StateRecv {
    predicate: Predicate,
    as_field: String,
    mode: TrackMode,
    unit: chrono::Duration,
    runs: HashMap<GroupId, Run>,
}

#[async_trait]
impl ForwardReceiver for StateRecv {
    async fn point(&mut self, mut point: Point) -> Result<Option<Message>, EdgeError> {
        let group = point.group_id().clone();
        let value = if self.predicate.eval(&point.fields, &point.tags) {
            let run = self.runs.entry(group).or_insert(Run {
                count: 0,
                since: point.time,
            });
            run.count += 1;
            match self.mode {
                TrackMode::Count => FieldValue::Int(run.count),
                TrackMode::Duration => {
                    let elapsed = (point.time - run.since).num_nanoseconds().unwrap_or(0);
                    let unit = self.unit.num_nanoseconds().unwrap_or(1).max(1);
                    FieldValue::Float(elapsed as f64 / unit as f64)
                }
            }
        } else {
            self.runs.remove(&group);
            match self.mode {
                TrackMode::Count => FieldValue::Int(-1),
                TrackMode::Duration => FieldValue::Float(-1.0),
            }
        };
        point.set_field(self.as_field.clone(), value);
        Ok(Some(Message::Point(point)))
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<Option<Message>, EdgeError> {
        self.runs.remove(&delete.group.id);
        Ok(Some(Message::DeleteGroup(delete)))
    }
}

#[async_trait]
impl Node for StateTrackNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: ForwardingReceiver::new(
                self.io.outs.clone(),
                StateRecv {
                    predicate: self.predicate,
                    as_field: self.as_field,
                    mode: self.mode,
                    unit: self.unit,
                    runs: HashMap::new(),
                },
            ),
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}
