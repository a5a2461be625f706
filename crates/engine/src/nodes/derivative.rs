//! Per-group rate of change of one field.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{DeleteGroup, FieldValue, GroupId, Message, Point};
use strom_edge::{Consumer, EdgeError, ForwardReceiver, ForwardingReceiver};

use crate::error::EngineError;
use crate::node::{Node, NodeIo, Timed};

pub(crate) struct DerivativeNode {
    pub io: NodeIo,
    pub field: String,
    pub unit: chrono::Duration,
    pub non_negative: bool,
    pub as_field: Option<String>,
}

struct DerivativeRecv {
    field: String,
    unit: chrono::Duration,
    non_negative: bool,
    as_field: String,
    previous: HashMap<GroupId, (DateTime<Utc>, f64)>,
}

#[async_trait]
impl ForwardReceiver for DerivativeRecv {
    async fn point(&mut self, mut point: Point) -> Result<Option<Message>, EdgeError> {
        let Some(value) = point.field(&self.field).and_then(FieldValue::as_float) else {
            // Non-numeric or missing field: nothing to differentiate.
            return Ok(None);
        };

        let group = point.group_id().clone();
        let prev = self.previous.insert(group, (point.time, value));
        let Some((t0, v0)) = prev else {
            // The first point of a group has no rate yet.
            return Ok(None);
        };

        let elapsed = point.time - t0;
        let Some(elapsed_ns) = elapsed.num_nanoseconds().filter(|ns| *ns > 0) else {
            return Ok(None);
        };
        let unit_ns = self.unit.num_nanoseconds().unwrap_or(1).max(1);
        let rate = (value - v0) / (elapsed_ns as f64 / unit_ns as f64);
        if self.non_negative && rate < 0.0 {
            return Ok(None);
        }

        point.set_field(self.as_field.clone(), FieldValue::Float(rate));
        Ok(Some(Message::Point(point)))
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<Option<Message>, EdgeError> {
        self.previous.remove(&delete.group.id);
        Ok(Some(Message::DeleteGroup(delete)))
    }
}

#[async_trait]
impl Node for DerivativeNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let as_field = self.as_field.unwrap_or_else(|| self.field.clone());
        let recv = Timed {
            recv: ForwardingReceiver::new(
                self.io.outs.clone(),
                DerivativeRecv {
                    field: self.field,
                    unit: self.unit,
                    non_negative: self.non_negative,
                    as_field,
                    previous: HashMap::new(),
                },
            ),
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}
