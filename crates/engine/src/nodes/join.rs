//! Aligns points from N inputs on time and merges their fields.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use strom_core::{
    Barrier, BufferedBatch, DeleteGroup, Fields, GroupId, Message, MessageKind, Point,
};
use strom_edge::{Edge, EdgeError, MultiConsumer, MultiReceiver};

use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo};
use crate::timer::Timer;

pub(crate) struct JoinNode {
    pub io: NodeIo,
    pub names: Vec<String>,
    pub tolerance: chrono::Duration,
    pub delimiter: String,
}

struct JoinRecv {
    outs: Vec<Arc<dyn Edge>>,
    names: Vec<String>,
    tolerance: chrono::Duration,
    delimiter: String,
    sources: usize,
    /// Per group, one pending-point queue per source.
    groups: HashMap<GroupId, Vec<VecDeque<Point>>>,
    timer: Timer,
}

impl JoinRecv {
    /// Emit merged points while every source has a head and the heads
    /// align within tolerance. A head too old to ever align is dropped.
    async fn try_join(&mut self, group: GroupId) -> Result<(), EdgeError> {
        loop {
            let Some(queues) = self.groups.get_mut(&group) else {
                return Ok(());
            };
            if queues.iter().any(|q| q.is_empty()) {
                return Ok(());
            }
            let times: Vec<_> = queues
                .iter()
                .map(|q| q.front().map(|p| p.time).unwrap_or_default())
                .collect();
            let min = times.iter().min().copied().unwrap_or_default();
            let max = times.iter().max().copied().unwrap_or_default();

            if max - min > self.tolerance {
                // The oldest head can never be matched: discard it.
                if let Some(pos) = times.iter().position(|t| *t == min) {
                    queues[pos].pop_front();
                }
                continue;
            }

            let mut fields = Fields::new();
            let mut merged: Option<Point> = None;
            for (src, q) in queues.iter_mut().enumerate() {
                let p = q.pop_front().ok_or_else(|| {
                    EdgeError::unexpected(MessageKind::Point, "join queue drained concurrently")
                })?;
                for (name, value) in p.fields.iter() {
                    fields.insert(
                        format!("{}{}{name}", self.names[src], self.delimiter),
                        value.clone(),
                    );
                }
                if merged.is_none() {
                    merged = Some(p);
                }
            }
            let Some(first) = merged else {
                return Ok(());
            };
            let point = Point::new(
                first.name.clone(),
                first.database.clone(),
                first.retention_policy.clone(),
                min,
                fields,
                (*first.tags).clone(),
                first.dimensions().clone(),
            );
            self.timer.start();
            fan_out(&self.outs, Message::Point(point)).await?;
            self.timer.stop();
        }
    }
}

#[async_trait]
impl MultiReceiver for JoinRecv {
    async fn point(&mut self, src: usize, point: Point) -> Result<(), EdgeError> {
        let group = point.group_id().clone();
        let sources = self.sources;
        self.groups
            .entry(group.clone())
            .or_insert_with(|| vec![VecDeque::new(); sources])[src]
            .push_back(point);
        self.try_join(group).await
    }

    async fn buffered_batch(
        &mut self,
        _src: usize,
        _batch: BufferedBatch,
    ) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            MessageKind::BufferedBatch,
            "join consumes stream data",
        ))
    }

    async fn barrier(&mut self, _src: usize, _barrier: Barrier) -> Result<(), EdgeError> {
        // Barriers from a single source promise nothing about the join
        // output; they are consumed here.
        Ok(())
    }

    async fn delete_group(&mut self, _src: usize, delete: DeleteGroup) -> Result<(), EdgeError> {
        // Forward the first delete for a group, swallow the rest.
        if self.groups.remove(&delete.group.id).is_some() {
            fan_out(&self.outs, Message::DeleteGroup(delete)).await?;
        }
        Ok(())
    }

    async fn done(&mut self) {}
}

#[async_trait]
impl Node for JoinNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        if self.names.len() != self.io.ins.len() {
            return Err(EngineError::node(
                &self.io.node_id,
                format!(
                    "join needs one name per input: {} names for {} inputs",
                    self.names.len(),
                    self.io.ins.len()
                ),
            ));
        }
        let sources = self.io.ins.len();
        let recv = JoinRecv {
            outs: self.io.outs.clone(),
            names: self.names.clone(),
            tolerance: self.tolerance,
            delimiter: self.delimiter.clone(),
            sources,
            groups: HashMap::new(),
            timer: self.io.timer.clone(),
        };
        MultiConsumer::new(self.io.ins.clone(), recv).run().await?;
        Ok(())
    }
}
