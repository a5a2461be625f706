//! Emits one point per k-subset of near-simultaneous points.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{
    Barrier, BatchPoint, BeginBatch, DeleteGroup, EndBatch, Fields, GroupInfo, Message, Point,
};
use strom_edge::{Edge, EdgeError, GroupedConsumer, Receiver};

use crate::combin::Combinator;
use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo, Timed};

pub(crate) struct CombineNode {
    pub io: NodeIo,
    pub k: usize,
    pub names: Vec<String>,
    pub tolerance: chrono::Duration,
    pub max: u64,
    pub delimiter: String,
}

struct CombineGroup {
    outs: Vec<Arc<dyn Edge>>,
    group: GroupInfo,
    k: usize,
    names: Vec<String>,
    tolerance: chrono::Duration,
    combin: Combinator,
    delimiter: String,
    buf: Vec<Point>,
    first_time: Option<DateTime<Utc>>,
}

impl CombineGroup {
    /// Enumerate k-subsets of the buffer and emit one synthesized point
    /// per combination. Exceeding the configured maximum fails the task.
    async fn combine(&mut self) -> Result<(), EdgeError> {
        let buf = std::mem::take(&mut self.buf);
        self.first_time = None;
        let n = buf.len();
        if n < self.k {
            return Ok(());
        }
        if self.combin.count(n as u64, self.k as u64).is_none() {
            return Err(EngineError::TooManyCombinations {
                max: self.combin.max(),
            }
            .into());
        }

        let mut combined: Vec<Point> = Vec::new();
        self.combin.each::<EdgeError>(n, self.k, |subset| {
            let mut fields = Fields::new();
            for (pos, &i) in subset.iter().enumerate() {
                for (name, value) in buf[i].fields.iter() {
                    fields.insert(
                        format!("{}{}{name}", self.names[pos], self.delimiter),
                        value.clone(),
                    );
                }
            }
            combined.push(Point::new(
                buf[0].name.clone(),
                buf[0].database.clone(),
                buf[0].retention_policy.clone(),
                buf[0].time,
                fields,
                (*self.group.tags).clone(),
                self.group.dimensions.clone(),
            ));
            Ok(())
        })?;

        for p in combined {
            fan_out(&self.outs, Message::Point(p)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Receiver for CombineGroup {
    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        if let Some(first) = self.first_time {
            if point.time - first > self.tolerance {
                self.combine().await?;
            }
        }
        if self.first_time.is_none() {
            self.first_time = Some(point.time);
        }
        self.buf.push(point);
        Ok(())
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError> {
        if let Some(first) = self.first_time {
            if barrier.time - first > self.tolerance {
                self.combine().await?;
            }
        }
        fan_out(&self.outs, Message::Barrier(barrier)).await
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        self.combine().await?;
        fan_out(&self.outs, Message::DeleteGroup(delete)).await
    }

    async fn begin_batch(&mut self, _begin: BeginBatch) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::BeginBatch,
            "combine consumes stream data",
        ))
    }

    async fn batch_point(&mut self, _point: BatchPoint) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::BatchPoint,
            "combine consumes stream data",
        ))
    }

    async fn end_batch(&mut self, _end: EndBatch) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::EndBatch,
            "combine consumes stream data",
        ))
    }

    async fn done(&mut self) {
        if let Err(e) = self.combine().await {
            tracing::warn!(group = %self.group.id, error = %e, "combine flush on close failed");
        }
    }
}

#[async_trait]
impl Node for CombineNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        if self.names.len() != self.k {
            return Err(EngineError::node(
                &self.io.node_id,
                format!(
                    "combine needs exactly k={} names, got {}",
                    self.k,
                    self.names.len()
                ),
            ));
        }
        let input = self.io.single_in()?;
        let outs = self.io.outs.clone();
        let (k, names, tolerance, max, delimiter) = (
            self.k,
            self.names.clone(),
            self.tolerance,
            self.max,
            self.delimiter.clone(),
        );
        let timer = self.io.timer.clone();
        let factory = move |group: GroupInfo, _first: &Message| -> Box<dyn Receiver> {
            Box::new(Timed {
                recv: CombineGroup {
                    outs: outs.clone(),
                    group,
                    k,
                    names: names.clone(),
                    tolerance,
                    combin: Combinator::new(max),
                    delimiter: delimiter.clone(),
                    buf: Vec::new(),
                    first_time: None,
                },
                timer: timer.clone(),
            })
        };
        GroupedConsumer::new(input, factory).run().await?;
        Ok(())
    }
}
