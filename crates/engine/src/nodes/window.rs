//! Collects per-group points into batches by time span or count.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{
    Barrier, BatchPoint, BeginBatch, BufferedBatch, DeleteGroup, EndBatch, GroupInfo, Message,
    Point,
};
use strom_edge::{Edge, EdgeError, GroupedConsumer, Receiver};

use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo, Timed};

#[derive(Clone)]
pub(crate) enum WindowMode {
    /// Emit every `every`, covering the trailing `period`.
    Time {
        period: chrono::Duration,
        every: chrono::Duration,
    },
    /// Emit every `every` points, covering the trailing `period` points.
    Count { period: usize, every: usize },
}

pub(crate) struct WindowNode {
    pub io: NodeIo,
    pub mode: WindowMode,
}

struct WindowGroup {
    outs: Vec<Arc<dyn Edge>>,
    group: GroupInfo,
    mode: WindowMode,
    name: String,
    buf: VecDeque<BatchPoint>,
    next_emit: Option<DateTime<Utc>>,
    count: usize,
}

impl WindowGroup {
    fn new(outs: Vec<Arc<dyn Edge>>, group: GroupInfo, mode: WindowMode) -> Self {
        Self {
            outs,
            group,
            mode,
            name: String::new(),
            buf: VecDeque::new(),
            next_emit: None,
            count: 0,
        }
    }

    fn make_batch(&self, points: Vec<BatchPoint>, tmax: DateTime<Utc>) -> Message {
        let begin = BeginBatch::new(
            self.name.clone(),
            (*self.group.tags).clone(),
            self.group.dimensions.by_name,
            tmax,
            points.len(),
        );
        Message::BufferedBatch(BufferedBatch::new(begin, points))
    }

    /// Emit the time window ending at `upto` and drop points that have
    /// fallen out of every future window.
    async fn emit_time(
        &mut self,
        upto: DateTime<Utc>,
        period: chrono::Duration,
    ) -> Result<(), EdgeError> {
        let start = upto - period;
        while let Some(front) = self.buf.front() {
            if front.time < start {
                self.buf.pop_front();
            } else {
                break;
            }
        }
        let points: Vec<BatchPoint> = self
            .buf
            .iter()
            .filter(|p| p.time < upto)
            .cloned()
            .collect();
        let batch = self.make_batch(points, upto);
        fan_out(&self.outs, batch).await
    }

    async fn emit_count(&mut self) -> Result<(), EdgeError> {
        let points: Vec<BatchPoint> = self.buf.iter().cloned().collect();
        let tmax = points.last().map(|p| p.time).unwrap_or_default();
        let batch = self.make_batch(points, tmax);
        fan_out(&self.outs, batch).await
    }
}

#[async_trait]
impl Receiver for WindowGroup {
    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        self.name = point.name.clone();
        match self.mode.clone() {
            WindowMode::Time { period, every } => {
                let t = point.time;
                if self.next_emit.is_none() {
                    self.next_emit = Some(t + every);
                }
                while let Some(next) = self.next_emit {
                    if t < next {
                        break;
                    }
                    self.emit_time(next, period).await?;
                    self.next_emit = Some(next + every);
                }
                self.buf.push_back(BatchPoint::from_point(&point));
            }
            WindowMode::Count { period, every } => {
                self.buf.push_back(BatchPoint::from_point(&point));
                if self.buf.len() > period {
                    self.buf.pop_front();
                }
                self.count += 1;
                if self.count % every == 0 {
                    self.emit_count().await?;
                }
            }
        }
        Ok(())
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError> {
        if let WindowMode::Time { period, every } = self.mode.clone() {
            while let Some(next) = self.next_emit {
                if barrier.time < next {
                    break;
                }
                self.emit_time(next, period).await?;
                self.next_emit = Some(next + every);
            }
        }
        fan_out(&self.outs, Message::Barrier(barrier)).await
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        fan_out(&self.outs, Message::DeleteGroup(delete)).await
    }

    async fn begin_batch(&mut self, _begin: BeginBatch) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::BeginBatch,
            "window consumes stream data",
        ))
    }

    async fn batch_point(&mut self, _point: BatchPoint) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::BatchPoint,
            "window consumes stream data",
        ))
    }

    async fn end_batch(&mut self, _end: EndBatch) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::EndBatch,
            "window consumes stream data",
        ))
    }

    async fn done(&mut self) {}
}

#[async_trait]
impl Node for WindowNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let outs = self.io.outs.clone();
        let mode = self.mode.clone();
        let timer = self.io.timer.clone();
        let factory = move |group: GroupInfo, _first: &Message| -> Box<dyn Receiver> {
            Box::new(Timed {
                recv: WindowGroup::new(outs.clone(), group, mode.clone()),
                timer: timer.clone(),
            })
        };
        GroupedConsumer::new(input, factory).run().await?;
        Ok(())
    }
}
