//! Rewrites the grouping dimensions of the stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use strom_core::{
    Barrier, BatchPoint, BeginBatch, BufferedBatch, DeleteGroup, Dimensions, EndBatch, Message,
    Point, Tags,
};
use strom_edge::{Consumer, Edge, EdgeError, Receiver};

use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo, Timed};

pub(crate) struct GroupByNode {
    pub io: NodeIo,
    pub tags: Vec<String>,
    pub by_name: bool,
}

struct GroupByRecv {
    outs: Vec<Arc<dyn Edge>>,
    tags: Vec<String>,
    by_name: bool,
    /// Batch being reassembled from framing, regrouped on end.
    open: Option<BufferedBatch>,
}

impl GroupByRecv {
    /// Split one batch into one batch per new group.
    async fn regroup_batch(&mut self, batch: BufferedBatch) -> Result<(), EdgeError> {
        let mut groups: BTreeMap<String, (Tags, Vec<BatchPoint>)> = BTreeMap::new();
        for p in batch.points {
            let subset: Tags = self
                .tags
                .iter()
                .filter_map(|t| p.tags.get(t).map(|v| (t.clone(), v.clone())))
                .collect();
            let key = subset
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            groups.entry(key).or_insert_with(|| (subset, Vec::new())).1.push(p);
        }
        for (_, (tags, points)) in groups {
            let begin = BeginBatch::new(
                batch.begin.name.clone(),
                tags,
                self.by_name,
                batch.begin.tmax,
                points.len(),
            );
            fan_out(
                &self.outs,
                Message::BufferedBatch(BufferedBatch::new(begin, points)),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Receiver for GroupByRecv {
    async fn point(&mut self, mut point: Point) -> Result<(), EdgeError> {
        point.set_dimensions(Dimensions::new(self.by_name, self.tags.clone()));
        fan_out(&self.outs, Message::Point(point)).await
    }

    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<(), EdgeError> {
        self.open = Some(BufferedBatch::new(begin, Vec::new()));
        Ok(())
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<(), EdgeError> {
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

    async fn end_batch(&mut self, _end: EndBatch) -> Result<(), EdgeError> {
        match self.open.take() {
            Some(batch) => self.regroup_batch(batch).await,
            None => Err(EdgeError::unexpected(
                strom_core::MessageKind::EndBatch,
                "end batch outside begin/end framing",
            )),
        }
    }

    async fn buffered_batch(&mut self, batch: BufferedBatch) -> Result<(), EdgeError> {
        self.regroup_batch(batch).await
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError> {
        fan_out(&self.outs, Message::Barrier(barrier)).await
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        fan_out(&self.outs, Message::DeleteGroup(delete)).await
    }

    async fn done(&mut self) {}
}

#[async_trait]
impl Node for GroupByNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: GroupByRecv {
                outs: self.io.outs.clone(),
                tags: self.tags,
                by_name: self.by_name,
                open: None,
            },
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}
