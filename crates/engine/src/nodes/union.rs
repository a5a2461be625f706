//! Merges any number of input edges, forwarding everything.

use std::sync::Arc;

use async_trait::async_trait;

use strom_core::{Barrier, BufferedBatch, DeleteGroup, Message, Point};
use strom_edge::{Edge, EdgeError, MultiConsumer, MultiReceiver};

use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo};
use crate::timer::Timer;

pub(crate) struct UnionNode {
    pub io: NodeIo,
}

struct UnionRecv {
    outs: Vec<Arc<dyn Edge>>,
    timer: Timer,
}

#[async_trait]
impl MultiReceiver for UnionRecv {
    async fn buffered_batch(
        &mut self,
        _src: usize,
        batch: BufferedBatch,
    ) -> Result<(), EdgeError> {
        self.timer.start();
        let res = fan_out(&self.outs, Message::BufferedBatch(batch)).await;
        self.timer.stop();
        res
    }

    async fn point(&mut self, _src: usize, point: Point) -> Result<(), EdgeError> {
        self.timer.start();
        let res = fan_out(&self.outs, Message::Point(point)).await;
        self.timer.stop();
        res
    }

    async fn barrier(&mut self, _src: usize, barrier: Barrier) -> Result<(), EdgeError> {
        fan_out(&self.outs, Message::Barrier(barrier)).await
    }

    async fn delete_group(&mut self, _src: usize, delete: DeleteGroup) -> Result<(), EdgeError> {
        fan_out(&self.outs, Message::DeleteGroup(delete)).await
    }

    async fn done(&mut self) {}
}

#[async_trait]
impl Node for UnionNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        if self.io.ins.is_empty() {
            return Err(EngineError::node(&self.io.node_id, "union has no inputs"));
        }
        let recv = UnionRecv {
            outs: self.io.outs.clone(),
            timer: self.io.timer.clone(),
        };
        MultiConsumer::new(self.io.ins.clone(), recv).run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strom_core::{Dimensions, EdgeType, FieldValue, Tags};
    use strom_edge::ChannelEdge;
    use tokio_util::sync::CancellationToken;

    fn point(v: i64) -> Message {
        Message::Point(Point::new(
            "m",
            "",
            "",
            Utc::now(),
            [("value".to_string(), FieldValue::Int(v))].into(),
            Tags::new(),
            Dimensions::none(),
        ))
    }

    #[tokio::test]
    async fn merges_all_inputs() {
        let in1: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 8));
        let in2: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 8));
        let output: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));

        in1.collect(point(1)).await.unwrap();
        in2.collect(point(2)).await.unwrap();
        in1.collect(point(3)).await.unwrap();
        in1.close().unwrap();
        in2.close().unwrap();

        let node = Box::new(UnionNode {
            io: NodeIo {
                task_id: "t".into(),
                node_id: "u".into(),
                ins: vec![in1, in2],
                outs: vec![Arc::clone(&output)],
                timer: Default::default(),
                cancel: CancellationToken::new(),
            },
        });
        node.run().await.unwrap();
        output.close().unwrap();

        let mut values = Vec::new();
        while let Some(Message::Point(p)) = output.emit().await {
            values.push(p.field("value").unwrap().as_int().unwrap());
        }
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
