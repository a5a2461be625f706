//! The where node: drop records failing a predicate.

use async_trait::async_trait;

use strom_core::{BatchPoint, Message, Point, Predicate};
use strom_edge::{Consumer, EdgeError, ForwardReceiver, ForwardingReceiver};

use crate::error::EngineError;
use crate::node::{Node, NodeIo, Timed};

pub(crate) struct WhereNode {
    pub io: NodeIo,
    pub predicate: Predicate,
}

struct WhereRecv {
    predicate: Predicate,
}

#[async_trait]
impl ForwardReceiver for WhereRecv {
    async fn point(&mut self, point: Point) -> Result<Option<Message>, EdgeError> {
        if self.predicate.eval(&point.fields, &point.tags) {
            Ok(Some(Message::Point(point)))
        } else {
            Ok(None)
        }
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<Option<Message>, EdgeError> {
        if self.predicate.eval(&point.fields, &point.tags) {
            Ok(Some(Message::BatchPoint(point)))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl Node for WhereNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: ForwardingReceiver::new(
                self.io.outs.clone(),
                WhereRecv {
                    predicate: self.predicate,
                },
            ),
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}
