//! Pipeline node backed by an out-of-process UDF worker.
//!
//! Incoming messages are forwarded to the worker over the framed
//! protocol; whatever the worker sends back flows to the output edges.
//! Init (and restore, when the task was restored from a snapshot) has
//! already happened at build time, so data may flow as soon as the node
//! runs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use strom_core::{
    Barrier, BatchPoint, BeginBatch, BufferedBatch, DeleteGroup, EndBatch, Message, Point,
};
use strom_edge::{Consumer, Edge, EdgeError, Receiver};
use strom_udf::{UdfError, UdfServer};

use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo, Timed};

pub(crate) struct UdfNode {
    pub io: NodeIo,
    pub server: Arc<UdfServer>,
    pub output: mpsc::Receiver<Message>,
}

struct UdfSend {
    server: Arc<UdfServer>,
    outs: Vec<Arc<dyn Edge>>,
    open: Option<BufferedBatch>,
}

impl UdfSend {
    fn wire_err(&self, e: UdfError) -> EdgeError {
        EdgeError::from(EngineError::from(e))
    }
}

#[async_trait]
impl Receiver for UdfSend {
    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        self.server
            .send_point(&point)
            .await
            .map_err(|e| self.wire_err(e))
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
            Some(batch) => self
                .server
                .send_batch(&batch)
                .await
                .map_err(|e| self.wire_err(e)),
            None => Err(EdgeError::unexpected(
                strom_core::MessageKind::EndBatch,
                "end batch outside begin/end framing",
            )),
        }
    }

    async fn buffered_batch(&mut self, batch: BufferedBatch) -> Result<(), EdgeError> {
        self.server
            .send_batch(&batch)
            .await
            .map_err(|e| self.wire_err(e))
    }

    async fn barrier(&mut self, _barrier: Barrier) -> Result<(), EdgeError> {
        // The worker protocol has no barrier message; a barrier cannot
        // overtake in-flight worker data, so it stops here.
        Ok(())
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        fan_out(&self.outs, Message::DeleteGroup(delete)).await
    }

    async fn done(&mut self) {
        self.server.close_input().await;
    }
}

#[async_trait]
impl Node for UdfNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let Self { io, server, output } = *self;
        let input = io.single_in()?;
        let outs = io.outs.clone();
        let mut output = output;
        let forwarder: tokio::task::JoinHandle<Result<(), EdgeError>> =
            tokio::spawn(async move {
                while let Some(msg) = output.recv().await {
                    fan_out(&outs, msg).await?;
                }
                Ok(())
            });

        let recv = Timed {
            recv: UdfSend {
                server: Arc::clone(&server),
                outs: io.outs.clone(),
                open: None,
            },
            timer: io.timer.clone(),
        };
        let consumed = Consumer::new(input, recv).run().await;

        // Let the worker flush; the forwarder ends when its stream does.
        let forwarded = forwarder
            .await
            .map_err(|e| EngineError::node(&io.node_id, format!("forwarder panicked: {e}")))?;

        consumed?;
        forwarded?;
        if let Some(err) = server.first_error() {
            return Err(EngineError::node(&io.node_id, err));
        }
        Ok(())
    }
}
