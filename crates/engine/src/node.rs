//! Node runtime base: the pieces every node owns.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use strom_edge::{Edge, EdgeError, Receiver};

use strom_core::{Barrier, BatchPoint, BeginBatch, BufferedBatch, DeleteGroup, EndBatch, Point};

use crate::error::EngineError;
use crate::timer::Timer;

/// Everything a node needs from the task that owns it.
pub(crate) struct NodeIo {
    pub task_id: String,
    pub node_id: String,
    pub ins: Vec<Arc<dyn Edge>>,
    pub outs: Vec<Arc<dyn Edge>>,
    pub timer: Timer,
    pub cancel: CancellationToken,
}

impl NodeIo {
    /// The single input edge of a one-input node.
    pub fn single_in(&self) -> Result<Arc<dyn Edge>, EngineError> {
        match self.ins.as_slice() {
            [edge] => Ok(Arc::clone(edge)),
            [] => Err(EngineError::node(&self.node_id, "node has no input edge")),
            _ => Err(EngineError::node(
                &self.node_id,
                "node accepts exactly one input edge",
            )),
        }
    }
}

/// One stage of a pipeline: owns its run loop.
#[async_trait]
pub(crate) trait Node: Send {
    async fn run(self: Box<Self>) -> Result<(), EngineError>;
}

/// Receiver wrapper sampling the wall-clock time of every callback.
pub(crate) struct Timed<R> {
    pub recv: R,
    pub timer: Timer,
}

#[async_trait]
impl<R: Receiver> Receiver for Timed<R> {
    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.begin_batch(begin).await;
        self.timer.stop();
        res
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.batch_point(point).await;
        self.timer.stop();
        res
    }

    async fn end_batch(&mut self, end: EndBatch) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.end_batch(end).await;
        self.timer.stop();
        res
    }

    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.point(point).await;
        self.timer.stop();
        res
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.barrier(barrier).await;
        self.timer.stop();
        res
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.delete_group(delete).await;
        self.timer.stop();
        res
    }

    async fn buffered_batch(&mut self, batch: BufferedBatch) -> Result<(), EdgeError> {
        self.timer.start();
        let res = self.recv.buffered_batch(batch).await;
        self.timer.stop();
        res
    }

    async fn done(&mut self) {
        self.recv.done().await
    }
}

/// Collect one message onto every edge in `outs`; first failure wins.
pub(crate) async fn fan_out(
    outs: &[Arc<dyn Edge>],
    msg: strom_core::Message,
) -> Result<(), EdgeError> {
    let mut iter = outs.iter().peekable();
    while let Some(out) = iter.next() {
        if iter.peek().is_some() {
            out.collect(msg.clone()).await?;
        } else {
            return out.collect(msg).await;
        }
    }
    Ok(())
}
