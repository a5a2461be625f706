//! Consumers drive an edge and dispatch each message to a receiver.
//!
//! [`Receiver`] is the full capability set over message kinds. Receivers
//! that buffer batches natively override `buffered_batch`; the default
//! implementation unfolds a buffered batch into its framing sequence, so
//! plain receivers never see the buffered form.
//!
//! [`ForwardReceiver`] is the one-in/one-out variant most transform
//! nodes implement: each callback returns the message to pass on (or
//! nothing, to swallow it), and [`ForwardingReceiver`] adapts it onto a
//! set of output edges.

use std::sync::Arc;

use async_trait::async_trait;

use strom_core::{
    Barrier, BatchPoint, BeginBatch, BufferedBatch, DeleteGroup, EndBatch, Message, Point,
};

use crate::edge::Edge;
use crate::error::EdgeError;

/// Handles every message kind an edge can deliver.
#[async_trait]
pub trait Receiver: Send {
    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<(), EdgeError>;
    async fn batch_point(&mut self, point: BatchPoint) -> Result<(), EdgeError>;
    async fn end_batch(&mut self, end: EndBatch) -> Result<(), EdgeError>;
    async fn point(&mut self, point: Point) -> Result<(), EdgeError>;
    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError>;
    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError>;

    /// Receive a whole batch at once. Receivers that keep batches
    /// buffered override this; the default unfolds into framing calls.
    async fn buffered_batch(&mut self, batch: BufferedBatch) -> Result<(), EdgeError> {
        let BufferedBatch { begin, points } = batch;
        self.begin_batch(begin).await?;
        for p in points {
            self.batch_point(p).await?;
        }
        self.end_batch(EndBatch).await
    }

    /// Called exactly once after the edge closes cleanly.
    async fn done(&mut self);
}

/// Dispatch one message to a receiver by kind.
pub async fn dispatch<R: Receiver + ?Sized>(
    recv: &mut R,
    msg: Message,
) -> Result<(), EdgeError> {
    match msg {
        Message::Point(p) => recv.point(p).await,
        Message::BeginBatch(b) => recv.begin_batch(b).await,
        Message::BatchPoint(p) => recv.batch_point(p).await,
        Message::EndBatch(e) => recv.end_batch(e).await,
        Message::BufferedBatch(b) => recv.buffered_batch(b).await,
        Message::Barrier(b) => recv.barrier(b).await,
        Message::DeleteGroup(d) => recv.delete_group(d).await,
    }
}

/// Drives one edge to completion, dispatching into a receiver.
pub struct Consumer<R> {
    edge: Arc<dyn Edge>,
    recv: R,
}

impl<R: Receiver> Consumer<R> {
    pub fn new(edge: Arc<dyn Edge>, recv: R) -> Self {
        Self { edge, recv }
    }

    /// Emit until the edge ends. A receiver error stops consumption and
    /// propagates; on clean close `done()` is called exactly once.
    pub async fn run(mut self) -> Result<(), EdgeError> {
        while let Some(msg) = self.edge.emit().await {
            dispatch(&mut self.recv, msg).await?;
        }
        self.recv.done().await;
        Ok(())
    }
}

/// The one-in/one-out receiver most transform nodes implement.
///
/// Every callback returns the message to forward downstream, or `None`
/// to swallow the input. Defaults pass messages through unchanged, so a
/// node only overrides the kinds it transforms.
#[async_trait]
pub trait ForwardReceiver: Send {
    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<Option<Message>, EdgeError> {
        Ok(Some(Message::BeginBatch(begin)))
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<Option<Message>, EdgeError> {
        Ok(Some(Message::BatchPoint(point)))
    }

    async fn end_batch(&mut self, end: EndBatch) -> Result<Option<Message>, EdgeError> {
        Ok(Some(Message::EndBatch(end)))
    }

    async fn point(&mut self, point: Point) -> Result<Option<Message>, EdgeError> {
        Ok(Some(Message::Point(point)))
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<Option<Message>, EdgeError> {
        Ok(Some(Message::Barrier(barrier)))
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<Option<Message>, EdgeError> {
        Ok(Some(Message::DeleteGroup(delete)))
    }

    async fn done(&mut self) {}
}

/// Adapts a [`ForwardReceiver`] into a [`Receiver`] that collects each
/// returned message onto every output edge.
pub struct ForwardingReceiver<R> {
    outs: Vec<Arc<dyn Edge>>,
    recv: R,
}

impl<R: ForwardReceiver> ForwardingReceiver<R> {
    pub fn new(outs: Vec<Arc<dyn Edge>>, recv: R) -> Self {
        Self { outs, recv }
    }

    /// Collect onto every output edge; the first failure wins.
    async fn forward(&mut self, msg: Option<Message>) -> Result<(), EdgeError> {
        let Some(msg) = msg else { return Ok(()) };
        let mut outs = self.outs.iter().peekable();
        while let Some(out) = outs.next() {
            if outs.peek().is_some() {
                out.collect(msg.clone()).await?;
            } else {
                return out.collect(msg).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<R: ForwardReceiver> Receiver for ForwardingReceiver<R> {
    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<(), EdgeError> {
        let out = self.recv.begin_batch(begin).await?;
        self.forward(out).await
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<(), EdgeError> {
        let out = self.recv.batch_point(point).await?;
        self.forward(out).await
    }

    async fn end_batch(&mut self, end: EndBatch) -> Result<(), EdgeError> {
        let out = self.recv.end_batch(end).await?;
        self.forward(out).await
    }

    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        let out = self.recv.point(point).await?;
        self.forward(out).await
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError> {
        let out = self.recv.barrier(barrier).await?;
        self.forward(out).await
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        let out = self.recv.delete_group(delete).await?;
        self.forward(out).await
    }

    async fn done(&mut self) {
        self.recv.done().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::ChannelEdge;
    use chrono::Utc;
    use strom_core::{Dimensions, EdgeType, FieldValue, Fields, Tags};

    struct Recorder {
        kinds: Vec<&'static str>,
    }

    #[async_trait]
    impl Receiver for Recorder {
        async fn begin_batch(&mut self, _b: BeginBatch) -> Result<(), EdgeError> {
            self.kinds.push("begin");
            Ok(())
        }
        async fn batch_point(&mut self, _p: BatchPoint) -> Result<(), EdgeError> {
            self.kinds.push("point");
            Ok(())
        }
        async fn end_batch(&mut self, _e: EndBatch) -> Result<(), EdgeError> {
            self.kinds.push("end");
            Ok(())
        }
        async fn point(&mut self, _p: Point) -> Result<(), EdgeError> {
            self.kinds.push("stream-point");
            Ok(())
        }
        async fn barrier(&mut self, _b: Barrier) -> Result<(), EdgeError> {
            Ok(())
        }
        async fn delete_group(&mut self, _d: DeleteGroup) -> Result<(), EdgeError> {
            Ok(())
        }
        async fn done(&mut self) {
            self.kinds.push("done");
        }
    }

    #[tokio::test]
    async fn buffered_batch_unfolds_for_plain_receivers() {
        let t = Utc::now();
        let batch = BufferedBatch::new(
            BeginBatch::new("m", Tags::new(), false, t, 0),
            vec![
                BatchPoint::new(t, Fields::new(), Tags::new()),
                BatchPoint::new(t, Fields::new(), Tags::new()),
            ],
        );
        let mut rec = Recorder { kinds: vec![] };
        rec.buffered_batch(batch).await.unwrap();
        assert_eq!(rec.kinds, vec!["begin", "point", "point", "end"]);
    }

    #[tokio::test]
    async fn consumer_calls_done_on_close() {
        let edge: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 4));
        edge.collect(Message::Point(Point::new(
            "m",
            "",
            "",
            Utc::now(),
            Fields::new(),
            Tags::new(),
            Dimensions::none(),
        )))
        .await
        .unwrap();
        edge.close().unwrap();

        let consumer = Consumer::new(Arc::clone(&edge), Recorder { kinds: vec![] });
        // run consumes the receiver, so check through a channel instead.
        let kinds = tokio::spawn(async move {
            let mut c = consumer;
            while let Some(m) = c.edge.emit().await {
                dispatch(&mut c.recv, m).await.unwrap();
            }
            c.recv.done().await;
            c.recv.kinds
        })
        .await
        .unwrap();
        assert_eq!(kinds, vec!["stream-point", "done"]);
    }

    /// Doubles the value field of every point, drops points without one.
    struct Doubler;

    #[async_trait]
    impl ForwardReceiver for Doubler {
        async fn point(&mut self, mut p: Point) -> Result<Option<Message>, EdgeError> {
            match p.field("value").and_then(FieldValue::as_int) {
                Some(v) => {
                    p.set_field("value", FieldValue::Int(v * 2));
                    Ok(Some(Message::Point(p)))
                }
                None => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn forwarding_receiver_fans_out() {
        let input: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 4));
        let out1: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 4));
        let out2: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 4));

        let p = Point::new(
            "m",
            "",
            "",
            Utc::now(),
            [("value".to_string(), FieldValue::Int(21))].into(),
            Tags::new(),
            Dimensions::none(),
        );
        input.collect(Message::Point(p)).await.unwrap();
        input.close().unwrap();

        let consumer = Consumer::new(
            Arc::clone(&input),
            ForwardingReceiver::new(vec![Arc::clone(&out1), Arc::clone(&out2)], Doubler),
        );
        consumer.run().await.unwrap();

        for out in [out1, out2] {
            match out.emit().await.unwrap() {
                Message::Point(p) => {
                    assert_eq!(p.field("value").unwrap().as_int(), Some(42))
                }
                other => panic!("unexpected {:?}", other.kind()),
            }
        }
    }
}
