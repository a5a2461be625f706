//! Consumes several edges in parallel into one receiver.
//!
//! Each input edge is drained by its own task into a shared channel, so
//! a slow source never starves the others. Batch framing is buffered per
//! source before it is surfaced, so the receiver always sees whole
//! batches tagged with the index of the edge they arrived on.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use strom_core::{Barrier, BufferedBatch, DeleteGroup, Message, MessageKind, Point};

use crate::edge::Edge;
use crate::error::EdgeError;

/// Receives messages from N sources, tagged with their source index.
#[async_trait]
pub trait MultiReceiver: Send {
    async fn buffered_batch(&mut self, src: usize, batch: BufferedBatch)
        -> Result<(), EdgeError>;
    async fn point(&mut self, src: usize, point: Point) -> Result<(), EdgeError>;
    async fn barrier(&mut self, src: usize, barrier: Barrier) -> Result<(), EdgeError>;
    async fn delete_group(&mut self, src: usize, delete: DeleteGroup) -> Result<(), EdgeError>;

    /// Called exactly once after every source has finished.
    async fn done(&mut self);
}

/// Drains N input edges into one [`MultiReceiver`].
pub struct MultiConsumer<R> {
    edges: Vec<Arc<dyn Edge>>,
    recv: R,
    channel_capacity: usize,
}

impl<R: MultiReceiver> MultiConsumer<R> {
    pub fn new(edges: Vec<Arc<dyn Edge>>, recv: R) -> Self {
        Self {
            edges,
            recv,
            channel_capacity: 64,
        }
    }

    pub async fn run(mut self) -> Result<(), EdgeError> {
        let (tx, mut rx) = mpsc::channel::<Result<(usize, Message), EdgeError>>(
            self.channel_capacity.max(self.edges.len()),
        );

        let mut drains = Vec::with_capacity(self.edges.len());
        for (src, edge) in self.edges.iter().enumerate() {
            let tx = tx.clone();
            let edge = Arc::clone(edge);
            drains.push(tokio::spawn(async move {
                let mut open: Option<BufferedBatch> = None;
                while let Some(msg) = edge.emit().await {
                    let surfaced = match msg {
                        Message::BeginBatch(begin) => {
                            open = Some(BufferedBatch::new(begin, Vec::new()));
                            None
                        }
                        Message::BatchPoint(point) => match open.as_mut() {
                            Some(batch) => {
                                batch.push(point);
                                None
                            }
                            None => Some(Err(EdgeError::unexpected(
                                MessageKind::BatchPoint,
                                "batch point outside begin/end framing",
                            ))),
                        },
                        Message::EndBatch(_) => match open.take() {
                            Some(batch) => Some(Ok(Message::BufferedBatch(batch))),
                            None => Some(Err(EdgeError::unexpected(
                                MessageKind::EndBatch,
                                "end batch outside begin/end framing",
                            ))),
                        },
                        other => Some(Ok(other)),
                    };
                    if let Some(item) = surfaced {
                        let failed = item.is_err();
                        if tx.send(item.map(|m| (src, m))).await.is_err() || failed {
                            return;
                        }
                    }
                }
            }));
        }
        drop(tx);

        let mut first_err = None;
        while let Some(item) = rx.recv().await {
            let (src, msg) = match item {
                Ok(pair) => pair,
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            };
            let res = match msg {
                Message::BufferedBatch(b) => self.recv.buffered_batch(src, b).await,
                Message::Point(p) => self.recv.point(src, p).await,
                Message::Barrier(b) => self.recv.barrier(src, b).await,
                Message::DeleteGroup(d) => self.recv.delete_group(src, d).await,
                // Framing was folded into BufferedBatch by the drain task.
                other => Err(EdgeError::unexpected(
                    other.kind(),
                    "framing should have been buffered per source",
                )),
            };
            if let Err(e) = res {
                first_err = Some(e);
                break;
            }
        }

        // Dropping the receiver stops the drain tasks at their next send.
        drop(rx);
        for d in drains {
            let _ = d.await;
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                self.recv.done().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::ChannelEdge;
    use chrono::Utc;
    use std::sync::Mutex;
    use strom_core::{
        BatchPoint, BeginBatch, Dimensions, EdgeType, EndBatch, Fields, Tags,
    };

    #[derive(Default)]
    struct Collector {
        items: Arc<Mutex<Vec<(usize, &'static str, usize)>>>,
        done: bool,
    }

    #[async_trait]
    impl MultiReceiver for Collector {
        async fn buffered_batch(
            &mut self,
            src: usize,
            batch: BufferedBatch,
        ) -> Result<(), EdgeError> {
            self.items.lock().unwrap().push((src, "batch", batch.len()));
            Ok(())
        }
        async fn point(&mut self, src: usize, _point: Point) -> Result<(), EdgeError> {
            self.items.lock().unwrap().push((src, "point", 1));
            Ok(())
        }
        async fn barrier(&mut self, src: usize, _barrier: Barrier) -> Result<(), EdgeError> {
            self.items.lock().unwrap().push((src, "barrier", 0));
            Ok(())
        }
        async fn delete_group(
            &mut self,
            src: usize,
            _delete: DeleteGroup,
        ) -> Result<(), EdgeError> {
            self.items.lock().unwrap().push((src, "delete", 0));
            Ok(())
        }
        async fn done(&mut self) {
            self.done = true;
        }
    }

    #[tokio::test]
    async fn merges_sources_and_buffers_framing() {
        let stream: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 8));
        let batch: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Batch, 8));

        stream
            .collect(Message::Point(Point::new(
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
        stream.close().unwrap();

        let t = Utc::now();
        batch
            .collect(Message::BeginBatch(BeginBatch::new(
                "m",
                Tags::new(),
                false,
                t,
                2,
            )))
            .await
            .unwrap();
        for _ in 0..2 {
            batch
                .collect(Message::BatchPoint(BatchPoint::new(
                    t,
                    Fields::new(),
                    Tags::new(),
                )))
                .await
                .unwrap();
        }
        batch.collect(Message::EndBatch(EndBatch)).await.unwrap();
        batch.close().unwrap();

        let items = Arc::new(Mutex::new(Vec::new()));
        let consumer = MultiConsumer::new(
            vec![stream, batch],
            Collector {
                items: Arc::clone(&items),
                done: false,
            },
        );
        consumer.run().await.unwrap();

        let mut got = items.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![(0, "point", 1), (1, "batch", 2)]);
    }
}
