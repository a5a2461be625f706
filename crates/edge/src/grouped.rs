//! Demultiplexes one edge into per-group receivers.
//!
//! Each group gets its own receiver, created lazily on the group's first
//! message and torn down on delete-group. Batch framing is tracked with
//! a current-group state machine: a begin sets the current group, its
//! points and end must follow before any other begin, so batches from
//! different groups never interleave on a single input.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use strom_core::{GroupId, GroupInfo, Message};

use crate::consumer::Receiver;
use crate::edge::Edge;
use crate::error::EdgeError;

/// Factory for per-group receivers.
pub trait GroupedReceiver: Send {
    /// Create the receiver for a group, given the message that created it.
    fn new_group(&mut self, group: GroupInfo, first: &Message) -> Box<dyn Receiver>;
}

impl<F> GroupedReceiver for F
where
    F: FnMut(GroupInfo, &Message) -> Box<dyn Receiver> + Send,
{
    fn new_group(&mut self, group: GroupInfo, first: &Message) -> Box<dyn Receiver> {
        self(group, first)
    }
}

/// Drives one edge, routing messages to per-group receivers.
pub struct GroupedConsumer<F> {
    edge: Arc<dyn Edge>,
    factory: F,
    groups: HashMap<GroupId, Box<dyn Receiver>>,
    current: Option<GroupId>,
    cardinality: Arc<AtomicI64>,
}

impl<F: GroupedReceiver> GroupedConsumer<F> {
    pub fn new(edge: Arc<dyn Edge>, factory: F) -> Self {
        Self {
            edge,
            factory,
            groups: HashMap::new(),
            current: None,
            cardinality: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Live-group gauge; shared so node stats can report it.
    pub fn cardinality(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.cardinality)
    }

    fn group_for(&mut self, info: GroupInfo, first: &Message) -> &mut Box<dyn Receiver> {
        let id = info.id.clone();
        if !self.groups.contains_key(&id) {
            let recv = self.factory.new_group(info, first);
            self.groups.insert(id.clone(), recv);
            self.cardinality.fetch_add(1, Ordering::Relaxed);
        }
        self.groups.get_mut(&id).expect("group just inserted")
    }

    pub async fn run(mut self) -> Result<(), EdgeError> {
        while let Some(msg) = self.edge.emit().await {
            match msg {
                Message::BeginBatch(begin) => {
                    let info = begin.group_info();
                    self.current = Some(info.id.clone());
                    let msg = Message::BeginBatch(begin.clone());
                    let recv = self.group_for(info, &msg);
                    recv.begin_batch(begin).await?;
                }
                Message::BatchPoint(point) => {
                    let current = self.current.as_ref().ok_or_else(|| {
                        EdgeError::unexpected(
                            strom_core::MessageKind::BatchPoint,
                            "batch point outside begin/end framing",
                        )
                    })?;
                    let recv = self.groups.get_mut(current).ok_or_else(|| {
                        EdgeError::unexpected(
                            strom_core::MessageKind::BatchPoint,
                            "batch framing continued after its group was deleted",
                        )
                    })?;
                    recv.batch_point(point).await?;
                }
                Message::EndBatch(end) => {
                    let current = self.current.take().ok_or_else(|| {
                        EdgeError::unexpected(
                            strom_core::MessageKind::EndBatch,
                            "end batch outside begin/end framing",
                        )
                    })?;
                    let recv = self.groups.get_mut(&current).ok_or_else(|| {
                        EdgeError::unexpected(
                            strom_core::MessageKind::EndBatch,
                            "batch framing continued after its group was deleted",
                        )
                    })?;
                    recv.end_batch(end).await?;
                }
                Message::Point(point) => {
                    let info = point.group_info();
                    let msg = Message::Point(point.clone());
                    let recv = self.group_for(info, &msg);
                    recv.point(point).await?;
                }
                Message::BufferedBatch(batch) => {
                    let info = batch.begin.group_info();
                    let msg = Message::BufferedBatch(batch.clone());
                    let recv = self.group_for(info, &msg);
                    recv.buffered_batch(batch).await?;
                }
                Message::Barrier(barrier) => {
                    let info = barrier.group.clone();
                    let msg = Message::Barrier(barrier.clone());
                    let recv = self.group_for(info, &msg);
                    recv.barrier(barrier).await?;
                }
                Message::DeleteGroup(delete) => {
                    if let Some(mut recv) = self.groups.remove(&delete.group.id) {
                        self.cardinality.fetch_sub(1, Ordering::Relaxed);
                        recv.delete_group(delete).await?;
                    }
                }
            }
        }
        for (_, mut recv) in self.groups.drain() {
            recv.done().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::ChannelEdge;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use strom_core::{
        Barrier, BatchPoint, BeginBatch, DeleteGroup, Dimensions, EdgeType, EndBatch, Fields,
        Point, Tags,
    };

    #[derive(Default)]
    struct Log {
        events: Arc<Mutex<Vec<String>>>,
    }

    struct GroupRecv {
        id: String,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl GroupRecv {
        fn log(&self, what: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.id, what));
        }
    }

    #[async_trait]
    impl Receiver for GroupRecv {
        async fn begin_batch(&mut self, _b: BeginBatch) -> Result<(), EdgeError> {
            self.log("begin");
            Ok(())
        }
        async fn batch_point(&mut self, _p: BatchPoint) -> Result<(), EdgeError> {
            self.log("bp");
            Ok(())
        }
        async fn end_batch(&mut self, _e: EndBatch) -> Result<(), EdgeError> {
            self.log("end");
            Ok(())
        }
        async fn point(&mut self, _p: Point) -> Result<(), EdgeError> {
            self.log("point");
            Ok(())
        }
        async fn barrier(&mut self, _b: Barrier) -> Result<(), EdgeError> {
            self.log("barrier");
            Ok(())
        }
        async fn delete_group(&mut self, _d: DeleteGroup) -> Result<(), EdgeError> {
            self.log("delete");
            Ok(())
        }
        async fn done(&mut self) {
            self.log("done");
        }
    }

    fn grouped_point(host: &str) -> Point {
        Point::new(
            "cpu",
            "",
            "",
            Utc::now(),
            Fields::new(),
            [("host".to_string(), host.to_string())].into(),
            Dimensions::new(false, vec!["host".into()]),
        )
    }

    #[tokio::test]
    async fn routes_points_by_group_and_calls_done_once_each() {
        let edge: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        let log = Log::default();
        let events = Arc::clone(&log.events);

        for host in ["a", "b", "a"] {
            edge.collect(Message::Point(grouped_point(host)))
                .await
                .unwrap();
        }
        edge.close().unwrap();

        let consumer = GroupedConsumer::new(Arc::clone(&edge), move |g: GroupInfo, _: &Message| {
            Box::new(GroupRecv {
                id: g.id.as_str().to_string(),
                events: Arc::clone(&events),
            }) as Box<dyn Receiver>
        });
        let cardinality = consumer.cardinality();
        consumer.run().await.unwrap();

        let events = log.events.lock().unwrap().clone();
        assert_eq!(
            events.iter().filter(|e| *e == "host=a:point").count(),
            2
        );
        assert_eq!(events.iter().filter(|e| *e == "host=b:point").count(), 1);
        assert_eq!(events.iter().filter(|e| e.ends_with(":done")).count(), 2);
        assert_eq!(cardinality.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn delete_group_tears_down_and_recreates() {
        let edge: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        let log = Log::default();
        let events = Arc::clone(&log.events);

        let p = grouped_point("a");
        let group = p.group_info();
        edge.collect(Message::Point(p.clone())).await.unwrap();
        edge.collect(Message::DeleteGroup(DeleteGroup { group }))
            .await
            .unwrap();
        edge.collect(Message::Point(p)).await.unwrap();
        edge.close().unwrap();

        let consumer = GroupedConsumer::new(Arc::clone(&edge), move |g: GroupInfo, _: &Message| {
            Box::new(GroupRecv {
                id: g.id.as_str().to_string(),
                events: Arc::clone(&events),
            }) as Box<dyn Receiver>
        });
        let cardinality = consumer.cardinality();
        consumer.run().await.unwrap();

        let events = log.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "host=a:point",
                "host=a:delete",
                "host=a:point",
                "host=a:done"
            ]
        );
        // Created twice, deleted once: one live group at the end.
        assert_eq!(cardinality.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn batch_point_outside_framing_is_an_error() {
        let edge: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Batch, 16));
        edge.collect(Message::BatchPoint(BatchPoint::new(
            Utc::now(),
            Fields::new(),
            Tags::new(),
        )))
        .await
        .unwrap();
        edge.close().unwrap();

        let consumer = GroupedConsumer::new(Arc::clone(&edge), |_: GroupInfo, _: &Message| {
            unreachable!("no group should be created")
        });
        let err = consumer.run().await.unwrap_err();
        assert!(matches!(err, EdgeError::UnexpectedMessage { .. }));
    }
}
