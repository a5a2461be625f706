//! Bounded asynchronous edges between pipeline nodes.
//!
//! An edge is a unidirectional queue with a fixed capacity. Collecting
//! blocks while the edge is full, providing backpressure; emitting blocks
//! while it is empty. Closing lets buffered messages drain to emitters;
//! aborting drops them and fails every pending and future operation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use strom_core::{EdgeType, Message};

use crate::error::EdgeError;

/// The message queue between two nodes.
///
/// Implementations are cheap to share (`Arc`) and safe to drive from any
/// number of collecting and emitting tasks; FIFO order holds per edge.
#[async_trait]
pub trait Edge: Send + Sync {
    /// Push a message, waiting for capacity. Fails once the edge is
    /// closed or aborted.
    async fn collect(&self, msg: Message) -> Result<(), EdgeError>;

    /// Pop the next message, waiting for one to arrive. Returns `None`
    /// once the edge is closed and drained, or aborted.
    async fn emit(&self) -> Option<Message>;

    /// Close the edge: no further collects, buffered messages drain.
    /// Fails if the edge is already closed or aborted.
    fn close(&self) -> Result<(), EdgeError>;

    /// Abort the edge: drop buffered messages and wake every waiter.
    /// Idempotent.
    fn abort(&self);

    /// Whether this edge carries stream points or batches.
    fn edge_type(&self) -> EdgeType;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closed,
    Aborted,
}

struct Queue {
    buf: VecDeque<Message>,
    status: Status,
}

struct Inner {
    queue: Mutex<Queue>,
    not_empty: Notify,
    not_full: Notify,
    edge_type: EdgeType,
    capacity: usize,
}

/// In-memory edge implementation.
pub struct ChannelEdge {
    inner: Arc<Inner>,
}

impl ChannelEdge {
    pub fn new(edge_type: EdgeType, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue {
                    buf: VecDeque::with_capacity(capacity.min(1024)),
                    status: Status::Open,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                edge_type,
                capacity: capacity.max(1),
            }),
        }
    }

    /// Attempt a push without waiting. Returns the message back when the
    /// edge is full.
    fn try_collect(&self, msg: Message) -> Result<Option<Message>, EdgeError> {
        let mut q = self.inner.queue.lock().unwrap();
        match q.status {
            Status::Aborted => Err(EdgeError::Aborted),
            Status::Closed => Err(EdgeError::Closed),
            Status::Open => {
                if q.buf.len() < self.inner.capacity {
                    q.buf.push_back(msg);
                    drop(q);
                    self.inner.not_empty.notify_one();
                    Ok(None)
                } else {
                    Ok(Some(msg))
                }
            }
        }
    }
}

impl Clone for ChannelEdge {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Edge for ChannelEdge {
    async fn collect(&self, msg: Message) -> Result<(), EdgeError> {
        let mut msg = msg;
        loop {
            // Register for the wakeup before checking state, so a
            // notify between the check and the await is not lost.
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_collect(msg)? {
                None => return Ok(()),
                Some(back) => msg = back,
            }
            notified.await;
        }
    }

    async fn emit(&self) -> Option<Message> {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut q = self.inner.queue.lock().unwrap();
                if let Some(m) = q.buf.pop_front() {
                    drop(q);
                    self.inner.not_full.notify_one();
                    return Some(m);
                }
                match q.status {
                    Status::Open => {}
                    Status::Closed | Status::Aborted => return None,
                }
            }
            notified.await;
        }
    }

    fn close(&self) -> Result<(), EdgeError> {
        let mut q = self.inner.queue.lock().unwrap();
        match q.status {
            Status::Open => {
                q.status = Status::Closed;
                drop(q);
                self.inner.not_empty.notify_waiters();
                self.inner.not_full.notify_waiters();
                Ok(())
            }
            Status::Closed => Err(EdgeError::Closed),
            Status::Aborted => Err(EdgeError::Aborted),
        }
    }

    fn abort(&self) {
        let mut q = self.inner.queue.lock().unwrap();
        if q.status != Status::Aborted {
            q.status = Status::Aborted;
            q.buf.clear();
            drop(q);
            self.inner.not_empty.notify_waiters();
            self.inner.not_full.notify_waiters();
        }
    }

    fn edge_type(&self) -> EdgeType {
        self.inner.edge_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strom_core::{Dimensions, Point, Tags};

    fn point(v: i64) -> Message {
        Message::Point(Point::new(
            "cpu",
            "db",
            "rp",
            chrono::Utc::now(),
            [("value".to_string(), strom_core::FieldValue::Int(v))].into(),
            Tags::new(),
            Dimensions::none(),
        ))
    }

    #[tokio::test]
    async fn fifo_order() {
        let e = ChannelEdge::new(EdgeType::Stream, 10);
        for i in 0..5 {
            e.collect(point(i)).await.unwrap();
        }
        for i in 0..5 {
            match e.emit().await.unwrap() {
                Message::Point(p) => {
                    assert_eq!(p.field("value").unwrap().as_int(), Some(i))
                }
                other => panic!("unexpected {:?}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn full_edge_applies_backpressure() {
        let e = ChannelEdge::new(EdgeType::Stream, 1);
        e.collect(point(1)).await.unwrap();

        let e2 = e.clone();
        let pending = tokio::spawn(async move { e2.collect(point(2)).await });

        // The second collect cannot finish until something is emitted.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert!(e.emit().await.is_some());
        pending.await.unwrap().unwrap();
        assert!(e.emit().await.is_some());
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let e = ChannelEdge::new(EdgeType::Stream, 10);
        e.collect(point(1)).await.unwrap();
        e.close().unwrap();

        assert!(matches!(
            e.collect(point(2)).await,
            Err(EdgeError::Closed)
        ));
        assert!(e.emit().await.is_some(), "buffered message drains");
        assert!(e.emit().await.is_none(), "then the edge ends");
        assert!(matches!(e.close(), Err(EdgeError::Closed)));
    }

    #[tokio::test]
    async fn abort_drops_buffer_and_wakes_waiters() {
        let e = ChannelEdge::new(EdgeType::Stream, 1);
        e.collect(point(1)).await.unwrap();

        let blocked_collect = {
            let e = e.clone();
            tokio::spawn(async move { e.collect(point(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        e.abort();
        e.abort(); // idempotent

        assert!(matches!(
            blocked_collect.await.unwrap(),
            Err(EdgeError::Aborted)
        ));
        assert!(e.emit().await.is_none(), "buffered messages are dropped");
        assert!(matches!(e.collect(point(3)).await, Err(EdgeError::Aborted)));
        assert!(matches!(e.close(), Err(EdgeError::Aborted)));
    }

    #[tokio::test]
    async fn pending_emit_ends_on_close() {
        let e = ChannelEdge::new(EdgeType::Stream, 1);
        let waiting = {
            let e = e.clone();
            tokio::spawn(async move { e.emit().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        e.close().unwrap();
        assert!(waiting.await.unwrap().is_none());
    }
}
