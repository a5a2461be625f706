//! Edge wrapper that counts traffic per edge and per group.
//!
//! Stream edges count one per point; batch edges count one per batch and
//! accumulate the batch's size into the group's point counter. Barriers
//! and delete-group markers are not counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use strom_core::{EdgeType, GroupId, GroupInfo, Message};

use crate::edge::Edge;
use crate::error::EdgeError;

/// Per-group traffic counters.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub info: GroupInfo,
    /// Points collected for this group (batch sizes accumulate here).
    pub collected: i64,
    /// Points emitted for this group.
    pub emitted: i64,
}

/// Framing tracker for one side of the edge: which batch is open and how
/// many points it has carried so far.
#[derive(Default)]
struct FrameState {
    group: Option<GroupInfo>,
    points: i64,
}

/// An [`Edge`] that maintains collected/emitted counters.
pub struct StatsEdge {
    inner: Arc<dyn Edge>,
    collected: AtomicI64,
    emitted: AtomicI64,
    groups: RwLock<HashMap<GroupId, GroupStats>>,
    collect_frame: Mutex<FrameState>,
    emit_frame: Mutex<FrameState>,
}

impl StatsEdge {
    pub fn new(inner: Arc<dyn Edge>) -> Self {
        Self {
            inner,
            collected: AtomicI64::new(0),
            emitted: AtomicI64::new(0),
            groups: RwLock::new(HashMap::new()),
            collect_frame: Mutex::new(FrameState::default()),
            emit_frame: Mutex::new(FrameState::default()),
        }
    }

    /// Total messages collected: points for stream edges, batches for
    /// batch edges.
    pub fn collected(&self) -> i64 {
        self.collected.load(Ordering::Relaxed)
    }

    /// Total messages emitted, in the same units as [`collected`].
    ///
    /// [`collected`]: StatsEdge::collected
    pub fn emitted(&self) -> i64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Visit every group's counters under the read lock.
    pub fn read_group_stats(&self, mut visit: impl FnMut(&GroupStats)) {
        let groups = self.groups.read().unwrap();
        for stats in groups.values() {
            visit(stats);
        }
    }

    fn add_group(&self, info: GroupInfo, collected: i64, emitted: i64) {
        let mut groups = self.groups.write().unwrap();
        let entry = groups.entry(info.id.clone()).or_insert_with(|| GroupStats {
            info,
            collected: 0,
            emitted: 0,
        });
        entry.collected += collected;
        entry.emitted += emitted;
    }

    /// Track framing and decide what this message adds to the counters
    /// once it is actually in the edge: `(group, points)` — one unit on
    /// the total, `points` on the group.
    fn prepare_collect(&self, msg: &Message) -> Option<(GroupInfo, i64)> {
        match self.inner.edge_type() {
            EdgeType::Stream => match msg {
                Message::Point(p) => Some((p.group_info(), 1)),
                _ => None,
            },
            EdgeType::Batch => match msg {
                Message::BeginBatch(b) => {
                    let mut frame = self.collect_frame.lock().unwrap();
                    frame.group = Some(b.group_info());
                    frame.points = 0;
                    None
                }
                Message::BatchPoint(_) => {
                    self.collect_frame.lock().unwrap().points += 1;
                    None
                }
                Message::EndBatch(_) => {
                    let mut frame = self.collect_frame.lock().unwrap();
                    let points = std::mem::take(&mut frame.points);
                    frame.group.take().map(|info| (info, points))
                }
                Message::BufferedBatch(b) => Some((b.begin.group_info(), b.len() as i64)),
                _ => None,
            },
        }
    }

    fn count_emit(&self, msg: &Message) {
        match self.inner.edge_type() {
            EdgeType::Stream => {
                if let Message::Point(p) = msg {
                    self.emitted.fetch_add(1, Ordering::Relaxed);
                    self.add_group(p.group_info(), 0, 1);
                }
            }
            EdgeType::Batch => match msg {
                Message::BeginBatch(b) => {
                    let mut frame = self.emit_frame.lock().unwrap();
                    frame.group = Some(b.group_info());
                    frame.points = 0;
                }
                Message::BatchPoint(_) => {
                    self.emit_frame.lock().unwrap().points += 1;
                }
                Message::EndBatch(_) => {
                    let (group, points) = {
                        let mut frame = self.emit_frame.lock().unwrap();
                        (frame.group.take(), std::mem::take(&mut frame.points))
                    };
                    if let Some(info) = group {
                        self.emitted.fetch_add(1, Ordering::Relaxed);
                        self.add_group(info, 0, points);
                    }
                }
                Message::BufferedBatch(b) => {
                    self.emitted.fetch_add(1, Ordering::Relaxed);
                    self.add_group(b.begin.group_info(), 0, b.len() as i64);
                }
                _ => {}
            },
        }
        // A group leaving the edge for good releases its counters.
        if let Message::DeleteGroup(d) = msg {
            self.groups.write().unwrap().remove(&d.group.id);
        }
    }
}

#[async_trait]
impl Edge for StatsEdge {
    async fn collect(&self, msg: Message) -> Result<(), EdgeError> {
        let pending = self.prepare_collect(&msg);
        self.inner.collect(msg).await?;
        if let Some((info, points)) = pending {
            self.collected.fetch_add(1, Ordering::Relaxed);
            self.add_group(info, points, 0);
        }
        Ok(())
    }

    async fn emit(&self) -> Option<Message> {
        let msg = self.inner.emit().await?;
        self.count_emit(&msg);
        Some(msg)
    }

    fn close(&self) -> Result<(), EdgeError> {
        self.inner.close()
    }

    fn abort(&self) {
        self.inner.abort()
    }

    fn edge_type(&self) -> EdgeType {
        self.inner.edge_type()
    }
}
