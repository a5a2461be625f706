//! Passes one record in N, or one per duration, per group.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{
    BatchPoint, BeginBatch, DeleteGroup, EndBatch, GroupId, Message, Point,
};
use strom_edge::{Consumer, EdgeError, ForwardReceiver, ForwardingReceiver};

use crate::error::EngineError;
use crate::node::{Node, NodeIo, Timed};

#[derive(Clone, Copy)]
pub(crate) enum SampleRate {
    EveryCount(u64),
    EveryDuration(chrono::Duration),
}

pub(crate) struct SampleNode {
    pub io: NodeIo,
    pub rate: SampleRate,
}

#[derive(Default)]
struct GroupState {
    seen: u64,
    last_passed: Option<DateTime<Utc>>,
}

struct SampleRecv {
    rate: SampleRate,
    groups: HashMap<GroupId, GroupState>,
    /// Whether the batch currently in framing passes the sample.
    batch_passing: bool,
}

impl SampleRecv {
    fn admit(&mut self, group: GroupId, time: DateTime<Utc>) -> bool {
        let state = self.groups.entry(group).or_default();
        match self.rate {
            SampleRate::EveryCount(n) => {
                let pass = state.seen % n.max(1) == 0;
                state.seen += 1;
                pass
            }
            SampleRate::EveryDuration(every) => match state.last_passed {
                Some(last) if time - last < every => false,
                _ => {
                    state.last_passed = Some(time);
                    true
                }
            },
        }
    }
}

#[async_trait]
impl ForwardReceiver for SampleRecv {
    async fn point(&mut self, point: Point) -> Result<Option<Message>, EdgeError> {
        if self.admit(point.group_id().clone(), point.time) {
            Ok(Some(Message::Point(point)))
        } else {
            Ok(None)
        }
    }

    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<Option<Message>, EdgeError> {
        self.batch_passing = self.admit(begin.group_id().clone(), begin.tmax);
        if self.batch_passing {
            Ok(Some(Message::BeginBatch(begin)))
        } else {
            Ok(None)
        }
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<Option<Message>, EdgeError> {
        if self.batch_passing {
            Ok(Some(Message::BatchPoint(point)))
        } else {
            Ok(None)
        }
    }

    async fn end_batch(&mut self, end: EndBatch) -> Result<Option<Message>, EdgeError> {
        if self.batch_passing {
            Ok(Some(Message::EndBatch(end)))
        } else {
            Ok(None)
        }
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<Option<Message>, EdgeError> {
        self.groups.remove(&delete.group.id);
        Ok(Some(Message::DeleteGroup(delete)))
    }
}

#[async_trait]
impl Node for SampleNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: ForwardingReceiver::new(
                self.io.outs.clone(),
                SampleRecv {
                    rate: self.rate,
                    groups: HashMap::new(),
                    batch_passing: false,
                },
            ),
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use strom_core::{Dimensions, EdgeType, FieldValue, Tags};
    use strom_edge::{ChannelEdge, Edge};
    use tokio_util::sync::CancellationToken;

    fn point(t_secs: i64, v: i64) -> Message {
        Message::Point(Point::new(
            "m",
            "",
            "",
            Utc.timestamp_opt(t_secs, 0).unwrap(),
            [("value".to_string(), FieldValue::Int(v))].into(),
            Tags::new(),
            Dimensions::none(),
        ))
    }

    async fn run_sample(rate: SampleRate, msgs: Vec<Message>) -> Vec<i64> {
        let input: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        let output: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        for m in msgs {
            input.collect(m).await.unwrap();
        }
        input.close().unwrap();

        let node = Box::new(SampleNode {
            io: NodeIo {
                task_id: "t".into(),
                node_id: "s".into(),
                ins: vec![Arc::clone(&input)],
                outs: vec![Arc::clone(&output)],
                timer: Default::default(),
                cancel: CancellationToken::new(),
            },
            rate,
        });
        node.run().await.unwrap();
        output.close().unwrap();

        let mut values = Vec::new();
        while let Some(Message::Point(p)) = output.emit().await {
            values.push(p.field("value").unwrap().as_int().unwrap());
        }
        values
    }

    #[tokio::test]
    async fn every_third_point_passes() {
        let msgs = (0..7).map(|i| point(i, i)).collect();
        let values = run_sample(SampleRate::EveryCount(3), msgs).await;
        assert_eq!(values, vec![0, 3, 6]);
    }

    #[tokio::test]
    async fn one_point_per_duration_passes() {
        let msgs = vec![point(0, 0), point(1, 1), point(10, 2), point(11, 3)];
        let values =
            run_sample(SampleRate::EveryDuration(chrono::Duration::seconds(5)), msgs).await;
        assert_eq!(values, vec![0, 2]);
    }
}
