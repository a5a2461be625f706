//! Coalesces near-simultaneous points into one wide point.
//!
//! Per group, points whose timestamps fall within `tolerance` of the
//! first buffered point merge into a single point whose field names are
//! the configured dimension tag values joined with the original field
//! names.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{
    Barrier, BatchPoint, BeginBatch, DeleteGroup, EndBatch, Fields, GroupInfo, Message, Point,
};
use strom_edge::{Edge, EdgeError, GroupedConsumer, Receiver};

use crate::error::EngineError;
use crate::node::{fan_out, Node, NodeIo, Timed};

pub(crate) struct FlattenNode {
    pub io: NodeIo,
    pub tags: Vec<String>,
    pub tolerance: chrono::Duration,
    pub delimiter: String,
}

struct FlattenGroup {
    outs: Vec<Arc<dyn Edge>>,
    group: GroupInfo,
    tags: Vec<String>,
    tolerance: chrono::Duration,
    delimiter: String,
    name: String,
    buf: Vec<Point>,
    first_time: Option<DateTime<Utc>>,
}

impl FlattenGroup {
    async fn flush(&mut self) -> Result<(), EdgeError> {
        let Some(time) = self.first_time.take() else {
            return Ok(());
        };
        let buf = std::mem::take(&mut self.buf);

        let mut fields = Fields::new();
        for p in &buf {
            let prefix = self
                .tags
                .iter()
                .map(|t| p.tags.get(t).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>()
                .join(&self.delimiter);
            for (name, value) in p.fields.iter() {
                let flat = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}{}{name}", self.delimiter)
                };
                // The first point to claim a flattened name wins.
                fields.entry(flat).or_insert_with(|| value.clone());
            }
        }

        let point = Point::new(
            self.name.clone(),
            "",
            "",
            time,
            fields,
            (*self.group.tags).clone(),
            self.group.dimensions.clone(),
        );
        fan_out(&self.outs, Message::Point(point)).await
    }
}

#[async_trait]
impl Receiver for FlattenGroup {
    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        if let Some(first) = self.first_time {
            if point.time - first > self.tolerance {
                self.flush().await?;
            }
        }
        if self.first_time.is_none() {
            self.first_time = Some(point.time);
        }
        self.name = point.name.clone();
        self.buf.push(point);
        Ok(())
    }

    async fn barrier(&mut self, barrier: Barrier) -> Result<(), EdgeError> {
        if let Some(first) = self.first_time {
            if barrier.time - first > self.tolerance {
                self.flush().await?;
            }
        }
        fan_out(&self.outs, Message::Barrier(barrier)).await
    }

    async fn delete_group(&mut self, delete: DeleteGroup) -> Result<(), EdgeError> {
        self.flush().await?;
        fan_out(&self.outs, Message::DeleteGroup(delete)).await
    }

    async fn begin_batch(&mut self, _begin: BeginBatch) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::BeginBatch,
            "flatten consumes stream data",
        ))
    }

    async fn batch_point(&mut self, _point: BatchPoint) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::BatchPoint,
            "flatten consumes stream data",
        ))
    }

    async fn end_batch(&mut self, _end: EndBatch) -> Result<(), EdgeError> {
        Err(EdgeError::unexpected(
            strom_core::MessageKind::EndBatch,
            "flatten consumes stream data",
        ))
    }

    async fn done(&mut self) {
        if let Err(e) = self.flush().await {
            tracing::warn!(group = %self.group.id, error = %e, "flatten flush on close failed");
        }
    }
}

#[async_trait]
impl Node for FlattenNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let outs = self.io.outs.clone();
        let tags = self.tags.clone();
        let tolerance = self.tolerance;
        let delimiter = self.delimiter.clone();
        let timer = self.io.timer.clone();
        let factory = move |group: GroupInfo, _first: &Message| -> Box<dyn Receiver> {
            Box::new(Timed {
                recv: FlattenGroup {
                    outs: outs.clone(),
                    group,
                    tags: tags.clone(),
                    tolerance,
                    delimiter: delimiter.clone(),
                    name: String::new(),
                    buf: Vec::new(),
                    first_time: None,
                },
                timer: timer.clone(),
            })
        };
        GroupedConsumer::new(input, factory).run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strom_core::{Dimensions, EdgeType, FieldValue, Tags};
    use strom_edge::ChannelEdge;
    use tokio_util::sync::CancellationToken;

    fn point(t_ms: i64, host: &str, v: f64) -> Message {
        Message::Point(Point::new(
            "cpu",
            "",
            "",
            Utc.timestamp_millis_opt(t_ms).unwrap(),
            [("value".to_string(), FieldValue::Float(v))].into(),
            [("host".to_string(), host.to_string())].into(),
            Dimensions::none(),
        ))
    }

    #[tokio::test]
    async fn flattens_by_tag_value() {
        let input: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));
        let output: Arc<dyn Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 16));

        // Two points within tolerance, then one far later forcing a flush.
        input.collect(point(0, "a", 1.0)).await.unwrap();
        input.collect(point(1, "b", 2.0)).await.unwrap();
        input.collect(point(5000, "a", 9.0)).await.unwrap();
        input.close().unwrap();

        let node = Box::new(FlattenNode {
            io: NodeIo {
                task_id: "t".into(),
                node_id: "f".into(),
                ins: vec![Arc::clone(&input)],
                outs: vec![Arc::clone(&output)],
                timer: Default::default(),
                cancel: CancellationToken::new(),
            },
            tags: vec!["host".into()],
            tolerance: chrono::Duration::milliseconds(10),
            delimiter: ".".into(),
        });
        node.run().await.unwrap();
        output.close().unwrap();

        let mut flat = Vec::new();
        while let Some(Message::Point(p)) = output.emit().await {
            flat.push(p);
        }
        assert_eq!(flat.len(), 2, "one flush at tolerance, one at close");
        assert_eq!(flat[0].field("a.value").unwrap().as_float(), Some(1.0));
        assert_eq!(flat[0].field("b.value").unwrap().as_float(), Some(2.0));
        assert_eq!(flat[1].field("a.value").unwrap().as_float(), Some(9.0));
    }
}
