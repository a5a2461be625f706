//! Re-injects records into the ingest path under a new DBRP.
//!
//! The definition validator has already rejected targets among the
//! task's own DBRPs, so a running loopback cannot feed itself.

use std::sync::Arc;

use async_trait::async_trait;

use strom_core::{
    Barrier, BatchPoint, BeginBatch, DeleteGroup, Dimensions, EndBatch, Message, Point, Tags,
};
use strom_edge::{Consumer, EdgeError, Receiver};

use crate::error::EngineError;
use crate::ingest::Ingest;
use crate::node::{Node, NodeIo, Timed};

pub(crate) struct LoopbackNode {
    pub io: NodeIo,
    pub database: String,
    pub retention_policy: String,
    pub measurement: Option<String>,
    pub tags: Tags,
    pub ingest: Arc<dyn Ingest>,
}

struct LoopbackRecv {
    database: String,
    retention_policy: String,
    measurement: Option<String>,
    tags: Tags,
    ingest: Arc<dyn Ingest>,
    /// Begin marker of the batch currently in framing.
    open: Option<BeginBatch>,
}

impl LoopbackRecv {
    async fn write(&self, mut point: Point) -> Result<(), EdgeError> {
        point.database = self.database.clone();
        point.retention_policy = self.retention_policy.clone();
        if let Some(name) = &self.measurement {
            point.set_name(name.clone());
        }
        for (k, v) in &self.tags {
            point.set_tag(k.clone(), v.clone());
        }
        self.ingest
            .write_point(point)
            .await
            .map_err(EdgeError::from)
    }
}

#[async_trait]
impl Receiver for LoopbackRecv {
    async fn point(&mut self, point: Point) -> Result<(), EdgeError> {
        self.write(point).await
    }

    async fn begin_batch(&mut self, begin: BeginBatch) -> Result<(), EdgeError> {
        self.open = Some(begin);
        Ok(())
    }

    async fn batch_point(&mut self, point: BatchPoint) -> Result<(), EdgeError> {
        let begin = self.open.as_ref().ok_or_else(|| {
            EdgeError::unexpected(
                strom_core::MessageKind::BatchPoint,
                "batch point outside begin/end framing",
            )
        })?;
        let p = Point::new(
            begin.name.clone(),
            "",
            "",
            point.time,
            (*point.fields).clone(),
            (*point.tags).clone(),
            Dimensions::none(),
        );
        self.write(p).await
    }

    async fn end_batch(&mut self, _end: EndBatch) -> Result<(), EdgeError> {
        self.open = None;
        Ok(())
    }

    async fn barrier(&mut self, _barrier: Barrier) -> Result<(), EdgeError> {
        Ok(())
    }

    async fn delete_group(&mut self, _delete: DeleteGroup) -> Result<(), EdgeError> {
        Ok(())
    }

    async fn done(&mut self) {}
}

#[async_trait]
impl Node for LoopbackNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: LoopbackRecv {
                database: self.database,
                retention_policy: self.retention_policy,
                measurement: self.measurement,
                tags: self.tags,
                ingest: self.ingest,
                open: None,
            },
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use strom_core::{EdgeType, FieldValue};
    use strom_edge::ChannelEdge;
    use tokio_util::sync::CancellationToken;

    struct Sink {
        written: Mutex<Vec<Point>>,
    }

    #[async_trait]
    impl Ingest for Sink {
        async fn write_point(&self, point: Point) -> Result<(), EngineError> {
            self.written.lock().unwrap().push(point);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rewrites_and_reinjects() {
        let input: Arc<dyn strom_edge::Edge> = Arc::new(ChannelEdge::new(EdgeType::Stream, 8));
        let sink = Arc::new(Sink {
            written: Mutex::new(Vec::new()),
        });

        let p = Point::new(
            "cpu",
            "telegraf",
            "autogen",
            Utc::now(),
            [("v".to_string(), FieldValue::Int(1))].into(),
            Tags::new(),
            Dimensions::none(),
        );
        input.collect(Message::Point(p)).await.unwrap();
        input.close().unwrap();

        let node = Box::new(LoopbackNode {
            io: NodeIo {
                task_id: "t".into(),
                node_id: "lb".into(),
                ins: vec![Arc::clone(&input)],
                outs: vec![],
                timer: Default::default(),
                cancel: CancellationToken::new(),
            },
            database: "derived".into(),
            retention_policy: "autogen".into(),
            measurement: Some("cpu_rates".into()),
            tags: [("source".to_string(), "loopback".to_string())].into(),
            ingest: sink.clone(),
        });
        node.run().await.unwrap();

        let written = sink.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].database, "derived");
        assert_eq!(written[0].name, "cpu_rates");
        assert_eq!(
            written[0].tags.get("source").map(String::as_str),
            Some("loopback")
        );
    }
}
