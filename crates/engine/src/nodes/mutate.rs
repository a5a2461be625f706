//! Stateless row mutations: default and delete.

use std::sync::Arc;

use async_trait::async_trait;

use strom_core::{BatchPoint, BeginBatch, Fields, Message, Point, Tags};
use strom_edge::{Consumer, EdgeError, ForwardReceiver, ForwardingReceiver};

use crate::error::EngineError;
use crate::node::{Node, NodeIo, Timed};

/// Fills in missing fields and tags with configured values.
pub(crate) struct DefaultNode {
    pub io: NodeIo,
    pub fields: Fields,
    pub tags: Tags,
}

struct DefaultRecv {
    fields: Fields,
    tags: Tags,
}

impl DefaultRecv {
    fn fill_point(&self, p: &mut Point) {
        for (k, v) in &self.fields {
            if !p.fields.contains_key(k) {
                p.set_field(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.tags {
            if !p.tags.contains_key(k) {
                p.set_tag(k.clone(), v.clone());
            }
        }
    }
}

#[async_trait]
impl ForwardReceiver for DefaultRecv {
    async fn point(&mut self, mut point: Point) -> Result<Option<Message>, EdgeError> {
        self.fill_point(&mut point);
        Ok(Some(Message::Point(point)))
    }

    async fn begin_batch(&mut self, mut begin: BeginBatch) -> Result<Option<Message>, EdgeError> {
        let missing: Vec<_> = self
            .tags
            .iter()
            .filter(|(k, _)| !begin.tags.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !missing.is_empty() {
            let mut tags = (*begin.tags).clone();
            tags.extend(missing);
            begin.set_tags(tags);
        }
        Ok(Some(Message::BeginBatch(begin)))
    }

    async fn batch_point(&mut self, mut point: BatchPoint) -> Result<Option<Message>, EdgeError> {
        for (k, v) in &self.fields {
            if !point.fields.contains_key(k) {
                point.set_field(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.tags {
            if !point.tags.contains_key(k) {
                Arc::make_mut(&mut point.tags).insert(k.clone(), v.clone());
            }
        }
        Ok(Some(Message::BatchPoint(point)))
    }
}

#[async_trait]
impl Node for DefaultNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: ForwardingReceiver::new(
                self.io.outs.clone(),
                DefaultRecv {
                    fields: self.fields,
                    tags: self.tags,
                },
            ),
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}

/// Removes fields and tags. Removing a grouped tag regroups the record.
pub(crate) struct DeleteNode {
    pub io: NodeIo,
    pub fields: Vec<String>,
    pub tags: Vec<String>,
}

struct DeleteRecv {
    fields: Vec<String>,
    tags: Vec<String>,
}

#[async_trait]
impl ForwardReceiver for DeleteRecv {
    async fn point(&mut self, mut point: Point) -> Result<Option<Message>, EdgeError> {
        for f in &self.fields {
            point.remove_field(f);
        }
        for t in &self.tags {
            point.remove_tag(t);
        }
        Ok(Some(Message::Point(point)))
    }

    async fn begin_batch(&mut self, mut begin: BeginBatch) -> Result<Option<Message>, EdgeError> {
        if self.tags.iter().any(|t| begin.tags.contains_key(t)) {
            let mut tags = (*begin.tags).clone();
            for t in &self.tags {
                tags.remove(t);
            }
            begin.set_tags(tags);
        }
        Ok(Some(Message::BeginBatch(begin)))
    }

    async fn batch_point(&mut self, mut point: BatchPoint) -> Result<Option<Message>, EdgeError> {
        for f in &self.fields {
            Arc::make_mut(&mut point.fields).remove(f);
        }
        for t in &self.tags {
            Arc::make_mut(&mut point.tags).remove(t);
        }
        Ok(Some(Message::BatchPoint(point)))
    }
}

#[async_trait]
impl Node for DeleteNode {
    async fn run(self: Box<Self>) -> Result<(), EngineError> {
        let input = self.io.single_in()?;
        let recv = Timed {
            recv: ForwardingReceiver::new(
                self.io.outs.clone(),
                DeleteRecv {
                    fields: self.fields,
                    tags: self.tags,
                },
            ),
            timer: self.io.timer.clone(),
        };
        Consumer::new(input, recv).run().await?;
        Ok(())
    }
}
