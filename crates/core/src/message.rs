//! Pipeline messages.
//!
//! Everything that travels over an edge is a [`Message`]: a stream point,
//! batch framing (begin / point / end), a whole buffered batch, a barrier,
//! or a delete-group marker.
//!
//! Field and tag maps are shared behind `Arc`: cloning a message is a
//! shallow copy, and mutators copy the map on first write. Any mutation
//! that touches the name, tags, or dimensions re-derives the cached group
//! id before returning.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::group::{group_id, Dimensions, Fields, GroupId, GroupInfo, Tags};
use crate::value::FieldValue;

/// Whether an edge (or a node port) carries stream points or batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Stream,
    Batch,
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeType::Stream => f.write_str("stream"),
            EdgeType::Batch => f.write_str("batch"),
        }
    }
}

/// A single stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub name: String,
    pub database: String,
    pub retention_policy: String,
    pub time: DateTime<Utc>,
    pub fields: Arc<Fields>,
    pub tags: Arc<Tags>,
    dimensions: Dimensions,
    group: GroupId,
}

impl Point {
    pub fn new(
        name: impl Into<String>,
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        time: DateTime<Utc>,
        fields: Fields,
        tags: Tags,
        dimensions: Dimensions,
    ) -> Self {
        let name = name.into();
        let group = group_id(&name, &tags, &dimensions);
        Self {
            name,
            database: database.into(),
            retention_policy: retention_policy.into(),
            time,
            fields: Arc::new(fields),
            tags: Arc::new(tags),
            dimensions,
            group,
        }
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    pub fn group_info(&self) -> GroupInfo {
        GroupInfo {
            id: self.group.clone(),
            tags: Arc::clone(&self.tags),
            dimensions: self.dimensions.clone(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Rename the point, re-deriving the group id.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.rederive();
    }

    /// Replace the whole tag map, re-deriving the group id.
    pub fn set_tags(&mut self, tags: Arc<Tags>) {
        self.tags = tags;
        self.rederive();
    }

    /// Replace the dimensions, re-deriving the group id.
    pub fn set_dimensions(&mut self, dimensions: Dimensions) {
        self.dimensions = dimensions;
        self.rederive();
    }

    /// Set a single tag value. Copies the shared tag map on first write.
    pub fn set_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.tags).insert(name.into(), value.into());
        self.rederive();
    }

    /// Remove a tag. If the tag is a grouping dimension it is removed
    /// from the dimensions as well, so the group id stays consistent.
    pub fn remove_tag(&mut self, name: &str) {
        Arc::make_mut(&mut self.tags).remove(name);
        if self.dimensions.contains(name) {
            self.dimensions.remove_tag(name);
        }
        self.rederive();
    }

    /// Set a single field value. Copies the shared field map on first write.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        Arc::make_mut(&mut self.fields).insert(name.into(), value);
    }

    /// Remove a field. Copies the shared field map on first write.
    pub fn remove_field(&mut self, name: &str) {
        Arc::make_mut(&mut self.fields).remove(name);
    }

    fn rederive(&mut self) {
        self.group = group_id(&self.name, &self.tags, &self.dimensions);
    }
}

/// Opens a batch: everything the batch's points have in common.
#[derive(Debug, Clone, PartialEq)]
pub struct BeginBatch {
    pub name: String,
    pub tags: Arc<Tags>,
    pub by_name: bool,
    pub tmax: DateTime<Utc>,
    /// Expected number of points; a hint, exact once buffered.
    pub size_hint: usize,
    group: GroupId,
}

impl BeginBatch {
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        by_name: bool,
        tmax: DateTime<Utc>,
        size_hint: usize,
    ) -> Self {
        let name = name.into();
        let dims = Dimensions::new(by_name, tags.keys().cloned().collect());
        let group = group_id(&name, &tags, &dims);
        Self {
            name,
            tags: Arc::new(tags),
            by_name,
            tmax,
            size_hint,
            group,
        }
    }

    /// Batch dimensions are the batch's own tag names.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.by_name, self.tags.keys().cloned().collect())
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group
    }

    pub fn group_info(&self) -> GroupInfo {
        GroupInfo {
            id: self.group.clone(),
            tags: Arc::clone(&self.tags),
            dimensions: self.dimensions(),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.rederive();
    }

    pub fn set_tags(&mut self, tags: Tags) {
        self.tags = Arc::new(tags);
        self.rederive();
    }

    fn rederive(&mut self) {
        let dims = self.dimensions();
        self.group = group_id(&self.name, &self.tags, &dims);
    }
}

/// One record inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPoint {
    pub time: DateTime<Utc>,
    pub fields: Arc<Fields>,
    pub tags: Arc<Tags>,
}

impl BatchPoint {
    pub fn new(time: DateTime<Utc>, fields: Fields, tags: Tags) -> Self {
        Self {
            time,
            fields: Arc::new(fields),
            tags: Arc::new(tags),
        }
    }

    /// Project a stream point into a batch point, sharing its maps.
    pub fn from_point(p: &Point) -> Self {
        Self {
            time: p.time,
            fields: Arc::clone(&p.fields),
            tags: Arc::clone(&p.tags),
        }
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        Arc::make_mut(&mut self.fields).insert(name.into(), value);
    }
}

/// Closes the batch opened by the matching [`BeginBatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndBatch;

/// Progress marker: no record older than `time` will arrive in `group`.
#[derive(Debug, Clone, PartialEq)]
pub struct Barrier {
    pub group: GroupInfo,
    pub time: DateTime<Utc>,
}

/// Marks a group as terminal; receivers may release its state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteGroup {
    pub group: GroupInfo,
}

/// Discriminant of a [`Message`], for stats and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Point,
    BeginBatch,
    BatchPoint,
    EndBatch,
    BufferedBatch,
    Barrier,
    DeleteGroup,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Point => "point",
            MessageKind::BeginBatch => "begin-batch",
            MessageKind::BatchPoint => "batch-point",
            MessageKind::EndBatch => "end-batch",
            MessageKind::BufferedBatch => "buffered-batch",
            MessageKind::Barrier => "barrier",
            MessageKind::DeleteGroup => "delete-group",
        };
        f.write_str(s)
    }
}

/// Everything that can travel over an edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Point(Point),
    BeginBatch(BeginBatch),
    BatchPoint(BatchPoint),
    EndBatch(EndBatch),
    BufferedBatch(crate::batch::BufferedBatch),
    Barrier(Barrier),
    DeleteGroup(DeleteGroup),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Point(_) => MessageKind::Point,
            Message::BeginBatch(_) => MessageKind::BeginBatch,
            Message::BatchPoint(_) => MessageKind::BatchPoint,
            Message::EndBatch(_) => MessageKind::EndBatch,
            Message::BufferedBatch(_) => MessageKind::BufferedBatch,
            Message::Barrier(_) => MessageKind::Barrier,
            Message::DeleteGroup(_) => MessageKind::DeleteGroup,
        }
    }

    /// Group identity carried by this message, when it has one.
    ///
    /// `BatchPoint` and `EndBatch` are addressed by the framing state of
    /// their enclosing batch and carry no group of their own.
    pub fn group_info(&self) -> Option<GroupInfo> {
        match self {
            Message::Point(p) => Some(p.group_info()),
            Message::BeginBatch(b) => Some(b.group_info()),
            Message::BufferedBatch(b) => Some(b.begin.group_info()),
            Message::Barrier(b) => Some(b.group.clone()),
            Message::DeleteGroup(d) => Some(d.group.clone()),
            Message::BatchPoint(_) | Message::EndBatch(_) => None,
        }
    }
}

impl From<Point> for Message {
    fn from(p: Point) -> Self {
        Message::Point(p)
    }
}

impl From<crate::batch::BufferedBatch> for Message {
    fn from(b: crate::batch::BufferedBatch) -> Self {
        Message::BufferedBatch(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn clone_is_shallow_until_mutation() {
        let p = Point::new(
            "cpu",
            "telegraf",
            "autogen",
            Utc::now(),
            fields(&[("value", FieldValue::Float(1.0))]),
            tags(&[("host", "a")]),
            Dimensions::new(false, vec!["host".into()]),
        );
        let mut copy = p.clone();
        assert!(Arc::ptr_eq(&p.fields, &copy.fields));
        assert!(Arc::ptr_eq(&p.tags, &copy.tags));

        copy.set_tag("host", "b");
        assert!(!Arc::ptr_eq(&p.tags, &copy.tags));
        assert_eq!(p.tags.get("host").unwrap(), "a");
        assert_eq!(copy.tags.get("host").unwrap(), "b");
    }

    #[test]
    fn mutators_rederive_group() {
        let dims = Dimensions::new(true, vec!["host".into()]);
        let mut p = Point::new(
            "cpu",
            "",
            "",
            Utc::now(),
            Fields::new(),
            tags(&[("host", "a")]),
            Dimensions::none(),
        );
        p.set_name("mem");
        p.set_tags(Arc::new(tags(&[("host", "b")])));
        p.set_dimensions(dims.clone());

        let fresh = Point::new(
            "mem",
            "",
            "",
            p.time,
            Fields::new(),
            tags(&[("host", "b")]),
            dims,
        );
        assert_eq!(p.group_id(), fresh.group_id());
    }

    #[test]
    fn removing_grouped_tag_drops_dimension() {
        let mut p = Point::new(
            "cpu",
            "",
            "",
            Utc::now(),
            Fields::new(),
            tags(&[("host", "a"), ("dc", "east")]),
            Dimensions::new(false, vec!["host".into(), "dc".into()]),
        );
        p.remove_tag("dc");
        assert!(!p.dimensions().contains("dc"));
        assert_eq!(p.group_id().as_str(), "host=a");
    }

    #[test]
    fn batch_group_uses_tag_names_as_dimensions() {
        let b = BeginBatch::new("cpu", tags(&[("host", "a")]), false, Utc::now(), 0);
        assert_eq!(b.group_id().as_str(), "host=a");
        assert!(b.dimensions().contains("host"));
    }
}
