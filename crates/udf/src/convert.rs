//! Conversions between engine messages and wire messages.
//!
//! Fields travel as four parallel typed maps; the conversion is lossless
//! for the four supported scalar types in both directions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::TimeZone;

use strom_core::{
    BatchPoint, BeginBatch, Dimensions, FieldValue, Fields, GroupId, Point, Tags,
};

use crate::proto;

fn split_fields(fields: &Fields, out: &mut proto::Point) {
    for (name, value) in fields {
        match value {
            FieldValue::Float(v) => {
                out.fields_double.insert(name.clone(), *v);
            }
            FieldValue::Int(v) => {
                out.fields_int.insert(name.clone(), *v);
            }
            FieldValue::Str(v) => {
                out.fields_string.insert(name.clone(), v.clone());
            }
            FieldValue::Bool(v) => {
                out.fields_bool.insert(name.clone(), *v);
            }
        }
    }
}

fn merge_fields(p: &proto::Point) -> Fields {
    let mut fields = Fields::new();
    for (k, v) in &p.fields_double {
        fields.insert(k.clone(), FieldValue::Float(*v));
    }
    for (k, v) in &p.fields_int {
        fields.insert(k.clone(), FieldValue::Int(*v));
    }
    for (k, v) in &p.fields_string {
        fields.insert(k.clone(), FieldValue::Str(v.clone()));
    }
    for (k, v) in &p.fields_bool {
        fields.insert(k.clone(), FieldValue::Bool(*v));
    }
    fields
}

fn to_wire_tags(tags: &Tags) -> HashMap<String, String> {
    tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn from_wire_tags(tags: &HashMap<String, String>) -> Tags {
    tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Engine point → wire point.
pub fn point_to_proto(p: &Point) -> proto::Point {
    let mut out = proto::Point {
        time: p.time.timestamp_nanos_opt().unwrap_or_default(),
        name: p.name.clone(),
        database: p.database.clone(),
        retention_policy: p.retention_policy.clone(),
        group: p.group_id().as_str().to_string(),
        dimensions: p.dimensions().tag_names.clone(),
        by_name: p.dimensions().by_name,
        tags: to_wire_tags(&p.tags),
        ..Default::default()
    };
    split_fields(&p.fields, &mut out);
    out
}

/// Wire point → engine point.
pub fn point_from_proto(p: &proto::Point) -> Point {
    Point::new(
        p.name.clone(),
        p.database.clone(),
        p.retention_policy.clone(),
        chrono::Utc.timestamp_nanos(p.time),
        merge_fields(p),
        from_wire_tags(&p.tags),
        Dimensions::new(p.by_name, p.dimensions.clone()),
    )
}

/// Batch point → wire point. Batch points carry no group of their own;
/// group identity travels in the begin/end framing.
pub fn batch_point_to_proto(p: &BatchPoint, group: &GroupId) -> proto::Point {
    let mut out = proto::Point {
        time: p.time.timestamp_nanos_opt().unwrap_or_default(),
        group: group.as_str().to_string(),
        tags: to_wire_tags(&p.tags),
        ..Default::default()
    };
    split_fields(&p.fields, &mut out);
    out
}

/// Wire point → batch point.
pub fn batch_point_from_proto(p: &proto::Point) -> BatchPoint {
    BatchPoint {
        time: chrono::Utc.timestamp_nanos(p.time),
        fields: Arc::new(merge_fields(p)),
        tags: Arc::new(from_wire_tags(&p.tags)),
    }
}

/// Engine begin-batch → wire begin.
pub fn begin_to_proto(b: &BeginBatch) -> proto::BeginBatch {
    proto::BeginBatch {
        name: b.name.clone(),
        group: b.group_id().as_str().to_string(),
        tags: to_wire_tags(&b.tags),
        size: b.size_hint as i64,
        by_name: b.by_name,
    }
}

/// Wire begin → engine begin-batch. `tmax` is carried by the end
/// message on the wire, so it starts at the epoch and is set when the
/// batch is closed.
pub fn begin_from_proto(b: &proto::BeginBatch) -> BeginBatch {
    BeginBatch::new(
        b.name.clone(),
        from_wire_tags(&b.tags),
        b.by_name,
        chrono::Utc.timestamp_nanos(0),
        b.size.max(0) as usize,
    )
}

/// Engine end-batch context → wire end.
pub fn end_to_proto(b: &BeginBatch) -> proto::EndBatch {
    proto::EndBatch {
        name: b.name.clone(),
        group: b.group_id().as_str().to_string(),
        tmax: b.tmax.timestamp_nanos_opt().unwrap_or_default(),
        tags: to_wire_tags(&b.tags),
    }
}
