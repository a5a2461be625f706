//! Buffered batches and the JSON batch codec.
//!
//! A [`BufferedBatch`] is a whole batch materialized as one value; edges
//! and receivers may carry a batch either buffered or as framing
//! messages, and the two forms interconvert losslessly.
//!
//! The JSON shape (used for replay files and test inputs) is
//! `{name, tmax, group, byname, tags, points: [{fields, tags, time}]}`
//! with RFC3339 nanosecond times; integer nanosecond timestamps are also
//! accepted on parse.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::group::Tags;
use crate::message::{BatchPoint, BeginBatch, EndBatch, Message};
use crate::value::{field_value_from_json, FieldValue};

/// A batch held as one value: the begin marker plus its ordered points.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedBatch {
    pub begin: BeginBatch,
    pub points: Vec<BatchPoint>,
}

impl BufferedBatch {
    /// Construct from a begin marker and points. The begin's size hint is
    /// corrected to the exact point count.
    pub fn new(mut begin: BeginBatch, points: Vec<BatchPoint>) -> Self {
        begin.size_hint = points.len();
        Self { begin, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a point, keeping the size hint exact.
    pub fn push(&mut self, p: BatchPoint) {
        self.points.push(p);
        self.begin.size_hint = self.points.len();
    }

    /// Unfold into the equivalent framing sequence: begin, points, end.
    pub fn into_messages(self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.points.len() + 2);
        out.push(Message::BeginBatch(self.begin));
        out.extend(self.points.into_iter().map(Message::BatchPoint));
        out.push(Message::EndBatch(EndBatch));
        out
    }

    /// Parse the JSON batch shape.
    pub fn from_json(s: &str) -> Result<Self, CoreError> {
        let wire: BatchJson = serde_json::from_str(s)?;
        wire.try_into()
    }

    /// Serialize to the JSON batch shape.
    pub fn to_json(&self) -> Result<String, CoreError> {
        let wire = BatchJson::from(self);
        Ok(serde_json::to_string(&wire)?)
    }
}

// ── JSON wire shape ──────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct BatchJson {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tmax: Option<serde_json::Value>,
    #[serde(default)]
    byname: bool,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
    #[serde(default)]
    points: Vec<PointJson>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PointJson {
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
    time: serde_json::Value,
}

/// Accept either an RFC3339 string or an integer nanosecond timestamp.
fn parse_time(v: &serde_json::Value) -> Result<DateTime<Utc>, CoreError> {
    match v {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CoreError::Time(format!("{s:?}: {e}"))),
        serde_json::Value::Number(n) => {
            let ns = n
                .as_i64()
                .ok_or_else(|| CoreError::Time(format!("{n} is not a nanosecond timestamp")))?;
            Ok(Utc.timestamp_nanos(ns))
        }
        other => Err(CoreError::Time(format!("unexpected time value {other}"))),
    }
}

fn format_time(t: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

impl TryFrom<BatchJson> for BufferedBatch {
    type Error = CoreError;

    fn try_from(wire: BatchJson) -> Result<Self, CoreError> {
        let tmax = match &wire.tmax {
            Some(v) => parse_time(v)?,
            None => Utc.timestamp_nanos(0),
        };
        let mut points = Vec::with_capacity(wire.points.len());
        for p in wire.points {
            let mut fields = crate::group::Fields::new();
            for (k, v) in &p.fields {
                let fv = field_value_from_json(v).ok_or_else(|| {
                    CoreError::Field(format!("field {k} has unsupported value {v}"))
                })?;
                fields.insert(k.clone(), fv);
            }
            let tags = if p.tags.is_empty() {
                wire.tags.clone()
            } else {
                p.tags
            };
            points.push(BatchPoint::new(parse_time(&p.time)?, fields, tags));
        }
        let begin = BeginBatch::new(wire.name, wire.tags, wire.byname, tmax, points.len());
        Ok(BufferedBatch::new(begin, points))
    }
}

impl From<&BufferedBatch> for BatchJson {
    fn from(b: &BufferedBatch) -> Self {
        BatchJson {
            name: b.begin.name.clone(),
            tmax: Some(format_time(b.begin.tmax)),
            byname: b.begin.by_name,
            tags: (*b.begin.tags).clone(),
            points: b
                .points
                .iter()
                .map(|p| PointJson {
                    fields: p
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), field_value_to_json(v)))
                        .collect(),
                    tags: (*p.tags).clone(),
                    time: format_time(p.time),
                })
                .collect(),
        }
    }
}

// ── Stream point wire shape ──────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct WirePoint {
    name: String,
    #[serde(default)]
    database: String,
    #[serde(default)]
    retention_policy: String,
    time: serde_json::Value,
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    group_by: Vec<String>,
    #[serde(default)]
    by_name: bool,
}

/// Parse one stream point from its JSON shape:
/// `{name, database, retention_policy, time, fields, tags, group_by, byname}`.
pub fn point_from_json(s: &str) -> Result<crate::message::Point, CoreError> {
    let wire: WirePoint = serde_json::from_str(s)?;
    let mut fields = crate::group::Fields::new();
    for (k, v) in &wire.fields {
        let fv = field_value_from_json(v)
            .ok_or_else(|| CoreError::Field(format!("field {k} has unsupported value {v}")))?;
        fields.insert(k.clone(), fv);
    }
    Ok(crate::message::Point::new(
        wire.name,
        wire.database,
        wire.retention_policy,
        parse_time(&wire.time)?,
        fields,
        wire.tags,
        crate::group::Dimensions::new(wire.by_name, wire.group_by),
    ))
}

/// Serialize one stream point to the JSON shape accepted by
/// [`point_from_json`].
pub fn point_to_json(p: &crate::message::Point) -> Result<String, CoreError> {
    let wire = WirePoint {
        name: p.name.clone(),
        database: p.database.clone(),
        retention_policy: p.retention_policy.clone(),
        time: format_time(p.time),
        fields: p
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), field_value_to_json(v)))
            .collect(),
        tags: (*p.tags).clone(),
        group_by: p.dimensions().tag_names.clone(),
        by_name: p.dimensions().by_name,
    };
    Ok(serde_json::to_string(&wire)?)
}

fn field_value_to_json(v: &FieldValue) -> serde_json::Value {
    match v {
        FieldValue::Bool(b) => serde_json::Value::Bool(*b),
        FieldValue::Int(i) => serde_json::Value::Number((*i).into()),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        FieldValue::Str(s) => serde_json::Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Fields;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn size_hint_tracks_len() {
        let begin = BeginBatch::new("cpu", Tags::new(), false, Utc::now(), 99);
        let mut b = BufferedBatch::new(begin, vec![]);
        assert_eq!(b.begin.size_hint, 0);
        b.push(BatchPoint::new(Utc::now(), Fields::new(), Tags::new()));
        assert_eq!(b.begin.size_hint, 1);
        assert_eq!(b.begin.size_hint, b.len());
    }

    #[test]
    fn framing_roundtrip_is_lossless() {
        let t = Utc::now();
        let begin = BeginBatch::new("cpu", tags(&[("host", "a")]), true, t, 0);
        let batch = BufferedBatch::new(
            begin,
            vec![
                BatchPoint::new(t, Fields::new(), tags(&[("host", "a")])),
                BatchPoint::new(t, Fields::new(), tags(&[("host", "a")])),
            ],
        );
        let msgs = batch.clone().into_messages();
        assert_eq!(msgs.len(), 4);

        // Rebuild from the framing.
        let mut rebuilt = None;
        let mut points = Vec::new();
        let mut begin = None;
        for m in msgs {
            match m {
                Message::BeginBatch(b) => begin = Some(b),
                Message::BatchPoint(p) => points.push(p),
                Message::EndBatch(_) => {
                    rebuilt = Some(BufferedBatch::new(begin.take().unwrap(), std::mem::take(&mut points)))
                }
                other => panic!("unexpected message {:?}", other.kind()),
            }
        }
        assert_eq!(rebuilt.unwrap(), batch);
    }

    #[test]
    fn json_parse_rfc3339_and_nanos() {
        let src = r#"{
            "name": "cpu",
            "tmax": "2015-06-01T00:00:00Z",
            "byname": false,
            "tags": {"host": "a"},
            "points": [
                {"fields": {"value": 42, "ratio": 0.5, "ok": true, "note": "hi"},
                 "tags": {"host": "a"},
                 "time": "2015-06-01T00:00:00.000000001Z"},
                {"fields": {"value": 43},
                 "time": 1433116800000000002}
            ]
        }"#;
        let b = BufferedBatch::from_json(src).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b.begin.size_hint, 2);
        assert_eq!(
            b.points[0].fields.get("value"),
            Some(&FieldValue::Int(42))
        );
        assert_eq!(
            b.points[0].fields.get("ratio"),
            Some(&FieldValue::Float(0.5))
        );
        assert_eq!(b.points[0].time.timestamp_subsec_nanos(), 1);
        assert_eq!(b.points[1].time.timestamp_subsec_nanos(), 2);
        // Points without tags inherit the batch tags.
        assert_eq!(b.points[1].tags.get("host").map(String::as_str), Some("a"));
    }

    #[test]
    fn stream_point_json_roundtrip() {
        let p = crate::message::Point::new(
            "cpu",
            "telegraf",
            "autogen",
            Utc.timestamp_nanos(1433116800000000042),
            [
                ("usage".to_string(), FieldValue::Float(42.5)),
                ("cores".to_string(), FieldValue::Int(8)),
            ]
            .into(),
            tags(&[("host", "a")]),
            crate::group::Dimensions::new(true, vec!["host".into()]),
        );
        let s = point_to_json(&p).unwrap();
        let back = point_from_json(&s).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.group_id(), p.group_id());
    }

    #[test]
    fn json_roundtrip_preserves_nanos() {
        let t = Utc.timestamp_nanos(1433116800000000123);
        let begin = BeginBatch::new("m", tags(&[("t1", "v1")]), false, t, 0);
        let batch = BufferedBatch::new(
            begin,
            vec![BatchPoint::new(
                t,
                [("f".to_string(), FieldValue::Float(1.5))].into(),
                tags(&[("t1", "v1")]),
            )],
        );
        let s = batch.to_json().unwrap();
        let back = BufferedBatch::from_json(&s).unwrap();
        assert_eq!(back, batch);
    }
}
