//! Group identity: dimensions and the derived group key.
//!
//! A point belongs to a group determined by the values of its dimension
//! tags (and optionally its measurement name). The [`GroupId`] is a pure
//! function of those inputs and is cached on each message; mutators that
//! touch name, tags, or dimensions re-derive it immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// Tag set of a point or batch. Ordered so group keys are deterministic.
pub type Tags = BTreeMap<String, String>;

/// Field set of a point.
pub type Fields = BTreeMap<String, FieldValue>;

/// The set of tag names a stream is grouped by, plus whether the
/// measurement name participates in the group key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    #[serde(default)]
    pub by_name: bool,
    #[serde(default)]
    pub tag_names: Vec<String>,
}

impl Dimensions {
    /// Create dimensions over the given tag names. Names are sorted so
    /// that the derived group key does not depend on caller order.
    pub fn new(by_name: bool, mut tag_names: Vec<String>) -> Self {
        tag_names.sort();
        tag_names.dedup();
        Self { by_name, tag_names }
    }

    /// Dimensions that group everything into the nil group.
    pub fn none() -> Self {
        Self::default()
    }

    /// Remove a tag name from the dimensions, if present.
    pub fn remove_tag(&mut self, name: &str) {
        self.tag_names.retain(|t| t != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tag_names.iter().any(|t| t == name)
    }

    pub fn is_empty(&self) -> bool {
        !self.by_name && self.tag_names.is_empty()
    }
}

/// Derived group key. Cheap to clone and hash; two points with equal
/// dimension values always produce equal ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(Arc<str>);

impl GroupId {
    /// The group of ungrouped data.
    pub fn nil() -> Self {
        GroupId(Arc::from(""))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        GroupId::nil()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        GroupId(Arc::from(s))
    }
}

/// Derive the group id for (name, tags) under the given dimensions.
///
/// The key is `name` + newline when grouping by name, followed by
/// `tag=value` pairs in dimension order. Missing tags contribute an
/// empty value, so the id stays a total function of its inputs.
pub fn group_id(name: &str, tags: &Tags, dims: &Dimensions) -> GroupId {
    if dims.is_empty() {
        return GroupId::nil();
    }
    let mut key = String::new();
    if dims.by_name {
        key.push_str(name);
        key.push('\n');
    }
    for (i, tag) in dims.tag_names.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(tag);
        key.push('=');
        if let Some(v) = tags.get(tag) {
            key.push_str(v);
        }
    }
    GroupId(Arc::from(key.as_str()))
}

/// Everything downstream needs to know about a group: its id, the tag
/// values that define it, and the dimensions it was derived under.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub id: GroupId,
    pub tags: Arc<Tags>,
    pub dimensions: Dimensions,
}

impl GroupInfo {
    pub fn nil() -> Self {
        Self {
            id: GroupId::nil(),
            tags: Arc::new(Tags::new()),
            dimensions: Dimensions::none(),
        }
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

    #[test]
    fn nil_group_for_empty_dimensions() {
        let id = group_id("cpu", &tags(&[("host", "a")]), &Dimensions::none());
        assert!(id.is_nil());
    }

    #[test]
    fn group_key_is_order_independent() {
        let t = tags(&[("host", "a"), ("dc", "east")]);
        let d1 = Dimensions::new(false, vec!["host".into(), "dc".into()]);
        let d2 = Dimensions::new(false, vec!["dc".into(), "host".into()]);
        assert_eq!(group_id("cpu", &t, &d1), group_id("cpu", &t, &d2));
    }

    #[test]
    fn by_name_distinguishes_measurements() {
        let t = tags(&[("host", "a")]);
        let d = Dimensions::new(true, vec!["host".into()]);
        assert_ne!(group_id("cpu", &t, &d), group_id("mem", &t, &d));
    }

    #[test]
    fn missing_tag_contributes_empty_value() {
        let d = Dimensions::new(false, vec!["host".into()]);
        let id = group_id("cpu", &Tags::new(), &d);
        assert_eq!(id.as_str(), "host=");
    }
}
