//! Boolean conditions over point fields and tags.
//!
//! This is the parsed form a task definition carries; the language that
//! produces it lives outside the engine. Evaluation is total: a missing
//! field or a type mismatch makes the condition false rather than
//! failing the node.

use serde::{Deserialize, Serialize};

use crate::group::{Fields, Tags};
use crate::value::FieldValue;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn apply_f64(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Gte => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Lte => a <= b,
        }
    }

    fn apply_str(self, a: &str, b: &str) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Gte => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Lte => a <= b,
        }
    }
}

/// A boolean condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Compare a field value against a constant.
    Field {
        field: String,
        op: CmpOp,
        value: FieldValue,
    },
    /// Compare a tag value against a constant string.
    Tag { tag: String, op: CmpOp, value: String },
    /// True when every child is true. Empty means true.
    All { all: Vec<Predicate> },
    /// True when any child is true. Empty means false.
    Any { any: Vec<Predicate> },
    Not { not: Box<Predicate> },
}

impl Predicate {
    /// Evaluate against a point's fields and tags.
    pub fn eval(&self, fields: &Fields, tags: &Tags) -> bool {
        match self {
            Predicate::Field { field, op, value } => match (fields.get(field), value) {
                (Some(FieldValue::Str(a)), FieldValue::Str(b)) => op.apply_str(a, b),
                (Some(FieldValue::Bool(a)), FieldValue::Bool(b)) => match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Neq => a != b,
                    _ => false,
                },
                (Some(actual), expected) => match (actual.as_float(), expected.as_float()) {
                    (Some(a), Some(b)) => op.apply_f64(a, b),
                    _ => false,
                },
                (None, _) => false,
            },
            Predicate::Tag { tag, op, value } => match tags.get(tag) {
                Some(actual) => op.apply_str(actual, value),
                None => false,
            },
            Predicate::All { all } => all.iter().all(|p| p.eval(fields, tags)),
            Predicate::Any { any } => any.iter().any(|p| p.eval(fields, tags)),
            Predicate::Not { not } => !not.eval(fields, tags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn numeric_comparison_widens_ints() {
        let p = Predicate::Field {
            field: "value".into(),
            op: CmpOp::Gt,
            value: FieldValue::Float(10.0),
        };
        assert!(p.eval(&fields(&[("value", FieldValue::Int(11))]), &Tags::new()));
        assert!(!p.eval(&fields(&[("value", FieldValue::Int(9))]), &Tags::new()));
    }

    #[test]
    fn missing_field_is_false() {
        let p = Predicate::Field {
            field: "nope".into(),
            op: CmpOp::Eq,
            value: FieldValue::Int(1),
        };
        assert!(!p.eval(&Fields::new(), &Tags::new()));
    }

    #[test]
    fn tag_and_combinators() {
        let mut tags = Tags::new();
        tags.insert("host".into(), "serverA".into());
        let p = Predicate::All {
            all: vec![
                Predicate::Tag {
                    tag: "host".into(),
                    op: CmpOp::Eq,
                    value: "serverA".into(),
                },
                Predicate::Not {
                    not: Box::new(Predicate::Any { any: vec![] }),
                },
            ],
        };
        assert!(p.eval(&Fields::new(), &tags));
    }

    #[test]
    fn serde_shape() {
        let p: Predicate = serde_json::from_str(
            r#"{"kind":"field","field":"usage","op":"gte","value":80.0}"#,
        )
        .unwrap();
        assert!(p.eval(&fields(&[("usage", FieldValue::Float(90.0))]), &Tags::new()));
    }
}
