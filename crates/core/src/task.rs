//! Task definitions: the parsed pipeline a task executes.
//!
//! A [`TaskDefinition`] is the engine-facing output of whatever language
//! or API produced the pipeline: a list of typed node specs plus the
//! directed connections between them. The reserved endpoint `"in"` is the
//! task's ingest edge and `"out"` its emitted output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::group::{Fields, Tags};
use crate::message::EdgeType;
use crate::predicate::Predicate;
use crate::value::FieldValue;

/// Reserved edge endpoint: the task's source edge.
pub const TASK_IN: &str = "in";
/// Reserved edge endpoint: the task's output edge.
pub const TASK_OUT: &str = "out";

/// A database / retention-policy pair a task reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dbrp {
    pub database: String,
    pub retention_policy: String,
}

impl fmt::Display for Dbrp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.database, self.retention_policy)
    }
}

/// A complete pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    /// Whether the task's source edge carries points or batches.
    pub kind: EdgeType,
    #[serde(default)]
    pub dbrps: Vec<Dbrp>,
    pub nodes: Vec<NodeDef>,
    /// Directed connections: (from, to). Endpoints are node ids, or the
    /// reserved `"in"` / `"out"` names.
    pub edges: Vec<(String, String)>,
}

/// One node in the pipeline: an id plus its typed spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(flatten)]
    pub spec: NodeSpec,
}

fn default_delimiter() -> String {
    ".".to_string()
}

fn default_max_combinations() -> u64 {
    10_000
}

fn default_state_field() -> String {
    "state".to_string()
}

fn default_unit_ms() -> u64 {
    1_000
}

/// Alert severity thresholds and dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSpec {
    /// Template for the alert id; defaults to the task id.
    #[serde(default)]
    pub id: Option<String>,
    /// Template for the alert message.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub info: Option<Predicate>,
    #[serde(default)]
    pub warning: Option<Predicate>,
    #[serde(default)]
    pub critical: Option<Predicate>,
    /// When true, dispatch only on level changes (including back to OK).
    #[serde(default)]
    pub state_changes_only: bool,
    /// Names of configured handler services to dispatch to.
    #[serde(default)]
    pub handlers: Vec<String>,
}

/// How to reach and initialize a UDF worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfSpec {
    /// Program and arguments to spawn, exchanging frames over stdio.
    #[serde(default)]
    pub command: Vec<String>,
    /// Unix socket path of an already-running worker. Mutually exclusive
    /// with `command`.
    #[serde(default)]
    pub socket: Option<String>,
    /// Edge type the worker consumes.
    pub wants: EdgeType,
    /// Edge type the worker produces.
    pub provides: EdgeType,
    /// Typed option values passed at init.
    #[serde(default)]
    pub options: BTreeMap<String, Vec<FieldValue>>,
    /// Keepalive timeout; 0 disables supervision.
    #[serde(default)]
    pub keepalive_ms: u64,
}

/// Typed node specifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSpec {
    /// Drop records that fail the predicate.
    Where { predicate: Predicate },
    /// Fill in missing fields and tags.
    Default {
        #[serde(default)]
        fields: Fields,
        #[serde(default)]
        tags: Tags,
    },
    /// Remove fields and tags. Removing a grouped tag regroups the point.
    Delete {
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Per-group rate of change of one field.
    Derivative {
        field: String,
        #[serde(default = "default_unit_ms")]
        unit_ms: u64,
        #[serde(default)]
        non_negative: bool,
        #[serde(default)]
        as_field: Option<String>,
    },
    /// Collect points into per-group batches by time span or count.
    Window {
        #[serde(default)]
        period_ms: u64,
        #[serde(default)]
        every_ms: u64,
        #[serde(default)]
        period_count: u64,
        #[serde(default)]
        every_count: u64,
    },
    /// Rewrite the grouping dimensions.
    GroupBy {
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        by_name: bool,
    },
    /// Coalesce near-simultaneous points into one wide point.
    Flatten {
        tags: Vec<String>,
        #[serde(default)]
        tolerance_ms: u64,
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
    /// Emit one point per k-subset of near-simultaneous points.
    Combine {
        k: usize,
        names: Vec<String>,
        #[serde(default)]
        tolerance_ms: u64,
        #[serde(default = "default_max_combinations")]
        max: u64,
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
    /// Merge any number of input edges, forwarding everything.
    Union {},
    /// Align points from N inputs on time and merge their fields.
    Join {
        names: Vec<String>,
        #[serde(default)]
        tolerance_ms: u64,
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
    /// Count consecutive records matching the predicate.
    StateCount {
        predicate: Predicate,
        #[serde(default = "default_state_field")]
        as_field: String,
    },
    /// Measure how long the predicate has held, in units of `unit_ms`.
    StateDuration {
        predicate: Predicate,
        #[serde(default = "default_state_field")]
        as_field: String,
        #[serde(default = "default_unit_ms")]
        unit_ms: u64,
    },
    /// Pass one record in `count`, or one per `every_ms`, per group.
    Sample {
        #[serde(default)]
        count: u64,
        #[serde(default)]
        every_ms: u64,
    },
    Alert(AlertSpec),
    /// Rewrite and re-inject records into the ingest path.
    Loopback {
        database: String,
        retention_policy: String,
        #[serde(default)]
        measurement: Option<String>,
        #[serde(default)]
        tags: Tags,
    },
    Udf(UdfSpec),
}

impl NodeSpec {
    /// Edge type this node emits given its input type.
    pub fn provides(&self, input: EdgeType) -> EdgeType {
        match self {
            NodeSpec::Window { .. } => EdgeType::Batch,
            NodeSpec::Combine { .. } => EdgeType::Stream,
            NodeSpec::Udf(spec) => spec.provides,
            _ => input,
        }
    }

    /// Edge type this node requires, when it is particular about it.
    pub fn wants(&self) -> Option<EdgeType> {
        match self {
            NodeSpec::Window { .. }
            | NodeSpec::Combine { .. }
            | NodeSpec::Derivative { .. }
            | NodeSpec::Flatten { .. }
            | NodeSpec::Join { .. }
            | NodeSpec::StateCount { .. }
            | NodeSpec::StateDuration { .. } => Some(EdgeType::Stream),
            NodeSpec::Udf(spec) => Some(spec.wants),
            _ => None,
        }
    }

    /// Human-readable node kind, for logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeSpec::Where { .. } => "where",
            NodeSpec::Default { .. } => "default",
            NodeSpec::Delete { .. } => "delete",
            NodeSpec::Derivative { .. } => "derivative",
            NodeSpec::Window { .. } => "window",
            NodeSpec::GroupBy { .. } => "group_by",
            NodeSpec::Flatten { .. } => "flatten",
            NodeSpec::Combine { .. } => "combine",
            NodeSpec::Union {} => "union",
            NodeSpec::Join { .. } => "join",
            NodeSpec::StateCount { .. } => "state_count",
            NodeSpec::StateDuration { .. } => "state_duration",
            NodeSpec::Sample { .. } => "sample",
            NodeSpec::Alert(_) => "alert",
            NodeSpec::Loopback { .. } => "loopback",
            NodeSpec::Udf(_) => "udf",
        }
    }
}

impl TaskDefinition {
    /// Structural validation: id uniqueness, edge endpoints, acyclicity,
    /// and the loopback self-write check.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() {
            return Err(CoreError::Definition("task id must not be empty".into()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(CoreError::Definition("node id must not be empty".into()));
            }
            if node.id == TASK_IN || node.id == TASK_OUT {
                return Err(CoreError::Definition(format!(
                    "node id {:?} is reserved",
                    node.id
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(CoreError::Definition(format!(
                    "duplicate node id {:?}",
                    node.id
                )));
            }
        }

        for (from, to) in &self.edges {
            if from != TASK_IN && !ids.contains(from.as_str()) {
                return Err(CoreError::Definition(format!(
                    "edge references unknown node {from:?}"
                )));
            }
            if to != TASK_OUT && !ids.contains(to.as_str()) {
                return Err(CoreError::Definition(format!(
                    "edge references unknown node {to:?}"
                )));
            }
            if from == TASK_OUT {
                return Err(CoreError::Definition(
                    "\"out\" cannot be an edge source".into(),
                ));
            }
            if to == TASK_IN {
                return Err(CoreError::Definition(
                    "\"in\" cannot be an edge target".into(),
                ));
            }
        }

        self.check_acyclic()?;

        for node in &self.nodes {
            if let NodeSpec::Loopback {
                database,
                retention_policy,
                ..
            } = &node.spec
            {
                let target = Dbrp {
                    database: database.clone(),
                    retention_policy: retention_policy.clone(),
                };
                if self.dbrps.contains(&target) {
                    return Err(CoreError::Definition(format!(
                        "loopback node {:?} would create an infinite loop: task already reads from DBRP {target}",
                        node.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Kahn's algorithm over the node graph; reserved endpoints cannot
    /// participate in a cycle so they are skipped.
    fn check_acyclic(&self) -> Result<(), CoreError> {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &self.edges {
            if from == TASK_IN || to == TASK_OUT {
                continue;
            }
            out.entry(from.as_str()).or_default().push(to.as_str());
            *indegree.entry(to.as_str()).or_default() += 1;
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            for next in out.get(id).into_iter().flatten() {
                let d = indegree.get_mut(next).expect("edge endpoints validated");
                *d -= 1;
                if *d == 0 {
                    ready.push(next);
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(CoreError::Definition(
                "pipeline contains a cycle".into(),
            ));
        }
        Ok(())
    }

    /// Start order: upstream nodes after their consumers, so every
    /// consumer is draining before its producer starts. Returns node ids
    /// leaves-first (reverse topological order).
    pub fn start_order(&self) -> Vec<&str> {
        let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut outdegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for (from, to) in &self.edges {
            if from == TASK_IN || to == TASK_OUT {
                continue;
            }
            out.entry(to.as_str()).or_default().push(from.as_str());
            *outdegree.entry(from.as_str()).or_default() += 1;
        }
        let mut ready: Vec<&str> = outdegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for next in out.get(id).into_iter().flatten() {
                let d = outdegree.get_mut(next).expect("edge endpoints validated");
                *d -= 1;
                if *d == 0 {
                    ready.push(next);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::CmpOp;

    fn where_node(id: &str) -> NodeDef {
        NodeDef {
            id: id.into(),
            spec: NodeSpec::Where {
                predicate: Predicate::Field {
                    field: "v".into(),
                    op: CmpOp::Gt,
                    value: FieldValue::Int(0),
                },
            },
        }
    }

    fn def(nodes: Vec<NodeDef>, edges: Vec<(&str, &str)>) -> TaskDefinition {
        TaskDefinition {
            id: "t1".into(),
            kind: EdgeType::Stream,
            dbrps: vec![Dbrp {
                database: "telegraf".into(),
                retention_policy: "autogen".into(),
            }],
            nodes,
            edges: edges
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    #[test]
    fn valid_chain() {
        let d = def(
            vec![where_node("w1"), where_node("w2")],
            vec![("in", "w1"), ("w1", "w2"), ("w2", "out")],
        );
        d.validate().unwrap();
        assert_eq!(d.start_order(), vec!["w2", "w1"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let d = def(
            vec![where_node("a"), where_node("b")],
            vec![("in", "a"), ("a", "b"), ("b", "a")],
        );
        let err = d.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn unknown_edge_endpoint_rejected() {
        let d = def(vec![where_node("a")], vec![("in", "a"), ("a", "ghost")]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn loopback_into_own_dbrp_rejected() {
        let mut d = def(vec![where_node("a")], vec![("in", "a")]);
        d.nodes.push(NodeDef {
            id: "lb".into(),
            spec: NodeSpec::Loopback {
                database: "telegraf".into(),
                retention_policy: "autogen".into(),
                measurement: None,
                tags: Tags::new(),
            },
        });
        d.edges.push(("a".into(), "lb".into()));
        let err = d.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("loop"), "{msg}");
        assert!(msg.contains("\"telegraf\".\"autogen\""), "{msg}");
    }

    #[test]
    fn yaml_definition_parses() {
        let src = r#"
id: cpu-alert
kind: stream
dbrps:
  - database: telegraf
    retention_policy: autogen
nodes:
  - id: hot
    type: where
    predicate: {kind: field, field: usage, op: gt, value: 80.0}
  - id: crit
    type: alert
    critical: {kind: field, field: usage, op: gt, value: 95.0}
    state_changes_only: true
edges:
  - [in, hot]
  - [hot, crit]
"#;
        let d: TaskDefinition = serde_yaml::from_str(src).unwrap();
        d.validate().unwrap();
        assert_eq!(d.nodes[1].spec.kind_name(), "alert");
    }
}
