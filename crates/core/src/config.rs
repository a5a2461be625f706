//! Service configuration.
//!
//! Two layers: the env-driven daemon [`RuntimeConfig`] read once at
//! startup, and the dynamic [`ConfigService`] that holds named sections
//! of typed options, applies overrides by producing a fresh immutable
//! snapshot, and notifies per-section subscribers of the new snapshot.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Daemon config ─────────────────────────────────────────────

/// Static daemon configuration, read from `STROM_*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of every edge allocated for a task.
    pub edge_capacity: usize,
    /// Default UDF keepalive timeout; 0 disables supervision.
    pub udf_keepalive_ms: u64,
    /// Directory task definition files are loaded from.
    pub task_dir: PathBuf,
}

impl RuntimeConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            host: env_or("STROM_HOST", "0.0.0.0"),
            port: env_u16("STROM_PORT", 9092),
            edge_capacity: env_u64("STROM_EDGE_CAPACITY", 1000) as usize,
            udf_keepalive_ms: env_u64("STROM_UDF_KEEPALIVE_MS", 10_000),
            task_dir: PathBuf::from(env_or("STROM_TASK_DIR", "tasks")),
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  server: {}:{}", self.host, self.port);
        tracing::info!("  edges:  capacity={}", self.edge_capacity);
        tracing::info!("  udf:    keepalive_ms={}", self.udf_keepalive_ms);
        tracing::info!("  tasks:  dir={}", self.task_dir.display());
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9092,
            edge_capacity: 1000,
            udf_keepalive_ms: 10_000,
            task_dir: PathBuf::from("tasks"),
        }
    }
}

// ── Dynamic section config ────────────────────────────────────

/// One configurable element: a bag of typed options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub options: BTreeMap<String, serde_json::Value>,
}

/// A named config section holding one or more elements keyed by id.
/// Single-element sections use the empty-string element id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Section {
    pub elements: BTreeMap<String, Element>,
}

/// A complete, immutable configuration state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub sections: BTreeMap<String, Section>,
}

/// An update to one element of one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    #[serde(default)]
    pub section: String,
    /// Element id; empty for single-element sections.
    #[serde(default)]
    pub element: String,
    pub options: BTreeMap<String, serde_json::Value>,
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Holds the current config snapshot and notifies subscribers on change.
///
/// Readers clone the `Arc` and never observe a partially-applied
/// override: each override builds a complete new snapshot which is
/// swapped in under the lock.
pub struct ConfigService {
    current: RwLock<Arc<ConfigSnapshot>>,
    subscribers: std::sync::Mutex<HashMap<String, Vec<watch::Sender<Arc<Section>>>>>,
}

impl ConfigService {
    pub fn new(base: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(base)),
            subscribers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read().expect("config lock poisoned"))
    }

    /// Subscribe to updates of one section. The receiver starts with the
    /// section's current state and yields a fresh snapshot per override.
    pub fn subscribe(&self, section: &str) -> Result<watch::Receiver<Arc<Section>>, CoreError> {
        let snap = self.snapshot();
        let current = snap
            .sections
            .get(section)
            .cloned()
            .ok_or_else(|| CoreError::UnknownSection(section.to_string()))?;
        let (tx, rx) = watch::channel(Arc::new(current));
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(section.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Apply a typed override: every option must exist in the target
    /// element and carry a value of the same JSON kind. On success the
    /// new snapshot becomes current and section subscribers are notified.
    pub fn apply(&self, ov: &Override) -> Result<Arc<ConfigSnapshot>, CoreError> {
        let mut next = (*self.snapshot()).clone();
        {
            let section = next
                .sections
                .get_mut(&ov.section)
                .ok_or_else(|| CoreError::UnknownSection(ov.section.clone()))?;
            let element = section.elements.get_mut(&ov.element).ok_or_else(|| {
                CoreError::UnknownElement {
                    section: ov.section.clone(),
                    element: ov.element.clone(),
                }
            })?;
            for (option, value) in &ov.options {
                let existing =
                    element
                        .options
                        .get(option)
                        .ok_or_else(|| CoreError::UnknownOption {
                            section: ov.section.clone(),
                            option: option.clone(),
                        })?;
                if json_kind(existing) != json_kind(value) && !existing.is_null() {
                    return Err(CoreError::OptionType {
                        option: option.clone(),
                        expected: json_kind(existing),
                        got: json_kind(value),
                    });
                }
                element.options.insert(option.clone(), value.clone());
            }
        }

        let next = Arc::new(next);
        *self.current.write().expect("config lock poisoned") = Arc::clone(&next);

        let updated = next
            .sections
            .get(&ov.section)
            .cloned()
            .expect("section just updated");
        let updated = Arc::new(updated);
        let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
        if let Some(senders) = subs.get_mut(&ov.section) {
            senders.retain(|tx| tx.send(Arc::clone(&updated)).is_ok());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> ConfigSnapshot {
        let mut sections = BTreeMap::new();
        let mut elements = BTreeMap::new();
        elements.insert(
            "".to_string(),
            Element {
                options: [
                    ("enabled".to_string(), json!(false)),
                    ("url".to_string(), json!("http://localhost")),
                ]
                .into(),
            },
        );
        sections.insert("alerts".to_string(), Section { elements });
        ConfigSnapshot { sections }
    }

    #[test]
    fn apply_swaps_snapshot() {
        let svc = ConfigService::new(base());
        let before = svc.snapshot();
        svc.apply(&Override {
            section: "alerts".into(),
            element: "".into(),
            options: [("enabled".to_string(), json!(true))].into(),
        })
        .unwrap();
        let after = svc.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(
            after.sections["alerts"].elements[""].options["enabled"],
            json!(true)
        );
        // The old snapshot is untouched.
        assert_eq!(
            before.sections["alerts"].elements[""].options["enabled"],
            json!(false)
        );
    }

    #[test]
    fn unknown_targets_are_user_errors() {
        let svc = ConfigService::new(base());
        assert!(matches!(
            svc.apply(&Override {
                section: "nope".into(),
                element: "".into(),
                options: BTreeMap::new(),
            }),
            Err(CoreError::UnknownSection(_))
        ));
        assert!(matches!(
            svc.apply(&Override {
                section: "alerts".into(),
                element: "".into(),
                options: [("ghost".to_string(), json!(1))].into(),
            }),
            Err(CoreError::UnknownOption { .. })
        ));
        assert!(matches!(
            svc.apply(&Override {
                section: "alerts".into(),
                element: "".into(),
                options: [("enabled".to_string(), json!("yes"))].into(),
            }),
            Err(CoreError::OptionType { .. })
        ));
    }

    #[tokio::test]
    async fn subscribers_see_new_snapshot() {
        let svc = ConfigService::new(base());
        let mut rx = svc.subscribe("alerts").unwrap();
        assert_eq!(rx.borrow().elements[""].options["enabled"], json!(false));

        svc.apply(&Override {
            section: "alerts".into(),
            element: "".into(),
            options: [("enabled".to_string(), json!(true))].into(),
        })
        .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().elements[""].options["enabled"], json!(true));
    }
}
