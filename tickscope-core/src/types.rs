//! Core domain types for tickscope
//!
//! These types describe captures (time-series logs of simulation ticks), the
//! sources they are read from, and the derivations computed over them.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Capture** | One logical time-series log, identified by a capture id |
//! | **Tick** | The discrete time index of one record in a capture |
//! | **Frame** | One capture record, normalized to `{tick, entities}` |
//! | **Live stream** | A capture source that may still be growing, polled incrementally |
//! | **Derivation** | A metric computed tick-by-tick from one or more existing metrics |
//! | **Display** | The single authoritative UI-facing control session |
//! | **Agent** | Any number of automation-facing control sessions |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================
// Frames
// ============================================

/// Components of one entity, keyed by component id.
pub type ComponentMap = BTreeMap<String, Value>;

/// Entities of one frame, keyed by entity id.
pub type EntityMap = BTreeMap<String, ComponentMap>;

/// One normalized capture record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub tick: u64,
    #[serde(default)]
    pub entities: EntityMap,
}

impl CaptureRecord {
    pub fn new(tick: u64) -> Self {
        Self {
            tick,
            entities: EntityMap::new(),
        }
    }

    /// Merge another record of the same tick into this one.
    ///
    /// Later components overwrite same-named earlier ones.
    pub fn merge(&mut self, other: CaptureRecord) {
        for (entity_id, components) in other.entities {
            self.entities
                .entry(entity_id)
                .or_default()
                .extend(components);
        }
    }

    /// Set a single component value.
    pub fn set(&mut self, entity_id: &str, component_id: &str, value: Value) {
        self.entities
            .entry(entity_id.to_string())
            .or_default()
            .insert(component_id.to_string(), value);
    }

    /// Look up a value by `[entity, component, key...]`.
    pub fn value_at(&self, path: &[String]) -> Option<&Value> {
        let (entity, rest) = path.split_first()?;
        let (component, keys) = rest.split_first()?;
        let mut current = self.entities.get(entity)?.get(component)?;
        for key in keys {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Approximate in-memory footprint, used for cache budgeting.
    pub fn approx_size(&self) -> usize {
        fn value_size(value: &Value) -> usize {
            match value {
                Value::Null | Value::Bool(_) => 8,
                Value::Number(_) => 16,
                Value::String(s) => 24 + s.len(),
                Value::Array(items) => 24 + items.iter().map(value_size).sum::<usize>(),
                Value::Object(map) => {
                    32 + map
                        .iter()
                        .map(|(k, v)| 24 + k.len() + value_size(v))
                        .sum::<usize>()
                }
            }
        }

        let mut size = 48;
        for (entity_id, components) in &self.entities {
            size += 48 + entity_id.len();
            for (component_id, value) in components {
                size += 32 + component_id.len() + value_size(value);
            }
        }
        size
    }
}

// ============================================
// Component shape
// ============================================

/// Value-type tag of a component tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    String,
    Boolean,
    Array,
    Object,
    Null,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }

    /// Combine a previously observed type with a newly observed one.
    ///
    /// `Null` never replaces a concrete type.
    pub fn merge(self, incoming: ValueType) -> ValueType {
        if incoming == ValueType::Null {
            self
        } else {
            incoming
        }
    }
}

/// One node of a capture's discovered shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentNode {
    /// Path segments joined with `/`
    pub id: String,
    /// Display label (last path segment)
    pub label: String,
    /// `[entity, component, key...]`
    pub path: Vec<String>,
    /// Children sorted by label
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ComponentNode>,
    pub leaf: bool,
    pub value_type: ValueType,
}

impl ComponentNode {
    pub fn new(path: Vec<String>) -> Self {
        Self {
            id: path.join("/"),
            label: path.last().cloned().unwrap_or_default(),
            path,
            children: Vec::new(),
            leaf: true,
            value_type: ValueType::Null,
        }
    }

    /// Find or insert the child with `label`, keeping children sorted.
    pub fn child_mut(&mut self, label: &str) -> (&mut ComponentNode, bool) {
        match self
            .children
            .binary_search_by(|c| c.label.as_str().cmp(label))
        {
            Ok(idx) => (&mut self.children[idx], false),
            Err(idx) => {
                let mut path = self.path.clone();
                path.push(label.to_string());
                self.children.insert(idx, ComponentNode::new(path));
                (&mut self.children[idx], true)
            }
        }
    }

    /// Number of nodes in this subtree, including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ComponentNode::node_count).sum::<usize>()
    }

    /// Leaf paths in this subtree.
    pub fn leaf_paths(&self, out: &mut Vec<Vec<String>>) {
        if self.leaf {
            out.push(self.path.clone());
        }
        for child in &self.children {
            child.leaf_paths(out);
        }
    }
}

// ============================================
// Capture sources
// ============================================

/// How a live stream delivers frames to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Frames stay in the cache; the display gets tick-only notifications
    #[default]
    Lite,
    /// Every frame is streamed
    Full,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Lite => "lite",
            StreamMode::Full => "full",
        }
    }
}

impl std::str::FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lite" => Ok(StreamMode::Lite),
            "full" => Ok(StreamMode::Full),
            _ => Err(format!("unknown stream mode: {}", s)),
        }
    }
}

/// Where a capture source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Upload,
    File,
    Url,
    Live,
    Derived,
}

impl SourceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOrigin::Upload => "upload",
            SourceOrigin::File => "file",
            SourceOrigin::Url => "url",
            SourceOrigin::Live => "live",
            SourceOrigin::Derived => "derived",
        }
    }
}

impl std::str::FromStr for SourceOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(SourceOrigin::Upload),
            "file" => Ok(SourceOrigin::File),
            "url" => Ok(SourceOrigin::Url),
            "live" => Ok(SourceOrigin::Live),
            "derived" => Ok(SourceOrigin::Derived),
            _ => Err(format!("unknown source origin: {}", s)),
        }
    }
}

/// A capture id's source locator and display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSource {
    pub capture_id: String,
    pub locator: String,
    pub display_name: String,
    pub stream_mode: StreamMode,
    pub origin: SourceOrigin,
    /// Poll interval for live sources
    pub poll_interval_ms: Option<u64>,
    /// Whether a live stream should be re-armed after restart
    pub live: bool,
    pub created_at: DateTime<Utc>,
}

impl CaptureSource {
    pub fn new(capture_id: &str, locator: &str, origin: SourceOrigin) -> Self {
        Self {
            capture_id: capture_id.to_string(),
            locator: locator.to_string(),
            display_name: default_display_name(locator),
            stream_mode: StreamMode::default(),
            origin,
            poll_interval_ms: None,
            live: false,
            created_at: Utc::now(),
        }
    }
}

/// File name (or URL tail) used when no display name is given.
pub fn default_display_name(locator: &str) -> String {
    locator
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(locator)
        .to_string()
}

/// A parsed source locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Http(String),
}

impl Locator {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Locator::Http(trimmed.to_string())
        } else if let Some(path) = trimmed.strip_prefix("file://") {
            Locator::File(PathBuf::from(path))
        } else {
            Locator::File(PathBuf::from(trimmed))
        }
    }

    pub fn origin(&self) -> SourceOrigin {
        match self {
            Locator::File(_) => SourceOrigin::File,
            Locator::Http(_) => SourceOrigin::Url,
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Http(url) => write!(f, "{}", url),
        }
    }
}

// ============================================
// Metrics and derivations
// ============================================

/// A metric inside a capture: `[entity, component, key...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricRef {
    pub capture_id: String,
    pub path: Vec<String>,
}

impl MetricRef {
    pub fn new(capture_id: &str, path: &[&str]) -> Self {
        Self {
            capture_id: capture_id.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Parse a dotted path such as `e1.c1.x`.
    pub fn parse_path(path: &str) -> Option<Vec<String>> {
        let segments: Vec<String> = path
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        (segments.len() >= 2).then_some(segments)
    }

    /// Numeric value of this metric in `record`, `None` for null/missing/non-numeric.
    pub fn extract(&self, record: &CaptureRecord) -> Option<f64> {
        record
            .value_at(&self.path)
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
    }

    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

impl std::fmt::Display for MetricRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.capture_id, self.dotted_path())
    }
}

impl std::str::FromStr for MetricRef {
    type Err = String;

    /// `capture_id:entity.component.key`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (capture_id, path) = s
            .split_once(':')
            .ok_or_else(|| format!("metric reference missing capture id: {}", s))?;
        if capture_id.is_empty() {
            return Err(format!("metric reference missing capture id: {}", s));
        }
        let path = MetricRef::parse_path(path)
            .ok_or_else(|| format!("metric path needs entity and component: {}", s))?;
        Ok(MetricRef {
            capture_id: capture_id.to_string(),
            path,
        })
    }
}

/// A named set of input metrics and the metrics derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationGroup {
    pub id: String,
    pub name: String,
    pub input_metrics: Vec<MetricRef>,
    #[serde(default)]
    pub derived_metrics: Vec<MetricRef>,
    #[serde(default)]
    pub plugin_id: Option<String>,
}

impl DerivationGroup {
    /// Check structural invariants.
    ///
    /// Inputs must be non-empty and disjoint from derived outputs.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err("group id and name are required".to_string());
        }
        if self.input_metrics.is_empty() {
            return Err("group needs at least one input metric".to_string());
        }
        if let Some(overlap) = self
            .derived_metrics
            .iter()
            .find(|m| self.input_metrics.contains(m))
        {
            return Err(format!(
                "metric {} cannot be both an input and a derived output",
                overlap
            ));
        }
        Ok(())
    }
}

/// Which transform a derivation job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// A zero window means the configured default
    MovingAverage {
        #[serde(default)]
        window: usize,
    },
    Diff,
    /// An empty id means the group's plugin
    Plugin {
        #[serde(default)]
        plugin_id: String,
    },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::MovingAverage { .. } => "moving_average",
            JobKind::Diff => "diff",
            JobKind::Plugin { .. } => "plugin",
        }
    }
}

/// Lifecycle of a derivation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Status report for one derivation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    #[serde(flatten)]
    pub kind: JobKind,
    pub group_id: String,
    pub output_capture_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub ticks_emitted: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================
// Plugins
// ============================================

/// Stored result of validating an uploaded plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub output_keys: Vec<String>,
    pub content_hash: String,
    pub file_name: String,
    pub valid: bool,
    pub validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Hex SHA-256 of `bytes`, used to address uploads and plugin files.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
