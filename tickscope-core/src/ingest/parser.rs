//! Capture line parsing and component shape discovery.
//!
//! Two line shapes are accepted:
//!
//! ```text
//! {"tick":1,"entities":{"e1":{"c1":{"x":1}}}}            frame
//! {"tick":1,"entityId":"e1","componentId":"c1","value":1} record
//! ```
//!
//! Anything else is skipped without error; captures are allowed to contain
//! the occasional corrupt line.

use crate::types::{CaptureRecord, ComponentMap, ComponentNode, ValueType};
use serde_json::{Map, Value};

/// A successfully parsed capture line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A full entity map for one tick
    Frame(CaptureRecord),
    /// A single entity/component value for one tick
    Record(CaptureRecord),
}

impl ParsedLine {
    pub fn tick(&self) -> u64 {
        match self {
            ParsedLine::Frame(r) | ParsedLine::Record(r) => r.tick,
        }
    }

    pub fn into_record(self) -> CaptureRecord {
        match self {
            ParsedLine::Frame(r) | ParsedLine::Record(r) => r,
        }
    }
}

/// Parse one raw line. Returns `None` for any unrecognized shape.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    let tick = parse_tick(obj.get("tick")?)?;

    if let Some(entities) = obj.get("entities") {
        let entities = entities.as_object()?;
        let mut record = CaptureRecord::new(tick);
        for (entity_id, components) in entities {
            // Non-object entity entries are dropped, the rest of the frame survives
            let Some(components) = components.as_object() else {
                continue;
            };
            let map: ComponentMap = components
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            record.entities.insert(entity_id.clone(), map);
        }
        return Some(ParsedLine::Frame(record));
    }

    let entity_id = obj.get("entityId")?.as_str()?;
    let component_id = obj.get("componentId")?.as_str()?;
    let value = obj.get("value")?;
    let mut record = CaptureRecord::new(tick);
    record.set(entity_id, component_id, value.clone());
    Some(ParsedLine::Record(record))
}

/// Ticks are finite numbers of at least 1; fractions truncate toward zero.
fn parse_tick(value: &Value) -> Option<u64> {
    let tick = match value.as_u64() {
        Some(t) => t,
        None => {
            let t = value.as_f64()?;
            if !t.is_finite() || t < 0.0 {
                return None;
            }
            t.trunc() as u64
        }
    };
    (tick >= 1).then_some(tick)
}

/// Merges consecutive same-tick lines into one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameAssembler {
    pending: Option<CaptureRecord>,
    skipped: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Returns the previous frame once the tick changes.
    pub fn push_line(&mut self, line: &str) -> Option<CaptureRecord> {
        match parse_line(line) {
            Some(parsed) => self.push(parsed.into_record()),
            None => {
                self.skipped += 1;
                tracing::trace!(line_len = line.len(), "Skipping unrecognized capture line");
                None
            }
        }
    }

    /// Feed one parsed record.
    pub fn push(&mut self, record: CaptureRecord) -> Option<CaptureRecord> {
        match &mut self.pending {
            Some(pending) if pending.tick == record.tick => {
                pending.merge(record);
                None
            }
            _ => self.pending.replace(record),
        }
    }

    /// Emit the frame still being assembled, if any.
    pub fn flush(&mut self) -> Option<CaptureRecord> {
        self.pending.take()
    }

    /// Drop any half-assembled frame.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// Lines skipped as malformed so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// The discovered shape of a capture's entities.
///
/// Roots are entities, their children components, and below that the keys
/// of nested JSON objects. Arrays are leaves. The tree only grows.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentTree {
    root: ComponentNode,
}

impl Default for ComponentTree {
    fn default() -> Self {
        Self {
            root: ComponentNode::new(Vec::new()),
        }
    }
}

impl ComponentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from previously reported roots.
    pub fn from_nodes(nodes: Vec<ComponentNode>) -> Self {
        let mut tree = Self::default();
        tree.root.children = nodes;
        tree.root.leaf = tree.root.children.is_empty();
        tree
    }

    /// Fold one frame's shape into the tree. Returns true if anything changed.
    pub fn observe(&mut self, record: &CaptureRecord) -> bool {
        let mut changed = false;
        for (entity_id, components) in &record.entities {
            let (entity, created) = self.root.child_mut(entity_id);
            changed |= created;
            changed |= mark_object(entity);
            for (component_id, value) in components {
                let (component, created) = entity.child_mut(component_id);
                changed |= created;
                changed |= observe_value(component, value);
            }
        }
        if changed {
            self.root.leaf = false;
        }
        changed
    }

    /// Entity nodes, sorted by id.
    pub fn nodes(&self) -> &[ComponentNode] {
        &self.root.children
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Total node count below the (implicit) root.
    pub fn node_count(&self) -> usize {
        self.root.node_count() - 1
    }

    /// Paths of every leaf (candidate metrics).
    pub fn leaf_paths(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for node in &self.root.children {
            node.leaf_paths(&mut out);
        }
        out
    }

    /// Look up a node by path.
    pub fn find(&self, path: &[String]) -> Option<&ComponentNode> {
        let mut node = &self.root;
        for segment in path {
            node = node.children.iter().find(|c| &c.label == segment)?;
        }
        (!path.is_empty()).then_some(node)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn mark_object(node: &mut ComponentNode) -> bool {
    let changed = node.leaf || node.value_type != ValueType::Object;
    node.leaf = false;
    node.value_type = ValueType::Object;
    changed
}

fn observe_value(node: &mut ComponentNode, value: &Value) -> bool {
    match value {
        Value::Object(map) => observe_object(node, map),
        other => {
            let merged = node.value_type.merge(ValueType::of(other));
            let leaf = node.children.is_empty();
            let changed = merged != node.value_type || leaf != node.leaf;
            node.value_type = merged;
            node.leaf = leaf;
            changed
        }
    }
}

fn observe_object(node: &mut ComponentNode, map: &Map<String, Value>) -> bool {
    let mut changed = false;
    if map.is_empty() {
        // An empty object adds no keys; keep it as a typed leaf until keys show up
        let merged = node.value_type.merge(ValueType::Object);
        changed |= merged != node.value_type;
        node.value_type = merged;
        return changed;
    }
    changed |= mark_object(node);
    for (key, child_value) in map {
        let (child, created) = node.child_mut(key);
        changed |= created;
        changed |= observe_value(child, child_value);
    }
    changed
}
