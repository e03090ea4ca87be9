//! Plan graph domain types
//!
//! `PlanNode` is one task row, `PlanTree` is the in-memory projection of a
//! whole plan (node map plus parent -> ordered children adjacency).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Lifecycle status of a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet executed
    #[default]
    Pending,
    /// Execution in progress
    Running,
    /// Execution succeeded
    Completed,
    /// Execution failed (terminal for the attempt sequence)
    Failed,
    /// Generator chose not to do anything for this node
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Completed, Failed and Skipped are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StoreError::InvalidArgument(format!("unknown node status '{}'", other))),
        }
    }
}

/// One titled block of node context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSection {
    pub title: String,
    pub content: String,
}

impl ContextSection {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Context payload attached to a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeContext {
    /// Pre-rendered combined text
    #[serde(default)]
    pub combined: Option<String>,
    /// Ordered sections
    #[serde(default)]
    pub sections: Vec<ContextSection>,
    /// Free-form metadata about how the context was assembled
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl NodeContext {
    pub fn is_empty(&self) -> bool {
        self.combined.as_deref().is_none_or(str::is_empty) && self.sections.is_empty() && self.meta.is_empty()
    }

    /// Combined text if present, otherwise the sections joined as markdown
    pub fn render(&self) -> String {
        if let Some(combined) = self.combined.as_deref().filter(|c| !c.is_empty()) {
            return combined.to_string();
        }
        self.sections
            .iter()
            .map(|s| format!("## {}\n{}", s.title, s.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A task in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: i64,
    pub plan_id: i64,
    pub name: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    /// Sibling order, contiguous 0..N-1 under one parent
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub depth: i64,
    /// Materialized path, e.g. `/1/4/7`
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Ids of tasks this task depends on
    #[serde(default)]
    pub dependencies: BTreeSet<i64>,
    #[serde(default)]
    pub context: NodeContext,
    #[serde(default)]
    pub execution_result: Option<Value>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl PlanNode {
    /// Build a detached node (for in-memory trees and tests)
    pub fn new(plan_id: i64, id: i64, name: impl Into<String>, parent_id: Option<i64>) -> Self {
        let now = crate::now_ms();
        Self {
            id,
            plan_id,
            name: name.into(),
            status: NodeStatus::Pending,
            instruction: None,
            parent_id,
            position: 0,
            depth: 0,
            path: format!("/{}", id),
            metadata: Map::new(),
            dependencies: BTreeSet::new(),
            context: NodeContext::default(),
            execution_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if `other` is a strict ancestor of this node (path prefix check)
    pub fn is_descendant_of(&self, other: &PlanNode) -> bool {
        self.path.starts_with(&format!("{}/", other.path))
    }

    /// Leaf flag recorded by decomposition
    pub fn is_leaf(&self) -> bool {
        self.metadata.get("is_leaf").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Textual content of the execution result, if any
    pub fn result_content(&self) -> Option<&str> {
        self.execution_result
            .as_ref()
            .and_then(|r| r.get("content"))
            .and_then(Value::as_str)
    }
}

/// Summary row from the plan registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub task_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

/// In-memory projection of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PlanTreeWire", into = "PlanTreeWire")]
pub struct PlanTree {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
    pub nodes: BTreeMap<i64, PlanNode>,
    adjacency: BTreeMap<Option<i64>, Vec<i64>>,
}

/// Serialized shape of a PlanTree (adjacency is derived)
#[derive(Serialize, Deserialize)]
struct PlanTreeWire {
    id: i64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    nodes: Vec<PlanNode>,
}

impl From<PlanTreeWire> for PlanTree {
    fn from(wire: PlanTreeWire) -> Self {
        let mut tree = PlanTree::new(wire.id, wire.title, wire.description, wire.metadata);
        for node in wire.nodes {
            tree.nodes.insert(node.id, node);
        }
        tree.rebuild_adjacency();
        tree
    }
}

impl From<PlanTree> for PlanTreeWire {
    fn from(tree: PlanTree) -> Self {
        Self {
            id: tree.id,
            title: tree.title,
            description: tree.description,
            metadata: tree.metadata,
            nodes: tree.nodes.into_values().collect(),
        }
    }
}

impl PlanTree {
    /// Empty tree
    pub fn new(id: i64, title: impl Into<String>, description: Option<String>, metadata: Map<String, Value>) -> Self {
        Self {
            id,
            title: title.into(),
            description,
            metadata,
            nodes: BTreeMap::new(),
            adjacency: BTreeMap::new(),
        }
    }

    /// Insert or replace a node; call `rebuild_adjacency` after a batch
    pub fn insert(&mut self, node: PlanNode) {
        self.nodes.insert(node.id, node);
    }

    /// Recompute parent -> children lists ordered by (position, id)
    pub fn rebuild_adjacency(&mut self) {
        let mut adjacency: BTreeMap<Option<i64>, Vec<(i64, i64)>> = BTreeMap::new();
        for node in self.nodes.values() {
            adjacency
                .entry(node.parent_id)
                .or_default()
                .push((node.position, node.id));
        }
        self.adjacency = adjacency
            .into_iter()
            .map(|(parent, mut kids)| {
                kids.sort();
                (parent, kids.into_iter().map(|(_, id)| id).collect())
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Ordered children of `parent` (None = root level)
    pub fn children_of(&self, parent: Option<i64>) -> &[i64] {
        self.adjacency.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ordered root ids
    pub fn roots(&self) -> &[i64] {
        self.children_of(None)
    }

    /// Ordered children of a node
    pub fn children(&self, id: i64) -> &[i64] {
        self.children_of(Some(id))
    }

    pub fn has_children(&self, id: i64) -> bool {
        !self.children(id).is_empty()
    }

    /// Parent chain from nearest to farthest
    pub fn ancestors(&self, id: i64) -> Vec<i64> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = self.get(id).and_then(|n| n.parent_id);
        while let Some(pid) = current {
            if !seen.insert(pid) {
                break;
            }
            out.push(pid);
            current = self.get(pid).and_then(|n| n.parent_id);
        }
        out
    }

    /// Indented outline of the plan, depth-limited relative to the roots
    pub fn outline(&self, max_depth: Option<i64>) -> String {
        let mut lines = Vec::new();
        let mut stack: Vec<(i64, i64)> = self.roots().iter().rev().map(|id| (*id, 0)).collect();

        while let Some((id, level)) = stack.pop() {
            let Some(node) = self.get(id) else { continue };
            lines.push(format!(
                "{}- [{}] {} (#{})",
                "  ".repeat(level as usize),
                node.status,
                node.name,
                node.id
            ));
            if max_depth.is_some_and(|max| level >= max) {
                continue;
            }
            for child in self.children(id).iter().rev() {
                stack.push((*child, level + 1));
            }
        }

        lines.join("\n")
    }
}

/// Where to insert a new task relative to an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    Before,
    After,
    FirstChild,
    LastChild,
}

impl FromStr for AnchorKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            "first_child" => Ok(Self::FirstChild),
            "last_child" => Ok(Self::LastChild),
            other => Err(StoreError::InvalidArgument(format!("unknown anchor '{}'", other))),
        }
    }
}

/// Relative insertion directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub kind: AnchorKind,
    /// Sibling for before/after, parent for first_child/last_child
    pub task_id: i64,
}

impl Anchor {
    pub fn new(kind: AnchorKind, task_id: i64) -> Self {
        Self { kind, task_id }
    }
}

/// Input for `PlanStore::create_task`
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub parent_id: Option<i64>,
    pub instruction: Option<String>,
    pub metadata: Map<String, Value>,
    pub dependencies: Vec<i64>,
    pub position: Option<i64>,
    pub anchor: Option<Anchor>,
    pub context: NodeContext,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<i64>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_anchor(mut self, kind: AnchorKind, task_id: i64) -> Self {
        self.anchor = Some(Anchor::new(kind, task_id));
        self
    }

    pub fn with_context(mut self, context: NodeContext) -> Self {
        self.context = context;
        self
    }
}

/// Partial update for `PlanStore::update_task`
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub status: Option<NodeStatus>,
    pub instruction: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    /// Replaces the full edge set when present
    pub dependencies: Option<Vec<i64>>,
    pub context: Option<NodeContext>,
    pub execution_result: Option<Value>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.status.is_none()
            && self.instruction.is_none()
            && self.metadata.is_none()
            && self.dependencies.is_none()
            && self.context.is_none()
            && self.execution_result.is_none()
    }

    /// Status + result pair written after an execution attempt
    pub fn execution(status: NodeStatus, result: Value) -> Self {
        Self {
            status: Some(status),
            execution_result: Some(result),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> PlanTree {
        let mut tree = PlanTree::new(1, "Plan", None, Map::new());
        let mut root = PlanNode::new(1, 1, "Root", None);
        root.path = "/1".into();
        let mut a = PlanNode::new(1, 2, "A", Some(1));
        a.path = "/1/2".into();
        a.depth = 1;
        a.position = 1;
        let mut b = PlanNode::new(1, 3, "B", Some(1));
        b.path = "/1/3".into();
        b.depth = 1;
        b.position = 0;
        let mut c = PlanNode::new(1, 4, "C", Some(2));
        c.path = "/1/2/4".into();
        c.depth = 2;
        for n in [root, a, b, c] {
            tree.insert(n);
        }
        tree.rebuild_adjacency();
        tree
    }

    #[test]
    fn test_node_status_roundtrip_strings() {
        for status in [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_adjacency_orders_by_position() {
        let tree = sample_tree();
        assert_eq!(tree.roots(), &[1]);
        assert_eq!(tree.children(1), &[3, 2]);
        assert_eq!(tree.children(2), &[4]);
        assert!(!tree.has_children(4));
    }

    #[test]
    fn test_ancestors() {
        let tree = sample_tree();
        assert_eq!(tree.ancestors(4), vec![2, 1]);
        assert!(tree.ancestors(1).is_empty());
    }

    #[test]
    fn test_outline_depth_limit() {
        let tree = sample_tree();
        let full = tree.outline(None);
        assert_eq!(full.lines().count(), 4);
        assert!(full.contains("    - [pending] C (#4)"));

        let shallow = tree.outline(Some(1));
        assert_eq!(shallow.lines().count(), 3);
        assert!(!shallow.contains("C (#4)"));
    }

    #[test]
    fn test_is_descendant_of() {
        let tree = sample_tree();
        let c = tree.get(4).unwrap();
        assert!(c.is_descendant_of(tree.get(1).unwrap()));
        assert!(c.is_descendant_of(tree.get(2).unwrap()));
        assert!(!c.is_descendant_of(tree.get(3).unwrap()));
        assert!(!c.is_descendant_of(c));
    }

    #[test]
    fn test_tree_serde_rebuilds_adjacency() {
        let tree = sample_tree();
        let json = serde_json::to_string(&tree).unwrap();
        let back: PlanTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back.children(1), &[3, 2]);
        assert_eq!(back, tree);
    }

    #[test]
    fn test_anchor_kind_parse() {
        assert_eq!("first-child".parse::<AnchorKind>().unwrap(), AnchorKind::FirstChild);
        assert_eq!("AFTER".parse::<AnchorKind>().unwrap(), AnchorKind::After);
        assert!("inside".parse::<AnchorKind>().is_err());
    }

    #[test]
    fn test_context_render() {
        let mut ctx = NodeContext::default();
        assert!(ctx.is_empty());
        ctx.sections.push(ContextSection::new("Goal", "ship it"));
        assert_eq!(ctx.render(), "## Goal\nship it");
        ctx.combined = Some("all in one".into());
        assert_eq!(ctx.render(), "all in one");
    }
}
