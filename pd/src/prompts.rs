//! Prompt construction
//!
//! Templates are `.pmt` files using Handlebars syntax, compiled into the
//! binary. `DefaultPromptBuilder` renders them from a plan snapshot.

use handlebars::Handlebars;
use planstore::{PlanNode, PlanTree};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Task execution prompt
pub const EXECUTE_TEMPLATE: &str = include_str!("../prompts/execute.pmt");

/// Decomposition prompt
pub const DECOMPOSE_TEMPLATE: &str = include_str!("../prompts/decompose.pmt");

/// Longest result excerpt copied into a prompt
const MAX_RESULT_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Failed to render template {name}: {source}")]
    Render {
        name: &'static str,
        #[source]
        source: handlebars::RenderError,
    },
}

/// Builds the text sent to the generator
pub trait PromptBuilder: Send + Sync {
    /// Prompt for executing one task
    fn execution_prompt(&self, tree: &PlanTree, node: &PlanNode, include_outline: bool) -> Result<String, PromptError>;

    /// Prompt asking for the children of `target` (None = the plan root)
    fn decomposition_prompt(
        &self,
        tree: &PlanTree,
        target: Option<&PlanNode>,
        max_children: usize,
    ) -> Result<String, PromptError>;
}

#[derive(Debug, Clone, Serialize)]
struct TaskView {
    id: i64,
    name: String,
    path: String,
    depth: i64,
    status: String,
    instruction: Option<String>,
    context: Option<String>,
    result: Option<String>,
}

impl TaskView {
    fn from_node(node: &PlanNode) -> Self {
        let context = node.context.render();
        Self {
            id: node.id,
            name: node.name.clone(),
            path: node.path.clone(),
            depth: node.depth,
            status: node.status.to_string(),
            instruction: node.instruction.clone().filter(|s| !s.trim().is_empty()),
            context: (!context.is_empty()).then_some(context),
            result: result_excerpt(node),
        }
    }
}

/// Context for `execute.pmt`
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPromptContext {
    plan_title: String,
    task: TaskView,
    parent: Option<TaskView>,
    dependencies: Vec<TaskView>,
    outline: Option<String>,
}

/// Context for `decompose.pmt`
#[derive(Debug, Clone, Serialize)]
pub struct DecompositionPromptContext {
    plan_title: String,
    plan_description: Option<String>,
    outline: Option<String>,
    target: Option<TaskView>,
    existing_children: Vec<String>,
    max_children: usize,
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n[truncated]");
    out
}

/// Text form of a node's execution result
fn result_excerpt(node: &PlanNode) -> Option<String> {
    let text = match (&node.execution_result, node.result_content()) {
        (_, Some(content)) => content.to_string(),
        (Some(Value::Null) | None, None) => return None,
        (Some(other), None) => other.to_string(),
    };
    (!text.trim().is_empty()).then(|| truncate(&text, MAX_RESULT_CHARS))
}

impl ExecutionPromptContext {
    pub fn build(tree: &PlanTree, node: &PlanNode, include_outline: bool) -> Self {
        let parent = node.parent_id.and_then(|pid| tree.get(pid)).map(TaskView::from_node);
        let dependencies = node
            .dependencies
            .iter()
            .filter_map(|id| tree.get(*id))
            .map(TaskView::from_node)
            .collect();
        let outline = include_outline.then(|| tree.outline(None)).filter(|o| !o.is_empty());
        Self {
            plan_title: tree.title.clone(),
            task: TaskView::from_node(node),
            parent,
            dependencies,
            outline,
        }
    }
}

impl DecompositionPromptContext {
    pub fn build(tree: &PlanTree, target: Option<&PlanNode>, max_children: usize) -> Self {
        let existing_children = tree
            .children_of(target.map(|t| t.id))
            .iter()
            .filter_map(|id| tree.get(*id))
            .map(|n| n.name.clone())
            .collect();
        let outline = tree.outline(None);
        Self {
            plan_title: tree.title.clone(),
            plan_description: tree.description.clone().filter(|d| !d.trim().is_empty()),
            outline: (!outline.is_empty()).then_some(outline),
            target: target.map(TaskView::from_node),
            existing_children,
            max_children,
        }
    }
}

/// Renders the embedded templates
pub struct DefaultPromptBuilder {
    hbs: Handlebars<'static>,
}

impl Default for DefaultPromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultPromptBuilder {
    pub fn new() -> Self {
        let mut hbs = Handlebars::new();
        // prompts are plain text, not HTML
        hbs.register_escape_fn(handlebars::no_escape);
        Self { hbs }
    }

    fn render<T: Serialize>(&self, name: &'static str, template: &str, context: &T) -> Result<String, PromptError> {
        self.hbs
            .render_template(template, context)
            .map_err(|source| PromptError::Render { name, source })
    }
}

impl PromptBuilder for DefaultPromptBuilder {
    fn execution_prompt(&self, tree: &PlanTree, node: &PlanNode, include_outline: bool) -> Result<String, PromptError> {
        debug!(plan_id = tree.id, task_id = node.id, include_outline, "execution_prompt: called");
        let context = ExecutionPromptContext::build(tree, node, include_outline);
        self.render("execute", EXECUTE_TEMPLATE, &context)
    }

    fn decomposition_prompt(
        &self,
        tree: &PlanTree,
        target: Option<&PlanNode>,
        max_children: usize,
    ) -> Result<String, PromptError> {
        debug!(plan_id = tree.id, target = ?target.map(|t| t.id), max_children, "decomposition_prompt: called");
        let context = DecompositionPromptContext::build(tree, target, max_children);
        self.render("decompose", DECOMPOSE_TEMPLATE, &context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planstore::NodeStatus;
    use serde_json::{Map, json};

    fn tree() -> PlanTree {
        let mut tree = PlanTree::new(7, "Launch", Some("Ship the \"thing\"".to_string()), Map::new());
        let mut root = PlanNode::new(7, 1, "Root", None);
        root.instruction = Some("Coordinate the launch".to_string());
        let mut a = PlanNode::new(7, 2, "Research", Some(1));
        a.path = "/1/2".into();
        a.depth = 1;
        a.status = NodeStatus::Completed;
        a.execution_result = Some(json!({"content": "Found <3> vendors"}));
        let mut b = PlanNode::new(7, 3, "Write", Some(1));
        b.path = "/1/3".into();
        b.depth = 1;
        b.position = 1;
        b.dependencies.insert(2);
        for n in [root, a, b] {
            tree.insert(n);
        }
        tree.rebuild_adjacency();
        tree
    }

    #[test]
    fn test_execution_prompt_includes_parent_and_dependencies() {
        let tree = tree();
        let builder = DefaultPromptBuilder::new();
        let prompt = builder.execution_prompt(&tree, tree.get(3).unwrap(), false).unwrap();

        assert!(prompt.contains("# Task: Write"));
        assert!(prompt.contains("Root: Coordinate the launch"));
        assert!(prompt.contains("### Research (#2, completed)"));
        // no HTML escaping
        assert!(prompt.contains("Found <3> vendors"));
        assert!(!prompt.contains("## Plan outline"));
    }

    #[test]
    fn test_execution_prompt_with_outline() {
        let tree = tree();
        let builder = DefaultPromptBuilder::new();
        let prompt = builder.execution_prompt(&tree, tree.get(2).unwrap(), true).unwrap();

        assert!(prompt.contains("## Plan outline"));
        assert!(prompt.contains("- [completed] Research (#2)"));
        assert!(!prompt.contains("prerequisite"));
    }

    #[test]
    fn test_decomposition_prompt_for_node() {
        let tree = tree();
        let builder = DefaultPromptBuilder::new();
        let prompt = builder.decomposition_prompt(&tree, tree.get(1), 4).unwrap();

        assert!(prompt.contains("Ship the \"thing\""));
        assert!(prompt.contains("Root (#1, depth 0)"));
        assert!(prompt.contains("- Research"));
        assert!(prompt.contains("at most 4 subtasks"));
    }

    #[test]
    fn test_decomposition_prompt_for_empty_plan() {
        let tree = PlanTree::new(1, "Blank", None, Map::new());
        let builder = DefaultPromptBuilder::new();
        let prompt = builder.decomposition_prompt(&tree, None, 3).unwrap();

        assert!(prompt.contains("Propose its top-level tasks"));
        assert!(!prompt.contains("## Current outline"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc\n[truncated]");
    }
}
