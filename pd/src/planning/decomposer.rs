//! Decomposer - breadth-first expansion of plan nodes
//!
//! Each dequeued node is shown to the generator together with the current
//! outline; the proposed children are created through the plan store and the
//! non-leaf ones are queued for the next level.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use planstore::{NewTask, NodeContext, PlanNode, PlanStore, PlanTree, StoreError, TaskUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{DecomposeError, DecomposeOptions};
use crate::generate::{GenerateConfig, GenerateError, Generation, Generator, extract_json};
use crate::jobs::JobLogger;
use crate::prompts::PromptBuilder;
use crate::storage::blocking;

/// Why a decomposition run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QueueExhausted,
    StopRequested,
    EmptyResult,
    NodeBudgetExhausted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueExhausted => "queue_exhausted",
            Self::StopRequested => "stop_requested",
            Self::EmptyResult => "empty_result",
            Self::NodeBudgetExhausted => "node_budget_exhausted",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node whose expansion failed at the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedExpansion {
    /// None for the plan root of an empty plan
    pub task_id: Option<i64>,
    pub error: String,
}

/// Outcome of a decomposition run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionResult {
    pub plan_id: i64,
    /// Tasks sent to the generator, in visit order
    pub processed_nodes: Vec<i64>,
    /// True when the empty plan itself was expanded into root tasks
    pub expanded_plan_root: bool,
    pub created: Vec<PlanNode>,
    pub failed: Vec<FailedExpansion>,
    pub warnings: Vec<String>,
    pub stopped_reason: StopReason,
}

impl DecompositionResult {
    fn new(plan_id: i64) -> Self {
        Self {
            plan_id,
            processed_nodes: Vec::new(),
            expanded_plan_root: false,
            created: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            stopped_reason: StopReason::QueueExhausted,
        }
    }

    pub fn created_ids(&self) -> Vec<i64> {
        self.created.iter().map(|n| n.id).collect()
    }

    pub fn stats(&self) -> Map<String, Value> {
        let mut stats = Map::new();
        stats.insert("processed".to_string(), json!(self.processed_nodes.len()));
        stats.insert("created".to_string(), json!(self.created.len()));
        stats.insert("failed".to_string(), json!(self.failed.len()));
        stats.insert("warnings".to_string(), json!(self.warnings.len()));
        stats.insert("stopped_reason".to_string(), json!(self.stopped_reason));
        stats
    }
}

/// Generator output schema for one proposed subtask
#[derive(Debug, Deserialize)]
struct ChildOutput {
    #[serde(alias = "title")]
    name: String,
    #[serde(default, alias = "description")]
    instruction: Option<String>,
    /// Sibling names from the same reply, or ids of existing tasks
    #[serde(default, alias = "depends_on")]
    dependencies: Vec<DependencyRef>,
    #[serde(default, alias = "is_leaf")]
    leaf: bool,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyRef {
    Id(i64),
    Name(String),
}

/// Full decomposition reply
#[derive(Debug, Default, Deserialize)]
struct DecompositionOutput {
    #[serde(default, alias = "tasks")]
    children: Vec<ChildOutput>,
    #[serde(default)]
    stop: bool,
}

fn parse_output(generation: &Generation) -> Result<DecompositionOutput, GenerateError> {
    let status = generation.status.trim().to_lowercase();
    if matches!(status.as_str(), "failed" | "fail" | "error") {
        let reason = generation.notes.clone().unwrap_or_else(|| "generator reported failure".to_string());
        return Err(GenerateError::InvalidResponse(reason));
    }

    let mut output = if generation.content.trim().is_empty() {
        DecompositionOutput::default()
    } else {
        serde_json::from_str::<DecompositionOutput>(extract_json(&generation.content))
            .map_err(|e| GenerateError::InvalidResponse(format!("Unparseable decomposition reply: {}", e)))?
    };
    if status == "stop" {
        output.stop = true;
    }
    Ok(output)
}

/// Context payload from the reply: plain text, a NodeContext object, or free-form metadata
fn node_context(value: Option<Value>) -> NodeContext {
    match value {
        None | Some(Value::Null) => NodeContext::default(),
        Some(Value::String(text)) => NodeContext {
            combined: Some(text),
            ..Default::default()
        },
        Some(Value::Object(map)) if ["combined", "sections", "meta"].iter().any(|k| map.contains_key(*k)) => {
            let raw = Value::Object(map);
            serde_json::from_value(raw.clone()).unwrap_or_else(|_| NodeContext {
                combined: Some(raw.to_string()),
                ..Default::default()
            })
        }
        Some(Value::Object(map)) => NodeContext {
            meta: map,
            ..Default::default()
        },
        Some(other) => NodeContext {
            combined: Some(other.to_string()),
            ..Default::default()
        },
    }
}

/// Expands plan nodes with the generator
pub struct Decomposer {
    store: PlanStore,
    generator: Arc<dyn Generator>,
    prompts: Arc<dyn PromptBuilder>,
    options: DecomposeOptions,
    generate_config: GenerateConfig,
    logger: Option<JobLogger>,
}

impl Decomposer {
    pub fn new(
        store: PlanStore,
        generator: Arc<dyn Generator>,
        prompts: Arc<dyn PromptBuilder>,
        options: DecomposeOptions,
    ) -> Self {
        debug!(?options, "Decomposer::new: called");
        Self {
            store,
            generator,
            prompts,
            options,
            generate_config: GenerateConfig::default(),
            logger: None,
        }
    }

    pub fn with_generate_config(mut self, generate_config: GenerateConfig) -> Self {
        self.generate_config = generate_config;
        self
    }

    /// Mirror progress lines into a job's log
    pub fn with_logger(mut self, logger: JobLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn options(&self) -> &DecomposeOptions {
        &self.options
    }

    /// Expand a whole plan breadth-first from its roots
    ///
    /// An empty plan is expanded from the plan itself, producing root tasks.
    pub async fn run_plan(
        &self,
        plan_id: i64,
        max_depth: Option<u32>,
        node_budget: Option<usize>,
    ) -> Result<DecompositionResult, DecomposeError> {
        debug!(plan_id, ?max_depth, ?node_budget, "Decomposer::run_plan: called");
        let options = self.options.with_max_depth(max_depth).with_node_budget(node_budget);
        let tree = blocking(&self.store, move |s| s.get_tree(plan_id)).await?;

        let start: Vec<Option<i64>> = if tree.is_empty() {
            vec![None]
        } else {
            tree.roots()
                .iter()
                .filter(|id| tree.get(**id).is_some_and(|n| !n.is_leaf()))
                .map(|id| Some(*id))
                .collect()
        };
        self.run(tree, start, options).await
    }

    /// Expand one task and, depth permitting, the subtasks it gains
    pub async fn decompose_node(
        &self,
        plan_id: i64,
        task_id: i64,
        expand_depth: Option<u32>,
        node_budget: Option<usize>,
        allow_existing_children: Option<bool>,
    ) -> Result<DecompositionResult, DecomposeError> {
        debug!(plan_id, task_id, ?expand_depth, ?node_budget, ?allow_existing_children, "Decomposer::decompose_node: called");
        let options = self
            .options
            .with_max_depth(expand_depth)
            .with_node_budget(node_budget)
            .with_allow_existing(allow_existing_children);
        let tree = blocking(&self.store, move |s| s.get_tree(plan_id)).await?;
        if !tree.contains(task_id) {
            return Err(StoreError::NotFound(format!("Task {} in plan {}", task_id, plan_id)).into());
        }
        self.run(tree, vec![Some(task_id)], options).await
    }

    async fn run(
        &self,
        mut tree: PlanTree,
        start: Vec<Option<i64>>,
        options: DecomposeOptions,
    ) -> Result<DecompositionResult, DecomposeError> {
        let plan_id = tree.id;
        let mut result = DecompositionResult::new(plan_id);
        let mut budget = options.node_budget;
        let mut queue: VecDeque<(Option<i64>, u32)> = start.into_iter().map(|id| (id, 0)).collect();

        info!(plan_id, max_depth = options.max_depth, node_budget = budget, "Decomposing plan");
        if let Some(logger) = &self.logger {
            logger.info(
                format!("Decomposing plan {} (depth {}, budget {})", plan_id, options.max_depth, budget),
                json!({ "plan_id": plan_id, "max_depth": options.max_depth, "node_budget": budget }),
            );
        }

        if budget == 0 {
            result.stopped_reason = StopReason::NodeBudgetExhausted;
            return Ok(result);
        }

        while let Some((target, depth)) = queue.pop_front() {
            if depth > options.max_depth {
                continue;
            }

            if let Some(task_id) = target {
                if !tree.contains(task_id) {
                    warn!(plan_id, task_id, "Queued task vanished from plan");
                    continue;
                }
                if tree.has_children(task_id) && !options.allow_existing_children {
                    debug!(plan_id, task_id, "Task already has subtasks, skipping");
                    continue;
                }
                result.processed_nodes.push(task_id);
            } else {
                result.expanded_plan_root = true;
            }

            let limit = options.max_children.min(budget);
            let prompt = self
                .prompts
                .decomposition_prompt(&tree, target.and_then(|id| tree.get(id)), limit)?;

            let output = match self.propose(&prompt).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(plan_id, task_id = ?target, error = %e, "Decomposition generation failed");
                    if let Some(logger) = &self.logger {
                        logger.warn(
                            format!("Expanding {} failed: {}", describe(target), e),
                            json!({ "task_id": target, "error": e.to_string() }),
                        );
                    }
                    result.failed.push(FailedExpansion {
                        task_id: target,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let stop = output.stop;
            let mut proposed = output.children;
            if proposed.len() > limit {
                debug!(plan_id, proposed = proposed.len(), limit, "Truncating proposed subtasks");
                proposed.truncate(limit);
            }

            let created = self
                .create_children(&mut tree, target, proposed, &mut result.warnings)
                .await?;
            budget = budget.saturating_sub(created.len());

            for node in &created {
                if !node.is_leaf() && depth < options.max_depth && budget > 0 {
                    queue.push_back((Some(node.id), depth + 1));
                }
            }

            if let Some(logger) = &self.logger {
                let ids: Vec<i64> = created.iter().map(|n| n.id).collect();
                logger.info(
                    format!("Expanded {} into {} subtasks", describe(target), created.len()),
                    json!({ "task_id": target, "created": ids, "remaining_budget": budget }),
                );
                logger.action("decompose_node", &json!({ "plan_id": plan_id, "task_id": target, "created": ids }));
            }

            let empty = created.is_empty();
            result.created.extend(created);

            if stop {
                result.stopped_reason = StopReason::StopRequested;
                break;
            }
            if empty && options.stop_on_empty {
                result.stopped_reason = StopReason::EmptyResult;
                break;
            }
            if budget == 0 {
                result.stopped_reason = StopReason::NodeBudgetExhausted;
                break;
            }
        }

        info!(
            plan_id,
            processed = result.processed_nodes.len(),
            created = result.created.len(),
            failed = result.failed.len(),
            stopped_reason = %result.stopped_reason,
            "Plan decomposed into {} new tasks",
            result.created.len()
        );
        Ok(result)
    }

    async fn propose(&self, prompt: &str) -> Result<DecompositionOutput, GenerateError> {
        let generation = self.generator.generate(prompt, &self.generate_config).await?;
        parse_output(&generation)
    }

    /// Create proposed children under `parent` and wire their dependencies
    async fn create_children(
        &self,
        tree: &mut PlanTree,
        parent: Option<i64>,
        proposed: Vec<ChildOutput>,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<PlanNode>, DecomposeError> {
        let plan_id = tree.id;
        let mut name_to_id: HashMap<String, i64> = HashMap::new();
        let mut pending: Vec<(i64, Vec<DependencyRef>)> = Vec::new();
        let mut created: Vec<PlanNode> = Vec::with_capacity(proposed.len());

        // First pass: create every child so siblings can reference each other
        for child in proposed {
            let name = child.name.trim();
            if name.is_empty() {
                warnings.push("Ignored a proposed subtask without a name".to_string());
                continue;
            }

            let mut metadata = Map::new();
            metadata.insert("is_leaf".to_string(), json!(child.leaf));
            metadata.insert("source".to_string(), json!("decomposition"));

            let mut task = NewTask::new(name)
                .with_metadata(metadata)
                .with_context(node_context(child.context));
            if let Some(parent_id) = parent {
                task = task.with_parent(parent_id);
            }
            if let Some(instruction) = child.instruction.filter(|i| !i.trim().is_empty()) {
                task = task.with_instruction(instruction);
            }

            let node = blocking(&self.store, move |s| s.create_task(plan_id, task)).await?;
            name_to_id.insert(name.to_lowercase(), node.id);
            if !child.dependencies.is_empty() {
                pending.push((node.id, child.dependencies));
            }
            created.push(node);
        }

        // Second pass: resolve dependency references
        for (task_id, refs) in pending {
            let mut deps = BTreeSet::new();
            for dep in refs {
                let (label, resolved) = match dep {
                    DependencyRef::Id(id) => (format!("#{}", id), Some(id)),
                    DependencyRef::Name(name) => {
                        let key = name.trim().to_lowercase();
                        let resolved = name_to_id
                            .get(&key)
                            .copied()
                            .or_else(|| key.trim_start_matches('#').parse::<i64>().ok());
                        (name, resolved)
                    }
                };
                match resolved {
                    Some(id) if tree.contains(id) || created.iter().any(|n| n.id == id) => {
                        deps.insert(id);
                    }
                    _ => warnings.push(format!("Task #{} depends on unknown task '{}'", task_id, label)),
                }
            }
            if deps.is_empty() {
                continue;
            }

            let requested = deps.len();
            let update = TaskUpdate {
                dependencies: Some(deps.into_iter().collect()),
                ..Default::default()
            };
            let updated = blocking(&self.store, move |s| s.update_task(plan_id, task_id, update)).await?;
            if updated.dependencies.len() < requested {
                warnings.push(format!(
                    "Task #{}: {} dependencies rejected as self, ancestor or cyclic",
                    task_id,
                    requested - updated.dependencies.len()
                ));
            }
            if let Some(slot) = created.iter_mut().find(|n| n.id == task_id) {
                *slot = updated;
            }
        }

        for node in &created {
            tree.insert(node.clone());
        }
        tree.rebuild_adjacency();
        Ok(created)
    }
}

fn describe(target: Option<i64>) -> String {
    match target {
        Some(id) => format!("task #{}", id),
        None => "plan root".to_string(),
    }
}
