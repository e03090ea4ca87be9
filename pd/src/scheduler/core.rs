//! Scheduler implementation

use std::sync::Arc;

use planstore::{NodeStatus, PlanNode, PlanStore, PlanTree, StoreError, TaskUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::SchedulerConfig;
use super::SchedulerError;
use super::order::compute_run_order;
use crate::generate::{GenerateConfig, GenerateError, Generation, Generator};
use crate::jobs::JobLogger;
use crate::prompts::PromptBuilder;
use crate::storage::blocking;

/// Outcome of `execute_plan`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_id: i64,
    /// Tasks that completed, in run order
    pub executed: Vec<i64>,
    pub failed: Vec<i64>,
    pub skipped: Vec<i64>,
    /// True when a failure stopped the run before the order was exhausted
    pub halted: bool,
}

impl ExecutionSummary {
    pub fn stats(&self) -> serde_json::Map<String, Value> {
        let mut stats = serde_json::Map::new();
        stats.insert("executed".to_string(), json!(self.executed.len()));
        stats.insert("failed".to_string(), json!(self.failed.len()));
        stats.insert("skipped".to_string(), json!(self.skipped.len()));
        stats.insert("halted".to_string(), json!(self.halted));
        stats
    }
}

/// Outcome of `execute_task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub plan_id: i64,
    pub task_id: i64,
    pub status: NodeStatus,
    pub attempts: u32,
    /// The execution result as persisted on the task
    pub result: Value,
    /// Last generation error, when every attempt raised
    pub error: Option<String>,
}

/// Map a free-form generator status onto a terminal node status
pub fn normalize_status(generation: &Generation) -> NodeStatus {
    match generation.status.trim().to_lowercase().as_str() {
        "completed" | "complete" | "success" | "succeeded" | "done" | "ok" => NodeStatus::Completed,
        "skip" | "skipped" => NodeStatus::Skipped,
        "failed" | "fail" | "error" | "failure" => NodeStatus::Failed,
        _ if generation.content.trim().is_empty() => NodeStatus::Failed,
        _ => NodeStatus::Completed,
    }
}

/// Drives the generator over a plan
pub struct Scheduler {
    store: PlanStore,
    generator: Arc<dyn Generator>,
    prompts: Arc<dyn PromptBuilder>,
    config: SchedulerConfig,
    generate_config: GenerateConfig,
    logger: Option<JobLogger>,
}

impl Scheduler {
    pub fn new(
        store: PlanStore,
        generator: Arc<dyn Generator>,
        prompts: Arc<dyn PromptBuilder>,
        config: SchedulerConfig,
    ) -> Self {
        debug!(?config, "Scheduler::new: called");
        Self {
            store,
            generator,
            prompts,
            config,
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

    /// Execute every task of a plan in run order
    pub async fn execute_plan(&self, plan_id: i64) -> Result<ExecutionSummary, SchedulerError> {
        debug!(plan_id, "Scheduler::execute_plan: called");
        let tree = blocking(&self.store, move |s| s.get_tree(plan_id)).await?;
        self.execute_tree(tree).await
    }

    /// Execute a plan snapshot; results are written to the store
    pub async fn execute_tree(&self, mut tree: PlanTree) -> Result<ExecutionSummary, SchedulerError> {
        let plan_id = tree.id;
        let order = compute_run_order(&tree)?;
        info!(plan_id, tasks = order.len(), "Executing plan");
        if let Some(logger) = &self.logger {
            logger.info(
                format!("Executing {} tasks", order.len()),
                json!({ "plan_id": plan_id, "order": order }),
            );
        }

        let mut summary = ExecutionSummary {
            plan_id,
            ..Default::default()
        };

        for (idx, task_id) in order.iter().enumerate() {
            let outcome = self.run_node(&mut tree, *task_id).await?;
            match outcome.status {
                NodeStatus::Completed => summary.executed.push(*task_id),
                NodeStatus::Skipped => summary.skipped.push(*task_id),
                _ => summary.failed.push(*task_id),
            }

            if outcome.status == NodeStatus::Failed && self.config.dependency_throttle {
                let remaining = order.len() - idx - 1;
                warn!(plan_id, task_id, remaining, "Stopping plan after failed task");
                if let Some(logger) = &self.logger {
                    logger.warn(
                        format!("Stopping after task #{} failed; {} tasks not run", task_id, remaining),
                        json!({ "task_id": task_id, "remaining": remaining }),
                    );
                }
                summary.halted = remaining > 0;
                break;
            }
        }

        info!(
            plan_id,
            executed = summary.executed.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "Plan execution finished"
        );
        Ok(summary)
    }

    /// Execute a single task
    pub async fn execute_task(&self, plan_id: i64, task_id: i64) -> Result<TaskOutcome, SchedulerError> {
        debug!(plan_id, task_id, "Scheduler::execute_task: called");
        let mut tree = blocking(&self.store, move |s| s.get_tree(plan_id)).await?;
        if !tree.contains(task_id) {
            return Err(StoreError::NotFound(format!("Task {} in plan {}", task_id, plan_id)).into());
        }
        self.run_node(&mut tree, task_id).await
    }

    /// Run one node and write the stored result back into `tree`
    async fn run_node(&self, tree: &mut PlanTree, task_id: i64) -> Result<TaskOutcome, SchedulerError> {
        let plan_id = tree.id;
        let Some(node) = tree.get(task_id).cloned() else {
            return Err(StoreError::NotFound(format!("Task {} in plan {}", task_id, plan_id)).into());
        };
        debug!(plan_id, task_id, name = %node.name, "run_node: called");
        if let Some(logger) = &self.logger {
            logger.info(format!("Running task #{} {}", task_id, node.name), json!({ "task_id": task_id }));
        }

        // a prompt failure leaves the task untouched
        let prompt = self
            .prompts
            .execution_prompt(tree, &node, self.config.include_plan_outline)?;

        let running = TaskUpdate {
            status: Some(NodeStatus::Running),
            ..Default::default()
        };
        blocking(&self.store, move |s| s.update_task(plan_id, task_id, running)).await?;

        let attempts = self.config.attempts();
        let mut last_error: Option<GenerateError> = None;
        for attempt in 1..=attempts {
            let backoff = self.config.backoff(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }

            match self.generate(&prompt).await {
                Ok(generation) => {
                    let status = normalize_status(&generation);
                    let result = json!({
                        "status": status,
                        "content": generation.content,
                        "notes": generation.notes,
                        "metadata": generation.metadata,
                        "reported_status": generation.status,
                        "attempts": attempt,
                    });
                    let stored = self.persist(plan_id, task_id, status, result.clone()).await?;
                    tree.insert(stored);
                    self.log_outcome(&node, status, attempt);
                    return Ok(TaskOutcome {
                        plan_id,
                        task_id,
                        status,
                        attempts: attempt,
                        result,
                        error: None,
                    });
                }
                Err(e) => {
                    let last = attempt == attempts;
                    warn!(plan_id, task_id, attempt, attempts, error = %e, "Generation failed");
                    if let Some(logger) = &self.logger {
                        logger.warn(
                            format!("Task #{} attempt {}/{} failed: {}", task_id, attempt, attempts, e),
                            json!({ "task_id": task_id, "attempt": attempt, "retryable": e.is_retryable() }),
                        );
                    }
                    let result = json!({
                        "status": NodeStatus::Failed,
                        "error": e.to_string(),
                        "attempts": attempt,
                    });
                    let status = if last { NodeStatus::Failed } else { NodeStatus::Running };
                    let stored = self.persist(plan_id, task_id, status, result).await?;
                    tree.insert(stored);
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.map(|e| e.to_string());
        let result = tree
            .get(task_id)
            .and_then(|n| n.execution_result.clone())
            .unwrap_or(Value::Null);
        self.log_outcome(&node, NodeStatus::Failed, attempts);
        Ok(TaskOutcome {
            plan_id,
            task_id,
            status: NodeStatus::Failed,
            attempts,
            result,
            error,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, GenerateError> {
        let timeout = self.config.generate_timeout();
        match tokio::time::timeout(timeout, self.generator.generate(prompt, &self.generate_config)).await {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Timeout(timeout)),
        }
    }

    async fn persist(&self, plan_id: i64, task_id: i64, status: NodeStatus, result: Value) -> Result<PlanNode, StoreError> {
        blocking(&self.store, move |s| {
            s.update_task(plan_id, task_id, TaskUpdate::execution(status, result))
        })
        .await
    }

    fn log_outcome(&self, node: &PlanNode, status: NodeStatus, attempts: u32) {
        info!(plan_id = node.plan_id, task_id = node.id, %status, attempts, "Task finished");
        if let Some(logger) = &self.logger {
            let message = format!("Task #{} {} {}", node.id, node.name, status);
            let metadata = json!({ "task_id": node.id, "status": status, "attempts": attempts });
            if status == NodeStatus::Failed {
                logger.error(message, metadata);
            } else {
                logger.info(message, metadata);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::mock::MockGenerator;
    use crate::prompts::{DefaultPromptBuilder, PromptError};
    use async_trait::async_trait;
    use planstore::NewTask;
    use serde_json::Map;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_retries: 2,
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn scheduler(store: &PlanStore, generator: Arc<dyn Generator>, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(store.clone(), generator, Arc::new(DefaultPromptBuilder::new()), config)
    }

    /// Root -> [A, B]
    fn setup() -> (TempDir, PlanStore, i64, [i64; 3]) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let plan = store.create_plan("Plan", None, Map::new()).unwrap();
        let root = store.create_task(plan.id, NewTask::new("Root")).unwrap();
        let a = store.create_task(plan.id, NewTask::new("A").with_parent(root.id)).unwrap();
        let b = store.create_task(plan.id, NewTask::new("B").with_parent(root.id)).unwrap();
        (dir, store, plan.id, [root.id, a.id, b.id])
    }

    fn fail_on(name: &'static str) -> MockGenerator {
        let marker = format!("# Task: {}\n", name);
        MockGenerator::with_fn(move |prompt, _| {
            if prompt.contains(&marker) {
                Err(GenerateError::InvalidResponse("boom".to_string()))
            } else {
                Ok(Generation::completed("done"))
            }
        })
    }

    #[test]
    fn test_normalize_status() {
        let g = |status: &str, content: &str| Generation::completed(content).with_status(status);
        assert_eq!(normalize_status(&g("Success", "x")), NodeStatus::Completed);
        assert_eq!(normalize_status(&g("done", "")), NodeStatus::Completed);
        assert_eq!(normalize_status(&g("skip", "")), NodeStatus::Skipped);
        assert_eq!(normalize_status(&g("ERROR", "x")), NodeStatus::Failed);
        assert_eq!(normalize_status(&g("partial", "some work")), NodeStatus::Completed);
        assert_eq!(normalize_status(&g("partial", "  ")), NodeStatus::Failed);
    }

    #[tokio::test]
    async fn test_failing_child_stops_plan_before_root() {
        let (_dir, store, plan_id, [root, a, b]) = setup();
        let generator = Arc::new(fail_on("B"));
        let scheduler = scheduler(&store, generator.clone(), fast_config());

        let summary = scheduler.execute_plan(plan_id).await.unwrap();

        assert_eq!(summary.executed, vec![a]);
        assert_eq!(summary.failed, vec![b]);
        assert!(summary.skipped.is_empty());
        assert!(summary.halted);
        // A once, B twice
        assert_eq!(generator.call_count(), 3);

        let root_node = store.get_node(plan_id, root).unwrap();
        assert_eq!(root_node.status, NodeStatus::Pending);
        let b_node = store.get_node(plan_id, b).unwrap();
        assert_eq!(b_node.status, NodeStatus::Failed);
        let result = b_node.execution_result.unwrap();
        assert_eq!(result["error"], "Invalid response: boom");
        assert_eq!(result["attempts"], 2);
    }

    #[tokio::test]
    async fn test_without_throttle_runs_everything() {
        let (_dir, store, plan_id, [root, a, b]) = setup();
        let config = SchedulerConfig {
            dependency_throttle: false,
            ..fast_config()
        };
        let scheduler = scheduler(&store, Arc::new(fail_on("B")), config);

        let summary = scheduler.execute_plan(plan_id).await.unwrap();
        assert_eq!(summary.executed, vec![a, root]);
        assert_eq!(summary.failed, vec![b]);
        assert!(!summary.halted);
    }

    #[tokio::test]
    async fn test_returned_failure_is_not_retried() {
        let (_dir, store, plan_id, [_, a, _]) = setup();
        let generator = Arc::new(MockGenerator::with_fn(|_, _| {
            Ok(Generation::completed("could not").with_status("failed"))
        }));
        let scheduler = scheduler(&store, generator.clone(), fast_config());

        let outcome = scheduler.execute_task(plan_id, a).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.is_none());
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (_dir, store, plan_id, [_, a, _]) = setup();
        let generator = Arc::new(MockGenerator::with_fn(|_, idx| {
            if idx == 0 {
                Err(GenerateError::Timeout(Duration::from_secs(1)))
            } else {
                Ok(Generation::completed("second time lucky"))
            }
        }));
        let scheduler = scheduler(&store, generator, fast_config());

        let outcome = scheduler.execute_task(plan_id, a).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Completed);
        assert_eq!(outcome.attempts, 2);

        let node = store.get_node(plan_id, a).unwrap();
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.result_content(), Some("second time lucky"));
    }

    #[tokio::test]
    async fn test_skipped_status_recorded() {
        let (_dir, store, plan_id, [root, a, b]) = setup();
        let generator = Arc::new(MockGenerator::with_fn(|prompt, _| {
            let status = if prompt.contains("# Task: A\n") { "skipped" } else { "completed" };
            Ok(Generation::completed("ok").with_status(status))
        }));
        let scheduler = scheduler(&store, generator, fast_config());

        let summary = scheduler.execute_plan(plan_id).await.unwrap();
        assert_eq!(summary.skipped, vec![a]);
        assert_eq!(summary.executed, vec![b, root]);
        assert_eq!(store.get_node(plan_id, a).unwrap().status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_dependency_results_reach_prompt() {
        let (_dir, store, plan_id, [_, a, b]) = setup();
        store.add_dependency(plan_id, b, a).unwrap();
        let generator = Arc::new(MockGenerator::with_fn(|prompt, _| {
            if prompt.contains("# Task: A\n") {
                Ok(Generation::completed("alpha output"))
            } else {
                Ok(Generation::completed("other"))
            }
        }));
        let scheduler = scheduler(&store, generator.clone(), fast_config());

        scheduler.execute_plan(plan_id).await.unwrap();
        let prompts = generator.prompts();
        let b_prompt = prompts.iter().find(|p| p.contains("# Task: B\n")).unwrap();
        assert!(b_prompt.contains("alpha output"));
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_generation() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let generator = Arc::new(MockGenerator::new(vec![]));
        let scheduler = scheduler(&store, generator.clone(), fast_config());

        let mut tree = PlanTree::new(1, "Cyclic", None, Map::new());
        let mut x = PlanNode::new(1, 1, "X", None);
        x.dependencies.insert(2);
        let mut y = PlanNode::new(1, 2, "Y", None);
        y.position = 1;
        y.dependencies.insert(1);
        tree.insert(x);
        tree.insert(y);
        tree.rebuild_adjacency();

        let err = scheduler.execute_tree(tree).await.unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected { .. }));
        assert_eq!(generator.call_count(), 0);
    }

    struct SlowGenerator;

    #[async_trait]
    impl Generator for SlowGenerator {
        async fn generate(&self, _prompt: &str, _config: &GenerateConfig) -> Result<Generation, GenerateError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Generation::completed("too late"))
        }
    }

    #[tokio::test]
    async fn test_generation_timeout_is_a_failure() {
        let (_dir, store, plan_id, [_, a, _]) = setup();
        let config = SchedulerConfig {
            max_retries: 1,
            generate_timeout_ms: 20,
            ..fast_config()
        };
        let scheduler = scheduler(&store, Arc::new(SlowGenerator), config);

        let outcome = scheduler.execute_task(plan_id, a).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.error.unwrap().starts_with("Timeout"));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (_dir, store, plan_id, _) = setup();
        let scheduler = scheduler(&store, Arc::new(MockGenerator::new(vec![])), fast_config());
        let err = scheduler.execute_task(plan_id, 999).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Store(e) if e.is_not_found()));
    }

    /// Fails every execution prompt
    struct BrokenPrompts;

    impl PromptBuilder for BrokenPrompts {
        fn execution_prompt(&self, _tree: &PlanTree, _node: &PlanNode, _outline: bool) -> Result<String, PromptError> {
            Err(PromptError::Render {
                name: "execute",
                source: handlebars::RenderErrorReason::Other("missing partial".to_string()).into(),
            })
        }

        fn decomposition_prompt(
            &self,
            tree: &PlanTree,
            target: Option<&PlanNode>,
            max_children: usize,
        ) -> Result<String, PromptError> {
            DefaultPromptBuilder::new().decomposition_prompt(tree, target, max_children)
        }
    }

    #[tokio::test]
    async fn test_prompt_failure_leaves_task_pending() {
        let (_dir, store, plan_id, [_, a, _]) = setup();
        let generator = Arc::new(MockGenerator::with_fn(|_, _| Ok(Generation::completed("done"))));
        let scheduler = Scheduler::new(store.clone(), generator.clone(), Arc::new(BrokenPrompts), fast_config());

        let err = scheduler.execute_task(plan_id, a).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Prompt(_)));
        assert_eq!(generator.call_count(), 0);
        assert_eq!(store.get_node(plan_id, a).unwrap().status, NodeStatus::Pending);
    }
}
