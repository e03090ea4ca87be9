//! JobRunner - background workers for scheduler and decomposer calls
//!
//! Each submission registers a job, then spawns one tokio task that marks it
//! running, does the work with a `JobLogger` attached, and records the
//! outcome. Workers never return errors to the submitter; every failure,
//! including a panic, ends as a failed job.

use std::future::Future;
use std::sync::Arc;

use planstore::{NodeStatus, PlanStore};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::JobError;
use super::logger::JobLogger;
use super::manager::JobManager;
use super::types::{JobMode, JobSnapshot, NewJob};
use crate::generate::{GenerateConfig, Generator};
use crate::planning::{DecomposeOptions, Decomposer, DecompositionResult};
use crate::prompts::PromptBuilder;
use crate::scheduler::{ExecutionSummary, Scheduler, SchedulerConfig, TaskOutcome};
use crate::storage::blocking;

/// What a worker hands back to the runner
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub result: Value,
    pub stats: Map<String, Value>,
    /// Set when the work finished but the job should count as failed
    pub error: Option<String>,
}

impl JobOutput {
    pub fn success(result: Value, stats: Map<String, Value>) -> Self {
        Self {
            result,
            stats,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, result: Value, stats: Map<String, Value>) -> Self {
        Self {
            result,
            stats,
            error: Some(error.into()),
        }
    }

    fn from_summary(summary: &ExecutionSummary) -> eyre::Result<Self> {
        let result = serde_json::to_value(summary)?;
        let stats = summary.stats();
        Ok(if summary.failed.is_empty() {
            Self::success(result, stats)
        } else {
            let failed: Vec<String> = summary.failed.iter().map(|id| format!("#{}", id)).collect();
            Self::failure(format!("Tasks failed: {}", failed.join(", ")), result, stats)
        })
    }

    fn from_outcome(outcome: &TaskOutcome) -> eyre::Result<Self> {
        let result = serde_json::to_value(outcome)?;
        let mut stats = Map::new();
        stats.insert("attempts".to_string(), json!(outcome.attempts));
        stats.insert("status".to_string(), json!(outcome.status));
        Ok(if outcome.status == NodeStatus::Failed {
            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| "generator reported failure".to_string());
            Self::failure(format!("Task #{} failed: {}", outcome.task_id, reason), result, stats)
        } else {
            Self::success(result, stats)
        })
    }

    fn from_decomposition(decomposition: &DecompositionResult) -> eyre::Result<Self> {
        let result = serde_json::to_value(decomposition)?;
        let stats = decomposition.stats();
        Ok(if decomposition.created.is_empty() && !decomposition.failed.is_empty() {
            let error = format!("No tasks created; {} expansions failed", decomposition.failed.len());
            Self::failure(error, result, stats)
        } else {
            Self::success(result, stats)
        })
    }
}

/// A registered job and its worker
#[derive(Debug)]
pub struct SubmittedJob {
    pub job: JobSnapshot,
    pub handle: JoinHandle<()>,
}

impl SubmittedJob {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

/// Submits scheduler and decomposer calls as background jobs
#[derive(Clone)]
pub struct JobRunner {
    store: PlanStore,
    generator: Arc<dyn Generator>,
    prompts: Arc<dyn PromptBuilder>,
    manager: Arc<JobManager>,
    scheduler_config: SchedulerConfig,
    generate_config: GenerateConfig,
}

impl JobRunner {
    pub fn new(
        store: PlanStore,
        generator: Arc<dyn Generator>,
        prompts: Arc<dyn PromptBuilder>,
        manager: Arc<JobManager>,
    ) -> Self {
        Self {
            store,
            generator,
            prompts,
            manager,
            scheduler_config: SchedulerConfig::default(),
            generate_config: GenerateConfig::default(),
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn with_generate_config(mut self, config: GenerateConfig) -> Self {
        self.generate_config = config;
        self
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.generator.clone(),
            self.prompts.clone(),
            self.scheduler_config.clone(),
        )
        .with_generate_config(self.generate_config.clone())
    }

    fn decomposer(&self, options: DecomposeOptions) -> Decomposer {
        Decomposer::new(self.store.clone(), self.generator.clone(), self.prompts.clone(), options)
            .with_generate_config(self.generate_config.clone())
    }

    /// Execute every task of a plan in the background
    pub fn submit_plan_execution(&self, plan_id: i64) -> Result<SubmittedJob, JobError> {
        debug!(plan_id, "submit_plan_execution: called");
        let job = self.manager.create_job(
            NewJob::new(JobMode::PlanWide)
                .for_plan(plan_id)
                .with_metadata(kind("execute")),
        )?;
        let scheduler = self.scheduler();
        Ok(self.spawn(job, move |logger| async move {
            let summary = scheduler.with_logger(logger).execute_plan(plan_id).await?;
            JobOutput::from_summary(&summary)
        }))
    }

    /// Execute one task in the background
    pub fn submit_task_execution(&self, plan_id: i64, task_id: i64) -> Result<SubmittedJob, JobError> {
        debug!(plan_id, task_id, "submit_task_execution: called");
        let job = self.manager.create_job(
            NewJob::new(JobMode::SingleNode)
                .for_plan(plan_id)
                .for_task(task_id)
                .with_metadata(kind("execute")),
        )?;
        let scheduler = self.scheduler();
        Ok(self.spawn(job, move |logger| async move {
            let outcome = scheduler.with_logger(logger).execute_task(plan_id, task_id).await?;
            JobOutput::from_outcome(&outcome)
        }))
    }

    /// Decompose a whole plan, or one task when `task_id` is given
    pub fn submit_decomposition(
        &self,
        plan_id: i64,
        task_id: Option<i64>,
        options: DecomposeOptions,
    ) -> Result<SubmittedJob, JobError> {
        debug!(plan_id, ?task_id, ?options, "submit_decomposition: called");
        let mut new = match task_id {
            Some(task_id) => NewJob::new(JobMode::SingleNode).for_plan(plan_id).for_task(task_id),
            None => NewJob::new(JobMode::PlanWide).for_plan(plan_id),
        };
        new = new.with_params(params(&options)).with_metadata(kind("decompose"));
        let job = self.manager.create_job(new)?;

        let decomposer = self.decomposer(options);
        Ok(self.spawn(job, move |logger| async move {
            let decomposer = decomposer.with_logger(logger);
            let result = match task_id {
                Some(task_id) => decomposer.decompose_node(plan_id, task_id, None, None, None).await?,
                None => decomposer.run_plan(plan_id, None, None).await?,
            };
            JobOutput::from_decomposition(&result)
        }))
    }

    /// Create a plan and decompose it, all inside the worker
    ///
    /// The job starts unbound and is attached once the plan id exists.
    pub fn submit_plan_bootstrap(
        &self,
        title: &str,
        description: Option<&str>,
        options: DecomposeOptions,
    ) -> Result<SubmittedJob, JobError> {
        debug!(%title, "submit_plan_bootstrap: called");
        let mut job_params = params(&options);
        job_params.insert("title".to_string(), json!(title));
        job_params.insert("description".to_string(), json!(description));
        let job = self.manager.create_job(
            NewJob::new(JobMode::PlanWide)
                .with_params(job_params)
                .with_metadata(kind("bootstrap")),
        )?;

        let title = title.to_string();
        let description = description.map(str::to_string);
        let store = self.store.clone();
        let manager = self.manager.clone();
        let decomposer = self.decomposer(options);
        Ok(self.spawn(job, move |logger| async move {
            let plan = blocking(&store, move |s| s.create_plan(&title, description.as_deref(), Map::new())).await?;
            manager.attach_plan(logger.job_id(), plan.id)?;
            logger.info(format!("Created plan {} '{}'", plan.id, plan.title), json!({ "plan_id": plan.id }));

            let result = decomposer.with_logger(logger).run_plan(plan.id, None, None).await?;
            JobOutput::from_decomposition(&result)
        }))
    }

    fn spawn<F, Fut>(&self, job: JobSnapshot, work: F) -> SubmittedJob
    where
        F: FnOnce(JobLogger) -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<JobOutput>> + Send + 'static,
    {
        let manager = self.manager.clone();
        let job_id = job.job_id.clone();
        let handle = tokio::spawn(run_job(manager, job_id, work));
        info!(job_id = %job.job_id, mode = %job.mode.as_str(), "Submitted job");
        SubmittedJob { job, handle }
    }
}

async fn run_job<F, Fut>(manager: Arc<JobManager>, job_id: String, work: F)
where
    F: FnOnce(JobLogger) -> Fut + Send + 'static,
    Fut: Future<Output = eyre::Result<JobOutput>> + Send + 'static,
{
    debug!(%job_id, "run_job: starting");
    if let Err(e) = manager.mark_running(&job_id) {
        error!(%job_id, error = %e, "Failed to start job");
        return;
    }

    let logger = JobLogger::new(manager.clone(), job_id.clone());
    // inner task so a panic surfaces as a JoinError
    let outcome = tokio::spawn(work(logger)).await;

    let recorded = match outcome {
        Ok(Ok(output)) => match output.error {
            None => manager.mark_success(&job_id, output.result, output.stats),
            Some(error) => manager.mark_failure(&job_id, error, Some(output.result), Some(output.stats)),
        },
        Ok(Err(e)) => manager.mark_failure(&job_id, format!("{:#}", e), None, None),
        Err(e) => manager.mark_failure(&job_id, format!("Worker panicked: {}", e), None, None),
    };
    if let Err(e) = recorded {
        error!(%job_id, error = %e, "Failed to record job outcome");
    }
    debug!(%job_id, "run_job: complete");
}

fn params(options: &DecomposeOptions) -> Map<String, Value> {
    match serde_json::to_value(options) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn kind(kind: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("kind".to_string(), json!(kind));
    metadata
}
