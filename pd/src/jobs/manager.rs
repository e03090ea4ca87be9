//! JobManager - in-process job registry
//!
//! The registry map lock is held only to look up, insert or evict jobs.
//! Each job has its own lock, which serialises its mutations, its durable
//! writes and its broadcasts, so subscribers see one job's events in append
//! order while different jobs never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use planstore::{JobLogRecord, PlanStore, StoreError, now_ms};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::JobError;
use super::types::{JobSnapshot, JobStatus, LogLevel, NewJob, StreamMessage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<StreamMessage>,
}

struct Job {
    /// Current state; `logs` is always empty here
    state: JobSnapshot,
    logs: VecDeque<JobLogRecord>,
    capacity: usize,
    next_seq: i64,
    /// Lines not yet in the durable mirror, independent of the ring buffer
    unpersisted: Vec<JobLogRecord>,
    /// Highest seq written to the durable mirror
    persisted_seq: i64,
    subscribers: Vec<Subscriber>,
}

impl Job {
    fn new(state: JobSnapshot, capacity: usize) -> Self {
        Self {
            state,
            logs: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_seq: 1,
            unpersisted: Vec::new(),
            persisted_seq: 0,
            subscribers: Vec::new(),
        }
    }

    fn summary(&self) -> JobSnapshot {
        self.state.clone()
    }

    fn full(&self) -> JobSnapshot {
        JobSnapshot {
            logs: self.logs.iter().cloned().collect(),
            ..self.state.clone()
        }
    }

    /// Append to the ring buffer, dropping the oldest line when full
    ///
    /// The line is also queued for the durable mirror; eviction from the
    /// ring never drops a line that has not been written yet.
    fn push_log(&mut self, level: LogLevel, message: String, metadata: Map<String, Value>) -> JobLogRecord {
        let entry = JobLogRecord {
            seq: self.next_seq,
            timestamp: now_ms(),
            level: level.as_str().to_string(),
            message,
            metadata,
        };
        self.next_seq += 1;
        if self.logs.len() >= self.capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(entry.clone());
        self.unpersisted.push(entry.clone());
        entry
    }

    /// Write pending lines exactly once, advancing the cursor
    ///
    /// On failure nothing is drained; the same lines go out with the next flush.
    fn flush(&mut self, store: &PlanStore) -> Result<usize, StoreError> {
        let Some(last) = self.unpersisted.last().map(|l| l.seq) else {
            return Ok(0);
        };
        store.append_job_logs(&self.state.job_id, &self.unpersisted)?;
        let flushed = self.unpersisted.len();
        self.unpersisted.clear();
        self.persisted_seq = last;
        Ok(flushed)
    }

    fn broadcast(&mut self, message: StreamMessage) {
        self.subscribers.retain(|s| s.tx.send(message.clone()).is_ok());
    }

    fn is_expired(&self, cutoff: i64) -> bool {
        self.state.status.is_terminal() && self.state.finished_at.is_some_and(|t| t < cutoff)
    }
}

/// Registry of background jobs
pub struct JobManager {
    store: PlanStore,
    log_capacity: usize,
    ttl: Duration,
    jobs: Mutex<HashMap<String, Arc<Mutex<Job>>>>,
    next_subscriber: AtomicU64,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("log_capacity", &self.log_capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl JobManager {
    pub fn new(store: PlanStore, log_capacity: usize, ttl: Duration) -> Self {
        debug!(log_capacity, ?ttl, "JobManager::new: called");
        Self {
            store,
            log_capacity,
            ttl,
            jobs: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    fn job(&self, job_id: &str) -> Result<Arc<Mutex<Job>>, JobError> {
        lock(&self.jobs)
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Register a job; an explicit id that is already known fails with `Duplicate`
    pub fn create_job(&self, new: NewJob) -> Result<JobSnapshot, JobError> {
        debug!(plan_id = ?new.plan_id, task_id = ?new.task_id, mode = ?new.mode, "create_job: called");
        self.sweep_expired();

        let job_id = new.job_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        if lock(&self.jobs).contains_key(&job_id) {
            return Err(JobError::Duplicate(job_id));
        }

        let state = JobSnapshot {
            job_id: job_id.clone(),
            plan_id: new.plan_id,
            task_id: new.task_id,
            mode: new.mode,
            status: JobStatus::Queued,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
            stats: Map::new(),
            params: new.params,
            metadata: new.metadata,
            logs: Vec::new(),
        };

        self.store.insert_job(&state.to_record()).map_err(|e| match e {
            StoreError::Duplicate(_) => JobError::Duplicate(job_id.clone()),
            other => JobError::Store(other),
        })?;

        lock(&self.jobs).insert(job_id.clone(), Arc::new(Mutex::new(Job::new(state.clone(), self.log_capacity))));
        info!(%job_id, plan_id = ?state.plan_id, mode = state.mode.as_str(), "Created job");
        Ok(state)
    }

    /// Drop finished jobs older than the TTL from memory
    ///
    /// Their durable copies remain available through `get_job_payload`.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = now_ms() - i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        // job locks are taken without the map lock held
        let candidates: Vec<(String, Arc<Mutex<Job>>)> = lock(&self.jobs)
            .iter()
            .map(|(id, job)| (id.clone(), Arc::clone(job)))
            .collect();
        let expired: Vec<(String, Arc<Mutex<Job>>)> = candidates
            .into_iter()
            .filter(|(_, job)| lock(job).is_expired(cutoff))
            .collect();

        let mut jobs = lock(&self.jobs);
        let mut evicted = 0;
        for (job_id, job) in expired {
            if jobs.get(&job_id).is_some_and(|current| Arc::ptr_eq(current, &job)) {
                jobs.remove(&job_id);
                evicted += 1;
            }
        }
        drop(jobs);
        if evicted > 0 {
            debug!(evicted, "sweep_expired: evicted finished jobs");
        }
        evicted
    }

    fn transition(
        &self,
        job_id: &str,
        next: JobStatus,
        apply: impl FnOnce(&mut JobSnapshot),
    ) -> Result<JobSnapshot, JobError> {
        let job = self.job(job_id)?;
        let mut job = lock(&job);
        let current = job.state.status;
        if !current.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current,
                to: next,
            });
        }

        job.state.status = next;
        apply(&mut job.state);
        if next.is_terminal() {
            job.flush(&self.store)?;
        }
        self.store.save_job(&job.state.to_record())?;

        let summary = job.summary();
        job.broadcast(StreamMessage::event(summary.clone()));
        if next.is_terminal() {
            // ends every open stream
            job.subscribers.clear();
        }
        Ok(summary)
    }

    pub fn mark_running(&self, job_id: &str) -> Result<JobSnapshot, JobError> {
        debug!(%job_id, "mark_running: called");
        self.transition(job_id, JobStatus::Running, |state| {
            state.started_at = Some(now_ms());
        })
    }

    pub fn mark_success(&self, job_id: &str, result: Value, stats: Map<String, Value>) -> Result<JobSnapshot, JobError> {
        debug!(%job_id, "mark_success: called");
        let snapshot = self.transition(job_id, JobStatus::Succeeded, |state| {
            state.finished_at = Some(now_ms());
            state.result = Some(result);
            state.stats = stats;
        })?;
        info!(%job_id, "Job succeeded");
        Ok(snapshot)
    }

    pub fn mark_failure(
        &self,
        job_id: &str,
        error_message: impl Into<String>,
        result: Option<Value>,
        stats: Option<Map<String, Value>>,
    ) -> Result<JobSnapshot, JobError> {
        let error_message = error_message.into();
        debug!(%job_id, error = %error_message, "mark_failure: called");
        let snapshot = self.transition(job_id, JobStatus::Failed, |state| {
            state.finished_at = Some(now_ms());
            state.error = Some(error_message.clone());
            if result.is_some() {
                state.result = result;
            }
            if let Some(stats) = stats {
                state.stats = stats;
            }
        })?;
        error!(%job_id, error = %error_message, "Job failed");
        Ok(snapshot)
    }

    /// Buffer, persist and broadcast one log line
    ///
    /// The line is buffered and broadcast even if the durable write fails; it
    /// stays pending and is retried with the next write.
    pub fn append_log(
        &self,
        job_id: &str,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<JobLogRecord, JobError> {
        let job = self.job(job_id)?;
        let mut job = lock(&job);
        let entry = job.push_log(level, message.into(), metadata);

        let mut event = job.summary();
        event.logs = vec![entry.clone()];
        job.broadcast(StreamMessage::event(event));

        job.flush(&self.store)?;
        Ok(entry)
    }

    /// Record a redacted action log entry for a job
    pub fn append_action(&self, job_id: &str, action: &str, payload: &Value) -> Result<i64, JobError> {
        debug!(%job_id, %action, "append_action: called");
        match self.job(job_id) {
            Ok(job) => {
                let _guard = lock(&job);
                Ok(self.store.append_action_log(job_id, action, payload)?)
            }
            Err(_) => Ok(self.store.append_action_log(job_id, action, payload)?),
        }
    }

    /// Open a stream: a full snapshot first, then events until the job ends
    pub fn subscribe(&self, job_id: &str) -> Result<JobSubscription, JobError> {
        debug!(%job_id, "subscribe: called");
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let snapshot = match self.job(job_id) {
            Ok(job) => {
                let mut job = lock(&job);
                let snapshot = job.full();
                let _ = tx.send(StreamMessage::snapshot(snapshot.clone()));
                if !snapshot.status.is_terminal() {
                    job.subscribers.push(Subscriber { id, tx });
                }
                snapshot
            }
            Err(_) => {
                let snapshot = self.load_durable(job_id)?;
                let _ = tx.send(StreamMessage::snapshot(snapshot.clone()));
                snapshot
            }
        };

        Ok(JobSubscription {
            job_id: job_id.to_string(),
            id,
            rx,
            last: snapshot.summary(),
        })
    }

    /// Stop delivering to a subscriber; returns false if it was not registered
    pub fn unsubscribe(&self, job_id: &str, subscriber_id: u64) -> bool {
        let Ok(job) = self.job(job_id) else {
            return false;
        };
        let mut job = lock(&job);
        let before = job.subscribers.len();
        job.subscribers.retain(|s| s.id != subscriber_id);
        before != job.subscribers.len()
    }

    /// Bind a job created without a plan to `plan_id`
    ///
    /// Runs under the job's lock, so no line can be appended between moving
    /// the mirror and flushing the pending buffer.
    pub fn attach_plan(&self, job_id: &str, plan_id: i64) -> Result<JobSnapshot, JobError> {
        debug!(%job_id, plan_id, "attach_plan: called");
        let job = match self.job(job_id) {
            Ok(job) => job,
            Err(_) => {
                self.store.attach_job(job_id, plan_id)?;
                return self.load_durable(job_id);
            }
        };

        let mut job = lock(&job);
        if job.state.plan_id == Some(plan_id) {
            return Ok(job.summary());
        }
        let moved = self.store.attach_job(job_id, plan_id)?;
        job.state.plan_id = Some(plan_id);
        let flushed = job.flush(&self.store)?;
        self.store.save_job(&job.state.to_record())?;

        let summary = job.summary();
        job.broadcast(StreamMessage::event(summary.clone()));
        info!(%job_id, plan_id, moved, flushed, "Attached job to plan");
        Ok(summary)
    }

    /// Full job state from memory, else from the durable mirror
    pub fn get_job_payload(&self, job_id: &str) -> Result<JobSnapshot, JobError> {
        debug!(%job_id, "get_job_payload: called");
        if let Ok(job) = self.job(job_id) {
            return Ok(lock(&job).full());
        }
        self.load_durable(job_id)
    }

    fn load_durable(&self, job_id: &str) -> Result<JobSnapshot, JobError> {
        match self.store.load_job(job_id)? {
            Some((record, logs)) => JobSnapshot::from_record(record, logs),
            None => Err(JobError::NotFound(job_id.to_string())),
        }
    }

    /// In-memory jobs (summaries), oldest first
    pub fn list_jobs(&self, plan_id: Option<i64>) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Mutex<Job>>> = lock(&self.jobs).values().cloned().collect();
        let mut out: Vec<JobSnapshot> = jobs
            .iter()
            .map(|job| lock(job).summary())
            .filter(|s| plan_id.is_none() || s.plan_id == plan_id)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        out
    }
}

/// Receiving end of a job stream
pub struct JobSubscription {
    job_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    last: JobSnapshot,
}

impl JobSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next message, or None once the job has ended and the stream drained
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        let message = self.rx.recv().await?;
        self.last = message.job.summary();
        Some(message)
    }

    /// Like `recv`, but yields a heartbeat after `heartbeat` of silence
    pub async fn next(&mut self, heartbeat: Duration) -> Option<StreamMessage> {
        match tokio::time::timeout(heartbeat, self.rx.recv()).await {
            Ok(Some(message)) => {
                self.last = message.job.summary();
                Some(message)
            }
            Ok(None) => None,
            Err(_) => Some(StreamMessage::heartbeat(self.last.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobMode, StreamKind};
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(capacity: usize) -> (TempDir, JobManager) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        (dir, JobManager::new(store, capacity, Duration::from_secs(3600)))
    }

    fn state(job_id: &str) -> JobSnapshot {
        JobSnapshot {
            job_id: job_id.to_string(),
            plan_id: None,
            task_id: None,
            mode: JobMode::PlanWide,
            status: JobStatus::Queued,
            created_at: 0,
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
            stats: Map::new(),
            params: Map::new(),
            metadata: Map::new(),
            logs: Vec::new(),
        }
    }

    #[test]
    fn test_create_job_generates_ids() {
        let (_dir, manager) = manager(10);
        let a = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        let b = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(manager.list_jobs(None).len(), 2);
    }

    #[test]
    fn test_duplicate_explicit_id_rejected() {
        let (_dir, manager) = manager(10);
        manager.create_job(NewJob::new(JobMode::PlanWide).with_id("fixed")).unwrap();
        let err = manager
            .create_job(NewJob::new(JobMode::SingleNode).with_id("fixed"))
            .unwrap_err();
        assert!(matches!(err, JobError::Duplicate(id) if id == "fixed"));
    }

    #[test]
    fn test_lifecycle_is_one_way() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();

        let running = manager.mark_running(&job.job_id).unwrap();
        assert!(running.started_at.is_some());
        let done = manager
            .mark_success(&job.job_id, json!({"ok": true}), Map::new())
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(done.finished_at.is_some());

        let err = manager.mark_failure(&job.job_id, "late", None, None).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert!(matches!(
            manager.mark_running(&job.job_id),
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_job_not_found() {
        let (_dir, manager) = manager(10);
        assert!(manager.mark_running("nope").unwrap_err().is_not_found());
        assert!(manager.get_job_payload("nope").unwrap_err().is_not_found());
        assert!(manager.subscribe("nope").is_err());
    }

    #[test]
    fn test_log_buffer_bounded_but_mirror_complete() {
        let (_dir, manager) = manager(3);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        for i in 0..5 {
            manager
                .append_log(&job.job_id, LogLevel::Info, format!("line {}", i), Map::new())
                .unwrap();
        }

        let payload = manager.get_job_payload(&job.job_id).unwrap();
        let messages: Vec<_> = payload.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);

        let (_, durable) = manager.store().load_job(&job.job_id).unwrap().unwrap();
        assert_eq!(durable.len(), 5);
        assert_eq!(durable[0].seq, 1);
    }

    #[test]
    fn test_failure_keeps_partial_result() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager.mark_running(&job.job_id).unwrap();
        let mut stats = Map::new();
        stats.insert("created".to_string(), json!(2));
        let failed = manager
            .mark_failure(&job.job_id, "generator down", Some(json!({"created": [1, 2]})), Some(stats))
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("generator down"));
        assert_eq!(failed.result.unwrap()["created"], json!([1, 2]));
        assert_eq!(failed.stats["created"], 2);
    }

    #[tokio::test]
    async fn test_subscriber_gets_snapshot_then_events_in_order() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager
            .append_log(&job.job_id, LogLevel::Info, "before", Map::new())
            .unwrap();

        let mut sub = manager.subscribe(&job.job_id).unwrap();
        manager.mark_running(&job.job_id).unwrap();
        manager
            .append_log(&job.job_id, LogLevel::Warn, "during", Map::new())
            .unwrap();
        manager.mark_success(&job.job_id, json!(null), Map::new()).unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, StreamKind::Snapshot);
        assert_eq!(first.job.logs.len(), 1);
        assert_eq!(first.job.logs[0].message, "before");

        let second = sub.recv().await.unwrap();
        assert_eq!(second.kind, StreamKind::Event);
        assert_eq!(second.job.status, JobStatus::Running);

        let third = sub.recv().await.unwrap();
        assert_eq!(third.job.logs[0].message, "during");
        assert_eq!(third.job.logs[0].level, "warn");

        let fourth = sub.recv().await.unwrap();
        assert!(fourth.is_terminal());

        // senders dropped after the terminal broadcast
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_on_silence() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        let mut sub = manager.subscribe(&job.job_id).unwrap();

        let first = sub.next(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.kind, StreamKind::Snapshot);
        let beat = sub.next(Duration::from_millis(20)).await.unwrap();
        assert_eq!(beat.kind, StreamKind::Heartbeat);
        assert_eq!(beat.job.job_id, job.job_id);
        assert!(beat.job.logs.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        let mut sub = manager.subscribe(&job.job_id).unwrap();
        assert!(manager.unsubscribe(&job.job_id, sub.id()));
        assert!(!manager.unsubscribe(&job.job_id, sub.id()));

        manager.mark_running(&job.job_id).unwrap();
        assert_eq!(sub.recv().await.unwrap().kind, StreamKind::Snapshot);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_to_finished_job_ends_after_snapshot() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager.mark_failure(&job.job_id, "nope", None, None).unwrap();

        let mut sub = manager.subscribe(&job.job_id).unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.job.status, JobStatus::Failed);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_attach_plan_moves_mirror() {
        let (_dir, manager) = manager(10);
        let plan = manager.store().create_plan("Later", None, Map::new()).unwrap();
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager
            .append_log(&job.job_id, LogLevel::Info, "unbound", Map::new())
            .unwrap();
        manager
            .append_action(&job.job_id, "create_plan", &json!({"api_key": "sk-1", "title": "Later"}))
            .unwrap();

        let attached = manager.attach_plan(&job.job_id, plan.id).unwrap();
        assert_eq!(attached.plan_id, Some(plan.id));
        manager
            .append_log(&job.job_id, LogLevel::Info, "bound", Map::new())
            .unwrap();

        let (record, logs) = manager.store().load_job(&job.job_id).unwrap().unwrap();
        assert_eq!(record.plan_id, Some(plan.id));
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["unbound", "bound"]);

        let actions = manager.store().list_action_logs(&job.job_id).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].payload["api_key"], "[REDACTED]");

        // idempotent for the same plan
        assert_eq!(manager.attach_plan(&job.job_id, plan.id).unwrap().plan_id, Some(plan.id));
    }

    #[test]
    fn test_sweep_evicts_only_expired_finished_jobs() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let manager = JobManager::new(store, 10, Duration::ZERO);

        let done = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager.mark_success(&done.job_id, json!({"n": 1}), Map::new()).unwrap();
        let live = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager.mark_running(&live.job_id).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        manager.sweep_expired();
        let ids: Vec<_> = manager.list_jobs(None).into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![live.job_id.clone()]);

        // durable copy still answers
        let payload = manager.get_job_payload(&done.job_id).unwrap();
        assert_eq!(payload.status, JobStatus::Succeeded);
        assert_eq!(payload.result.unwrap()["n"], 1);
    }

    #[test]
    fn test_sweep_does_not_hold_registry_while_job_is_busy() {
        let (_dir, manager) = manager(10);
        let busy = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        manager.mark_running(&busy.job_id).unwrap();
        let handle = manager.job(&busy.job_id).unwrap();

        std::thread::scope(|scope| {
            let guard = lock(&handle);
            let sweeper = scope.spawn(|| manager.sweep_expired());
            std::thread::sleep(Duration::from_millis(50));
            // sweeper is parked on the busy job, not on the map
            assert!(manager.jobs.try_lock().is_ok());
            drop(guard);
            assert_eq!(sweeper.join().unwrap(), 0);
        });
        assert_eq!(manager.list_jobs(None).len(), 1);
    }

    #[test]
    fn test_list_jobs_filters_by_plan() {
        let (_dir, manager) = manager(10);
        let plan = manager.store().create_plan("P", None, Map::new()).unwrap();
        manager.create_job(NewJob::new(JobMode::PlanWide).for_plan(plan.id)).unwrap();
        manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        assert_eq!(manager.list_jobs(Some(plan.id)).len(), 1);
        assert_eq!(manager.list_jobs(None).len(), 2);
    }

    #[test]
    fn test_flush_is_exactly_once() {
        let (_dir, manager) = manager(10);
        let job = manager.create_job(NewJob::new(JobMode::PlanWide)).unwrap();
        let handle = manager.job(&job.job_id).unwrap();
        let mut guard = lock(&handle);
        guard.push_log(LogLevel::Info, "a".to_string(), Map::new());
        guard.push_log(LogLevel::Info, "b".to_string(), Map::new());
        assert_eq!(guard.flush(manager.store()).unwrap(), 2);
        assert_eq!(guard.flush(manager.store()).unwrap(), 0);
        assert_eq!(guard.persisted_seq, 2);
    }

    #[test]
    fn test_failed_write_keeps_lines_past_ring_capacity() {
        let (_dir, manager) = manager(2);
        let snapshot = state("late-index");
        // registered in memory only, so durable writes fail until indexed
        lock(&manager.jobs).insert(
            snapshot.job_id.clone(),
            Arc::new(Mutex::new(Job::new(snapshot.clone(), manager.log_capacity))),
        );

        for i in 0..5 {
            let err = manager
                .append_log(&snapshot.job_id, LogLevel::Info, format!("line {}", i), Map::new())
                .unwrap_err();
            assert!(matches!(err, JobError::Store(_)));
        }
        assert_eq!(manager.get_job_payload(&snapshot.job_id).unwrap().logs.len(), 2);

        manager.store().insert_job(&snapshot.to_record()).unwrap();
        manager
            .append_log(&snapshot.job_id, LogLevel::Info, "line 5", Map::new())
            .unwrap();

        let (_, logs) = manager.store().load_job(&snapshot.job_id).unwrap().unwrap();
        let seqs: Vec<i64> = logs.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(logs[0].message, "line 0");

        let handle = manager.job(&snapshot.job_id).unwrap();
        let guard = lock(&handle);
        assert!(guard.unpersisted.is_empty());
        assert_eq!(guard.persisted_seq, 6);
    }

    proptest! {
        #[test]
        fn prop_log_buffer_never_exceeds_capacity(capacity in 1usize..16, lines in 0usize..64) {
            let mut job = Job::new(state("p"), capacity);
            for i in 0..lines {
                job.push_log(LogLevel::Debug, format!("{}", i), Map::new());
                prop_assert!(job.logs.len() <= capacity);
            }
            prop_assert_eq!(job.logs.len(), lines.min(capacity));
            // oldest dropped first, order preserved
            let seqs: Vec<i64> = job.logs.iter().map(|l| l.seq).collect();
            let expected: Vec<i64> = ((lines.saturating_sub(capacity) + 1) as i64..=lines as i64).collect();
            prop_assert_eq!(seqs, expected);
        }
    }
}
