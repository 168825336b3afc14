//! Control operations on batches and jobs.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventHandle};
use crate::lifecycle::{Action, EntityKind, SubmissionStatus, TransitionError, WorkStatus};
use crate::metrics;
use crate::progress::ProgressAggregator;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::work::{
    Batch, Job, JobFilter, NewBatch, NewJob, NewSubmission, StoreError, Submission,
    SubmissionFilter, WorkStore, MAX_PRIORITY, MIN_PRIORITY,
};

use super::types::{AddSubmissionRequest, CreateBatchRequest, CreateJobRequest, EngineError};

/// Statuses in which a parent still accepts new children.
fn accepts_children(status: WorkStatus) -> bool {
    matches!(status, WorkStatus::Draft | WorkStatus::Pending)
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_priority(priority: u8) -> Result<(), EngineError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(EngineError::Validation(format!(
            "priority must be between {} and {}, got {}",
            MIN_PRIORITY, MAX_PRIORITY, priority
        )));
    }
    Ok(())
}

fn copy_name(name: &str) -> String {
    format!("{} (copy)", name)
}

/// Entry point for every state-changing operation on the work tree.
///
/// Each operation validates against the lifecycle rules, writes under the
/// entity's lock with a compare-and-set, emits a status event, and tells the
/// scheduler about new or unblocked work. Entity locks are never nested:
/// cascades release the parent lock before taking each child's.
pub struct WorkController {
    store: Arc<dyn WorkStore>,
    aggregator: Arc<ProgressAggregator>,
    scheduler: Arc<Scheduler>,
    events: EventHandle,
    default_retry: RetryPolicy,
}

impl WorkController {
    pub fn new(
        store: Arc<dyn WorkStore>,
        aggregator: Arc<ProgressAggregator>,
        scheduler: Arc<Scheduler>,
        events: EventHandle,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            aggregator,
            scheduler,
            events,
            default_retry,
        }
    }

    // Creation

    pub async fn create_batch(&self, req: CreateBatchRequest) -> Result<Batch, EngineError> {
        validate_name(&req.name)?;
        validate_priority(req.priority)?;

        let batch = self.store.create_batch(NewBatch {
            name: req.name,
            priority: req.priority,
            tags: req.tags,
            owner: req.owner,
            deadline: req.deadline,
        })?;

        info!(batch_id = %batch.id, name = %batch.name, priority = batch.priority, "Batch created");
        self.count(EntityKind::Batch, "create");
        self.events
            .emit(EngineEvent::BatchCreated {
                batch_id: batch.id.clone(),
                name: batch.name.clone(),
                priority: batch.priority,
                owner: batch.owner.clone(),
            })
            .await;

        Ok(batch)
    }

    /// Create a job, optionally inside a draft or pending batch, together with
    /// its initial submissions.
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job, EngineError> {
        validate_name(&req.name)?;
        if req.provider.trim().is_empty() {
            return Err(EngineError::Validation("provider must not be empty".to_string()));
        }
        if let Some(priority) = req.priority {
            validate_priority(priority)?;
        }

        let job = match req.batch_id {
            Some(ref batch_id) => {
                let _guard = self.aggregator.locks().lock(batch_id).await;
                let batch = self.load_batch(batch_id)?;
                if !accepts_children(batch.status) {
                    return Err(EngineError::Validation(format!(
                        "batch {} is {} and no longer accepts jobs",
                        batch.id, batch.status
                    )));
                }
                self.insert_job(&req)?
            }
            None => self.insert_job(&req)?,
        };

        info!(
            job_id = %job.id,
            batch_id = ?job.batch_id,
            provider = %job.provider,
            submissions = req.submissions.len(),
            "Job created"
        );
        self.count(EntityKind::Job, "create");
        self.events
            .emit(EngineEvent::JobCreated {
                job_id: job.id.clone(),
                batch_id: job.batch_id.clone(),
                provider: job.provider.clone(),
            })
            .await;

        self.refresh_job(&job).await
    }

    /// Add a queued submission to a draft or pending job.
    pub async fn add_submission(
        &self,
        job_id: &str,
        req: AddSubmissionRequest,
    ) -> Result<Submission, EngineError> {
        let submission = {
            let _guard = self.aggregator.locks().lock(job_id).await;
            let job = self.load_job(job_id)?;
            if !accepts_children(job.status) {
                return Err(EngineError::Validation(format!(
                    "job {} is {} and no longer accepts submissions",
                    job.id, job.status
                )));
            }
            self.store.add_submission(NewSubmission {
                job_id: job.id,
                payload: req.payload,
            })?
        };

        debug!(submission_id = %submission.id, job_id = %job_id, "Submission added");
        self.aggregator.rollup_job(job_id).await?;
        Ok(submission)
    }

    // Batch operations

    /// Move a draft batch and its draft jobs to pending.
    pub async fn mark_ready_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let batch = {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            self.move_batch(batch, Action::MarkReady).await?
        };
        self.count(EntityKind::Batch, "mark_ready");

        for job in self.batch_jobs(batch_id, Some(WorkStatus::Draft))? {
            let _guard = self.aggregator.locks().lock(&job.id).await;
            let job = self.load_job(&job.id)?;
            if job.status == WorkStatus::Draft {
                self.move_job(job, Action::MarkReady).await?;
            }
        }

        Ok(batch)
    }

    /// Start a pending batch. Draft and pending jobs with queued submissions
    /// are started; ones with nothing to dispatch are cancelled.
    pub async fn start_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let jobs = {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            batch.status.apply(EntityKind::Batch, Action::Start)?;

            let jobs = self.batch_jobs(batch_id, None)?;
            let mut eligible = 0;
            for job in &jobs {
                if !job.status.is_terminal() && self.queued_count(&job.id)? > 0 {
                    eligible += 1;
                }
            }
            if eligible == 0 {
                return Err(EngineError::NoEligibleWork {
                    kind: EntityKind::Batch,
                    id: batch_id.to_string(),
                });
            }

            self.move_batch(batch, Action::Start).await?;
            jobs
        };
        self.count(EntityKind::Batch, "start");

        for job in jobs {
            if !accepts_children(job.status) {
                continue;
            }

            let started = {
                let _guard = self.aggregator.locks().lock(&job.id).await;
                let mut job = self.load_job(&job.id)?;
                if !accepts_children(job.status) {
                    continue;
                }
                if self.queued_count(&job.id)? == 0 {
                    warn!(job_id = %job.id, batch_id = %batch_id, "Job has no submissions, cancelling");
                    self.move_job(job, Action::Cancel).await?;
                    false
                } else {
                    if job.status == WorkStatus::Draft {
                        job = self.move_job(job, Action::MarkReady).await?;
                    }
                    self.move_job(job, Action::Start).await?;
                    true
                }
            };

            if started {
                self.scheduler.enqueue_job(&job.id)?;
            }
        }

        Ok(self.aggregator.rollup_batch(batch_id).await?)
    }

    /// Pause a batch and every processing job in it.
    pub async fn pause_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let batch = {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            self.move_batch(batch, Action::Pause).await?
        };
        self.count(EntityKind::Batch, "pause");

        for job in self.batch_jobs(batch_id, Some(WorkStatus::Processing))? {
            let _guard = self.aggregator.locks().lock(&job.id).await;
            let job = self.load_job(&job.id)?;
            if job.status == WorkStatus::Processing {
                self.move_job(job, Action::Pause).await?;
            }
        }

        Ok(batch)
    }

    /// Resume a paused batch and its paused jobs.
    pub async fn resume_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let batch = {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            self.move_batch(batch, Action::Resume).await?
        };
        self.count(EntityKind::Batch, "resume");

        for job in self.batch_jobs(batch_id, Some(WorkStatus::Paused))? {
            let resumed = {
                let _guard = self.aggregator.locks().lock(&job.id).await;
                let job = self.load_job(&job.id)?;
                if job.status == WorkStatus::Paused {
                    self.move_job(job, Action::Resume).await?;
                    true
                } else {
                    false
                }
            };
            if resumed {
                self.scheduler.enqueue_job(&job.id)?;
            }
        }
        self.scheduler.wake();

        Ok(batch)
    }

    /// Cancel a batch, its open jobs and their open submissions. Finished
    /// results are kept.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            self.move_batch(batch, Action::Cancel).await?;
        }
        self.count(EntityKind::Batch, "cancel");

        let mut cancelled = HashSet::new();
        for job in self.batch_jobs(batch_id, None)? {
            if job.status.is_terminal() {
                continue;
            }
            if self.cancel_job_locked(&job.id).await? {
                cancelled.insert(job.id);
            }
        }

        self.scheduler.drop_jobs(&cancelled);
        for job_id in &cancelled {
            self.aggregator.rollup_job(job_id).await?;
        }

        Ok(self.aggregator.rollup_batch(batch_id).await?)
    }

    /// Requeue every failed submission in the batch, reopening settled jobs
    /// and the batch itself. Attempt counts are preserved.
    pub async fn retry_failed_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let candidates = {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            batch.status.apply(EntityKind::Batch, Action::RetryFailed)?;

            let mut candidates = Vec::new();
            for job in self.batch_jobs(batch_id, None)? {
                if job.status != WorkStatus::Cancelled
                    && self.store.submission_tally(&job.id)?.failed > 0
                {
                    candidates.push(job.id);
                }
            }
            if candidates.is_empty() {
                return Err(EngineError::NoEligibleWork {
                    kind: EntityKind::Batch,
                    id: batch_id.to_string(),
                });
            }

            self.move_batch(batch, Action::RetryFailed).await?;
            candidates
        };
        self.count(EntityKind::Batch, "retry_failed");

        for job_id in candidates {
            if self.reset_job_failures(&job_id).await? > 0 {
                self.scheduler.enqueue_job(&job_id)?;
            }
            self.aggregator.rollup_job(&job_id).await?;
        }

        Ok(self.aggregator.rollup_batch(batch_id).await?)
    }

    /// Create a draft copy of a batch with its jobs and submission payloads.
    pub async fn duplicate_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let source = self.load_batch(batch_id)?;
        let copy = self.store.create_batch(NewBatch {
            name: copy_name(&source.name),
            priority: source.priority,
            tags: source.tags.clone(),
            owner: source.owner.clone(),
            deadline: source.deadline,
        })?;

        let mut jobs = Vec::new();
        for job in self.batch_jobs(batch_id, None)? {
            jobs.push(self.copy_job(&job, job.name.clone(), Some(copy.id.clone()))?);
        }

        info!(
            source_id = %source.id,
            batch_id = %copy.id,
            jobs = jobs.len(),
            "Batch duplicated"
        );
        self.count(EntityKind::Batch, "duplicate");
        self.events
            .emit(EngineEvent::Duplicated {
                entity: EntityKind::Batch,
                source_id: source.id,
                new_id: copy.id.clone(),
            })
            .await;

        for job in &jobs {
            self.aggregator.rollup_job(&job.id).await?;
        }
        Ok(self.aggregator.rollup_batch(&copy.id).await?)
    }

    /// Freeze a settled batch.
    pub async fn archive_batch(&self, batch_id: &str) -> Result<Batch, EngineError> {
        let _guard = self.aggregator.locks().lock(batch_id).await;
        let batch = self.load_batch(batch_id)?;
        let batch = self.move_batch(batch, Action::Archive).await?;
        self.count(EntityKind::Batch, "archive");
        Ok(batch)
    }

    // Job operations

    pub async fn mark_ready_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let _guard = self.aggregator.locks().lock(job_id).await;
        let job = self.load_job(job_id)?;
        let job = self.move_job(job, Action::MarkReady).await?;
        self.count(EntityKind::Job, "mark_ready");
        Ok(job)
    }

    /// Start a pending job. Dispatch still waits for the owning batch to be
    /// processing.
    pub async fn start_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = {
            let _guard = self.aggregator.locks().lock(job_id).await;
            let job = self.load_job(job_id)?;
            job.status.apply(EntityKind::Job, Action::Start)?;
            if self.queued_count(job_id)? == 0 {
                return Err(EngineError::NoEligibleWork {
                    kind: EntityKind::Job,
                    id: job_id.to_string(),
                });
            }
            self.move_job(job, Action::Start).await?
        };
        self.count(EntityKind::Job, "start");

        self.scheduler.enqueue_job(job_id)?;
        Ok(job)
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let _guard = self.aggregator.locks().lock(job_id).await;
        let job = self.load_job(job_id)?;
        let job = self.move_job(job, Action::Pause).await?;
        self.count(EntityKind::Job, "pause");
        Ok(job)
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = {
            let _guard = self.aggregator.locks().lock(job_id).await;
            let job = self.load_job(job_id)?;
            self.move_job(job, Action::Resume).await?
        };
        self.count(EntityKind::Job, "resume");

        self.scheduler.enqueue_job(job_id)?;
        Ok(job)
    }

    /// Cancel a job and its open submissions.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = self.load_job(job_id)?;
        job.status.apply(EntityKind::Job, Action::Cancel)?;

        if !self.cancel_job_locked(job_id).await? {
            // Settled between the check and the lock.
            let job = self.load_job(job_id)?;
            return Err(TransitionError::Work {
                kind: EntityKind::Job,
                from: job.status,
                action: Action::Cancel,
            }
            .into());
        }
        self.count(EntityKind::Job, "cancel");

        self.scheduler.drop_jobs(&HashSet::from([job_id.to_string()]));
        let job = self.aggregator.rollup_job(job_id).await?;
        if let Some(ref batch_id) = job.batch_id {
            self.aggregator.rollup_batch(batch_id).await?;
        }
        Ok(job)
    }

    /// Requeue the job's failed submissions, reopening the job and its batch
    /// if they had settled. Attempt counts are preserved.
    pub async fn retry_failed_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = self.load_job(job_id)?;
        job.status.apply(EntityKind::Job, Action::RetryFailed)?;
        if self.store.submission_tally(job_id)?.failed == 0 {
            return Err(EngineError::NoEligibleWork {
                kind: EntityKind::Job,
                id: job_id.to_string(),
            });
        }

        if let Some(ref batch_id) = job.batch_id {
            let _guard = self.aggregator.locks().lock(batch_id).await;
            let batch = self.load_batch(batch_id)?;
            self.move_batch(batch, Action::RetryFailed).await?;
        }

        let reset = self.reset_job_failures(job_id).await?;
        self.count(EntityKind::Job, "retry_failed");
        if reset > 0 {
            self.scheduler.enqueue_job(job_id)?;
        }

        let job = self.aggregator.rollup_job(job_id).await?;
        if let Some(ref batch_id) = job.batch_id {
            self.aggregator.rollup_batch(batch_id).await?;
        }
        Ok(job)
    }

    /// Create a draft copy of a job. The copy stays in the same batch while
    /// that batch still accepts jobs, otherwise it is standalone.
    pub async fn duplicate_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let source = self.load_job(job_id)?;

        let copy = match source.batch_id {
            Some(ref batch_id) => {
                let _guard = self.aggregator.locks().lock(batch_id).await;
                let target = self
                    .store
                    .get_batch(batch_id)?
                    .filter(|b| accepts_children(b.status))
                    .map(|b| b.id);
                self.copy_job(&source, copy_name(&source.name), target)?
            }
            None => self.copy_job(&source, copy_name(&source.name), None)?,
        };

        info!(source_id = %source.id, job_id = %copy.id, "Job duplicated");
        self.count(EntityKind::Job, "duplicate");
        self.events
            .emit(EngineEvent::Duplicated {
                entity: EntityKind::Job,
                source_id: source.id.clone(),
                new_id: copy.id.clone(),
            })
            .await;

        self.refresh_job(&copy).await
    }

    /// Jobs are never archived; only their batch is.
    pub async fn archive_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = self.load_job(job_id)?;
        Err(TransitionError::Work {
            kind: EntityKind::Job,
            from: job.status,
            action: Action::Archive,
        }
        .into())
    }

    // Helpers

    fn load_batch(&self, id: &str) -> Result<Batch, EngineError> {
        self.store
            .get_batch(id)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "batch",
                id: id.to_string(),
            })
    }

    fn load_job(&self, id: &str) -> Result<Job, EngineError> {
        self.store.get_job(id)?.ok_or_else(|| EngineError::NotFound {
            kind: "job",
            id: id.to_string(),
        })
    }

    fn batch_jobs(&self, batch_id: &str, status: Option<WorkStatus>) -> Result<Vec<Job>, EngineError> {
        let mut filter = JobFilter::new().with_batch(batch_id).unbounded();
        if let Some(status) = status {
            filter = filter.with_status(status);
        }
        Ok(self.store.list_jobs(&filter)?)
    }

    fn queued_count(&self, job_id: &str) -> Result<i64, EngineError> {
        Ok(self.store.count_submissions(
            &SubmissionFilter::new()
                .with_job(job_id)
                .with_status(SubmissionStatus::Queued),
        )?)
    }

    fn count(&self, kind: EntityKind, action: &str) {
        metrics::CONTROL_OPERATIONS
            .with_label_values(&[kind.as_str(), action])
            .inc();
    }

    /// Caller must hold the batch lock.
    async fn move_batch(&self, batch: Batch, action: Action) -> Result<Batch, EngineError> {
        let from = batch.status;
        let to = from.apply(EntityKind::Batch, action)?;
        if to == from {
            return Ok(batch);
        }

        let updated = self.store.transition_batch(&batch.id, from, to)?;
        info!(batch_id = %batch.id, from = %from, to = %to, action = %action, "Batch status changed");
        self.events
            .emit(EngineEvent::status_changed(
                EntityKind::Batch,
                &batch.id,
                from,
                to,
                action,
            ))
            .await;
        Ok(updated)
    }

    /// Caller must hold the job lock.
    async fn move_job(&self, job: Job, action: Action) -> Result<Job, EngineError> {
        let from = job.status;
        let to = from.apply(EntityKind::Job, action)?;
        if to == from {
            return Ok(job);
        }

        let updated = self.store.transition_job(&job.id, from, to)?;
        info!(job_id = %job.id, from = %from, to = %to, action = %action, "Job status changed");
        self.events
            .emit(EngineEvent::status_changed(
                EntityKind::Job,
                &job.id,
                from,
                to,
                action,
            ))
            .await;
        Ok(updated)
    }

    /// Cancel one job under its lock. Returns false if it had already settled.
    async fn cancel_job_locked(&self, job_id: &str) -> Result<bool, EngineError> {
        let _guard = self.aggregator.locks().lock(job_id).await;
        let job = self.load_job(job_id)?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        self.move_job(job, Action::Cancel).await?;
        let count = self.store.cancel_open_submissions(job_id)?;
        debug!(job_id = %job_id, count, "Cancelled open submissions");
        Ok(true)
    }

    /// Reset failed submissions and reopen the job if it had settled.
    /// Returns how many submissions were requeued.
    async fn reset_job_failures(&self, job_id: &str) -> Result<u32, EngineError> {
        let _guard = self.aggregator.locks().lock(job_id).await;
        let job = self.load_job(job_id)?;
        job.status.apply(EntityKind::Job, Action::RetryFailed)?;

        let reset = self.store.reset_failed_submissions(job_id)?;
        let count = reset.len() as u32;
        if count == 0 {
            return Ok(0);
        }

        self.move_job(job, Action::RetryFailed).await?;
        info!(job_id = %job_id, count, "Failed submissions requeued");
        self.events
            .emit(EngineEvent::SubmissionsReset {
                job_id: job_id.to_string(),
                count,
            })
            .await;
        Ok(count)
    }

    fn insert_job(&self, req: &CreateJobRequest) -> Result<Job, EngineError> {
        let job = self.store.create_job(NewJob {
            batch_id: req.batch_id.clone(),
            name: req.name.clone(),
            priority: req.priority,
            provider: req.provider.clone(),
            retry_policy: req.retry_policy.unwrap_or(self.default_retry),
        })?;
        for payload in &req.submissions {
            self.store.add_submission(NewSubmission {
                job_id: job.id.clone(),
                payload: payload.clone(),
            })?;
        }
        Ok(job)
    }

    /// Copy configuration and submission payloads; no status or results.
    fn copy_job(
        &self,
        source: &Job,
        name: String,
        batch_id: Option<String>,
    ) -> Result<Job, EngineError> {
        let payloads = self
            .store
            .list_submissions(&SubmissionFilter::new().with_job(&source.id).unbounded())?
            .into_iter()
            .map(|s| s.payload)
            .collect();

        self.insert_job(&CreateJobRequest {
            batch_id,
            name,
            provider: source.provider.clone(),
            priority: source.priority,
            retry_policy: Some(source.retry_policy),
            submissions: payloads,
        })
    }

    /// Recount a new job and its batch so totals are visible immediately.
    async fn refresh_job(&self, job: &Job) -> Result<Job, EngineError> {
        let job = self.aggregator.rollup_job(&job.id).await?;
        if let Some(ref batch_id) = job.batch_id {
            match self.aggregator.rollup_batch(batch_id).await {
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(job)
    }
}
