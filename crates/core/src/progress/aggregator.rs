//! Recomputes parent counters from children and settles finished parents.

use std::sync::Arc;

use tracing::{debug, info};

use crate::events::{EngineEvent, EventHandle};
use crate::lifecycle::{settle_outcome, Action, ChildTally, EntityKind};
use crate::metrics;
use crate::work::{Batch, Job, Progress, StoreError, WorkStore};

use super::locks::EntityLocks;

fn progress_of(tally: &ChildTally) -> Progress {
    Progress {
        total: tally.total,
        completed: tally.completed,
        failed: tally.failed,
    }
}

/// Rolls submission outcomes up into job and batch counters.
///
/// Counters are always recounted from the children, never incremented, so
/// running a rollup twice on a consistent tree writes nothing and emits nothing.
pub struct ProgressAggregator {
    store: Arc<dyn WorkStore>,
    locks: Arc<EntityLocks>,
    events: EventHandle,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn WorkStore>, events: EventHandle) -> Self {
        Self {
            store,
            locks: Arc::new(EntityLocks::new()),
            events,
        }
    }

    /// Locks shared with the control surface.
    pub fn locks(&self) -> &Arc<EntityLocks> {
        &self.locks
    }

    /// Recount a job, settle it if every submission is terminal, and roll the
    /// owning batch up when the job just settled.
    pub async fn rollup_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let (job, settled) = {
            let _guard = self.locks.lock(job_id).await;
            self.recompute_job(job_id).await?
        };

        if settled {
            if let Some(ref batch_id) = job.batch_id {
                self.rollup_batch(batch_id).await?;
            }
        }

        Ok(job)
    }

    /// Recount a batch from its jobs and settle it if every job is terminal.
    pub async fn rollup_batch(&self, batch_id: &str) -> Result<Batch, StoreError> {
        let _guard = self.locks.lock(batch_id).await;
        self.recompute_batch(batch_id).await
    }

    /// Caller must hold the job lock. Returns the job and whether it settled.
    async fn recompute_job(&self, job_id: &str) -> Result<(Job, bool), StoreError> {
        let job = self.store.get_job(job_id)?.ok_or_else(|| StoreError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })?;

        let tally = self.store.submission_tally(job_id)?;
        let progress = progress_of(&tally);
        let mut job = if job.progress() != progress {
            self.store.set_job_progress(job_id, progress)?
        } else {
            job
        };

        if !job.status.is_active() {
            return Ok((job, false));
        }

        let Some(outcome) = settle_outcome(&tally) else {
            return Ok((job, false));
        };

        let from = job.status;
        let to = from.apply(EntityKind::Job, Action::Settle(outcome))?;
        match self.store.transition_job(job_id, from, to) {
            Ok(updated) => {
                info!(
                    job_id = %job_id,
                    status = %to,
                    completed = progress.completed,
                    failed = progress.failed,
                    total = progress.total,
                    "Job settled"
                );
                metrics::ENTITIES_SETTLED
                    .with_label_values(&["job", to.as_str()])
                    .inc();
                self.events
                    .emit(EngineEvent::status_changed(
                        EntityKind::Job,
                        job_id,
                        from,
                        to,
                        Action::Settle(to),
                    ))
                    .await;
                job = updated;
                Ok((job, true))
            }
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(job_id = %job_id, actual = %actual, "Job changed before it could settle");
                let job = self.store.get_job(job_id)?.unwrap_or(job);
                Ok((job, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Caller must hold the batch lock.
    async fn recompute_batch(&self, batch_id: &str) -> Result<Batch, StoreError> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "batch",
                id: batch_id.to_string(),
            })?;

        let tally = self.store.job_tally(batch_id)?;
        let progress = progress_of(&tally);
        let batch = if batch.progress() != progress {
            self.store.set_batch_progress(batch_id, progress)?
        } else {
            batch
        };

        if !batch.status.is_active() {
            return Ok(batch);
        }

        let Some(outcome) = settle_outcome(&tally) else {
            return Ok(batch);
        };

        let from = batch.status;
        let to = from.apply(EntityKind::Batch, Action::Settle(outcome))?;
        match self.store.transition_batch(batch_id, from, to) {
            Ok(updated) => {
                info!(
                    batch_id = %batch_id,
                    status = %to,
                    completed_jobs = progress.completed,
                    failed_jobs = progress.failed,
                    total_jobs = progress.total,
                    "Batch settled"
                );
                metrics::ENTITIES_SETTLED
                    .with_label_values(&["batch", to.as_str()])
                    .inc();
                self.events
                    .emit(EngineEvent::status_changed(
                        EntityKind::Batch,
                        batch_id,
                        from,
                        to,
                        Action::Settle(to),
                    ))
                    .await;
                Ok(updated)
            }
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(batch_id = %batch_id, actual = %actual, "Batch changed before it could settle");
                Ok(self.store.get_batch(batch_id)?.unwrap_or(batch))
            }
            Err(e) => Err(e),
        }
    }
}
