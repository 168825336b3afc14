//! Read side of the control surface: listing, lookup and batch analytics.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::WorkStatus;
use crate::work::{
    Batch, BatchFilter, Job, JobFilter, Submission, SubmissionFilter, WorkStore,
};

use super::types::EngineError;

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of matching rows
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Per-provider slice of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderBreakdown {
    pub provider: String,
    pub jobs: u32,
    pub total_submissions: u32,
    pub completed_submissions: u32,
    pub failed_submissions: u32,
    /// Completed share of finished submissions, in percent.
    pub success_rate: f64,
}

/// Summary statistics for one batch, computed from stored counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAnalytics {
    pub batch_id: String,
    pub status: WorkStatus,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub total_submissions: u32,
    pub completed_submissions: u32,
    pub failed_submissions: u32,
    /// Completed share of finished submissions, in percent.
    pub success_rate: f64,
    /// Seconds from start to completion, or to now while still running.
    pub elapsed_secs: Option<i64>,
    pub providers: Vec<ProviderBreakdown>,
}

fn success_rate(completed: u32, failed: u32) -> f64 {
    let finished = completed + failed;
    if finished > 0 {
        (completed as f64 / finished as f64) * 100.0
    } else {
        0.0
    }
}

fn elapsed_secs(batch: &Batch, now: DateTime<Utc>) -> Option<i64> {
    let started = batch.started_at?;
    let end = batch.completed_at.unwrap_or(now);
    Some((end - started).num_seconds().max(0))
}

/// Query contract over the work store.
#[derive(Clone)]
pub struct WorkQuery {
    store: Arc<dyn WorkStore>,
}

impl WorkQuery {
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self { store }
    }

    pub fn list_batches(&self, filter: &BatchFilter) -> Result<Page<Batch>, EngineError> {
        Ok(Page {
            items: self.store.list_batches(filter)?,
            total: self.store.count_batches(filter)?,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    pub fn get_batch(&self, id: &str) -> Result<Batch, EngineError> {
        self.store
            .get_batch(id)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "batch",
                id: id.to_string(),
            })
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>, EngineError> {
        Ok(Page {
            items: self.store.list_jobs(filter)?,
            total: self.store.count_jobs(filter)?,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Job, EngineError> {
        self.store.get_job(id)?.ok_or_else(|| EngineError::NotFound {
            kind: "job",
            id: id.to_string(),
        })
    }

    pub fn list_submissions(
        &self,
        filter: &SubmissionFilter,
    ) -> Result<Page<Submission>, EngineError> {
        Ok(Page {
            items: self.store.list_submissions(filter)?,
            total: self.store.count_submissions(filter)?,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    pub fn get_submission(&self, id: &str) -> Result<Submission, EngineError> {
        self.store
            .get_submission(id)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "submission",
                id: id.to_string(),
            })
    }

    pub fn batch_analytics(&self, batch_id: &str) -> Result<BatchAnalytics, EngineError> {
        let batch = self.get_batch(batch_id)?;
        let jobs = self
            .store
            .list_jobs(&JobFilter::new().with_batch(batch_id).unbounded())?;

        let mut providers: BTreeMap<String, ProviderBreakdown> = BTreeMap::new();
        for job in &jobs {
            let entry = providers
                .entry(job.provider.clone())
                .or_insert_with(|| ProviderBreakdown {
                    provider: job.provider.clone(),
                    ..Default::default()
                });
            entry.jobs += 1;
            entry.total_submissions += job.total_submissions;
            entry.completed_submissions += job.completed_submissions;
            entry.failed_submissions += job.failed_submissions;
        }

        let mut providers: Vec<ProviderBreakdown> = providers.into_values().collect();
        for p in &mut providers {
            p.success_rate = success_rate(p.completed_submissions, p.failed_submissions);
        }

        let total_submissions = providers.iter().map(|p| p.total_submissions).sum();
        let completed_submissions = providers.iter().map(|p| p.completed_submissions).sum();
        let failed_submissions = providers.iter().map(|p| p.failed_submissions).sum();

        Ok(BatchAnalytics {
            batch_id: batch.id.clone(),
            status: batch.status,
            total_jobs: batch.total_jobs,
            completed_jobs: batch.completed_jobs,
            failed_jobs: batch.failed_jobs,
            total_submissions,
            completed_submissions,
            failed_submissions,
            success_rate: success_rate(completed_submissions, failed_submissions),
            elapsed_secs: elapsed_secs(&batch, Utc::now()),
            providers,
        })
    }
}
