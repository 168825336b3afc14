//! Dispatch scheduler implementation.
//!
//! Pulls eligible submissions from per-provider lanes in priority order,
//! claims each one with a compare-and-set and hands it to the executor on its
//! own task. Results flow through the retry policy and the progress aggregator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::events::{EngineEvent, EventHandle};
use crate::executor::{ExecutionError, ExecutionOutput, ExecutionRequest, Executor};
use crate::lifecycle::{SubmissionStatus, WorkStatus};
use crate::metrics;
use crate::progress::ProgressAggregator;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::work::{
    JobFilter, StoreError, Submission, SubmissionError, SubmissionFilter, SubmissionUpdate,
    WorkStore,
};

use super::config::{LaneSettings, SchedulerConfig};
use super::queue::{DispatchQueue, QueueEntry};
use super::types::{LaneStatus, SchedulerError, SchedulerStatus};

/// One provider's queue and capacity.
struct Lane {
    settings: LaneSettings,
    queue: DispatchQueue,
    permits: Arc<Semaphore>,
    last_dispatch: Option<Instant>,
}

impl Lane {
    fn new(settings: LaneSettings) -> Self {
        Self {
            settings,
            queue: DispatchQueue::new(),
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            last_dispatch: None,
        }
    }

    fn in_flight(&self) -> usize {
        self.settings
            .max_concurrent
            .saturating_sub(self.permits.available_permits())
    }
}

/// What to do with a queue entry given its parents' statuses.
#[derive(Debug, Clone)]
enum Gate {
    Dispatch { policy: RetryPolicy, provider: String },
    /// Parent paused or not started yet; keep the entry.
    Hold,
    /// Parent cancelled, settled or gone; forget the entry.
    Drop,
}

/// A submission claimed for execution.
struct Claimed {
    entry: QueueEntry,
    submission: Submission,
    policy: RetryPolicy,
    provider: String,
    permit: OwnedSemaphorePermit,
}

/// State shared between the scheduler, its loop and in-flight tasks.
#[derive(Clone)]
struct Shared {
    config: Arc<SchedulerConfig>,
    store: Arc<dyn WorkStore>,
    executor: Arc<dyn Executor>,
    aggregator: Arc<ProgressAggregator>,
    events: EventHandle,
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
    /// Submissions claimed by this process whose result is not recorded yet.
    in_flight: Arc<Mutex<HashSet<String>>>,
    wake: Arc<Notify>,
    tick_lock: Arc<tokio::sync::Mutex<()>>,
}

/// The dispatch scheduler. One instance owns every provider lane.
pub struct Scheduler {
    shared: Shared,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn WorkStore>,
        executor: Arc<dyn Executor>,
        aggregator: Arc<ProgressAggregator>,
        events: EventHandle,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Shared {
                config: Arc::new(config),
                store,
                executor,
                aggregator,
                events,
                lanes: Arc::new(Mutex::new(HashMap::new())),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                wake: Arc::new(Notify::new()),
                tick_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Start the background dispatch loop after recovering interrupted work.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return Ok(());
        }

        info!(executor = self.shared.executor.name(), "Starting scheduler");

        if let Err(e) = self.recover() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.spawn_dispatch_loop();

        info!("Scheduler started");
        Ok(())
    }

    /// Stop the dispatch loop. In-flight calls run to completion and keep
    /// their claim across a later `start`.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Scheduler not running");
            return;
        }

        info!("Stopping scheduler");
        let _ = self.shutdown_tx.send(());
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Return submissions orphaned by a crash to the queue and reload the
    /// lanes of every active job. Calls still running in this process keep
    /// their claim.
    pub fn recover(&self) -> Result<usize, SchedulerError> {
        let released = {
            let in_flight = self.shared.in_flight();
            self.shared.store.release_in_progress(&in_flight)?
        };
        if released > 0 {
            warn!(count = released, "Released in-progress submissions left by a previous run");
        }

        let mut enqueued = 0;
        for status in [WorkStatus::Processing, WorkStatus::Paused] {
            let jobs = self
                .shared
                .store
                .list_jobs(&JobFilter::new().with_status(status).unbounded())?;
            for job in jobs {
                enqueued += self.enqueue_job(&job.id)?;
            }
        }

        if enqueued > 0 {
            info!(count = enqueued, "Recovered queued submissions");
        }
        Ok(enqueued)
    }

    /// Load every queued submission of a job into its provider lane.
    /// Returns how many entries were new.
    pub fn enqueue_job(&self, job_id: &str) -> Result<usize, SchedulerError> {
        let store = &self.shared.store;
        let job = store.get_job(job_id)?.ok_or_else(|| StoreError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })?;

        let batch_priority = match job.batch_id {
            Some(ref batch_id) => store.get_batch(batch_id)?.map(|b| b.priority),
            None => None,
        };
        let priority = job.scheduling_priority(batch_priority);

        let submissions = store.list_submissions(
            &SubmissionFilter::new()
                .with_job(job_id)
                .with_status(SubmissionStatus::Queued)
                .unbounded(),
        )?;

        let added = {
            let mut lanes = self.shared.lanes();
            let lane = self.shared.lane_mut(&mut lanes, &job.provider);
            let mut added = 0;
            for submission in submissions {
                let entry = QueueEntry {
                    submission_id: submission.id,
                    job_id: job.id.clone(),
                    batch_id: job.batch_id.clone(),
                    priority,
                    enqueued_at: submission.enqueued_at,
                    ready_at: submission.ready_at,
                };
                if lane.queue.push(entry) {
                    added += 1;
                }
            }
            metrics::LANE_QUEUED
                .with_label_values(&[job.provider.as_str()])
                .set(lane.queue.len() as i64);
            added
        };

        debug!(job_id = %job_id, provider = %job.provider, added, "Enqueued job");
        self.wake();
        Ok(added)
    }

    /// Forget queued entries of the given jobs.
    pub fn drop_jobs(&self, job_ids: &HashSet<String>) -> usize {
        let mut lanes = self.shared.lanes();
        let mut removed = 0;
        for (provider, lane) in lanes.iter_mut() {
            removed += lane.queue.remove_jobs(job_ids);
            metrics::LANE_QUEUED
                .with_label_values(&[provider.as_str()])
                .set(lane.queue.len() as i64);
        }
        removed
    }

    /// Signal the dispatch loop to run a tick now.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Run one dispatch pass over every lane. Returns how many submissions
    /// were handed to the executor.
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        self.shared.tick().await
    }

    /// Get current scheduler status.
    pub fn status(&self) -> SchedulerStatus {
        let lanes = self.shared.lanes();
        let mut lanes: Vec<LaneStatus> = lanes
            .iter()
            .map(|(provider, lane)| LaneStatus {
                provider: provider.clone(),
                max_concurrent: lane.settings.max_concurrent,
                in_flight: lane.in_flight(),
                queued: lane.queue.len(),
            })
            .collect();
        lanes.sort_by(|a, b| a.provider.cmp(&b.provider));

        SchedulerStatus {
            running: self.is_running(),
            lanes,
        }
    }

    /// Spawn the dispatch loop task.
    fn spawn_dispatch_loop(&self) {
        let running = Arc::clone(&self.running);
        let shared = self.shared.clone();
        let interval = self.shared.config.tick_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Dispatch loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Dispatch loop received shutdown signal");
                        break;
                    }
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = shared.tick().await {
                    warn!("Dispatch tick failed: {}", e);
                }
            }
            info!("Dispatch loop stopped");
        });
    }
}

impl Shared {
    fn lanes(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lane_mut<'a>(
        &self,
        lanes: &'a mut HashMap<String, Lane>,
        provider: &str,
    ) -> &'a mut Lane {
        lanes
            .entry(provider.to_string())
            .or_insert_with(|| Lane::new(self.config.lane(provider)))
    }

    async fn tick(&self) -> Result<usize, SchedulerError> {
        let _tick = self.tick_lock.lock().await;

        let providers: Vec<String> = self.lanes().keys().cloned().collect();
        let mut gates: HashMap<String, Gate> = HashMap::new();
        let mut dispatched = 0;

        for provider in providers {
            self.release_held(&provider, &mut gates)?;
            loop {
                match self.claim_next(&provider, &mut gates) {
                    Ok(Some(claimed)) => {
                        self.spawn_execution(claimed);
                        dispatched += 1;
                    }
                    Ok(None) => break,
                    Err(SchedulerError::CapacityExceeded {
                        provider,
                        max_concurrent,
                    }) => {
                        debug!(provider = %provider, max_concurrent, "Lane at capacity, deferring");
                        metrics::CAPACITY_DEFERRALS
                            .with_label_values(&[provider.as_str()])
                            .inc();
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(dispatched)
    }

    /// Decide whether an entry may go out now, caching per job for one tick.
    fn gate(&self, job_id: &str, gates: &mut HashMap<String, Gate>) -> Result<Gate, StoreError> {
        if let Some(gate) = gates.get(job_id) {
            return Ok(gate.clone());
        }

        let gate = match self.store.get_job(job_id)? {
            None => Gate::Drop,
            Some(job) => {
                let batch_status = match job.batch_id {
                    Some(ref batch_id) => Some(self.store.get_batch(batch_id)?.map(|b| b.status)),
                    None => None,
                };
                match (job.status, batch_status) {
                    (status, _) if status.is_terminal() => Gate::Drop,
                    (_, Some(None)) => Gate::Drop,
                    (_, Some(Some(batch))) if batch.is_terminal() => Gate::Drop,
                    (WorkStatus::Processing, None)
                    | (WorkStatus::Processing, Some(Some(WorkStatus::Processing))) => {
                        Gate::Dispatch {
                            policy: job.retry_policy,
                            provider: job.provider,
                        }
                    }
                    _ => Gate::Hold,
                }
            }
        };

        gates.insert(job_id.to_string(), gate.clone());
        Ok(gate)
    }

    /// Re-admit parked entries of jobs that may run again and forget those
    /// of jobs that never will.
    fn release_held(
        &self,
        provider: &str,
        gates: &mut HashMap<String, Gate>,
    ) -> Result<(), SchedulerError> {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(provider) else {
            return Ok(());
        };

        for job_id in lane.queue.held_jobs() {
            match self.gate(&job_id, gates)? {
                Gate::Dispatch { .. } => {
                    let released = lane.queue.release_job(&job_id);
                    debug!(job_id = %job_id, released, "Released held entries");
                }
                Gate::Drop => {
                    let dropped: HashSet<String> = [job_id].into_iter().collect();
                    lane.queue.remove_jobs(&dropped);
                }
                Gate::Hold => {}
            }
        }
        Ok(())
    }

    /// Pop and claim the best eligible entry of one lane.
    fn claim_next(
        &self,
        provider: &str,
        gates: &mut HashMap<String, Gate>,
    ) -> Result<Option<Claimed>, SchedulerError> {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(provider) else {
            return Ok(None);
        };

        if lane.queue.is_empty() {
            return Ok(None);
        }

        if let Some(last) = lane.last_dispatch {
            if last.elapsed() < lane.settings.stagger {
                return Ok(None);
            }
        }

        let now = Utc::now();
        if !lane.queue.has_ready(now) {
            return Ok(None);
        }

        let permit = Arc::clone(&lane.permits)
            .try_acquire_owned()
            .map_err(|_| SchedulerError::CapacityExceeded {
                provider: provider.to_string(),
                max_concurrent: lane.settings.max_concurrent,
            })?;

        let aging = self.config.aging_interval();
        while let Some(entry) = lane.queue.pop_best(now, aging) {
            let gate = match self.gate(&entry.job_id, gates) {
                Ok(gate) => gate,
                Err(e) => {
                    lane.queue.push(entry);
                    return Err(e.into());
                }
            };
            let (policy, job_provider) = match gate {
                Gate::Dispatch { policy, provider } => (policy, provider),
                Gate::Hold => {
                    lane.queue.hold(entry);
                    continue;
                }
                Gate::Drop => {
                    debug!(submission_id = %entry.submission_id, "Dropping entry of inactive parent");
                    continue;
                }
            };

            self.in_flight().insert(entry.submission_id.clone());
            match self.store.transition_submission(
                &entry.submission_id,
                SubmissionStatus::Queued,
                SubmissionUpdate::Claim,
            ) {
                Ok(submission) => {
                    lane.last_dispatch = Some(Instant::now());
                    metrics::LANE_QUEUED
                        .with_label_values(&[provider])
                        .set(lane.queue.len() as i64);
                    return Ok(Some(Claimed {
                        entry,
                        submission,
                        policy,
                        provider: job_provider,
                        permit,
                    }));
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    self.in_flight().remove(&entry.submission_id);
                    debug!(
                        submission_id = %entry.submission_id,
                        actual = %actual,
                        "Submission no longer queued, skipping"
                    );
                }
                Err(StoreError::NotFound { .. }) => {
                    self.in_flight().remove(&entry.submission_id);
                }
                Err(e) => {
                    // Still queued in the store; keep it in line for the next tick.
                    self.in_flight().remove(&entry.submission_id);
                    lane.queue.push(entry);
                    return Err(e.into());
                }
            }
        }

        metrics::LANE_QUEUED
            .with_label_values(&[provider])
            .set(lane.queue.len() as i64);
        Ok(None)
    }

    fn spawn_execution(&self, claimed: Claimed) {
        let shared = self.clone();

        tokio::spawn(async move {
            let Claimed {
                entry,
                submission,
                policy,
                provider,
                permit,
            } = claimed;

            let request = ExecutionRequest {
                submission_id: submission.id.clone(),
                job_id: submission.job_id.clone(),
                provider: provider.clone(),
                attempt: submission.attempt_count,
                payload: submission.payload.clone(),
            };

            info!(
                submission_id = %request.submission_id,
                job_id = %request.job_id,
                provider = %provider,
                attempt = request.attempt,
                "Dispatching submission"
            );
            metrics::SUBMISSIONS_DISPATCHED
                .with_label_values(&[provider.as_str()])
                .inc();
            let in_flight = metrics::LANE_IN_FLIGHT.with_label_values(&[provider.as_str()]);
            in_flight.inc();
            shared
                .events
                .emit(EngineEvent::SubmissionDispatched {
                    submission_id: request.submission_id.clone(),
                    job_id: request.job_id.clone(),
                    provider: provider.clone(),
                    attempt: request.attempt,
                })
                .await;

            let started = Instant::now();
            let result = shared.executor.execute(&request).await;
            let elapsed = started.elapsed();
            metrics::EXECUTION_DURATION
                .with_label_values(&[provider.as_str()])
                .observe(elapsed.as_secs_f64());

            // The call is over; free the slot before bookkeeping.
            drop(permit);
            in_flight.dec();

            if let Err(e) = shared
                .record_result(entry, &submission, &policy, &provider, result, elapsed)
                .await
            {
                error!(submission_id = %submission.id, "Failed to record execution result: {}", e);
            }

            shared.wake.notify_one();
        });
    }

    /// Fold an execution result into the submission, then roll the job up.
    async fn record_result(
        &self,
        entry: QueueEntry,
        submission: &Submission,
        policy: &RetryPolicy,
        provider: &str,
        result: Result<ExecutionOutput, ExecutionError>,
        elapsed: Duration,
    ) -> Result<(), StoreError> {
        let mut gave_up = None;
        let update = match result {
            Ok(output) => SubmissionUpdate::Complete {
                output: output.output,
            },
            Err(err) => {
                let error = SubmissionError::from(&err);
                match policy.decide(submission.attempt_count, err.kind()) {
                    RetryDecision::Retry { attempt, delay } => {
                        return self
                            .schedule_retry(entry, submission, provider, error, attempt, delay)
                            .await;
                    }
                    RetryDecision::GiveUp(reason) => {
                        gave_up = Some((reason, error.clone()));
                        SubmissionUpdate::Fail { error }
                    }
                }
            }
        };

        let recorded = self.store.transition_submission(
            &submission.id,
            SubmissionStatus::InProgress,
            update,
        );
        self.in_flight().remove(&submission.id);

        match recorded {
            Ok(_) => match gave_up {
                None => {
                    metrics::SUBMISSION_RESULTS
                        .with_label_values(&[provider, "completed"])
                        .inc();
                    debug!(submission_id = %submission.id, "Submission completed");
                    self.events
                        .emit(EngineEvent::SubmissionCompleted {
                            submission_id: submission.id.clone(),
                            job_id: submission.job_id.clone(),
                            duration_ms: elapsed.as_millis() as u64,
                        })
                        .await;
                }
                Some((reason, error)) => {
                    metrics::SUBMISSION_RESULTS
                        .with_label_values(&[provider, "failed"])
                        .inc();
                    warn!(
                        submission_id = %submission.id,
                        job_id = %submission.job_id,
                        reason = ?reason,
                        "Submission failed: {}",
                        error.message
                    );
                    self.events
                        .emit(EngineEvent::SubmissionFailed {
                            submission_id: submission.id.clone(),
                            job_id: submission.job_id.clone(),
                            reason,
                            error,
                        })
                        .await;
                }
            },
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                self.discard(submission, provider).await;
            }
            Err(e) => return Err(e),
        }

        self.aggregator.rollup_job(&submission.job_id).await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        mut entry: QueueEntry,
        submission: &Submission,
        provider: &str,
        error: SubmissionError,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let ready_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let requeued = self.store.transition_submission(
            &submission.id,
            SubmissionStatus::InProgress,
            SubmissionUpdate::Requeue {
                ready_at,
                error: error.clone(),
            },
        );
        self.in_flight().remove(&submission.id);

        match requeued {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                self.discard(submission, provider).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        warn!(
            submission_id = %submission.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retry scheduled: {}",
            error.message
        );
        metrics::SUBMISSION_RESULTS
            .with_label_values(&[provider, "retry"])
            .inc();
        self.events
            .emit(EngineEvent::SubmissionRetryScheduled {
                submission_id: submission.id.clone(),
                job_id: submission.job_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error,
            })
            .await;

        entry.ready_at = ready_at;
        let mut lanes = self.lanes();
        let lane = self.lane_mut(&mut lanes, provider);
        lane.queue.push(entry);
        metrics::LANE_QUEUED
            .with_label_values(&[provider])
            .set(lane.queue.len() as i64);
        Ok(())
    }

    /// The submission left `in_progress` (cancelled) while the call was in flight.
    async fn discard(&self, submission: &Submission, provider: &str) {
        info!(
            submission_id = %submission.id,
            job_id = %submission.job_id,
            "Discarding result of submission no longer in progress"
        );
        metrics::SUBMISSION_RESULTS
            .with_label_values(&[provider, "discarded"])
            .inc();
        self.events
            .emit(EngineEvent::SubmissionResultDiscarded {
                submission_id: submission.id.clone(),
                job_id: submission.job_id.clone(),
            })
            .await;
    }
}
