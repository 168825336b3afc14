//! Per-provider eligibility queue with priority aging.
//!
//! Eligible entries live in one ordered bucket per base priority. Within a
//! bucket the oldest entry also has the highest aged priority, so picking the
//! next entry only compares bucket heads. Entries with a future `ready_at`
//! wait in a separate set ordered by `ready_at` and are promoted as time
//! passes. Entries of jobs that may not run yet are parked per job.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::work::MAX_PRIORITY;

/// A submission waiting for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub submission_id: String,
    pub job_id: String,
    pub batch_id: Option<String>,
    /// Scheduling priority at enqueue time, before aging.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    /// Not eligible before this instant.
    pub ready_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Priority after aging: +1 per elapsed `aging_interval`, capped at the maximum.
    pub fn effective_priority(&self, now: DateTime<Utc>, aging_interval: Duration) -> u8 {
        let interval_ms = aging_interval.as_millis();
        if interval_ms == 0 {
            return self.priority;
        }
        let waited_ms = (now - self.enqueued_at).num_milliseconds().max(0) as u128;
        let bonus = (waited_ms / interval_ms).min(u128::from(MAX_PRIORITY));
        (u128::from(self.priority) + bonus).min(u128::from(MAX_PRIORITY)) as u8
    }
}

/// Dispatch order key; the greater rank goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rank {
    priority: u8,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.priority.cmp(&other.priority) {
            // Earlier enqueue first, then insertion order
            Ordering::Equal => other
                .enqueued_at
                .cmp(&self.enqueued_at)
                .then_with(|| other.seq.cmp(&self.seq)),
            other => other,
        }
    }
}

/// Ordered position: `(time, seq, submission_id)`.
type Slot = (DateTime<Utc>, u64, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    Ready,
    Delayed,
    Held,
}

#[derive(Debug)]
struct Stored {
    seq: u64,
    entry: QueueEntry,
    place: Place,
}

impl Stored {
    fn ready_slot(&self) -> Slot {
        (self.entry.enqueued_at, self.seq, self.entry.submission_id.clone())
    }

    fn delayed_slot(&self) -> Slot {
        (self.entry.ready_at, self.seq, self.entry.submission_id.clone())
    }
}

/// Queue of one provider lane, deduplicated by submission id.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    entries: HashMap<String, Stored>,
    /// Eligible entries by base priority, each ordered by enqueue time.
    ready: BTreeMap<u8, BTreeSet<Slot>>,
    /// Entries waiting for `ready_at`, earliest first.
    delayed: BTreeSet<Slot>,
    /// Entries parked by job id.
    held: HashMap<String, HashSet<String>>,
    next_seq: u64,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Returns false if the submission is already queued, in
    /// which case its `ready_at` is refreshed.
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        let id = entry.submission_id.clone();
        if let Some(place) = self.entries.get(&id).map(|stored| stored.place) {
            if place != Place::Held {
                self.unlink(&id);
            }
            if let Some(stored) = self.entries.get_mut(&id) {
                stored.entry.ready_at = entry.ready_at;
            }
            if place != Place::Held {
                self.link_delayed(&id);
            }
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id.clone(),
            Stored {
                seq,
                entry,
                place: Place::Delayed,
            },
        );
        self.link_delayed(&id);
        true
    }

    /// Park an entry until [`release_job`](Self::release_job) is called for its job.
    pub fn hold(&mut self, entry: QueueEntry) {
        let id = entry.submission_id.clone();
        let job_id = entry.job_id.clone();
        if self.entries.contains_key(&id) {
            self.unlink(&id);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id.clone(),
            Stored {
                seq,
                entry,
                place: Place::Held,
            },
        );
        self.held.entry(job_id).or_default().insert(id);
    }

    /// Jobs with parked entries.
    pub fn held_jobs(&self) -> Vec<String> {
        self.held.keys().cloned().collect()
    }

    /// Put a job's parked entries back in line. Returns how many moved.
    pub fn release_job(&mut self, job_id: &str) -> usize {
        let Some(ids) = self.held.remove(job_id) else {
            return 0;
        };
        for id in &ids {
            if let Some(stored) = self.entries.get_mut(id) {
                stored.place = Place::Delayed;
            }
            self.link_delayed(id);
        }
        ids.len()
    }

    pub fn remove(&mut self, submission_id: &str) -> Option<QueueEntry> {
        if !self.entries.contains_key(submission_id) {
            return None;
        }
        self.unlink(submission_id);
        self.entries
            .remove(submission_id)
            .map(|stored| stored.entry)
    }

    /// Drop every entry whose job is in `job_ids`.
    pub fn remove_jobs(&mut self, job_ids: &HashSet<String>) -> usize {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|stored| job_ids.contains(&stored.entry.job_id))
            .map(|stored| stored.entry.submission_id.clone())
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed.len()
    }

    pub fn contains(&self, submission_id: &str) -> bool {
        self.entries.contains_key(submission_id)
    }

    /// Entries in the queue, parked ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry is eligible at `now`.
    pub fn has_ready(&mut self, now: DateTime<Utc>) -> bool {
        self.promote(now);
        !self.ready.is_empty()
    }

    /// Remove and return the best entry eligible at `now`.
    pub fn pop_best(&mut self, now: DateTime<Utc>, aging_interval: Duration) -> Option<QueueEntry> {
        self.promote(now);

        let mut best: Option<(Rank, u8, Slot)> = None;
        for (priority, bucket) in &self.ready {
            let Some(head) = bucket.first() else {
                continue;
            };
            let Some(stored) = self.entries.get(&head.2) else {
                continue;
            };
            let rank = Rank {
                priority: stored.entry.effective_priority(now, aging_interval),
                enqueued_at: stored.entry.enqueued_at,
                seq: stored.seq,
            };
            if best.as_ref().map_or(true, |(top, _, _)| rank > *top) {
                best = Some((rank, *priority, head.clone()));
            }
        }

        let (_, priority, slot) = best?;
        self.take_ready(priority, &slot);
        self.entries.remove(&slot.2).map(|stored| stored.entry)
    }

    /// Move every delayed entry that is due into its ready bucket.
    fn promote(&mut self, now: DateTime<Utc>) {
        while self
            .delayed
            .first()
            .is_some_and(|(ready_at, _, _)| *ready_at <= now)
        {
            let Some((_, _, id)) = self.delayed.pop_first() else {
                break;
            };
            if let Some(stored) = self.entries.get_mut(&id) {
                stored.place = Place::Ready;
                let slot = stored.ready_slot();
                self.ready
                    .entry(stored.entry.priority)
                    .or_default()
                    .insert(slot);
            }
        }
    }

    fn link_delayed(&mut self, id: &str) {
        if let Some(stored) = self.entries.get_mut(id) {
            stored.place = Place::Delayed;
            self.delayed.insert(stored.delayed_slot());
        }
    }

    /// Detach an entry from its ordered set without forgetting it.
    fn unlink(&mut self, id: &str) {
        let Some(stored) = self.entries.get(id) else {
            return;
        };
        match stored.place {
            Place::Ready => {
                let priority = stored.entry.priority;
                let slot = stored.ready_slot();
                self.take_ready(priority, &slot);
            }
            Place::Delayed => {
                let slot = stored.delayed_slot();
                self.delayed.remove(&slot);
            }
            Place::Held => {
                let job_id = stored.entry.job_id.clone();
                if let Some(ids) = self.held.get_mut(&job_id) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.held.remove(&job_id);
                    }
                }
            }
        }
    }

    fn take_ready(&mut self, priority: u8, slot: &Slot) {
        if let Some(bucket) = self.ready.get_mut(&priority) {
            bucket.remove(slot);
            if bucket.is_empty() {
                self.ready.remove(&priority);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn entry(id: &str, priority: u8, enqueued_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            submission_id: id.to_string(),
            job_id: format!("job-{}", id),
            batch_id: None,
            priority,
            enqueued_at,
            ready_at: enqueued_at,
        }
    }

    fn drain(queue: &mut DispatchQueue, now: DateTime<Utc>) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_best(now, MINUTE))
            .map(|e| e.submission_id)
            .collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        queue.push(entry("a5", 5, t0));
        queue.push(entry("b8", 8, t0 + ChronoDuration::milliseconds(1)));
        queue.push(entry("c5", 5, t0 - ChronoDuration::milliseconds(1)));
        queue.push(entry("d5", 5, t0));

        let now = t0 + ChronoDuration::milliseconds(10);
        assert_eq!(drain(&mut queue, now), vec!["b8", "c5", "a5", "d5"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_push_is_ignored() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        assert!(queue.push(entry("a", 5, t0)));
        assert!(!queue.push(entry("a", 5, t0)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_delayed_entries_wait() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        let mut delayed = entry("late", 9, t0);
        delayed.ready_at = t0 + ChronoDuration::seconds(4);
        queue.push(delayed);
        queue.push(entry("now", 1, t0));

        assert_eq!(drain(&mut queue, t0), vec!["now"]);
        assert!(!queue.has_ready(t0));
        assert_eq!(queue.len(), 1);

        let later = t0 + ChronoDuration::seconds(5);
        assert_eq!(drain(&mut queue, later), vec!["late"]);
    }

    #[test]
    fn test_repush_refreshes_ready_at() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        queue.push(entry("a", 5, t0));
        assert!(queue.has_ready(t0));

        let mut retry = entry("a", 5, t0);
        retry.ready_at = t0 + ChronoDuration::seconds(2);
        assert!(!queue.push(retry));
        assert!(!queue.has_ready(t0 + ChronoDuration::seconds(1)));
        assert!(queue.has_ready(t0 + ChronoDuration::seconds(2)));
    }

    #[test]
    fn test_aging_lifts_old_entries() {
        let t0 = Utc::now();
        let old = entry("old", 3, t0);
        assert_eq!(old.effective_priority(t0, MINUTE), 3);
        assert_eq!(old.effective_priority(t0 + ChronoDuration::minutes(2), MINUTE), 5);
        assert_eq!(old.effective_priority(t0 + ChronoDuration::hours(5), MINUTE), 10);

        let mut queue = DispatchQueue::new();
        queue.push(old);
        queue.push(entry("new", 6, t0 + ChronoDuration::minutes(4)));

        // After 4 minutes the old entry sits at 7 and overtakes the fresh 6.
        let now = t0 + ChronoDuration::minutes(4);
        assert_eq!(drain(&mut queue, now), vec!["old", "new"]);
    }

    #[test]
    fn test_held_entries_skip_the_line_until_released() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        queue.push(entry("paused", 9, t0));
        queue.push(entry("running", 2, t0));

        let first = queue.pop_best(t0, MINUTE).unwrap();
        assert_eq!(first.submission_id, "paused");
        queue.hold(first);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.held_jobs(), vec!["job-paused".to_string()]);
        assert_eq!(drain(&mut queue, t0), vec!["running"]);
        assert!(!queue.has_ready(t0));

        assert_eq!(queue.release_job("job-paused"), 1);
        assert!(queue.held_jobs().is_empty());
        assert_eq!(drain(&mut queue, t0), vec!["paused"]);
    }

    #[test]
    fn test_remove_jobs() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        queue.push(entry("a", 5, t0));
        queue.push(entry("b", 5, t0));
        queue.push(entry("c", 5, t0));
        let held = queue.remove("c").unwrap();
        queue.hold(held);

        let cancelled: HashSet<String> = ["job-a".to_string(), "job-c".to_string()]
            .into_iter()
            .collect();
        assert_eq!(queue.remove_jobs(&cancelled), 2);
        assert!(!queue.contains("a"));
        assert!(!queue.contains("c"));
        assert!(queue.held_jobs().is_empty());
        assert_eq!(drain(&mut queue, t0), vec!["b"]);
    }

    #[test]
    fn test_large_queue_pops_in_order() {
        let t0 = Utc::now();
        let mut queue = DispatchQueue::new();
        for i in 0..10_000u32 {
            let priority = (i % 10) as u8 + 1;
            queue.push(entry(
                &format!("s{}", i),
                priority,
                t0 + ChronoDuration::milliseconds(i64::from(i)),
            ));
        }

        let now = t0 + ChronoDuration::seconds(20);
        let mut last: Option<(u8, DateTime<Utc>)> = None;
        let mut popped = 0;
        while let Some(next) = queue.pop_best(now, Duration::ZERO) {
            if let Some((priority, enqueued_at)) = last {
                assert!(
                    next.priority < priority
                        || (next.priority == priority && next.enqueued_at >= enqueued_at)
                );
            }
            last = Some((next.priority, next.enqueued_at));
            popped += 1;
        }
        assert_eq!(popped, 10_000);
    }
}
