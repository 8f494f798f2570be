//! In-memory stores for tests and single-process runs.
//!
//! Every operation takes the mutex once and never awaits while holding it,
//! so each call is atomic with respect to concurrent callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{CREATED_VERSION, JobMutation, JobStore, QueueStore, apply_update, page_limit};
use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    DeadLetterEntry, JobFilter, JobId, NotificationJob, Page, Precondition, QueueStats,
};

const MAX_PAGE_SIZE: usize = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_cursor(cursor: Option<&str>) -> NotificationResult<usize> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| NotificationError::Validation(format!("invalid cursor '{raw}'"))),
    }
}

// ============================================================================
// Job records
// ============================================================================

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, NotificationJob>,
    /// Creation order, used for listing.
    order: Vec<JobId>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, mut job: NotificationJob) -> NotificationResult<JobId> {
        let mut table = lock(&self.table);
        if table.jobs.contains_key(&job.id) {
            return Err(NotificationError::DuplicateJob(job.id));
        }

        job.version = CREATED_VERSION;
        let id = job.id.clone();
        table.order.push(id.clone());
        table.jobs.insert(id.clone(), job);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> NotificationResult<NotificationJob> {
        lock(&self.table)
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| NotificationError::NotFound(id.clone()))
    }

    async fn update(
        &self,
        id: &JobId,
        expected: Precondition,
        mutation: JobMutation,
    ) -> NotificationResult<NotificationJob> {
        let mut table = lock(&self.table);
        let current = table
            .jobs
            .get(id)
            .ok_or_else(|| NotificationError::NotFound(id.clone()))?;

        let next = apply_update(current, &expected, mutation)?;
        table.jobs.insert(id.clone(), next.clone());
        Ok(next)
    }

    async fn list(&self, filter: &JobFilter) -> NotificationResult<Page<NotificationJob>> {
        let start = parse_cursor(filter.cursor.as_deref())?;
        let limit = page_limit(filter.limit, MAX_PAGE_SIZE);
        let table = lock(&self.table);

        let mut items = Vec::with_capacity(limit);
        let mut next_cursor = None;
        for (index, id) in table.order.iter().enumerate().skip(start) {
            let Some(job) = table.jobs.get(id) else {
                continue;
            };
            if filter.status.is_some_and(|s| s != job.status) {
                continue;
            }
            if items.len() == limit {
                next_cursor = Some(index.to_string());
                break;
            }
            items.push(job.clone());
        }

        Ok(Page { items, next_cursor })
    }

    async fn withdraw(&self, id: &JobId, version: u64) -> NotificationResult<bool> {
        let mut table = lock(&self.table);
        if table.jobs.get(id).is_none_or(|job| job.version != version) {
            return Ok(false);
        }
        table.jobs.remove(id);
        table.order.retain(|existing| existing != id);
        Ok(true)
    }
}

// ============================================================================
// Queue structures
// ============================================================================

#[derive(Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    delayed_at: HashMap<JobId, DateTime<Utc>>,
    leases: HashMap<JobId, DateTime<Utc>>,
    dead_letters: Vec<DeadLetterEntry>,
    dead_letter_index: HashMap<JobId, usize>,
}

impl QueueState {
    fn remove_delayed(&mut self, id: &JobId) {
        if let Some(at) = self.delayed_at.remove(id) {
            self.delayed.remove(&(at, id.clone()));
        }
    }
}

#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, id: &JobId) -> bool {
        lock(&self.state).ready.contains(id)
    }

    pub fn is_delayed(&self, id: &JobId) -> bool {
        lock(&self.state).delayed_at.contains_key(id)
    }

    pub fn delayed_until(&self, id: &JobId) -> Option<DateTime<Utc>> {
        lock(&self.state).delayed_at.get(id).copied()
    }

    pub fn is_leased(&self, id: &JobId) -> bool {
        lock(&self.state).leases.contains_key(id)
    }

    pub fn dead_letter_count(&self, id: &JobId) -> usize {
        lock(&self.state)
            .dead_letters
            .iter()
            .filter(|e| e.job_id() == id)
            .count()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue_ready(&self, id: &JobId) -> NotificationResult<()> {
        let mut state = lock(&self.state);
        state.remove_delayed(id);
        if !state.ready.contains(id) {
            state.ready.push_back(id.clone());
        }
        Ok(())
    }

    async fn enqueue_delayed(&self, id: &JobId, ready_at: DateTime<Utc>) -> NotificationResult<()> {
        let mut state = lock(&self.state);
        state.remove_delayed(id);
        state.ready.retain(|queued| queued != id);
        state.delayed.insert((ready_at, id.clone()));
        state.delayed_at.insert(id.clone(), ready_at);
        Ok(())
    }

    async fn claim_ready(
        &self,
        lease_until: Option<DateTime<Utc>>,
    ) -> NotificationResult<Option<JobId>> {
        let mut state = lock(&self.state);
        let Some(id) = state.ready.pop_front() else {
            return Ok(None);
        };
        if let Some(until) = lease_until {
            state.leases.insert(id.clone(), until);
        }
        Ok(Some(id))
    }

    async fn promote_due_delayed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> NotificationResult<Vec<JobId>> {
        let mut state = lock(&self.state);
        let due: Vec<(DateTime<Utc>, JobId)> = state
            .delayed
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .cloned()
            .collect();

        let mut promoted = Vec::with_capacity(due.len());
        for entry in due {
            state.delayed.remove(&entry);
            let (_, id) = entry;
            state.delayed_at.remove(&id);
            state.ready.push_back(id.clone());
            promoted.push(id);
        }
        Ok(promoted)
    }

    async fn release(&self, id: &JobId) -> NotificationResult<()> {
        lock(&self.state).leases.remove(id);
        Ok(())
    }

    async fn renew_lease(&self, id: &JobId, until: DateTime<Utc>) -> NotificationResult<bool> {
        let mut state = lock(&self.state);
        match state.leases.get_mut(id) {
            Some(deadline) => {
                *deadline = until;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> NotificationResult<Vec<JobId>> {
        let mut state = lock(&self.state);
        let mut expired: Vec<(DateTime<Utc>, JobId)> = state
            .leases
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, until)| (*until, id.clone()))
            .collect();
        expired.sort();

        for (_, id) in &expired {
            state.leases.remove(id);
        }
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn discard(&self, id: &JobId) -> NotificationResult<()> {
        let mut state = lock(&self.state);
        state.remove_delayed(id);
        state.ready.retain(|queued| queued != id);
        state.leases.remove(id);
        Ok(())
    }

    async fn enqueue_dead_letter(&self, entry: &DeadLetterEntry) -> NotificationResult<()> {
        let mut state = lock(&self.state);
        let position = state.dead_letters.len();
        state.dead_letters.push(entry.clone());
        state.dead_letter_index.insert(entry.job_id().clone(), position);
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> NotificationResult<Page<DeadLetterEntry>> {
        let start = parse_cursor(cursor)?;
        let limit = page_limit(limit, MAX_PAGE_SIZE);
        let state = lock(&self.state);

        let items: Vec<DeadLetterEntry> = state
            .dead_letters
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect();
        let end = start + items.len();
        let next_cursor = (end < state.dead_letters.len()).then(|| end.to_string());

        Ok(Page { items, next_cursor })
    }

    async fn get_dead_letter(&self, id: &JobId) -> NotificationResult<Option<DeadLetterEntry>> {
        let state = lock(&self.state);
        Ok(state
            .dead_letter_index
            .get(id)
            .and_then(|&position| state.dead_letters.get(position))
            .cloned())
    }

    async fn stats(&self) -> NotificationResult<QueueStats> {
        let state = lock(&self.state);
        Ok(QueueStats {
            ready: state.ready.len() as u64,
            delayed: state.delayed.len() as u64,
            in_flight: state.leases.len() as u64,
            dead_letters: state.dead_letters.len() as u64,
        })
    }
}
