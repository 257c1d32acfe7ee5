use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::error::AdmissionError;
use crate::scheduler::job::{Job, JobId, JobStatus};

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    /// Arrival order; also the dispatch priority among waiting jobs.
    order: Vec<JobId>,
    running: Option<JobId>,
}

impl StoreInner {
    fn waiting_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Waiting)
            .count()
    }

    fn origin_busy(&self, origin: IpAddr) -> bool {
        self.jobs
            .values()
            .any(|j| j.origin == origin && j.status != JobStatus::Done)
    }
}

/// Queue counters reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub running: Option<JobId>,
}

/// Single source of truth for job state.
///
/// Every method takes the store lock for its whole duration and never awaits
/// while holding it. Compound decisions (admission, dispatch) are single
/// critical sections. Cloning yields another handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    inner: Arc<Mutex<StoreInner>>,
    work_available: Arc<Notify>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal raised whenever there may be a job to dispatch.
    pub fn work_available(&self) -> Arc<Notify> {
        self.work_available.clone()
    }

    /// Insert a job unconditionally. Returns false if the id is already present.
    pub fn append(&self, job: Job) -> bool {
        {
            let mut inner = self.lock();
            if inner.jobs.contains_key(&job.id) {
                return false;
            }
            inner.order.push(job.id);
            inner.jobs.insert(job.id, job);
        }
        self.work_available.notify_one();
        true
    }

    /// Quota check, origin exclusivity check and insertion as one atomic step.
    ///
    /// A colliding id is replaced with a fresh one before insertion.
    pub fn try_admit(&self, mut job: Job, max_queue: usize) -> Result<JobId, AdmissionError> {
        let id = {
            let mut inner = self.lock();

            if inner.waiting_count() >= max_queue {
                return Err(AdmissionError::QueueFull { max: max_queue });
            }
            if inner.origin_busy(job.origin) {
                return Err(AdmissionError::OriginBusy);
            }

            while inner.jobs.contains_key(&job.id) {
                job.id = JobId::new();
            }

            let id = job.id;
            inner.order.push(id);
            inner.jobs.insert(id, job);
            id
        };

        tracing::debug!(job_id = %id, "Job added");
        self.work_available.notify_one();
        Ok(id)
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    /// Apply `mutator` to the job under the lock.
    pub fn update<R>(&self, id: &JobId, mutator: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.lock().jobs.get_mut(id).map(mutator)
    }

    /// All jobs in arrival order.
    pub fn snapshot(&self) -> Vec<Job> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .cloned()
            .collect()
    }

    /// Remove every job the predicate selects, keeping the arrival order of the
    /// rest. The predicate runs under the lock and sees jobs in arrival order.
    pub fn remove_where(&self, mut predicate: impl FnMut(&Job) -> bool) -> Vec<Job> {
        let mut inner = self.lock();
        let StoreInner {
            jobs,
            order,
            running,
        } = &mut *inner;

        let mut removed = Vec::new();
        order.retain(|id| {
            let Some(job) = jobs.get(id) else {
                return false;
            };
            if !predicate(job) {
                return true;
            }
            if let Some(job) = jobs.remove(id) {
                if *running == Some(job.id) {
                    *running = None;
                }
                removed.push(job);
            }
            false
        });
        removed
    }

    /// Atomically pick the earliest waiting job and mark it running.
    ///
    /// Returns `None` while another job is running or nothing is waiting.
    pub fn try_dispatch_next(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut inner = self.lock();
        if inner.running.is_some() {
            return None;
        }

        let next = inner
            .order
            .iter()
            .copied()
            .find(|id| {
                inner
                    .jobs
                    .get(id)
                    .is_some_and(|j| j.status == JobStatus::Waiting)
            })?;

        let job = inner.jobs.get_mut(&next)?;
        if !job.start(now) {
            return None;
        }
        let started = job.clone();
        inner.running = Some(next);
        Some(started)
    }

    /// Mark the running job done and clear the running indicator.
    pub fn finish(&self, id: &JobId, now: DateTime<Utc>) -> Option<Job> {
        let finished = {
            let mut inner = self.lock();
            if inner.running == Some(*id) {
                inner.running = None;
            }
            let job = inner.jobs.get_mut(id)?;
            job.finish(now);
            job.clone()
        };
        self.work_available.notify_one();
        Some(finished)
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting_count()
    }

    pub fn running_id(&self) -> Option<JobId> {
        self.lock().running
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.lock();
        QueueCounts {
            waiting: inner.waiting_count(),
            running: inner.running,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }
}
