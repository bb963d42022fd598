//! Deterministic job scheduler.
//!
//! A single-threaded queue of typed [`Job`]s ordered by deadline. The
//! scheduler never runs anything by itself: the owner asks for the
//! [`next_deadline`](Scheduler::next_deadline), waits, and drains due jobs
//! with [`pop_due`](Scheduler::pop_due). All time arguments are explicit,
//! which keeps the queue independent of any clock.
//!
//! # Retry backoff
//!
//! Jobs scheduled through [`schedule_retryable`](Scheduler::schedule_retryable)
//! carry a [`RetryState`]. When such a job fails, the owner hands the state
//! back to [`schedule_next_retryable`](Scheduler::schedule_next_retryable),
//! which schedules the job after the carried delay and doubles it for the
//! next round, capped at [`RetryPolicy::max`]:
//!
//! ```text
//! initial = 1s, max = 8s
//!
//! attempt:   1    2    3    4    5    6
//! delay:     1s   2s   4s   8s   8s   8s
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::{ConnectionType, Ssid};

/// Far-future fallback when a deadline would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Reference to a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

/// Work the server manager schedules for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Synchronize server entries with the data model
    Reload,
    /// Connect and register an inactive server
    Activate {
        /// Server to activate
        ssid: Ssid,
    },
    /// Tear down an active server
    Deactivate {
        /// Server to deactivate
        ssid: Ssid,
        /// Reactivate after this delay; `None` keeps the server disabled
        reactivate_after: Option<Duration>,
    },
    /// Refresh the connection and send a Registration Update
    SendUpdate {
        /// Server to update
        ssid: Ssid,
    },
    /// Close an idle queue-mode connection
    QueueModeClose {
        /// Server owning the connection
        ssid: Ssid,
        /// Transport to close
        conn_type: ConnectionType,
    },
}

impl Job {
    /// Server the job applies to, if any
    pub fn ssid(&self) -> Option<Ssid> {
        match self {
            Job::Reload => None,
            Job::Activate { ssid }
            | Job::Deactivate { ssid, .. }
            | Job::SendUpdate { ssid }
            | Job::QueueModeClose { ssid, .. } => Some(*ssid),
        }
    }
}

/// Backoff policy for retryable jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for the delay
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(120),
        }
    }
}

/// Backoff carried by a retryable job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Delay to apply on the next retry
    pub delay: Duration,
}

/// A job whose deadline has passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredJob {
    /// Handle under which the job was scheduled
    pub handle: JobHandle,
    /// The job
    pub job: Job,
    /// Backoff state, for retryable jobs
    pub retry: Option<RetryState>,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    retry: Option<RetryState>,
}

/// Deadline-ordered job queue
#[derive(Debug)]
pub struct Scheduler {
    policy: RetryPolicy,
    next_id: u64,
    queue: BTreeMap<(Instant, u64), Entry>,
    deadlines: HashMap<u64, Instant>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            next_id: 0,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Backoff policy in use
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn insert(&mut self, now: Instant, delay: Duration, job: Job, retry: Option<RetryState>) -> JobHandle {
        let deadline = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((deadline, id), Entry { job, retry });
        self.deadlines.insert(id, deadline);
        JobHandle(id)
    }

    /// Run `job` after `delay`
    pub fn schedule(&mut self, now: Instant, delay: Duration, job: Job) -> JobHandle {
        self.insert(now, delay, job, None)
    }

    /// Run `job` after `delay`, with backoff state for retries
    pub fn schedule_retryable(&mut self, now: Instant, delay: Duration, job: Job) -> JobHandle {
        let retry = RetryState {
            delay: self.policy.initial,
        };
        self.insert(now, delay, job, Some(retry))
    }

    /// Reschedule a failed retryable job after its backoff delay
    pub fn schedule_next_retryable(&mut self, now: Instant, job: Job, retry: RetryState) -> JobHandle {
        let next = RetryState {
            delay: retry.delay.saturating_mul(2).min(self.policy.max),
        };
        self.insert(now, retry.delay, job, Some(next))
    }

    /// Cancel the job behind `handle` and clear it.
    ///
    /// A `None` handle or one whose job already fired is a no-op.
    pub fn cancel(&mut self, handle: &mut Option<JobHandle>) {
        if let Some(JobHandle(id)) = handle.take() {
            if let Some(deadline) = self.deadlines.remove(&id) {
                self.queue.remove(&(deadline, id));
            }
        }
    }

    /// Whether `handle` refers to a job that has not fired yet
    pub fn is_pending(&self, handle: Option<JobHandle>) -> bool {
        handle.is_some_and(|JobHandle(id)| self.deadlines.contains_key(&id))
    }

    /// Deadline of `handle`, if still pending
    pub fn deadline(&self, handle: Option<JobHandle>) -> Option<Instant> {
        handle.and_then(|JobHandle(id)| self.deadlines.get(&id).copied())
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest job due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<FiredJob> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let entry = self.queue.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some(FiredJob {
            handle: JobHandle(id),
            job: entry.job,
            retry: entry.retry,
        })
    }

    /// Number of pending jobs
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pending jobs in deadline order
    pub fn pending_jobs(&self) -> impl Iterator<Item = (Instant, &Job)> + '_ {
        self.queue
            .iter()
            .map(|((deadline, _), entry)| (*deadline, &entry.job))
    }
}
