use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use crate::messages::{Report, TaskKey};

#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryTask {
    pub key: TaskKey,
    pub report: Report,
    /// Failed attempts for the current payload.
    pub attempt_count: u32,
    pub enqueued_at: Instant,
    /// Changes whenever the payload is replaced.
    pub generation: u64,
}

/// Exponential retry delay, doubling from `initial` up to `max`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before the next try after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, PartialEq)]
pub enum Claim {
    Ready(DeliveryTask),
    /// Nothing is ready. `wake_at` is when the earliest backed-off task becomes
    /// ready, if there is one.
    Idle { wake_at: Option<Instant> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Ack {
    Delivered,
    /// The payload was replaced while in flight; the new one stays queued.
    Superseded,
    Unknown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Requeue {
    Retry { attempt: u32, delay: Duration },
    Superseded,
    Unknown,
}

struct Entry {
    task: DeliveryTask,
    /// Insertion order, kept when the payload is replaced.
    seq: u64,
    next_attempt_at: Instant,
    in_flight: bool,
}

impl Entry {
    fn is_ready(&self, now: Instant) -> bool {
        !self.in_flight && self.next_attempt_at <= now
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<TaskKey, Entry>,
    next_generation: u64,
}

impl Inner {
    fn oldest_ready(&self, now: Instant) -> Option<&TaskKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_ready(now))
            .min_by_key(|(_, entry)| (entry.task.enqueued_at, entry.seq))
            .map(|(key, _)| key)
    }
}

/// Pending outbound reports, at most one per key.
///
/// A task stays here until a delivery of its *current* payload is
/// acknowledged. Tasks handed out by [`DeliveryQueue::claim_next`] are marked
/// in flight so a key is never delivered by two workers at once.
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    ready: Notify,
    backoff: Backoff,
}

impl DeliveryQueue {
    pub fn new(backoff: Backoff) -> Self {
        DeliveryQueue {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            backoff,
        }
    }

    /// Insert a task, or replace the payload of the pending one for `key`.
    ///
    /// A replaced payload starts over with zero attempts and no backoff. The
    /// task keeps its place in the drain order.
    pub fn upsert(&self, key: TaskKey, report: Report) -> DeliveryTask {
        let now = Instant::now();
        let task = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.next_generation += 1;
            let generation = inner.next_generation;

            let entry = inner.entries.entry(key.clone()).or_insert_with(|| Entry {
                task: DeliveryTask {
                    key,
                    report: report.clone(),
                    attempt_count: 0,
                    enqueued_at: now,
                    generation,
                },
                seq: generation,
                next_attempt_at: now,
                in_flight: false,
            });
            entry.task.report = report;
            entry.task.attempt_count = 0;
            entry.task.generation = generation;
            entry.next_attempt_at = now;
            entry.task.clone()
        };
        self.ready.notify_one();
        task
    }

    /// Oldest task that could be delivered right now.
    pub fn peek_next(&self) -> Option<DeliveryTask> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = inner.oldest_ready(Instant::now())?;
        Some(inner.entries[key].task.clone())
    }

    /// Like [`peek_next`](Self::peek_next), but marks the task in flight. The
    /// caller must follow up with [`ack`](Self::ack) or
    /// [`requeue`](Self::requeue).
    pub fn claim_next(&self) -> Claim {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(key) = inner.oldest_ready(now).cloned() else {
            let wake_at = inner
                .entries
                .values()
                .filter(|entry| !entry.in_flight)
                .map(|entry| entry.next_attempt_at)
                .min();
            return Claim::Idle { wake_at };
        };

        let more_ready = inner
            .entries
            .iter()
            .any(|(other, entry)| *other != key && entry.is_ready(now));
        let Some(entry) = inner.entries.get_mut(&key) else {
            return Claim::Idle { wake_at: None };
        };
        entry.in_flight = true;
        let task = entry.task.clone();
        drop(inner);

        if more_ready {
            // hand the rest to another idle worker
            self.ready.notify_one();
        }
        Claim::Ready(task)
    }

    /// Confirm delivery of `generation`. The task is only removed if that is
    /// still its current payload.
    pub fn ack(&self, key: &TaskKey, generation: u64) -> Ack {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = inner.entries.get_mut(key) else {
            return Ack::Unknown;
        };
        if entry.task.generation == generation {
            inner.entries.remove(key);
            return Ack::Delivered;
        }
        entry.in_flight = false;
        drop(inner);
        self.ready.notify_one();
        Ack::Superseded
    }

    /// Record a failed delivery of `generation` and schedule the next attempt.
    /// A failure of a superseded payload does not delay the new one.
    pub fn requeue(&self, key: &TaskKey, generation: u64) -> Requeue {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = inner.entries.get_mut(key) else {
            return Requeue::Unknown;
        };
        entry.in_flight = false;

        let outcome = if entry.task.generation == generation {
            entry.task.attempt_count = entry.task.attempt_count.saturating_add(1);
            let attempt = entry.task.attempt_count;
            let delay = self.backoff.delay(attempt);
            entry.next_attempt_at = Instant::now() + delay;
            Requeue::Retry { attempt, delay }
        } else {
            Requeue::Superseded
        };
        drop(inner);
        // wake an idle worker so it can recompute its wake-up time
        self.ready.notify_one();
        outcome
    }

    /// Drop the task for `key`, delivered or not. A delivery of it that is
    /// still in flight will be acked or requeued as unknown.
    pub fn remove(&self, key: &TaskKey) -> Option<DeliveryTask> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(key).map(|entry| entry.task)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &TaskKey) -> Option<DeliveryTask> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).map(|entry| entry.task.clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Resolves after the next upsert, ack or requeue.
    pub fn changed(&self) -> Notified<'_> {
        self.ready.notified()
    }
}
