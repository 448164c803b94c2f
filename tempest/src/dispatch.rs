//! Sample delivery to local consumers.
//!
//! Each reader owns a [`Dispatcher`]: a queue of unread samples guarded by
//! the reader's retention policy, plus the blocking read primitives. The
//! matcher reports counterpart writers so readers can wait for a match.
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use localtime::LocalTime;

use crate::history::ElementHistory;
use crate::policy::Retention;
use crate::sample::Sample;

#[derive(Debug)]
pub struct Dispatcher<V> {
    inner: Mutex<Inner<V>>,
    cond: Condvar,
}

#[derive(Debug)]
struct Inner<V> {
    /// Unread samples, oldest first, kept under the reader's policy.
    queue: ElementHistory<V>,
    policy: Retention,
    /// Matched counterpart writers.
    writers: usize,
    closed: bool,
}

impl<V> Inner<V> {
    /// Drop expired samples from the front of the queue. Samples older
    /// than the configured lifetime are never delivered as unread.
    fn prune(&mut self, now: LocalTime) {
        if let Some(lifetime) = self.policy.lifetime {
            let cutoff = now - lifetime;
            while self
                .queue
                .iter()
                .next()
                .map(|s| s.timestamp.to_local_time() < cutoff)
                .unwrap_or(false)
            {
                self.queue.pop_front();
            }
        }
    }
}

impl<V: Clone> Dispatcher<V> {
    pub fn new(policy: Retention) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: ElementHistory::new(),
                policy,
                writers: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn policy(&self) -> Retention {
        self.lock().policy
    }

    /// Queue a sample for the reader. Returns `false` if the sample was
    /// dropped as a duplicate.
    pub fn deliver(&self, sample: Sample<V>, now: LocalTime) -> bool {
        let mut inner = self.lock();
        let policy = inner.policy;
        let queued = inner.queue.push(sample, &policy, now);

        drop(inner);
        self.cond.notify_all();

        queued
    }

    pub fn deliver_all(
        &self,
        samples: impl IntoIterator<Item = Sample<V>>,
        now: LocalTime,
    ) -> usize {
        let mut inner = self.lock();
        let policy = inner.policy;
        let mut queued = 0;

        for sample in samples {
            if inner.queue.push(sample, &policy, now) {
                queued += 1;
            }
        }
        drop(inner);
        self.cond.notify_all();

        queued
    }

    /// Number of unread samples.
    pub fn unread(&self) -> usize {
        let mut inner = self.lock();
        inner.prune(LocalTime::now());
        inner.queue.len()
    }

    /// Take the next unread sample, blocking until one is available.
    /// Returns `None` once the dispatcher is closed and drained.
    pub fn next_unread(&self) -> Option<Sample<V>> {
        let mut inner = self.lock();
        loop {
            inner.prune(LocalTime::now());
            if let Some(sample) = inner.queue.pop_front() {
                return Some(sample);
            }
            if inner.closed {
                return None;
            }
            inner = self.wait(inner);
        }
    }

    /// Take the next unread sample if one is queued.
    pub fn try_next_unread(&self) -> Option<Sample<V>> {
        let mut inner = self.lock();
        inner.prune(LocalTime::now());
        inner.queue.pop_front()
    }

    /// Drain and return all unread samples, without blocking.
    pub fn all_unread(&self) -> Vec<Sample<V>> {
        let mut inner = self.lock();
        inner.prune(LocalTime::now());

        let mut out = Vec::with_capacity(inner.queue.len());
        while let Some(sample) = inner.queue.pop_front() {
            out.push(sample);
        }
        out
    }

    /// Block until at least `n` samples are unread. Returns `false` if the
    /// dispatcher was closed first.
    pub fn wait_for_unread(&self, n: usize) -> bool {
        let mut inner = self.lock();
        loop {
            inner.prune(LocalTime::now());
            if inner.queue.len() >= n {
                return true;
            }
            if inner.closed {
                return false;
            }
            inner = self.wait(inner);
        }
    }

    /// As [`Dispatcher::wait_for_unread`], giving up after `timeout`.
    pub fn wait_for_unread_timeout(&self, n: usize, timeout: Duration) -> bool {
        let mut inner = self.lock();
        loop {
            inner.prune(LocalTime::now());
            if inner.queue.len() >= n {
                return true;
            }
            if inner.closed {
                return false;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(inner, timeout)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;

            if result.timed_out() {
                inner.prune(LocalTime::now());
                return inner.queue.len() >= n;
            }
        }
    }

    /// Block until the reader has at least one matched writer. Returns
    /// `false` if the dispatcher was closed first.
    pub fn wait_for_writers(&self) -> bool {
        let mut inner = self.lock();
        loop {
            if inner.writers > 0 {
                return true;
            }
            if inner.closed {
                return false;
            }
            inner = self.wait(inner);
        }
    }

    /// Matched counterpart writers.
    pub fn writers(&self) -> usize {
        self.lock().writers
    }

    pub fn writer_attached(&self) {
        self.lock().writers += 1;
        self.cond.notify_all();
    }

    pub fn writer_detached(&self) {
        let mut inner = self.lock();
        inner.writers = inner.writers.saturating_sub(1);
        drop(inner);
        self.cond.notify_all();
    }

    /// Wake all blocked callers; subsequent blocking reads return once the
    /// queue is drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, Inner<V>>,
    ) -> std::sync::MutexGuard<'a, Inner<V>> {
        self.cond.wait(guard).unwrap_or_else(|e| e.into_inner())
    }
}
