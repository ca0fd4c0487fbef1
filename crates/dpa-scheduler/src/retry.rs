//! Bounded-backoff retry of failed retriable operations.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dpa_model::Key;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Delay before the first re-attempt.
    pub period: Duration,
    /// Double the delay after every failed attempt.
    pub exp_backoff: bool,
    /// Administrator-configured retry budget per value; once exhausted the
    /// failure is permanent until the value is re-written.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::from_secs(1),
            exp_backoff: true,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.exp_backoff && attempt > 1 {
            self.period.saturating_mul(2u32.saturating_pow(attempt - 1))
        } else {
            self.period
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryEntry {
    pub key: Key,
    /// 1-based attempt number this entry will execute.
    pub attempt: u32,
    pub due_at: Instant,
    /// Value revision observed when the failure happened; a newer write
    /// makes the retry obsolete.
    pub revision: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RetryQueue {
    entries: BTreeMap<Key, RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules (or reschedules) a retry. Returns false when the policy
    /// forbids it or the budget is exhausted.
    pub fn schedule(
        &mut self,
        policy: &RetryPolicy,
        key: Key,
        attempt: u32,
        revision: u64,
        now: Instant,
    ) -> bool {
        if !policy.enabled || attempt > policy.max_attempts {
            return false;
        }
        let due_at = now + policy.delay(attempt);
        self.entries.insert(
            key.clone(),
            RetryEntry {
                key,
                attempt,
                due_at,
                revision,
            },
        );
        true
    }

    pub fn remove(&mut self, key: &Key) {
        self.entries.remove(key);
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.due_at).min()
    }

    /// Removes and returns every entry due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<RetryEntry> {
        let due_keys: Vec<Key> = self
            .entries
            .values()
            .filter(|entry| entry.due_at <= now)
            .map(|entry| entry.key.clone())
            .collect();
        due_keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
