//! Per-task occurrence index allocation.
//!
//! The counter for a task lives in a [`CounterStore`] under
//! `episode_outcome_index_<storage_id>`, independent of the outcome rows, so
//! pruning the outcome store never causes an index to be handed out twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use ulid::Ulid;

use crate::{CounterStore, OutcomeError, TaskIdentity};

pub const COUNTER_KEY_PREFIX: &str = "episode_outcome_index_";

#[must_use]
pub fn counter_key(task: &TaskIdentity) -> String {
    format!("{COUNTER_KEY_PREFIX}{}", task.storage_id)
}

pub struct IndexAllocator<C> {
    counters: C,
    task_locks: Mutex<HashMap<Ulid, Arc<Mutex<()>>>>,
}

/// Counter view for one task, only reachable while its task lock is held.
pub struct TaskCounter<'a, C> {
    counters: &'a C,
    key: String,
}

impl<C: CounterStore> TaskCounter<'_, C> {
    /// Returns the next index to try (0 for a task never seen).
    ///
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the counter cannot be read.
    pub fn next_index(&self) -> Result<u64, OutcomeError> {
        Ok(self.counters.load(&self.key)?.unwrap_or(0))
    }

    /// Moves the counter to `max(current, used_index + 1)` and returns it.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the counter cannot be read or saved.
    pub fn advance(&self, used_index: u64) -> Result<u64, OutcomeError> {
        let current = self.next_index()?;
        let target = current.max(used_index.saturating_add(1));
        if target != current {
            self.counters.save(&self.key, target)?;
        }
        Ok(target)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<C: CounterStore> IndexAllocator<C> {
    pub fn new(counters: C) -> Self {
        Self {
            counters,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn counters(&self) -> &C {
        &self.counters
    }

    /// Runs `operation` with the task's lock held.
    ///
    /// Every read-then-advance sequence for one task goes through here, so two
    /// writers never act on the same counter snapshot.
    pub fn with_task<R>(
        &self,
        task: &TaskIdentity,
        operation: impl FnOnce(&TaskCounter<'_, C>) -> R,
    ) -> R {
        let lock = self.task_lock(task);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = TaskCounter {
            counters: &self.counters,
            key: counter_key(task),
        };
        operation(&counter)
    }

    /// # Errors
    /// Returns [`OutcomeError::Io`] when the counter cannot be read.
    pub fn next_index(&self, task: &TaskIdentity) -> Result<u64, OutcomeError> {
        self.with_task(task, |counter| counter.next_index())
    }

    /// # Errors
    /// Returns [`OutcomeError::Io`] when the counter cannot be read or saved.
    pub fn advance(&self, task: &TaskIdentity, used_index: u64) -> Result<u64, OutcomeError> {
        self.with_task(task, |counter| counter.advance(used_index))
    }

    /// Returns the lock guarding `task`, creating it on first use.
    pub fn task_lock(&self, task: &TaskIdentity) -> Arc<Mutex<()>> {
        let mut locks = self
            .task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(task.storage_id).or_default())
    }
}
