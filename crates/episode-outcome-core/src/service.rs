//! Write and read orchestration for episode outcomes.
//!
//! A write allocates an index, encodes the reflection, and inserts it. A
//! conflicting key moves the counter past the occupied slot and is retried
//! exactly once; any other failure leaves the counter untouched and is
//! returned as-is.

use time::OffsetDateTime;

use crate::allocator::TaskCounter;
use crate::{
    codec, now_utc, CounterStore, EpisodeReport, IndexAllocator, OutcomeError, OutcomeKey,
    OutcomeStore, OutcomeValue, Reflection, TaskIdentity,
};

pub const MAX_CONFLICT_RETRIES: u32 = 1;

pub struct EpisodicOutcomeService<S, C> {
    store: S,
    allocator: IndexAllocator<C>,
}

impl<S: OutcomeStore, C: CounterStore> EpisodicOutcomeService<S, C> {
    pub fn new(store: S, counters: C) -> Self {
        Self {
            store,
            allocator: IndexAllocator::new(counters),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn allocator(&self) -> &IndexAllocator<C> {
        &self.allocator
    }

    /// Persists one reflection as the next outcome of `task`.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Validation`] for an invalid reflection,
    /// [`OutcomeError::Conflict`] when the retried slot is also occupied, and
    /// [`OutcomeError::Io`] when storage fails.
    pub fn record(
        &self,
        task: &TaskIdentity,
        reflection: &Reflection,
    ) -> Result<OutcomeKey, OutcomeError> {
        reflection.validate()?;

        self.allocator.with_task(task, |counter| {
            let index = counter.next_index()?;
            let values = codec::encode(reflection)?;
            self.write_with_retry(task, counter, index, &values)
        })
    }

    fn write_with_retry(
        &self,
        task: &TaskIdentity,
        counter: &TaskCounter<'_, C>,
        first_index: u64,
        values: &[OutcomeValue],
    ) -> Result<OutcomeKey, OutcomeError> {
        let mut index = first_index;
        let mut retries_left = MAX_CONFLICT_RETRIES;

        loop {
            let key = OutcomeKey::new(task.clone(), index);
            tracing::debug!(%key, "inserting episode outcome");

            match self.store.insert(&key, values) {
                Ok(()) => {
                    // The record is durable; a stale counter is skipped by the
                    // next write's conflict path.
                    if let Err(err) = counter.advance(index) {
                        tracing::warn!(
                            %key,
                            counter_key = counter.key(),
                            error = %err,
                            "outcome persisted but index advance failed"
                        );
                    }
                    return Ok(key);
                }
                Err(OutcomeError::Conflict(occupied)) => {
                    counter.advance(index)?;
                    if retries_left == 0 {
                        return Err(OutcomeError::Conflict(occupied));
                    }
                    retries_left -= 1;
                    index = counter.next_index()?;
                    tracing::info!(
                        occupied = %occupied,
                        retry_index = index,
                        "outcome key occupied, retrying with next index"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns every report of `task`, newest first.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the store cannot be queried.
    pub fn reports(&self, task: &TaskIdentity) -> Result<Vec<EpisodeReport>, OutcomeError> {
        self.reports_at(task, now_utc())
    }

    /// Same as [`Self::reports`], with `now` used for unparseable timestamps.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the store cannot be queried.
    pub fn reports_at(
        &self,
        task: &TaskIdentity,
        now: OffsetDateTime,
    ) -> Result<Vec<EpisodeReport>, OutcomeError> {
        let mut reports = self
            .store
            .list_all(task)?
            .iter()
            .map(|record| codec::decode(record.key.occurrence_index, &record.values, now))
            .collect::<Vec<_>>();

        reports.sort_by(|lhs, rhs| rhs.date.cmp(&lhs.date).then(rhs.id.cmp(&lhs.id)));
        Ok(reports)
    }

    /// Returns the report stored at occurrence index `id`, if any.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the store cannot be queried.
    pub fn find_report(
        &self,
        task: &TaskIdentity,
        id: u64,
    ) -> Result<Option<EpisodeReport>, OutcomeError> {
        let now = now_utc();
        Ok(self
            .store
            .list_all(task)?
            .iter()
            .find(|record| record.key.occurrence_index == id)
            .map(|record| codec::decode(id, &record.values, now)))
    }
}
