//! In-process backends for [`OutcomeStore`] and [`CounterStore`].
//!
//! Used by embedders that do not need durability and by the test suites.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::{
    now_utc, CounterStore, OutcomeError, OutcomeKey, OutcomeRecord, OutcomeStore, OutcomeValue,
    TaskIdentity,
};

#[derive(Debug, Default)]
pub struct MemoryOutcomeStore {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemoryOutcomeStore {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutcomeStore for MemoryOutcomeStore {
    fn insert(&self, key: &OutcomeKey, values: &[OutcomeValue]) -> Result<(), OutcomeError> {
        // Check and push under one guard so concurrent inserts see each other.
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.iter().any(|record| {
            record.key.task.storage_id == key.task.storage_id
                && record.key.occurrence_index == key.occurrence_index
        }) {
            return Err(OutcomeError::Conflict(key.clone()));
        }

        let record_seq = i64::try_from(records.len())
            .map_err(|err| OutcomeError::io("record sequence overflow", err))?
            + 1;
        records.push(OutcomeRecord {
            key: key.clone(),
            values: values.to_vec(),
            record_seq,
            created_at: now_utc(),
        });
        Ok(())
    }

    fn list_all(&self, task: &TaskIdentity) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|record| record.key.task.storage_id == task.storage_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    cells: Mutex<HashMap<String, u64>>,
}

impl CounterStore for MemoryCounterStore {
    fn load(&self, key: &str) -> Result<Option<u64>, OutcomeError> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cells.get(key).copied())
    }

    fn save(&self, key: &str, value: u64) -> Result<(), OutcomeError> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T, OutcomeError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn duplicate_key_is_a_typed_conflict() {
        let store = MemoryOutcomeStore::default();
        let key = OutcomeKey::new(TaskIdentity::new("episode_report", Ulid::nil()), 0);

        must(store.insert(&key, &[OutcomeValue::from("first")]));
        let err = match store.insert(&key, &[OutcomeValue::from("second")]) {
            Ok(()) => panic!("duplicate insert must fail"),
            Err(err) => err,
        };
        assert!(err.is_conflict());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn task_identity_is_its_storage_id() {
        let store = MemoryOutcomeStore::default();
        let storage_id = Ulid::new();
        let registered = TaskIdentity::new("episode_report", storage_id);
        let renamed = TaskIdentity::new("episode_report_renamed", storage_id);

        must(store.insert(&OutcomeKey::new(registered.clone(), 2), &[]));
        let err = match store.insert(&OutcomeKey::new(renamed.clone(), 2), &[]) {
            Ok(()) => panic!("same storage id and index must conflict"),
            Err(err) => err,
        };
        assert!(err.is_conflict());
        assert_eq!(must(store.list_all(&renamed)).len(), 1);
        assert_eq!(must(store.list_all(&registered)).len(), 1);
    }

    #[test]
    fn list_all_filters_by_task_and_keeps_insert_order() {
        let store = MemoryOutcomeStore::default();
        let task = TaskIdentity::new("episode_report", Ulid::nil());
        let other = TaskIdentity::new("other", Ulid::new());

        must(store.insert(&OutcomeKey::new(task.clone(), 3), &[]));
        must(store.insert(&OutcomeKey::new(other, 0), &[]));
        must(store.insert(&OutcomeKey::new(task.clone(), 1), &[]));

        let records = must(store.list_all(&task));
        let indices = records
            .iter()
            .map(|record| record.key.occurrence_index)
            .collect::<Vec<_>>();
        assert_eq!(indices, vec![3, 1]);
        assert!(records[0].record_seq < records[1].record_seq);
    }
}
