//! Core model for the episodic outcome store.
//!
//! An episode reflection is written as one append-only outcome of a recurring
//! task, keyed by `(task, occurrence_index)`. This crate owns the value codec,
//! the per-task index allocator, and the write/read orchestration; storage
//! backends plug in through [`OutcomeStore`] and [`CounterStore`].

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod allocator;
pub mod codec;
pub mod memory;
pub mod service;

pub use allocator::{counter_key, IndexAllocator, TaskCounter, COUNTER_KEY_PREFIX};
pub use codec::{
    decode, decode_detailed, encode, DecodeDefault, DecodeReason, ReportField,
    DEFAULT_CONTROL_LEVEL, EMPTY_PLACEHOLDER, NOT_SPECIFIED, VALUE_COUNT,
};
pub use service::{EpisodicOutcomeService, MAX_CONFLICT_RETRIES};

pub const EPISODE_TASK_ID: &str = "episode_report";
pub const EPISODE_TASK_TITLE: &str = "Episode Record";

pub const MIN_CONTROL_LEVEL: u8 = 1;
pub const MAX_CONTROL_LEVEL: u8 = 10;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("outcome key {0} is already occupied")]
    Conflict(OutcomeKey),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

impl OutcomeError {
    pub fn io(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Io {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Stable identity of a recurring task.
///
/// `task_id` is the human-facing name (`episode_report`); `storage_id` is
/// assigned once when the task is registered and keys both the outcome rows
/// and the allocator counter.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskIdentity {
    pub task_id: String,
    pub storage_id: Ulid,
}

impl TaskIdentity {
    #[must_use]
    pub fn new(task_id: impl Into<String>, storage_id: Ulid) -> Self {
        Self {
            task_id: task_id.into(),
            storage_id,
        }
    }
}

impl Display for TaskIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OutcomeKey {
    pub task: TaskIdentity,
    pub occurrence_index: u64,
}

impl OutcomeKey {
    #[must_use]
    pub fn new(task: TaskIdentity, occurrence_index: u64) -> Self {
        Self {
            task,
            occurrence_index,
        }
    }
}

impl Display for OutcomeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.task.task_id, self.occurrence_index)
    }
}

/// Loosely-typed scalar stored at one position of an outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutcomeValue {
    Text(String),
    Number(f64),
}

impl OutcomeValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Number(_) => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

impl From<&str> for OutcomeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OutcomeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for OutcomeValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub key: OutcomeKey,
    pub values: Vec<OutcomeValue>,
    /// Store-assigned creation order. Audit only.
    pub record_seq: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Answers a user submits after one episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reflection {
    pub triggers: BTreeSet<String>,
    pub control_level: u8,
    pub location: String,
    pub urge_to_eat: String,
    pub what_ate: BTreeSet<String>,
    pub episode_duration_label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl Reflection {
    /// Validates a reflection before any index is allocated for it.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Validation`] when the control level is outside
    /// `1..=10`.
    pub fn validate(&self) -> Result<(), OutcomeError> {
        if !(MIN_CONTROL_LEVEL..=MAX_CONTROL_LEVEL).contains(&self.control_level) {
            return Err(OutcomeError::Validation(format!(
                "control_level MUST be in [{MIN_CONTROL_LEVEL}, {MAX_CONTROL_LEVEL}], got {}",
                self.control_level
            )));
        }

        Ok(())
    }
}

/// Display-ready projection of one stored outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpisodeReport {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub triggers: String,
    pub control_level: i64,
    pub location: String,
    pub urge_to_eat: String,
    pub what_ate: String,
    pub episode_duration: String,
}

/// Append-only outcome storage keyed by `(task, occurrence_index)`.
pub trait OutcomeStore: Send + Sync {
    /// Persists one record.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Conflict`] when the key is already taken and
    /// [`OutcomeError::Io`] when the backend fails.
    fn insert(&self, key: &OutcomeKey, values: &[OutcomeValue]) -> Result<(), OutcomeError>;

    /// Lists every record of `task` in store order.
    ///
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the backend cannot be queried.
    fn list_all(&self, task: &TaskIdentity) -> Result<Vec<OutcomeRecord>, OutcomeError>;
}

/// Durable key-value cells backing the allocator counters.
pub trait CounterStore: Send + Sync {
    /// # Errors
    /// Returns [`OutcomeError::Io`] when the backend cannot be read.
    fn load(&self, key: &str) -> Result<Option<u64>, OutcomeError>;

    /// # Errors
    /// Returns [`OutcomeError::Io`] when the backend cannot be written.
    fn save(&self, key: &str, value: u64) -> Result<(), OutcomeError>;
}

impl<T: OutcomeStore + ?Sized> OutcomeStore for Arc<T> {
    fn insert(&self, key: &OutcomeKey, values: &[OutcomeValue]) -> Result<(), OutcomeError> {
        (**self).insert(key, values)
    }

    fn list_all(&self, task: &TaskIdentity) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        (**self).list_all(task)
    }
}

impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    fn load(&self, key: &str) -> Result<Option<u64>, OutcomeError> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: u64) -> Result<(), OutcomeError> {
        (**self).save(key, value)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`OutcomeError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, OutcomeError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| OutcomeError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(OutcomeError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parses an RFC3339 timestamp with any offset and normalizes it to UTC.
#[must_use]
pub fn parse_rfc3339_lenient(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`OutcomeError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OutcomeError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            OutcomeError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
