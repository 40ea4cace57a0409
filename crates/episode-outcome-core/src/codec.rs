//! Positional value layout of an episode outcome.
//!
//! ```text
//! 0 triggers        Text
//! 1 control_level   Number
//! 2 location        Text
//! 3 urge_to_eat     Text
//! 4 what_ate        Text
//! 5 recorded_at     Text (RFC3339)
//! 6 duration_label  Text
//! ```
//!
//! The layout is versionless. Decoding never fails: a missing or mistyped
//! position is replaced by a default and reported as a [`DecodeDefault`].

use std::collections::BTreeSet;

use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    format_rfc3339, parse_rfc3339_lenient, EpisodeReport, OutcomeError, OutcomeValue, Reflection,
};

pub const NOT_SPECIFIED: &str = "Not specified";
pub const EMPTY_PLACEHOLDER: &str = "—";
pub const DEFAULT_CONTROL_LEVEL: i64 = 5;
pub const VALUE_COUNT: usize = 7;

const LIST_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportField {
    Triggers,
    ControlLevel,
    Location,
    UrgeToEat,
    WhatAte,
    Date,
    EpisodeDuration,
}

impl ReportField {
    #[must_use]
    pub fn position(self) -> usize {
        match self {
            Self::Triggers => 0,
            Self::ControlLevel => 1,
            Self::Location => 2,
            Self::UrgeToEat => 3,
            Self::WhatAte => 4,
            Self::Date => 5,
            Self::EpisodeDuration => 6,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triggers => "triggers",
            Self::ControlLevel => "control_level",
            Self::Location => "location",
            Self::UrgeToEat => "urge_to_eat",
            Self::WhatAte => "what_ate",
            Self::Date => "date",
            Self::EpisodeDuration => "episode_duration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DecodeReason {
    Missing,
    WrongTag,
    Unparseable,
}

impl DecodeReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::WrongTag => "wrong_tag",
            Self::Unparseable => "unparseable",
        }
    }
}

/// A default substituted for one malformed position during decode.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct DecodeDefault {
    pub field: ReportField,
    pub reason: DecodeReason,
}

/// Encodes a reflection into its positional value list.
///
/// # Errors
/// Returns [`OutcomeError::Validation`] when the timestamp cannot be
/// formatted.
pub fn encode(reflection: &Reflection) -> Result<Vec<OutcomeValue>, OutcomeError> {
    Ok(vec![
        OutcomeValue::Text(join_or_sentinel(&reflection.triggers)),
        OutcomeValue::Number(f64::from(reflection.control_level)),
        OutcomeValue::Text(text_or(&reflection.location, NOT_SPECIFIED)),
        OutcomeValue::Text(text_or(&reflection.urge_to_eat, NOT_SPECIFIED)),
        OutcomeValue::Text(join_or_sentinel(&reflection.what_ate)),
        OutcomeValue::Text(format_rfc3339(reflection.recorded_at)?),
        OutcomeValue::Text(text_or(
            &reflection.episode_duration_label,
            EMPTY_PLACEHOLDER,
        )),
    ])
}

/// Decodes a stored value list, logging every substituted default.
#[must_use]
pub fn decode(occurrence_index: u64, values: &[OutcomeValue], now: OffsetDateTime) -> EpisodeReport {
    let (report, defaults) = decode_detailed(occurrence_index, values, now);
    for substituted in &defaults {
        tracing::warn!(
            occurrence_index,
            field = substituted.field.as_str(),
            reason = substituted.reason.as_str(),
            "substituted default while decoding episode outcome"
        );
    }
    report
}

/// Decodes a stored value list and returns the defaults that were applied.
///
/// `now` stands in for a missing or unparseable timestamp.
#[must_use]
pub fn decode_detailed(
    occurrence_index: u64,
    values: &[OutcomeValue],
    now: OffsetDateTime,
) -> (EpisodeReport, Vec<DecodeDefault>) {
    let mut defaults = Vec::new();

    let triggers = text_field(values, ReportField::Triggers, &mut defaults);
    let control_level = control_level_field(values, &mut defaults);
    let location = text_field(values, ReportField::Location, &mut defaults);
    let urge_to_eat = text_field(values, ReportField::UrgeToEat, &mut defaults);
    let what_ate = text_field(values, ReportField::WhatAte, &mut defaults);
    let date = date_field(values, now, &mut defaults);
    let episode_duration = text_field(values, ReportField::EpisodeDuration, &mut defaults);

    let report = EpisodeReport {
        id: occurrence_index,
        date,
        triggers,
        control_level,
        location,
        urge_to_eat,
        what_ate,
        episode_duration,
    };
    (report, defaults)
}

fn join_or_sentinel(items: &BTreeSet<String>) -> String {
    let joined = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR);

    if joined.is_empty() {
        NOT_SPECIFIED.to_string()
    } else {
        joined
    }
}

fn text_or(value: &str, sentinel: &str) -> String {
    if value.trim().is_empty() {
        sentinel.to_string()
    } else {
        value.to_string()
    }
}

fn text_field(
    values: &[OutcomeValue],
    field: ReportField,
    defaults: &mut Vec<DecodeDefault>,
) -> String {
    match values.get(field.position()) {
        Some(OutcomeValue::Text(value)) => value.clone(),
        Some(OutcomeValue::Number(_)) => {
            defaults.push(DecodeDefault {
                field,
                reason: DecodeReason::WrongTag,
            });
            EMPTY_PLACEHOLDER.to_string()
        }
        None => {
            defaults.push(DecodeDefault {
                field,
                reason: DecodeReason::Missing,
            });
            EMPTY_PLACEHOLDER.to_string()
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn control_level_field(values: &[OutcomeValue], defaults: &mut Vec<DecodeDefault>) -> i64 {
    let field = ReportField::ControlLevel;
    let reason = match values.get(field.position()) {
        Some(OutcomeValue::Number(value)) if value.is_finite() => return value.trunc() as i64,
        Some(OutcomeValue::Number(_)) => DecodeReason::Unparseable,
        Some(OutcomeValue::Text(_)) => DecodeReason::WrongTag,
        None => DecodeReason::Missing,
    };

    defaults.push(DecodeDefault { field, reason });
    DEFAULT_CONTROL_LEVEL
}

fn date_field(
    values: &[OutcomeValue],
    now: OffsetDateTime,
    defaults: &mut Vec<DecodeDefault>,
) -> OffsetDateTime {
    let field = ReportField::Date;
    let reason = match values.get(field.position()) {
        Some(OutcomeValue::Text(raw)) => match parse_rfc3339_lenient(raw) {
            Some(parsed) => return parsed,
            None => DecodeReason::Unparseable,
        },
        Some(OutcomeValue::Number(_)) => DecodeReason::WrongTag,
        None => DecodeReason::Missing,
    };

    defaults.push(DecodeDefault { field, reason });
    now
}
