//! Recurrence calculation for Hearth tasks.
//!
//! A [`RecurrencePattern`] is a compact description of when a task repeats.
//! Occurrences are never stored; they are derived on demand from a pattern
//! and the series start date with the pure functions in this crate.

mod matcher;
mod pattern;

pub use matcher::{
    is_occurrence, is_occurrence_with, next_occurrence_after, next_occurrence_after_with,
    occurrences_in_range, occurrences_in_range_with, CustomRule, NoCustomRule, LOOKAHEAD_DAYS,
};
pub use pattern::{
    EndCondition, EndType, PatternBuilder, PatternError, PatternKind, PatternRecord,
    PatternViolation, Preset, RecurrencePattern, MAX_INTERVAL,
};
