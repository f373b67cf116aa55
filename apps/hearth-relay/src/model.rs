use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RelayError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Account identity that owns a managed profile, independent of any device.
    UserId
);
string_id!(
    /// Stable identifier a client installation assigns to itself.
    DeviceId
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Sort rank within a time slot; high priority first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// Reminder value for tasks that have no time of day.
pub const ALL_DAY: &str = "all_day";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: u64,
    pub owner: UserId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_time: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_pattern_id: Option<u64>,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// Single occurrences removed with [`DeletionScope::Single`].
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded_dates: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task's own lifetime covers `date`, before any pattern is applied.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        !self.deleted
            && date >= self.start_date
            && self.end_date.map_or(true, |end| date <= end)
            && !self.excluded_dates.contains(&date)
    }

    pub fn overlaps(&self, from: NaiveDate, to: NaiveDate) -> bool {
        !self.deleted && self.start_date <= to && self.end_date.map_or(true, |end| end >= from)
    }

    /// Minutes after midnight of the reminder, `None` for all-day or untimed tasks.
    ///
    /// Accepts `HH:MM` and bare `HH`.
    pub fn reminder_minutes(&self) -> Option<u32> {
        let time = self.reminder_time.as_deref()?.trim();
        if time.is_empty() || time == ALL_DAY {
            return None;
        }
        let (hours, minutes) = time.split_once(':').unwrap_or((time, "0"));
        let hours: u32 = hours.trim().parse().ok()?;
        let minutes: u32 = minutes.trim().parse().ok()?;
        Some(hours * 60 + minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reminder_time: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub recurrence_pattern_id: Option<u64>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl TaskDraft {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.title.trim().is_empty() {
            return Err(RelayError::Validation("task title must not be empty".into()));
        }
        check_date_order(self.start_date, self.end_date)
    }
}

/// Partial update; absent fields keep their stored value.
///
/// The optional fields of a task can be cleared with an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub reminder_time: Option<Option<String>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub recurrence_pattern_id: Option<Option<u64>>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_date: Option<Option<NaiveDate>>,
}

impl TaskPatch {
    pub fn apply(self, task: &mut Task) -> Result<(), RelayError> {
        if let Some(title) = self.title {
            if title.trim().is_empty() {
                return Err(RelayError::Validation("task title must not be empty".into()));
            }
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(reminder_time) = self.reminder_time {
            task.reminder_time = reminder_time;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(pattern_id) = self.recurrence_pattern_id {
            task.recurrence_pattern_id = pattern_id;
        }
        if let Some(start_date) = self.start_date {
            task.start_date = start_date;
        }
        if let Some(end_date) = self.end_date {
            task.end_date = end_date;
        }
        check_date_order(task.start_date, task.end_date)
    }
}

/// A field that is present deserializes to `Some`, even when it is `null`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_date_order(start: NaiveDate, end: Option<NaiveDate>) -> Result<(), RelayError> {
    match end {
        Some(end) if end < start => Err(RelayError::Validation(format!(
            "end date {end} is before start date {start}"
        ))),
        _ => Ok(()),
    }
}

/// How much of a recurring task a delete removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionScope {
    /// Soft-deletes the whole series.
    All,
    /// Hides one occurrence.
    Single(NaiveDate),
    /// Truncates the series so nothing occurs on or after the date.
    FromDate(NaiveDate),
}

impl DeletionScope {
    pub fn label(self) -> &'static str {
        match self {
            DeletionScope::All => "all",
            DeletionScope::Single(_) => "single",
            DeletionScope::FromDate(_) => "from_date",
        }
    }

    pub fn date(self) -> Option<NaiveDate> {
        match self {
            DeletionScope::All => None,
            DeletionScope::Single(date) | DeletionScope::FromDate(date) => Some(date),
        }
    }
}

/// Completion state of one occurrence, unique per `(task_id, occurrence_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub task_id: u64,
    pub occurrence_date: NaiveDate,
    pub completed_by: UserId,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: u64,
    pub owner: UserId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDraft {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl NoteDraft {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.title.trim().is_empty() {
            return Err(RelayError::Validation("note title must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl NotePatch {
    pub fn apply(self, note: &mut Note) -> Result<(), RelayError> {
        if let Some(title) = self.title {
            if title.trim().is_empty() {
                return Err(RelayError::Validation("note title must not be empty".into()));
            }
            note.title = title;
        }
        if let Some(content) = self.content {
            note.content = content;
        }
        Ok(())
    }
}
