use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted `interval`.
pub const MAX_INTERVAL: u32 = 365;

/// The base rule a pattern repeats by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Occurs once, on the series start.
    None,
    Daily,
    Weekly,
    Monthly,
    /// Never matches unless the caller supplies a [`CustomRule`](crate::CustomRule).
    Custom,
}

/// When a series stops producing occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCondition {
    Never,
    /// The series ends after this many valid occurrences.
    AfterCount(u32),
    /// Last day (inclusive) an occurrence may fall on.
    OnDate(NaiveDate),
}

/// A validated recurrence definition.
///
/// Every instance satisfies `1 <= interval <= MAX_INTERVAL`, has weekdays in
/// `0..=6` (0 is Sunday) and month days in `1..=31`, both sorted and
/// deduplicated. Deserialization runs the same checks as [`PatternBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatternRecord", into = "PatternRecord")]
pub struct RecurrencePattern {
    id: Option<u64>,
    kind: PatternKind,
    interval: u32,
    days_of_week: Vec<u8>,
    days_of_month: Vec<u8>,
    end: EndCondition,
}

impl RecurrencePattern {
    pub fn builder(kind: PatternKind) -> PatternBuilder {
        PatternBuilder::new(kind)
    }

    /// A one-off pattern.
    pub fn once() -> Self {
        Self::raw(PatternKind::None, 1, Vec::new(), Vec::new())
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn days_of_week(&self) -> &[u8] {
        &self.days_of_week
    }

    pub fn days_of_month(&self) -> &[u8] {
        &self.days_of_month
    }

    pub fn end(&self) -> EndCondition {
        self.end
    }

    /// Returns the same pattern carrying the identifier a store assigned to it.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    fn raw(kind: PatternKind, interval: u32, days_of_week: Vec<u8>, days_of_month: Vec<u8>) -> Self {
        Self {
            id: None,
            kind,
            interval,
            days_of_week,
            days_of_month,
            end: EndCondition::Never,
        }
    }
}

/// Collects pattern fields and checks them all at once in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PatternBuilder {
    id: Option<u64>,
    kind: PatternKind,
    interval: u32,
    days_of_week: Vec<u8>,
    days_of_month: Vec<u8>,
    end: EndCondition,
}

impl PatternBuilder {
    fn new(kind: PatternKind) -> Self {
        Self {
            id: None,
            kind,
            interval: 1,
            days_of_week: Vec::new(),
            days_of_month: Vec::new(),
            end: EndCondition::Never,
        }
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_weekdays(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.days_of_week = days.into_iter().collect();
        self
    }

    pub fn on_month_days(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.days_of_month = days.into_iter().collect();
        self
    }

    pub fn ending(mut self, end: EndCondition) -> Self {
        self.end = end;
        self
    }

    pub fn build(self) -> Result<RecurrencePattern, PatternError> {
        let mut violations = Vec::new();

        if !(1..=MAX_INTERVAL).contains(&self.interval) {
            violations.push(PatternViolation::IntervalOutOfRange(self.interval));
        }
        if let Some(day) = self.days_of_week.iter().copied().find(|day| *day > 6) {
            violations.push(PatternViolation::WeekdayOutOfRange(day));
        }
        if let Some(day) = self
            .days_of_month
            .iter()
            .copied()
            .find(|day| !(1..=31).contains(day))
        {
            violations.push(PatternViolation::MonthDayOutOfRange(day));
        }
        if self.end == EndCondition::AfterCount(0) {
            violations.push(PatternViolation::MissingCount);
        }

        if !violations.is_empty() {
            return Err(PatternError { violations });
        }

        Ok(RecurrencePattern {
            id: self.id,
            kind: self.kind,
            interval: self.interval,
            days_of_week: normalize(self.days_of_week),
            days_of_month: normalize(self.days_of_month),
            end: self.end,
        })
    }
}

fn normalize(mut days: Vec<u8>) -> Vec<u8> {
    days.sort_unstable();
    days.dedup();
    days
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternViolation {
    #[error("interval must be between 1 and {max}, got {0}", max = MAX_INTERVAL)]
    IntervalOutOfRange(u32),
    #[error("day of week must be between 0 and 6, got {0}")]
    WeekdayOutOfRange(u8),
    #[error("day of month must be between 1 and 31, got {0}")]
    MonthDayOutOfRange(u8),
    #[error("after_count end condition needs a count of at least 1")]
    MissingCount,
    #[error("on_date end condition needs an end date")]
    MissingEndDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid recurrence pattern: {}", summarize(.violations))]
pub struct PatternError {
    violations: Vec<PatternViolation>,
}

impl PatternError {
    pub fn violations(&self) -> &[PatternViolation] {
        &self.violations
    }
}

fn summarize(violations: &[PatternViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Wire form of an end condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndType {
    #[default]
    Never,
    #[serde(alias = "after")]
    AfterCount,
    OnDate,
}

/// Flat JSON representation shared with clients and stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub pattern_type: PatternKind,
    #[serde(default = "default_interval", alias = "interval_value")]
    pub interval: u32,
    #[serde(default)]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default)]
    pub days_of_month: Option<Vec<u8>>,
    #[serde(default)]
    pub end_type: EndType,
    #[serde(default)]
    pub end_after_count: Option<u32>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

fn default_interval() -> u32 {
    1
}

impl TryFrom<PatternRecord> for RecurrencePattern {
    type Error = PatternError;

    fn try_from(record: PatternRecord) -> Result<Self, Self::Error> {
        let end = match record.end_type {
            EndType::Never => EndCondition::Never,
            EndType::AfterCount => match record.end_after_count {
                Some(count) => EndCondition::AfterCount(count),
                None => {
                    return Err(PatternError {
                        violations: vec![PatternViolation::MissingCount],
                    })
                }
            },
            EndType::OnDate => match record.end_date {
                Some(date) => EndCondition::OnDate(date),
                None => {
                    return Err(PatternError {
                        violations: vec![PatternViolation::MissingEndDate],
                    })
                }
            },
        };

        let mut builder = RecurrencePattern::builder(record.pattern_type)
            .every(record.interval)
            .on_weekdays(record.days_of_week.unwrap_or_default())
            .on_month_days(record.days_of_month.unwrap_or_default())
            .ending(end);
        if let Some(id) = record.id {
            builder = builder.id(id);
        }
        builder.build()
    }
}

impl From<RecurrencePattern> for PatternRecord {
    fn from(pattern: RecurrencePattern) -> Self {
        let (end_type, end_after_count, end_date) = match pattern.end {
            EndCondition::Never => (EndType::Never, None, None),
            EndCondition::AfterCount(count) => (EndType::AfterCount, Some(count), None),
            EndCondition::OnDate(date) => (EndType::OnDate, None, Some(date)),
        };
        Self {
            id: pattern.id,
            pattern_type: pattern.kind,
            interval: pattern.interval,
            days_of_week: non_empty(pattern.days_of_week),
            days_of_month: non_empty(pattern.days_of_month),
            end_type,
            end_after_count,
            end_date,
        }
    }
}

fn non_empty(days: Vec<u8>) -> Option<Vec<u8>> {
    if days.is_empty() {
        None
    } else {
        Some(days)
    }
}

/// Ready-made patterns offered to clients when creating a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Once,
    Daily,
    EveryOtherDay,
    Weekly,
    Weekdays,
    Weekends,
    Monthly,
}

impl Preset {
    pub const ALL: [Preset; 7] = [
        Preset::Once,
        Preset::Daily,
        Preset::EveryOtherDay,
        Preset::Weekly,
        Preset::Weekdays,
        Preset::Weekends,
        Preset::Monthly,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Preset::Once => "once",
            Preset::Daily => "daily",
            Preset::EveryOtherDay => "every_other_day",
            Preset::Weekly => "weekly",
            Preset::Weekdays => "weekdays",
            Preset::Weekends => "weekends",
            Preset::Monthly => "monthly",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Preset::Once => "Does not repeat",
            Preset::Daily => "Every day",
            Preset::EveryOtherDay => "Every 2 days",
            Preset::Weekly => "Every week",
            Preset::Weekdays => "Weekdays only",
            Preset::Weekends => "Weekends only",
            Preset::Monthly => "Every month",
        }
    }

    pub fn pattern(self) -> RecurrencePattern {
        match self {
            Preset::Once => RecurrencePattern::once(),
            Preset::Daily => RecurrencePattern::raw(PatternKind::Daily, 1, Vec::new(), Vec::new()),
            Preset::EveryOtherDay => {
                RecurrencePattern::raw(PatternKind::Daily, 2, Vec::new(), Vec::new())
            }
            Preset::Weekly => RecurrencePattern::raw(PatternKind::Weekly, 1, Vec::new(), Vec::new()),
            Preset::Weekdays => {
                RecurrencePattern::raw(PatternKind::Weekly, 1, vec![1, 2, 3, 4, 5], Vec::new())
            }
            Preset::Weekends => {
                RecurrencePattern::raw(PatternKind::Weekly, 1, vec![0, 6], Vec::new())
            }
            Preset::Monthly => {
                RecurrencePattern::raw(PatternKind::Monthly, 1, Vec::new(), Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_normalizes_day_sets() {
        let pattern = RecurrencePattern::builder(PatternKind::Weekly)
            .on_weekdays([5, 1, 3, 1])
            .build()
            .unwrap();
        assert_eq!(pattern.days_of_week(), &[1, 3, 5]);
        assert_eq!(pattern.interval(), 1);
    }

    #[test]
    fn builder_reports_every_violation() {
        let err = RecurrencePattern::builder(PatternKind::Monthly)
            .every(0)
            .on_weekdays([7])
            .on_month_days([0, 32])
            .ending(EndCondition::AfterCount(0))
            .build()
            .unwrap_err();
        assert_eq!(
            err.violations(),
            &[
                PatternViolation::IntervalOutOfRange(0),
                PatternViolation::WeekdayOutOfRange(7),
                PatternViolation::MonthDayOutOfRange(0),
                PatternViolation::MissingCount,
            ]
        );
        assert!(err.to_string().starts_with("invalid recurrence pattern: interval"));
    }

    #[test]
    fn interval_upper_bound_is_enforced() {
        assert!(RecurrencePattern::builder(PatternKind::Daily)
            .every(MAX_INTERVAL)
            .build()
            .is_ok());
        assert!(RecurrencePattern::builder(PatternKind::Daily)
            .every(MAX_INTERVAL + 1)
            .build()
            .is_err());
    }

    #[test]
    fn deserializes_legacy_field_names() {
        let pattern: RecurrencePattern = serde_json::from_value(json!({
            "pattern_type": "weekly",
            "interval_value": 2,
            "days_of_week": [1, 2, 3, 4, 5],
            "days_of_month": null,
            "end_type": "after",
            "end_after_count": 10
        }))
        .unwrap();
        assert_eq!(pattern.kind(), PatternKind::Weekly);
        assert_eq!(pattern.interval(), 2);
        assert_eq!(pattern.end(), EndCondition::AfterCount(10));
        assert!(pattern.days_of_month().is_empty());
    }

    #[test]
    fn deserialization_rejects_invalid_patterns() {
        let zero_interval = serde_json::from_value::<RecurrencePattern>(json!({
            "pattern_type": "daily",
            "interval": 0
        }));
        assert!(zero_interval.is_err());

        let missing_date = serde_json::from_value::<RecurrencePattern>(json!({
            "pattern_type": "daily",
            "end_type": "on_date"
        }));
        let message = missing_date.unwrap_err().to_string();
        assert!(message.contains("needs an end date"), "{message}");
    }

    #[test]
    fn serializes_to_flat_record() {
        let end = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let pattern = RecurrencePattern::builder(PatternKind::Monthly)
            .id(7)
            .on_month_days([15, 1])
            .ending(EndCondition::OnDate(end))
            .build()
            .unwrap();
        let value = serde_json::to_value(&pattern).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "pattern_type": "monthly",
                "interval": 1,
                "days_of_week": null,
                "days_of_month": [1, 15],
                "end_type": "on_date",
                "end_after_count": null,
                "end_date": "2024-06-30"
            })
        );
    }

    #[test]
    fn presets_are_valid_patterns() {
        for preset in Preset::ALL {
            let pattern = preset.pattern();
            let rebuilt: RecurrencePattern =
                serde_json::from_value(serde_json::to_value(&pattern).unwrap()).unwrap();
            assert_eq!(rebuilt, pattern, "{}", preset.key());
        }
        assert_eq!(Preset::Weekdays.pattern().days_of_week(), &[1, 2, 3, 4, 5]);
        assert_eq!(Preset::EveryOtherDay.pattern().interval(), 2);
    }
}
