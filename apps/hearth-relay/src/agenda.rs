//! Expands tasks into dated occurrences and joins their completion state.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::NaiveDate;
use hearth_recurrence::{is_occurrence, next_occurrence_after, occurrences_in_range, RecurrencePattern};
use serde::Serialize;
use tracing::warn;

use crate::error::RelayError;
use crate::model::{CompletionRecord, Task, UserId};
use crate::store::CareStore;

/// Longest range a single agenda request may span, in days.
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgendaEntry {
    pub date: NaiveDate,
    pub task: Task,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionRecord>,
}

/// Occurrences of `task` in `from..=to`, honouring its end date and exclusions.
///
/// A task without a pattern occurs once, on its start date.
pub fn task_occurrences(
    task: &Task,
    pattern: Option<&RecurrencePattern>,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<NaiveDate> {
    if task.deleted {
        return Vec::new();
    }
    let upper = task.end_date.map_or(to, |end| end.min(to));
    let once = RecurrencePattern::once();
    let pattern = pattern.unwrap_or(&once);
    occurrences_in_range(pattern, task.start_date, from, upper)
        .into_iter()
        .filter(|date| !task.excluded_dates.contains(date))
        .collect()
}

pub fn occurs_on(task: &Task, pattern: Option<&RecurrencePattern>, date: NaiveDate) -> bool {
    if !task.is_active_on(date) {
        return false;
    }
    match pattern {
        Some(pattern) => is_occurrence(pattern, date, task.start_date),
        None => date == task.start_date,
    }
}

/// First occurrence of `task` strictly after `after`.
pub fn next_task_occurrence(
    task: &Task,
    pattern: Option<&RecurrencePattern>,
    after: NaiveDate,
) -> Option<NaiveDate> {
    if task.deleted {
        return None;
    }
    let once = RecurrencePattern::once();
    let pattern = pattern.unwrap_or(&once);
    let mut cursor = after;
    loop {
        let next = next_occurrence_after(pattern, cursor, task.start_date)?;
        if task.end_date.is_some_and(|end| next > end) {
            return None;
        }
        if !task.excluded_dates.contains(&next) {
            return Some(next);
        }
        cursor = next;
    }
}

/// Loads the pattern a task refers to. A dangling reference behaves like no pattern.
pub async fn resolve_pattern(
    store: &dyn CareStore,
    task: &Task,
) -> Result<Option<RecurrencePattern>, RelayError> {
    let Some(pattern_id) = task.recurrence_pattern_id else {
        return Ok(None);
    };
    let pattern = store.pattern(pattern_id).await?;
    if pattern.is_none() {
        warn!(task_id = task.id, pattern_id, "task refers to a missing recurrence pattern");
    }
    Ok(pattern)
}

pub fn check_range(from: NaiveDate, to: NaiveDate) -> Result<(), RelayError> {
    if to < from {
        return Err(RelayError::Validation(format!(
            "range end {to} is before range start {from}"
        )));
    }
    let span = (to - from).num_days() + 1;
    if span > MAX_RANGE_DAYS {
        return Err(RelayError::Validation(format!(
            "range spans {span} days; at most {MAX_RANGE_DAYS} are allowed"
        )));
    }
    Ok(())
}

/// Every occurrence of `owner`'s tasks in `from..=to`, ordered by date then [`day_order`].
pub async fn agenda(
    store: &dyn CareStore,
    owner: &UserId,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<AgendaEntry>, RelayError> {
    check_range(from, to)?;
    let tasks = store.tasks_in_range(owner, from, to).await?;
    let mut completions: HashMap<(u64, NaiveDate), CompletionRecord> = store
        .completions_in_range(owner, from, to)
        .await?
        .into_iter()
        .map(|record| ((record.task_id, record.occurrence_date), record))
        .collect();

    let mut patterns: HashMap<u64, Option<RecurrencePattern>> = HashMap::new();
    let mut entries = Vec::new();
    for task in tasks {
        let pattern = match task.recurrence_pattern_id {
            Some(id) => match patterns.get(&id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = resolve_pattern(store, &task).await?;
                    patterns.insert(id, loaded.clone());
                    loaded
                }
            },
            None => None,
        };

        for date in task_occurrences(&task, pattern.as_ref(), from, to) {
            let completion = completions.remove(&(task.id, date));
            entries.push(AgendaEntry {
                date,
                task: task.clone(),
                completed: completion.is_some(),
                completion,
            });
        }
    }

    entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| day_order(&a.task, &b.task)));
    Ok(entries)
}

/// Order of tasks within one day: by reminder time with untimed tasks last,
/// then by priority, then oldest first.
pub fn day_order(a: &Task, b: &Task) -> Ordering {
    let slot = |task: &Task| task.reminder_minutes().unwrap_or(u32::MAX);
    slot(a)
        .cmp(&slot(b))
        .then(a.priority.rank().cmp(&b.priority.rank()))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hearth_recurrence::{EndCondition, PatternKind};

    use super::*;
    use crate::model::{DeletionScope, Priority, TaskDraft, ALL_DAY};
    use crate::store::InMemoryStore;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn draft(title: &str, start: NaiveDate, pattern: Option<u64>) -> TaskDraft {
        TaskDraft {
            title: title.into(),
            description: None,
            reminder_time: None,
            priority: Default::default(),
            recurrence_pattern_id: pattern,
            start_date: start,
            end_date: None,
        }
    }

    #[tokio::test]
    async fn weekly_task_expands_and_joins_completions() -> TestResult {
        let store = InMemoryStore::new();
        let alice = UserId::from("alice");
        // Mondays and Wednesdays.
        let pattern = store
            .create_pattern(
                RecurrencePattern::builder(PatternKind::Weekly)
                    .on_weekdays([1, 3])
                    .build()?,
            )
            .await?;
        let task = store
            .create_task(&alice, draft("Physio", date(2024, 1, 1), pattern.id()))
            .await?;
        store
            .mark_complete(CompletionRecord {
                task_id: task.id,
                occurrence_date: date(2024, 1, 3),
                completed_by: alice.clone(),
                completed_at: Utc::now(),
                note: None,
                mood: None,
            })
            .await?;

        let entries = agenda(store.as_ref(), &alice, date(2024, 1, 1), date(2024, 1, 10)).await?;
        let dates: Vec<NaiveDate> = entries.iter().map(|e| e.date).collect();
        assert_eq!(dates, [date(2024, 1, 1), date(2024, 1, 3), date(2024, 1, 8), date(2024, 1, 10)]);
        let done: Vec<bool> = entries.iter().map(|e| e.completed).collect();
        assert_eq!(done, [false, true, false, false]);
        Ok(())
    }

    #[tokio::test]
    async fn deletion_scopes_hide_the_right_occurrences() -> TestResult {
        let store = InMemoryStore::new();
        let alice = UserId::from("alice");
        let daily = store
            .create_pattern(RecurrencePattern::builder(PatternKind::Daily).build()?)
            .await?;
        let task = store
            .create_task(&alice, draft("Water plants", date(2024, 5, 1), daily.id()))
            .await?;

        store
            .delete_task(task.id, DeletionScope::Single(date(2024, 5, 2)))
            .await?;
        store
            .delete_task(task.id, DeletionScope::FromDate(date(2024, 5, 4)))
            .await?;

        let entries = agenda(store.as_ref(), &alice, date(2024, 5, 1), date(2024, 5, 7)).await?;
        let dates: Vec<NaiveDate> = entries.iter().map(|e| e.date).collect();
        assert_eq!(dates, [date(2024, 5, 1), date(2024, 5, 3)]);
        Ok(())
    }

    #[tokio::test]
    async fn day_lists_follow_reminder_time_then_priority() -> TestResult {
        let store = InMemoryStore::new();
        let alice = UserId::from("alice");
        let day = date(2024, 1, 1);
        let timed = |title: &str, time: Option<&str>, priority: Priority| TaskDraft {
            reminder_time: time.map(str::to_string),
            priority,
            ..draft(title, day, None)
        };
        store
            .create_task(&alice, timed("evening", Some("20:00"), Priority::Low))
            .await?;
        store
            .create_task(&alice, timed("whenever", Some(ALL_DAY), Priority::High))
            .await?;
        store
            .create_task(&alice, timed("untimed", None, Priority::High))
            .await?;
        store
            .create_task(&alice, timed("morning", Some("08:00"), Priority::High))
            .await?;
        store
            .create_task(&alice, timed("morning low", Some("08:00"), Priority::Low))
            .await?;
        store
            .create_task(&alice, timed("morning medium", Some("8:00"), Priority::Medium))
            .await?;

        let entries = agenda(store.as_ref(), &alice, day, day).await?;
        let titles: Vec<&str> = entries.iter().map(|e| e.task.title.as_str()).collect();
        assert_eq!(
            titles,
            ["morning", "morning medium", "morning low", "evening", "whenever", "untimed"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn dangling_pattern_behaves_like_a_one_off() -> TestResult {
        let store = InMemoryStore::new();
        let alice = UserId::from("alice");
        store
            .create_task(&alice, draft("Dentist", date(2024, 2, 14), Some(999)))
            .await?;

        let entries = agenda(store.as_ref(), &alice, date(2024, 2, 1), date(2024, 2, 29)).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].date, date(2024, 2, 14));
        Ok(())
    }

    #[test]
    fn next_occurrence_skips_exclusions_and_stops_at_end_date() {
        let now = Utc::now();
        let mut task = Task {
            id: 1,
            owner: UserId::from("alice"),
            title: "Walk".into(),
            description: None,
            reminder_time: None,
            priority: Default::default(),
            recurrence_pattern_id: Some(1),
            start_date: date(2024, 1, 1),
            end_date: Some(date(2024, 1, 5)),
            excluded_dates: [date(2024, 1, 3)].into(),
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        let daily = RecurrencePattern::builder(PatternKind::Daily)
            .ending(EndCondition::Never)
            .build()
            .unwrap();

        assert_eq!(
            next_task_occurrence(&task, Some(&daily), date(2024, 1, 2)),
            Some(date(2024, 1, 4))
        );
        assert_eq!(next_task_occurrence(&task, Some(&daily), date(2024, 1, 5)), None);
        assert!(!occurs_on(&task, Some(&daily), date(2024, 1, 3)));
        assert!(occurs_on(&task, Some(&daily), date(2024, 1, 4)));

        task.recurrence_pattern_id = None;
        assert!(occurs_on(&task, None, date(2024, 1, 1)));
        assert!(!occurs_on(&task, None, date(2024, 1, 2)));
    }

    #[test]
    fn ranges_are_bounded() {
        assert!(check_range(date(2024, 1, 1), date(2024, 12, 31)).is_ok());
        assert!(check_range(date(2024, 1, 1), date(2025, 1, 1)).is_err());
        assert!(check_range(date(2024, 1, 2), date(2024, 1, 1)).is_err());
    }
}
