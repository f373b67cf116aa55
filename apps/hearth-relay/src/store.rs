use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hearth_recurrence::RecurrencePattern;
use tokio::sync::Mutex;

use crate::model::{
    CompletionRecord, DeletionScope, Note, NoteDraft, NotePatch, Task, TaskDraft, TaskPatch,
    UserId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary for tasks, completions, patterns and notes.
///
/// The relay never caches what this returns between requests.
#[async_trait]
pub trait CareStore: Send + Sync {
    async fn create_task(&self, owner: &UserId, draft: TaskDraft) -> StoreResult<Task>;
    async fn task(&self, id: u64) -> StoreResult<Option<Task>>;
    async fn update_task(&self, id: u64, patch: TaskPatch) -> StoreResult<Task>;
    /// Applies `scope` and returns the task as it stands afterwards.
    async fn delete_task(&self, id: u64, scope: DeletionScope) -> StoreResult<Task>;
    /// Non-deleted tasks of `owner` whose lifetime overlaps `from..=to`.
    async fn tasks_in_range(
        &self,
        owner: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<Task>>;

    /// Upserts on `(task_id, occurrence_date)`.
    async fn mark_complete(&self, record: CompletionRecord) -> StoreResult<CompletionRecord>;
    /// Returns whether a record existed.
    async fn unmark_complete(&self, task_id: u64, date: NaiveDate) -> StoreResult<bool>;
    async fn completions_in_range(
        &self,
        owner: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<CompletionRecord>>;

    /// Persists the pattern and returns it with its assigned id.
    async fn create_pattern(&self, pattern: RecurrencePattern) -> StoreResult<RecurrencePattern>;
    async fn pattern(&self, id: u64) -> StoreResult<Option<RecurrencePattern>>;

    async fn create_note(&self, owner: &UserId, draft: NoteDraft) -> StoreResult<Note>;
    async fn note(&self, id: u64) -> StoreResult<Option<Note>>;
    async fn update_note(&self, id: u64, patch: NotePatch) -> StoreResult<Note>;
    async fn delete_note(&self, id: u64) -> StoreResult<bool>;
    async fn notes_for_owner(&self, owner: &UserId) -> StoreResult<Vec<Note>>;

    /// Time of the most recent write touching `owner`'s data.
    async fn last_change(&self, owner: &UserId) -> StoreResult<Option<DateTime<Utc>>>;
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    tasks: BTreeMap<u64, Task>,
    completions: BTreeMap<(u64, NaiveDate), CompletionRecord>,
    patterns: BTreeMap<u64, RecurrencePattern>,
    notes: BTreeMap<u64, Note>,
    last_change: HashMap<UserId, DateTime<Utc>>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn touch(&mut self, owner: &UserId, at: DateTime<Utc>) {
        self.last_change.insert(owner.clone(), at);
    }

    fn live_task_mut(&mut self, id: u64) -> StoreResult<&mut Task> {
        match self.tasks.get_mut(&id) {
            Some(task) if !task.deleted => Ok(task),
            _ => Err(StoreError::NotFound { entity: "task", id }),
        }
    }
}

/// Process-local store used by the binary and the tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CareStore for InMemoryStore {
    async fn create_task(&self, owner: &UserId, draft: TaskDraft) -> StoreResult<Task> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let id = tables.allocate_id();
        let task = Task {
            id,
            owner: owner.clone(),
            title: draft.title,
            description: draft.description,
            reminder_time: draft.reminder_time,
            priority: draft.priority,
            recurrence_pattern_id: draft.recurrence_pattern_id,
            start_date: draft.start_date,
            end_date: draft.end_date,
            excluded_dates: Default::default(),
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        tables.tasks.insert(id, task.clone());
        tables.touch(owner, now);
        Ok(task)
    }

    async fn task(&self, id: u64) -> StoreResult<Option<Task>> {
        let tables = self.tables.lock().await;
        Ok(tables.tasks.get(&id).filter(|task| !task.deleted).cloned())
    }

    async fn update_task(&self, id: u64, patch: TaskPatch) -> StoreResult<Task> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let task = tables.live_task_mut(id)?;
        let mut updated = task.clone();
        patch
            .apply(&mut updated)
            .map_err(|err| StoreError::Conflict(err.to_string()))?;
        updated.updated_at = now;
        *task = updated.clone();
        tables.touch(&updated.owner, now);
        Ok(updated)
    }

    async fn delete_task(&self, id: u64, scope: DeletionScope) -> StoreResult<Task> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let task = tables.live_task_mut(id)?;
        match scope {
            DeletionScope::All => task.deleted = true,
            DeletionScope::Single(date) => {
                task.excluded_dates.insert(date);
            }
            DeletionScope::FromDate(date) => match date.pred_opt() {
                Some(last) if last >= task.start_date => {
                    task.end_date = Some(task.end_date.map_or(last, |end| end.min(last)));
                }
                _ => task.deleted = true,
            },
        }
        task.updated_at = now;
        let task = task.clone();
        tables.touch(&task.owner, now);
        Ok(task)
    }

    async fn tasks_in_range(
        &self,
        owner: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<Task>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tasks
            .values()
            .filter(|task| &task.owner == owner && task.overlaps(from, to))
            .cloned()
            .collect())
    }

    async fn mark_complete(&self, record: CompletionRecord) -> StoreResult<CompletionRecord> {
        let mut tables = self.tables.lock().await;
        let owner = tables.live_task_mut(record.task_id)?.owner.clone();
        tables
            .completions
            .insert((record.task_id, record.occurrence_date), record.clone());
        tables.touch(&owner, record.completed_at);
        Ok(record)
    }

    async fn unmark_complete(&self, task_id: u64, date: NaiveDate) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let owner = tables.live_task_mut(task_id)?.owner.clone();
        let removed = tables.completions.remove(&(task_id, date)).is_some();
        if removed {
            tables.touch(&owner, Utc::now());
        }
        Ok(removed)
    }

    async fn completions_in_range(
        &self,
        owner: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<CompletionRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .completions
            .values()
            .filter(|record| (from..=to).contains(&record.occurrence_date))
            .filter(|record| {
                tables
                    .tasks
                    .get(&record.task_id)
                    .is_some_and(|task| &task.owner == owner)
            })
            .cloned()
            .collect())
    }

    async fn create_pattern(&self, pattern: RecurrencePattern) -> StoreResult<RecurrencePattern> {
        let mut tables = self.tables.lock().await;
        let id = tables.allocate_id();
        let pattern = pattern.with_id(id);
        tables.patterns.insert(id, pattern.clone());
        Ok(pattern)
    }

    async fn pattern(&self, id: u64) -> StoreResult<Option<RecurrencePattern>> {
        let tables = self.tables.lock().await;
        Ok(tables.patterns.get(&id).cloned())
    }

    async fn create_note(&self, owner: &UserId, draft: NoteDraft) -> StoreResult<Note> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let id = tables.allocate_id();
        let note = Note {
            id,
            owner: owner.clone(),
            title: draft.title,
            content: draft.content,
            created_at: now,
            updated_at: now,
        };
        tables.notes.insert(id, note.clone());
        tables.touch(owner, now);
        Ok(note)
    }

    async fn note(&self, id: u64) -> StoreResult<Option<Note>> {
        let tables = self.tables.lock().await;
        Ok(tables.notes.get(&id).cloned())
    }

    async fn update_note(&self, id: u64, patch: NotePatch) -> StoreResult<Note> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let note = tables
            .notes
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "note", id })?;
        let mut updated = note.clone();
        patch
            .apply(&mut updated)
            .map_err(|err| StoreError::Conflict(err.to_string()))?;
        updated.updated_at = now;
        *note = updated.clone();
        tables.touch(&updated.owner, now);
        Ok(updated)
    }

    async fn delete_note(&self, id: u64) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.notes.remove(&id) {
            Some(note) => {
                tables.touch(&note.owner, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn notes_for_owner(&self, owner: &UserId) -> StoreResult<Vec<Note>> {
        let tables = self.tables.lock().await;
        let mut notes: Vec<Note> = tables
            .notes
            .values()
            .filter(|note| &note.owner == owner)
            .cloned()
            .collect();
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(notes)
    }

    async fn last_change(&self, owner: &UserId) -> StoreResult<Option<DateTime<Utc>>> {
        let tables = self.tables.lock().await;
        Ok(tables.last_change.get(owner).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn draft(start: NaiveDate) -> TaskDraft {
        TaskDraft {
            title: "Blood pressure".into(),
            description: None,
            reminder_time: Some("08:00".into()),
            priority: Priority::High,
            recurrence_pattern_id: None,
            start_date: start,
            end_date: None,
        }
    }

    #[tokio::test]
    async fn deletion_scopes_shape_the_series() -> TestResult {
        let store = InMemoryStore::new();
        let owner = UserId::from("alice");
        let task = store.create_task(&owner, draft(date(2024, 1, 1))).await?;

        let single = store
            .delete_task(task.id, DeletionScope::Single(date(2024, 1, 5)))
            .await?;
        assert!(single.excluded_dates.contains(&date(2024, 1, 5)));
        assert!(!single.deleted);

        let truncated = store
            .delete_task(task.id, DeletionScope::FromDate(date(2024, 1, 10)))
            .await?;
        assert_eq!(truncated.end_date, Some(date(2024, 1, 9)));

        let gone = store.delete_task(task.id, DeletionScope::All).await?;
        assert!(gone.deleted);
        assert!(store.task(task.id).await?.is_none());
        assert!(matches!(
            store.delete_task(task.id, DeletionScope::All).await,
            Err(StoreError::NotFound { entity: "task", .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn from_date_on_series_start_removes_everything() -> TestResult {
        let store = InMemoryStore::new();
        let owner = UserId::from("alice");
        let task = store.create_task(&owner, draft(date(2024, 3, 1))).await?;
        let deleted = store
            .delete_task(task.id, DeletionScope::FromDate(date(2024, 3, 1)))
            .await?;
        assert!(deleted.deleted);
        Ok(())
    }

    #[tokio::test]
    async fn completion_is_an_upsert_per_occurrence() -> TestResult {
        let store = InMemoryStore::new();
        let owner = UserId::from("alice");
        let task = store.create_task(&owner, draft(date(2024, 1, 1))).await?;
        let day = date(2024, 1, 2);

        for mood in ["tired", "good"] {
            store
                .mark_complete(CompletionRecord {
                    task_id: task.id,
                    occurrence_date: day,
                    completed_by: owner.clone(),
                    completed_at: Utc::now(),
                    note: None,
                    mood: Some(mood.into()),
                })
                .await?;
        }

        let records = store.completions_in_range(&owner, day, day).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mood.as_deref(), Some("good"));

        let other = store
            .completions_in_range(&UserId::from("bob"), day, day)
            .await?;
        assert!(other.is_empty());

        assert!(store.unmark_complete(task.id, day).await?);
        assert!(!store.unmark_complete(task.id, day).await?);
        Ok(())
    }

    #[tokio::test]
    async fn writes_advance_last_change() -> TestResult {
        let store = InMemoryStore::new();
        let owner = UserId::from("alice");
        assert!(store.last_change(&owner).await?.is_none());

        let note = store
            .create_note(
                &owner,
                NoteDraft {
                    title: "Allergies".into(),
                    content: "penicillin".into(),
                },
            )
            .await?;
        let first = store.last_change(&owner).await?;
        assert!(first.is_some());

        store
            .update_note(
                note.id,
                NotePatch {
                    content: Some("penicillin, latex".into()),
                    ..NotePatch::default()
                },
            )
            .await?;
        assert!(store.last_change(&owner).await? >= first);
        assert_eq!(store.notes_for_owner(&owner).await?.len(), 1);
        assert!(store.delete_note(note.id).await?);
        assert!(store.notes_for_owner(&owner).await?.is_empty());
        Ok(())
    }
}
