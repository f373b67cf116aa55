//! Operation handlers. Each returns the `data` of the `_RESPONSE` envelope.

use chrono::{NaiveDate, Utc};
use hearth_recurrence::{next_occurrence_after, occurrences_in_range, Preset, RecurrencePattern};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agenda::{self, check_range};
use crate::error::RelayError;
use crate::model::{
    CompletionRecord, DeletionScope, Note, NoteDraft, NotePatch, Task, TaskDraft, TaskPatch,
    UserId,
};
use crate::protocol::{
    Operation, ServerEnvelope, SyncOrigin, LINK_CANCELLED, LINK_ESTABLISHED,
    LINK_INVITATION_REJECTED, LINK_REQUEST_RECEIVED,
};
use crate::router::{decode, Identity, MessageRouter};
use crate::sync::LinkDecision;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatePayload {
    date: NaiveDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangePayload {
    #[serde(alias = "startDate")]
    from: NaiveDate,
    #[serde(alias = "endDate")]
    to: NaiveDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextOccurrencePayload {
    todo_id: u64,
    #[serde(default)]
    after: Option<NaiveDate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTodoPayload {
    todo_id: u64,
    #[serde(flatten)]
    patch: TaskPatch,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScopeKind {
    #[default]
    All,
    Single,
    FromDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteTodoPayload {
    todo_id: u64,
    #[serde(default, alias = "deletionType")]
    scope: ScopeKind,
    #[serde(default, alias = "deletionDate")]
    date: Option<NaiveDate>,
}

impl DeleteTodoPayload {
    fn scope(&self) -> Result<DeletionScope, RelayError> {
        match (self.scope, self.date) {
            (ScopeKind::All, _) => Ok(DeletionScope::All),
            (ScopeKind::Single, Some(date)) => Ok(DeletionScope::Single(date)),
            (ScopeKind::FromDate, Some(date)) => Ok(DeletionScope::FromDate(date)),
            (_, None) => Err(RelayError::Validation(
                "single and from_date deletions require a date".into(),
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletePayload {
    todo_id: u64,
    date: NaiveDate,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    mood: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteRef {
    note_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateNotePayload {
    note_id: u64,
    #[serde(flatten)]
    patch: NotePatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatternRef {
    pattern_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewPayload {
    pattern: RecurrencePattern,
    start_date: NaiveDate,
    #[serde(default)]
    from: Option<NaiveDate>,
    #[serde(default)]
    to: Option<NaiveDate>,
}

/// Number of days shown by a preview without an explicit range.
const PREVIEW_DAYS: u64 = 30;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRef {
    #[serde(alias = "userId")]
    logical_user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvitePayload {
    #[serde(alias = "targetUser", alias = "logicalUserId")]
    to_user: UserId,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestRef {
    request_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerRef {
    #[serde(alias = "logicalUserId")]
    linked_user: UserId,
}

impl MessageRouter {
    pub(crate) async fn execute(
        &self,
        operation: Operation,
        identity: &Identity,
        payload: Value,
    ) -> Result<Value, RelayError> {
        match operation {
            Operation::Ping => self.ping(identity).await,
            Operation::TodoGetToday => {
                let today = Utc::now().date_naive();
                self.agenda_for_day(identity, today).await
            }
            Operation::TodoGetByDate => {
                let DatePayload { date } = decode(payload)?;
                self.agenda_for_day(identity, date).await
            }
            Operation::TodoGetRange => {
                let RangePayload { from, to } = decode(payload)?;
                let todos = agenda::agenda(self.store.as_ref(), &identity.user_id, from, to).await?;
                Ok(json!({ "from": from, "to": to, "todos": todos }))
            }
            Operation::TodoNextOccurrence => self.next_occurrence(identity, decode(payload)?).await,
            Operation::TodoCreate => self.create_todo(identity, decode(payload)?).await,
            Operation::TodoUpdate => self.update_todo(identity, decode(payload)?).await,
            Operation::TodoDelete => self.delete_todo(identity, decode(payload)?).await,
            Operation::TodoComplete => self.complete_todo(identity, decode(payload)?).await,
            Operation::TodoUncomplete => self.uncomplete_todo(identity, decode(payload)?).await,
            Operation::NotesGetByUser => {
                let notes = self.store.notes_for_owner(&identity.user_id).await?;
                Ok(json!({ "notes": notes }))
            }
            Operation::NotesCreate => {
                let draft: NoteDraft = decode(payload)?;
                draft.validate()?;
                let note = self.store.create_note(&identity.user_id, draft).await?;
                Ok(json!({ "note": note }))
            }
            Operation::NotesUpdate => {
                let UpdateNotePayload { note_id, patch } = decode(payload)?;
                self.owned_note(identity, note_id).await?;
                let note = self.store.update_note(note_id, patch).await?;
                Ok(json!({ "note": note }))
            }
            Operation::NotesDelete => {
                let NoteRef { note_id } = decode(payload)?;
                self.owned_note(identity, note_id).await?;
                let deleted = self.store.delete_note(note_id).await?;
                Ok(json!({ "noteId": note_id, "deleted": deleted }))
            }
            Operation::PatternCreate => {
                let pattern: RecurrencePattern = decode(payload)?;
                let pattern = self.store.create_pattern(pattern).await?;
                Ok(json!({ "pattern": pattern }))
            }
            Operation::PatternGet => {
                let PatternRef { pattern_id } = decode(payload)?;
                let pattern = self.store.pattern(pattern_id).await?.ok_or_else(|| {
                    RelayError::NotFound(format!("pattern {pattern_id} not found"))
                })?;
                Ok(json!({ "pattern": pattern }))
            }
            Operation::PatternPresets => {
                let presets: Vec<Value> = Preset::ALL
                    .into_iter()
                    .map(|preset| {
                        json!({
                            "key": preset.key(),
                            "label": preset.label(),
                            "pattern": preset.pattern(),
                        })
                    })
                    .collect();
                Ok(json!({ "presets": presets }))
            }
            Operation::PatternPreview => preview(decode(payload)?),
            Operation::LinkCheckUserOnline => {
                let UserRef { logical_user_id } = decode(payload)?;
                let devices = self.registry.devices_of(&logical_user_id);
                Ok(json!({
                    "logicalUserId": logical_user_id,
                    "isOnline": !devices.is_empty(),
                    "deviceCount": devices.len(),
                }))
            }
            Operation::LinkGetLinkedUsers => {
                let linked = self
                    .sync
                    .linked_users(&identity.user_id)
                    .await?;
                Ok(json!({ "linkedUsers": linked }))
            }
            Operation::LinkSendInvitation => self.send_invitation(identity, decode(payload)?).await,
            Operation::LinkAcceptInvitation => {
                let RequestRef { request_id } = decode(payload)?;
                self.answer_invitation(identity, request_id, LinkDecision::Accept)
                    .await
            }
            Operation::LinkRejectInvitation => {
                let RequestRef { request_id } = decode(payload)?;
                self.answer_invitation(identity, request_id, LinkDecision::Reject)
                    .await
            }
            Operation::LinkCancel => {
                let PartnerRef { linked_user } = decode(payload)?;
                self.sync.cancel_link(&identity.user_id, &linked_user).await?;
                self.notify_user(
                    identity,
                    &linked_user,
                    LINK_CANCELLED,
                    json!({ "linkedUser": identity.user_id }),
                );
                self.notify_user(
                    identity,
                    &identity.user_id,
                    LINK_CANCELLED,
                    json!({ "linkedUser": linked_user }),
                );
                Ok(json!({ "linkedUser": linked_user, "cancelled": true }))
            }
        }
    }

    async fn ping(&self, identity: &Identity) -> Result<Value, RelayError> {
        let last_change = self.store.last_change(&identity.user_id).await?;
        Ok(json!({
            "pong": true,
            "serverTime": Utc::now(),
            "lastChange": last_change,
        }))
    }

    async fn agenda_for_day(&self, identity: &Identity, date: NaiveDate) -> Result<Value, RelayError> {
        let todos = agenda::agenda(self.store.as_ref(), &identity.user_id, date, date).await?;
        Ok(json!({ "date": date, "todos": todos }))
    }

    async fn next_occurrence(
        &self,
        identity: &Identity,
        payload: NextOccurrencePayload,
    ) -> Result<Value, RelayError> {
        let task = self.owned_task(identity, payload.todo_id).await?;
        let pattern = agenda::resolve_pattern(self.store.as_ref(), &task).await?;
        let after = payload.after.unwrap_or_else(|| Utc::now().date_naive());
        let next = agenda::next_task_occurrence(&task, pattern.as_ref(), after);
        Ok(json!({ "todoId": task.id, "after": after, "next": next }))
    }

    async fn create_todo(&self, identity: &Identity, draft: TaskDraft) -> Result<Value, RelayError> {
        draft.validate()?;
        if let Some(pattern_id) = draft.recurrence_pattern_id {
            self.require_pattern(pattern_id).await?;
        }
        let task = self.store.create_task(&identity.user_id, draft).await?;
        Ok(json!({ "todo": task }))
    }

    async fn update_todo(
        &self,
        identity: &Identity,
        payload: UpdateTodoPayload,
    ) -> Result<Value, RelayError> {
        self.owned_task(identity, payload.todo_id).await?;
        if let Some(Some(pattern_id)) = payload.patch.recurrence_pattern_id {
            self.require_pattern(pattern_id).await?;
        }
        let task = self.store.update_task(payload.todo_id, payload.patch).await?;
        Ok(json!({ "todo": task }))
    }

    async fn delete_todo(
        &self,
        identity: &Identity,
        payload: DeleteTodoPayload,
    ) -> Result<Value, RelayError> {
        let scope = payload.scope()?;
        self.owned_task(identity, payload.todo_id).await?;
        let task = self.store.delete_task(payload.todo_id, scope).await?;
        Ok(json!({
            "todoId": task.id,
            "scope": scope.label(),
            "date": scope.date(),
            "todo": task,
        }))
    }

    async fn complete_todo(
        &self,
        identity: &Identity,
        payload: CompletePayload,
    ) -> Result<Value, RelayError> {
        let task = self.owned_task(identity, payload.todo_id).await?;
        let pattern = agenda::resolve_pattern(self.store.as_ref(), &task).await?;
        if !agenda::occurs_on(&task, pattern.as_ref(), payload.date) {
            return Err(RelayError::Validation(format!(
                "task {} has no occurrence on {}",
                task.id, payload.date
            )));
        }
        let completion = self
            .store
            .mark_complete(CompletionRecord {
                task_id: task.id,
                occurrence_date: payload.date,
                completed_by: identity.user_id.clone(),
                completed_at: Utc::now(),
                note: payload.note,
                mood: payload.mood,
            })
            .await?;
        Ok(json!({
            "todoId": task.id,
            "date": payload.date,
            "completed": true,
            "completion": completion,
        }))
    }

    async fn uncomplete_todo(
        &self,
        identity: &Identity,
        payload: CompletePayload,
    ) -> Result<Value, RelayError> {
        let task = self.owned_task(identity, payload.todo_id).await?;
        let removed = self.store.unmark_complete(task.id, payload.date).await?;
        Ok(json!({
            "todoId": task.id,
            "date": payload.date,
            "completed": false,
            "removed": removed,
        }))
    }

    /// Invitations are only sent to users with a live device to answer them.
    async fn send_invitation(
        &self,
        identity: &Identity,
        payload: InvitePayload,
    ) -> Result<Value, RelayError> {
        if self.registry.devices_of(&payload.to_user).is_empty() {
            return Err(RelayError::TargetOffline(format!(
                "user {} is not online",
                payload.to_user
            )));
        }
        let request = self
            .sync
            .request_link(&identity.user_id, &payload.to_user, payload.message)
            .await?;
        let delivered = self.notify_user(
            identity,
            &request.to_user,
            LINK_REQUEST_RECEIVED,
            json!({ "request": request }),
        );
        Ok(json!({ "request": request, "delivered": delivered }))
    }

    async fn answer_invitation(
        &self,
        identity: &Identity,
        request_id: u64,
        decision: LinkDecision,
    ) -> Result<Value, RelayError> {
        let request = self
            .sync
            .answer_link(request_id, &identity.user_id, decision)
            .await?;
        match decision {
            LinkDecision::Accept => {
                self.notify_user(
                    identity,
                    &request.from_user,
                    LINK_ESTABLISHED,
                    json!({ "linkedUser": request.to_user, "requestId": request_id, "role": "manager" }),
                );
                self.notify_user(
                    identity,
                    &request.to_user,
                    LINK_ESTABLISHED,
                    json!({ "linkedUser": request.from_user, "requestId": request_id, "role": "linked" }),
                );
            }
            LinkDecision::Reject => {
                self.notify_user(
                    identity,
                    &request.from_user,
                    LINK_INVITATION_REJECTED,
                    json!({ "rejectedBy": request.to_user, "requestId": request_id }),
                );
            }
        }
        Ok(json!({ "request": request }))
    }

    /// Pushes a link event to `target`'s live devices, skipping the device that caused it.
    fn notify_user(&self, identity: &Identity, target: &UserId, tag: &str, data: Value) -> usize {
        let origin = SyncOrigin::device(&identity.user_id, &identity.device_id);
        let envelope = ServerEnvelope::event(tag, data, origin);
        self.broadcaster
            .push_to_live_devices(target, &envelope, Some(&identity.device_id))
            .delivered
    }

    async fn owned_task(&self, identity: &Identity, id: u64) -> Result<Task, RelayError> {
        let task = self
            .store
            .task(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("task {id} not found")))?;
        if task.owner != identity.user_id {
            return Err(RelayError::Permission(format!(
                "task {id} belongs to another user"
            )));
        }
        Ok(task)
    }

    async fn owned_note(&self, identity: &Identity, id: u64) -> Result<Note, RelayError> {
        let note = self
            .store
            .note(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("note {id} not found")))?;
        if note.owner != identity.user_id {
            return Err(RelayError::Permission(format!(
                "note {id} belongs to another user"
            )));
        }
        Ok(note)
    }

    async fn require_pattern(&self, id: u64) -> Result<(), RelayError> {
        match self.store.pattern(id).await? {
            Some(_) => Ok(()),
            None => Err(RelayError::NotFound(format!("pattern {id} not found"))),
        }
    }
}

fn preview(payload: PreviewPayload) -> Result<Value, RelayError> {
    let from = payload.from.unwrap_or(payload.start_date);
    let to = match payload.to {
        Some(to) => to,
        None => from
            .checked_add_days(chrono::Days::new(PREVIEW_DAYS - 1))
            .unwrap_or(NaiveDate::MAX),
    };
    check_range(from, to)?;
    let occurrences = occurrences_in_range(&payload.pattern, payload.start_date, from, to);
    let next = next_occurrence_after(&payload.pattern, to, payload.start_date);
    Ok(json!({
        "occurrences": occurrences,
        "nextAfterRange": next,
    }))
}
