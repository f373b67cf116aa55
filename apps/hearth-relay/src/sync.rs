use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::model::UserId;
use crate::protocol::{Operation, ServerEnvelope, SyncOrigin};

/// A completed mutation, handed to the sync collaborator after the reply went out.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub operation: Operation,
    pub owner: UserId,
    pub origin: SyncOrigin,
    pub data: Value,
}

/// Change that must reach every live device of `target_user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotice {
    pub target_user: UserId,
    /// Tag of the operation that caused the change, e.g. `TODO_COMPLETE`.
    pub operation: String,
    #[serde(default)]
    pub data: Value,
    pub origin: SyncOrigin,
}

impl SyncNotice {
    pub fn into_envelope(self) -> ServerEnvelope {
        ServerEnvelope::broadcast(&self.operation, self.data, self.origin)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("account linking is not available")]
    Unsupported,
    #[error("link request {0} not found")]
    UnknownRequest(u64),
    #[error("{0} is not linked to {1}")]
    NotLinked(UserId, UserId),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Denied(String),
    #[error("sync collaborator failed: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDecision {
    Accept,
    Reject,
}

/// Invitation from one account to share its household data with another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub request_id: u64,
    pub from_user: UserId,
    pub to_user: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: LinkStatus,
    /// True when this request superseded an earlier pending one between the same users.
    #[serde(default)]
    pub renewed: bool,
    pub created_at: DateTime<Utc>,
}

/// Service that owns cross-account links and their data propagation.
#[async_trait]
pub trait SyncCollaborator: Send + Sync {
    async fn linked_users(&self, user: &UserId) -> Result<Vec<UserId>, SyncError>;

    /// Applies `event` to linked accounts and returns whom to notify.
    async fn apply_and_notify(&self, event: &MutationEvent) -> Result<Vec<SyncNotice>, SyncError>;

    /// Records a pending invitation from `from` to `to`.
    async fn request_link(
        &self,
        _from: &UserId,
        _to: &UserId,
        _message: Option<String>,
    ) -> Result<LinkRequest, SyncError> {
        Err(SyncError::Unsupported)
    }

    /// Settles a pending invitation. Only its addressee may answer it.
    async fn answer_link(
        &self,
        _request_id: u64,
        _responder: &UserId,
        _decision: LinkDecision,
    ) -> Result<LinkRequest, SyncError> {
        Err(SyncError::Unsupported)
    }

    async fn cancel_link(&self, _user: &UserId, _partner: &UserId) -> Result<(), SyncError> {
        Err(SyncError::Unsupported)
    }
}

/// Collaborator for deployments without linked accounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLinks;

#[async_trait]
impl SyncCollaborator for NoLinks {
    async fn linked_users(&self, _user: &UserId) -> Result<Vec<UserId>, SyncError> {
        Ok(Vec::new())
    }

    async fn apply_and_notify(&self, _event: &MutationEvent) -> Result<Vec<SyncNotice>, SyncError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkSpecError {
    #[error("link entry `{0}` is missing `=`")]
    MissingSeparator(String),
    #[error("link entry `{0}` has an empty user id")]
    EmptyUser(String),
    #[error("user `{0}` cannot be linked to itself")]
    SelfLink(String),
}

/// Static, symmetric link table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkedAccounts {
    links: HashMap<UserId, BTreeSet<UserId>>,
}

impl LinkedAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, a: UserId, b: UserId) {
        self.links.entry(a.clone()).or_default().insert(b.clone());
        self.links.entry(b).or_default().insert(a);
    }

    /// Removes the link between `a` and `b`; false when there was none.
    pub fn unlink(&mut self, a: &UserId, b: &UserId) -> bool {
        let removed = self.detach(a, b);
        self.detach(b, a);
        removed
    }

    pub fn are_linked(&self, a: &UserId, b: &UserId) -> bool {
        self.links.get(a).is_some_and(|linked| linked.contains(b))
    }

    pub fn linked_to(&self, user: &UserId) -> Vec<UserId> {
        self.links
            .get(user)
            .map(|linked| linked.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// One notice per partner of the event's owner.
    pub fn notices_for(&self, event: &MutationEvent) -> Vec<SyncNotice> {
        let origin = SyncOrigin::linked_account(&event.owner, event.origin.device_id.as_ref());
        self.linked_to(&event.owner)
            .into_iter()
            .map(|target_user| SyncNotice {
                target_user,
                operation: event.operation.tag().to_string(),
                data: event.data.clone(),
                origin: origin.clone(),
            })
            .collect()
    }

    fn detach(&mut self, user: &UserId, partner: &UserId) -> bool {
        let Some(linked) = self.links.get_mut(user) else {
            return false;
        };
        let removed = linked.remove(partner);
        if linked.is_empty() {
            self.links.remove(user);
        }
        removed
    }
}

/// Parses `user=linked,linked;user2=linked`.
impl FromStr for LinkedAccounts {
    type Err = LinkSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut accounts = LinkedAccounts::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (user, linked) = entry
                .split_once('=')
                .ok_or_else(|| LinkSpecError::MissingSeparator(entry.to_string()))?;
            let user = user.trim();
            if user.is_empty() {
                return Err(LinkSpecError::EmptyUser(entry.to_string()));
            }
            for other in linked.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                if other == user {
                    return Err(LinkSpecError::SelfLink(user.to_string()));
                }
                accounts.link(UserId::from(user), UserId::from(other));
            }
        }
        Ok(accounts)
    }
}

#[derive(Debug, Default)]
struct LinkState {
    accounts: LinkedAccounts,
    pending: BTreeMap<u64, LinkRequest>,
    next_request_id: u64,
}

/// In-process link service: links seeded from configuration plus invitations
/// accepted at runtime.
#[derive(Debug, Clone, Default)]
pub struct LinkBook {
    inner: Arc<Mutex<LinkState>>,
}

impl LinkBook {
    pub fn new(accounts: LinkedAccounts) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkState {
                accounts,
                ..LinkState::default()
            })),
        }
    }

    pub fn pending_for(&self, user: &UserId) -> Vec<LinkRequest> {
        self.inner
            .lock()
            .pending
            .values()
            .filter(|request| &request.to_user == user)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SyncCollaborator for LinkBook {
    async fn linked_users(&self, user: &UserId) -> Result<Vec<UserId>, SyncError> {
        Ok(self.inner.lock().accounts.linked_to(user))
    }

    async fn apply_and_notify(&self, event: &MutationEvent) -> Result<Vec<SyncNotice>, SyncError> {
        Ok(self.inner.lock().accounts.notices_for(event))
    }

    async fn request_link(
        &self,
        from: &UserId,
        to: &UserId,
        message: Option<String>,
    ) -> Result<LinkRequest, SyncError> {
        if from == to {
            return Err(SyncError::Invalid("an account cannot link to itself".into()));
        }
        let mut state = self.inner.lock();
        if state.accounts.are_linked(from, to) {
            return Err(SyncError::Invalid(format!("{from} is already linked to {to}")));
        }

        let previous = state
            .pending
            .iter()
            .find(|(_, request)| &request.from_user == from && &request.to_user == to)
            .map(|(id, _)| *id);
        let renewed = previous.is_some();
        if let Some(id) = previous {
            state.pending.remove(&id);
        }

        state.next_request_id += 1;
        let request = LinkRequest {
            request_id: state.next_request_id,
            from_user: from.clone(),
            to_user: to.clone(),
            message,
            status: LinkStatus::Pending,
            renewed,
            created_at: Utc::now(),
        };
        state.pending.insert(request.request_id, request.clone());
        Ok(request)
    }

    async fn answer_link(
        &self,
        request_id: u64,
        responder: &UserId,
        decision: LinkDecision,
    ) -> Result<LinkRequest, SyncError> {
        let mut state = self.inner.lock();
        let Some(pending) = state.pending.get(&request_id) else {
            return Err(SyncError::UnknownRequest(request_id));
        };
        if &pending.to_user != responder {
            return Err(SyncError::Denied(format!(
                "link request {request_id} is addressed to another user"
            )));
        }
        let Some(mut request) = state.pending.remove(&request_id) else {
            return Err(SyncError::UnknownRequest(request_id));
        };

        request.status = match decision {
            LinkDecision::Accept => {
                state
                    .accounts
                    .link(request.from_user.clone(), request.to_user.clone());
                LinkStatus::Accepted
            }
            LinkDecision::Reject => LinkStatus::Rejected,
        };
        info!(
            request_id,
            from_user = %request.from_user,
            to_user = %request.to_user,
            status = ?request.status,
            "link request settled"
        );
        Ok(request)
    }

    async fn cancel_link(&self, user: &UserId, partner: &UserId) -> Result<(), SyncError> {
        if self.inner.lock().accounts.unlink(user, partner) {
            info!(user_id = %user, partner = %partner, "link cancelled");
            Ok(())
        } else {
            Err(SyncError::NotLinked(user.clone(), partner.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::DeviceId;
    use crate::protocol::OriginVia;

    #[test]
    fn link_spec_is_symmetric() {
        let accounts: LinkedAccounts = "alice=bob,carol; dave=erin".parse().unwrap();
        assert_eq!(
            accounts.linked_to(&UserId::from("alice")),
            vec![UserId::from("bob"), UserId::from("carol")]
        );
        assert_eq!(
            accounts.linked_to(&UserId::from("carol")),
            vec![UserId::from("alice")]
        );
        assert_eq!(accounts.linked_to(&UserId::from("zed")), Vec::<UserId>::new());
    }

    #[test]
    fn malformed_link_specs_are_rejected() {
        assert_eq!(
            "alice".parse::<LinkedAccounts>(),
            Err(LinkSpecError::MissingSeparator("alice".into()))
        );
        assert_eq!(
            "=bob".parse::<LinkedAccounts>(),
            Err(LinkSpecError::EmptyUser("=bob".into()))
        );
        assert_eq!(
            "alice=alice".parse::<LinkedAccounts>(),
            Err(LinkSpecError::SelfLink("alice".into()))
        );
        assert!("".parse::<LinkedAccounts>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn linked_accounts_notify_every_partner() {
        let book = LinkBook::new("alice=bob".parse().unwrap());
        let event = MutationEvent {
            operation: Operation::TodoComplete,
            owner: UserId::from("alice"),
            origin: SyncOrigin::device(&UserId::from("alice"), &DeviceId::from("d1")),
            data: json!({"todoId": 3}),
        };

        let notices = book.apply_and_notify(&event).await.unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].target_user, UserId::from("bob"));
        assert_eq!(notices[0].origin.via, OriginVia::LinkedAccount);

        let envelope = notices[0].clone().into_envelope();
        assert_eq!(envelope.operation, "TODO_COMPLETE_BROADCAST");
        assert_eq!(envelope.data, Some(json!({"todoId": 3})));
    }

    #[tokio::test]
    async fn accepted_invitation_links_both_accounts() {
        let book = LinkBook::default();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        let first = book.request_link(&alice, &bob, None).await.unwrap();
        let second = book
            .request_link(&alice, &bob, Some("mum's meds".into()))
            .await
            .unwrap();
        assert!(!first.renewed);
        assert!(second.renewed);
        assert_eq!(book.pending_for(&bob), vec![second.clone()]);

        assert_eq!(
            book.answer_link(second.request_id, &alice, LinkDecision::Accept).await,
            Err(SyncError::Denied(format!(
                "link request {} is addressed to another user",
                second.request_id
            )))
        );
        let settled = book
            .answer_link(second.request_id, &bob, LinkDecision::Accept)
            .await
            .unwrap();
        assert_eq!(settled.status, LinkStatus::Accepted);
        assert_eq!(book.linked_users(&bob).await.unwrap(), vec![alice.clone()]);
        assert_eq!(
            book.answer_link(second.request_id, &bob, LinkDecision::Accept).await,
            Err(SyncError::UnknownRequest(second.request_id))
        );
        assert!(matches!(
            book.request_link(&bob, &alice, None).await,
            Err(SyncError::Invalid(_))
        ));

        book.cancel_link(&bob, &alice).await.unwrap();
        assert!(book.linked_users(&alice).await.unwrap().is_empty());
        assert_eq!(
            book.cancel_link(&bob, &alice).await,
            Err(SyncError::NotLinked(bob.clone(), alice.clone()))
        );
    }

    #[tokio::test]
    async fn rejected_invitation_leaves_accounts_apart() {
        let book = LinkBook::default();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let request = book.request_link(&alice, &bob, None).await.unwrap();

        let settled = book
            .answer_link(request.request_id, &bob, LinkDecision::Reject)
            .await
            .unwrap();
        assert_eq!(settled.status, LinkStatus::Rejected);
        assert!(book.linked_users(&alice).await.unwrap().is_empty());
        assert!(book.pending_for(&bob).is_empty());
    }

    #[tokio::test]
    async fn collaborators_without_linking_refuse_invitations() {
        let result = NoLinks
            .request_link(&UserId::from("alice"), &UserId::from("bob"), None)
            .await;
        assert_eq!(result, Err(SyncError::Unsupported));
    }
}
