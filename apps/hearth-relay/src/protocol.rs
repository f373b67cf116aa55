use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::model::{DeviceId, UserId};

/// Handshake tag every transport must send first.
pub const REGISTRATION_TAG: &str = "USER_REGISTRATION";
/// Reply tag for frames that are not a JSON envelope.
pub const PARSE_ERROR_TAG: &str = "MESSAGE_PARSE_ERROR";

/// Pushed to the addressee of a new link invitation.
pub const LINK_REQUEST_RECEIVED: &str = "LINK_REQUEST_RECEIVED";
/// Pushed to both accounts once an invitation is accepted.
pub const LINK_ESTABLISHED: &str = "LINK_ESTABLISHED";
pub const LINK_INVITATION_REJECTED: &str = "LINK_INVITATION_REJECTED";
pub const LINK_CANCELLED: &str = "LINK_CANCELLED";

/// Operations understood after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    TodoGetToday,
    TodoGetByDate,
    TodoGetRange,
    TodoNextOccurrence,
    TodoCreate,
    TodoUpdate,
    TodoDelete,
    TodoComplete,
    TodoUncomplete,
    NotesGetByUser,
    NotesCreate,
    NotesUpdate,
    NotesDelete,
    PatternCreate,
    PatternGet,
    PatternPresets,
    PatternPreview,
    LinkCheckUserOnline,
    LinkGetLinkedUsers,
    LinkSendInvitation,
    LinkAcceptInvitation,
    LinkRejectInvitation,
    LinkCancel,
}

impl Operation {
    pub const ALL: [Operation; 24] = [
        Operation::Ping,
        Operation::TodoGetToday,
        Operation::TodoGetByDate,
        Operation::TodoGetRange,
        Operation::TodoNextOccurrence,
        Operation::TodoCreate,
        Operation::TodoUpdate,
        Operation::TodoDelete,
        Operation::TodoComplete,
        Operation::TodoUncomplete,
        Operation::NotesGetByUser,
        Operation::NotesCreate,
        Operation::NotesUpdate,
        Operation::NotesDelete,
        Operation::PatternCreate,
        Operation::PatternGet,
        Operation::PatternPresets,
        Operation::PatternPreview,
        Operation::LinkCheckUserOnline,
        Operation::LinkGetLinkedUsers,
        Operation::LinkSendInvitation,
        Operation::LinkAcceptInvitation,
        Operation::LinkRejectInvitation,
        Operation::LinkCancel,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Operation::Ping => "PING",
            Operation::TodoGetToday => "TODO_GET_TODAY",
            Operation::TodoGetByDate => "TODO_GET_BY_DATE",
            Operation::TodoGetRange => "TODO_GET_RANGE",
            Operation::TodoNextOccurrence => "TODO_NEXT_OCCURRENCE",
            Operation::TodoCreate => "TODO_CREATE",
            Operation::TodoUpdate => "TODO_UPDATE",
            Operation::TodoDelete => "TODO_DELETE",
            Operation::TodoComplete => "TODO_COMPLETE",
            Operation::TodoUncomplete => "TODO_UNCOMPLETE",
            Operation::NotesGetByUser => "NOTES_GET_BY_USER",
            Operation::NotesCreate => "NOTES_CREATE",
            Operation::NotesUpdate => "NOTES_UPDATE",
            Operation::NotesDelete => "NOTES_DELETE",
            Operation::PatternCreate => "PATTERN_CREATE",
            Operation::PatternGet => "PATTERN_GET",
            Operation::PatternPresets => "PATTERN_PRESETS",
            Operation::PatternPreview => "PATTERN_PREVIEW",
            Operation::LinkCheckUserOnline => "LINK_CHECK_USER_ONLINE",
            Operation::LinkGetLinkedUsers => "LINK_GET_LINKED_USERS",
            Operation::LinkSendInvitation => "LINK_SEND_INVITATION",
            Operation::LinkAcceptInvitation => "LINK_ACCEPT_INVITATION",
            Operation::LinkRejectInvitation => "LINK_REJECT_INVITATION",
            Operation::LinkCancel => "LINK_CANCEL",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.tag() == tag)
    }

    /// Mutations are fanned out to the owner's other devices.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Operation::TodoCreate
                | Operation::TodoUpdate
                | Operation::TodoDelete
                | Operation::TodoComplete
                | Operation::TodoUncomplete
                | Operation::NotesCreate
                | Operation::NotesUpdate
                | Operation::NotesDelete
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Frame sent by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_user_id: Option<UserId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ClientEnvelope {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            device_id: None,
            logical_user_id: None,
            payload,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    pub fn with_identity(mut self, device_id: &DeviceId, user_id: &UserId) -> Self {
        self.device_id = Some(device_id.clone());
        self.logical_user_id = Some(user_id.clone());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginVia {
    /// Another device of the same account made the change.
    Device,
    /// A linked account's service relayed the change.
    LinkedAccount,
}

/// Who caused a broadcast. Receivers drop broadcasts carrying their own device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOrigin {
    pub logical_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub via: OriginVia,
}

impl SyncOrigin {
    pub fn device(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self {
            logical_user_id: user_id.clone(),
            device_id: Some(device_id.clone()),
            via: OriginVia::Device,
        }
    }

    pub fn linked_account(user_id: &UserId, device_id: Option<&DeviceId>) -> Self {
        Self {
            logical_user_id: user_id.clone(),
            device_id: device_id.cloned(),
            via: OriginVia::LinkedAccount,
        }
    }
}

/// Frame sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    pub operation: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<SyncOrigin>,
}

impl ServerEnvelope {
    pub fn response(tag: &str, data: Value) -> Self {
        Self::new(format!("{tag}_RESPONSE"), true, Some(data))
    }

    pub fn failure(tag: &str, err: &RelayError) -> Self {
        let mut envelope = Self::new(format!("{tag}_ERROR"), false, None);
        envelope.error = Some(err.to_string());
        envelope.error_kind = Some(err.kind().to_string());
        envelope
    }

    pub fn parse_failure(reason: impl fmt::Display) -> Self {
        let mut envelope = Self::new(PARSE_ERROR_TAG.to_string(), false, None);
        envelope.error = Some(format!("malformed message: {reason}"));
        envelope.error_kind = Some("validation".to_string());
        envelope
    }

    pub fn broadcast(tag: &str, data: Value, origin: SyncOrigin) -> Self {
        let mut envelope = Self::new(format!("{tag}_BROADCAST"), true, Some(data));
        envelope.origin = Some(origin);
        envelope
    }

    /// Server-initiated event that is not the echo of a mutation.
    pub fn event(tag: &str, data: Value, origin: SyncOrigin) -> Self {
        let mut envelope = Self::new(tag.to_string(), true, Some(data));
        envelope.origin = Some(origin);
        envelope
    }

    /// True when `device` itself caused this broadcast.
    pub fn is_echo_for(&self, device: &DeviceId) -> bool {
        self.origin
            .as_ref()
            .and_then(|origin| origin.device_id.as_ref())
            .is_some_and(|origin_device| origin_device == device)
    }

    fn new(operation: String, success: bool, data: Option<Value>) -> Self {
        Self {
            operation,
            success,
            data,
            error: None,
            error_kind: None,
            timestamp: Utc::now().timestamp_millis(),
            origin: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tags_resolve_both_ways() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_tag(op.tag()), Some(op));
        }
        assert_eq!(Operation::from_tag(REGISTRATION_TAG), None);
        assert_eq!(Operation::from_tag("TODO_EXPLODE"), None);
    }

    #[test]
    fn only_writes_are_mutations() {
        let mutations: Vec<&str> = Operation::ALL
            .into_iter()
            .filter(|op| op.is_mutation())
            .map(Operation::tag)
            .collect();
        assert_eq!(
            mutations,
            [
                "TODO_CREATE",
                "TODO_UPDATE",
                "TODO_DELETE",
                "TODO_COMPLETE",
                "TODO_UNCOMPLETE",
                "NOTES_CREATE",
                "NOTES_UPDATE",
                "NOTES_DELETE"
            ]
        );
    }

    #[test]
    fn client_envelope_accepts_camel_case_fields() {
        let envelope: ClientEnvelope = serde_json::from_value(json!({
            "operation": "TODO_GET_TODAY",
            "deviceId": "tablet",
            "logicalUserId": "alice",
            "timestamp": 1_700_000_000_000i64
        }))
        .unwrap();
        assert_eq!(envelope.device_id, Some(DeviceId::from("tablet")));
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn error_envelope_carries_kind_and_no_data() {
        let envelope = ServerEnvelope::failure(
            "TODO_UPDATE",
            &RelayError::Permission("task 4 belongs to another user".into()),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["operation"], "TODO_UPDATE_ERROR");
        assert_eq!(value["success"], false);
        assert_eq!(value["errorKind"], "permission");
        assert!(value.get("data").is_none());
        assert!(value.get("origin").is_none());
    }

    #[test]
    fn events_keep_their_tag_verbatim() {
        let origin = SyncOrigin::device(&UserId::from("alice"), &DeviceId::from("d1"));
        let envelope = ServerEnvelope::event(LINK_ESTABLISHED, json!({"linkedUser": "bob"}), origin);
        assert_eq!(envelope.operation, "LINK_ESTABLISHED");
        assert!(envelope.success);
        assert!(envelope.is_echo_for(&DeviceId::from("d1")));
    }

    #[test]
    fn broadcast_is_recognised_as_echo_by_its_origin_device() {
        let origin = SyncOrigin::device(&UserId::from("alice"), &DeviceId::from("d1"));
        let envelope = ServerEnvelope::broadcast("TODO_COMPLETE", json!({"todoId": 1}), origin);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["origin"]["via"], "device");
        assert_eq!(value["origin"]["deviceId"], "d1");
        assert!(envelope.is_echo_for(&DeviceId::from("d1")));
        assert!(!envelope.is_echo_for(&DeviceId::from("d2")));
    }
}
