use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, DeniedAccess};
use crate::broadcast::Broadcaster;
use crate::error::RelayError;
use crate::model::{DeviceId, UserId};
use crate::protocol::{ClientEnvelope, Operation, ServerEnvelope, SyncOrigin, REGISTRATION_TAG};
use crate::registry::{CloseReason, ConnectionRegistry, Transport};
use crate::store::CareStore;
use crate::sync::{MutationEvent, SyncCollaborator};

/// Identity a transport established with its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: DeviceId,
    pub user_id: UserId,
}

/// Validates, dispatches and answers device messages, then fans out mutations.
#[derive(Clone)]
pub struct MessageRouter {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) store: Arc<dyn CareStore>,
    pub(crate) sync: Arc<dyn SyncCollaborator>,
    pub(crate) audit: Arc<dyn AuditSink>,
}

impl MessageRouter {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn CareStore>,
        sync: Arc<dyn SyncCollaborator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            store,
            sync,
            audit,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Binds `transport` to the identity the envelope claims.
    pub fn register(
        &self,
        transport: &Arc<Transport>,
        envelope: &ClientEnvelope,
    ) -> Result<Identity, RelayError> {
        let (device_id, user_id) = registration_identity(envelope)?;
        let registration =
            self.registry
                .register(device_id.clone(), user_id.clone(), Arc::clone(transport))?;
        info!(
            device_id = %device_id,
            user_id = %user_id,
            connection_id = %transport.id(),
            devices = registration.user_devices,
            total = registration.total_connections,
            "device registered"
        );
        self.reply(
            transport,
            ServerEnvelope::response(
                REGISTRATION_TAG,
                json!({
                    "deviceId": device_id,
                    "logicalUserId": user_id,
                    "replacedPrevious": registration.replaced.is_some(),
                    "activeDevices": registration.user_devices,
                }),
            ),
        );
        Ok(Identity { device_id, user_id })
    }

    /// Handles one post-handshake envelope from `transport`.
    pub async fn route(&self, transport: &Arc<Transport>, identity: &Identity, envelope: ClientEnvelope) {
        let tag = envelope.operation.clone();
        let Some(operation) = Operation::from_tag(&tag) else {
            counter!("hearth_relay_messages_total", 1, "operation" => "unknown");
            debug!(device_id = %identity.device_id, operation = %tag, "unknown operation");
            let err = RelayError::Validation(format!("unknown operation: {tag}"));
            self.reply(transport, ServerEnvelope::failure(&tag, &err));
            return;
        };
        counter!("hearth_relay_messages_total", 1, "operation" => operation.tag());

        let result = match check_claimed_identity(identity, &envelope) {
            Ok(()) => self.execute(operation, identity, envelope.payload).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(data) => {
                self.reply(transport, ServerEnvelope::response(operation.tag(), data.clone()));
                if operation.is_mutation() {
                    self.fan_out(operation, identity, data).await;
                }
            }
            Err(err) => self.reject(transport, identity, &tag, err),
        }
    }

    /// Reports `err` to the sender, auditing permission failures.
    pub(crate) fn reject(
        &self,
        transport: &Arc<Transport>,
        identity: &Identity,
        tag: &str,
        err: RelayError,
    ) {
        counter!("hearth_relay_errors_total", 1, "kind" => err.kind());
        if let RelayError::Permission(reason) = &err {
            self.audit.permission_denied(&DeniedAccess {
                device_id: identity.device_id.clone(),
                user_id: identity.user_id.clone(),
                operation: tag.to_string(),
                reason: reason.clone(),
                at: Utc::now(),
            });
        }
        if err.is_reportable() {
            debug!(device_id = %identity.device_id, operation = tag, error = %err, "operation failed");
            self.reply(transport, ServerEnvelope::failure(tag, &err));
        } else {
            warn!(device_id = %identity.device_id, operation = tag, error = %err, "operation aborted");
        }
    }

    /// Writes to one transport. A failed write closes it; results for an
    /// already closed transport are dropped.
    pub(crate) fn reply(&self, transport: &Arc<Transport>, envelope: ServerEnvelope) {
        if transport.is_closed() {
            return;
        }
        if let Err(err) = transport.send(envelope) {
            debug!(connection_id = %transport.id(), error = %err, "reply dropped");
            self.registry
                .close_transport(transport, CloseReason::TransportFailed);
        }
    }

    async fn fan_out(&self, operation: Operation, identity: &Identity, data: Value) {
        let origin = SyncOrigin::device(&identity.user_id, &identity.device_id);
        let envelope = ServerEnvelope::broadcast(operation.tag(), data.clone(), origin.clone());
        let report = self.broadcaster.push_to_live_devices(
            &identity.user_id,
            &envelope,
            Some(&identity.device_id),
        );
        debug!(
            operation = operation.tag(),
            user_id = %identity.user_id,
            delivered = report.delivered,
            closed = report.closed,
            "mutation broadcast"
        );

        let event = MutationEvent {
            operation,
            owner: identity.user_id.clone(),
            origin,
            data,
        };
        match self.sync.apply_and_notify(&event).await {
            Ok(notices) => {
                for notice in notices {
                    self.broadcaster.deliver_notice(notice);
                }
            }
            Err(err) => warn!(
                operation = operation.tag(),
                user_id = %identity.user_id,
                error = %err,
                "sync propagation failed"
            ),
        }
    }
}

pub(crate) fn registration_identity(envelope: &ClientEnvelope) -> Result<(DeviceId, UserId), RelayError> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RegistrationPayload {
        device_id: Option<DeviceId>,
        logical_user_id: Option<UserId>,
    }

    let payload: RegistrationPayload = match &envelope.payload {
        Value::Null => RegistrationPayload {
            device_id: None,
            logical_user_id: None,
        },
        other => serde_json::from_value(other.clone())?,
    };
    let device_id = envelope
        .device_id
        .clone()
        .or(payload.device_id)
        .filter(|id| !id.is_blank())
        .ok_or_else(|| RelayError::Validation("registration requires a deviceId".into()))?;
    let user_id = envelope
        .logical_user_id
        .clone()
        .or(payload.logical_user_id)
        .filter(|id| !id.is_blank())
        .ok_or_else(|| RelayError::Validation("registration requires a logicalUserId".into()))?;
    Ok((device_id, user_id))
}

/// Envelope identity fields, when present, must match the handshake.
pub(crate) fn check_claimed_identity(
    identity: &Identity,
    envelope: &ClientEnvelope,
) -> Result<(), RelayError> {
    if let Some(device_id) = &envelope.device_id {
        if device_id != &identity.device_id {
            return Err(RelayError::Permission(format!(
                "connection is registered as device {}, not {device_id}",
                identity.device_id
            )));
        }
    }
    if let Some(user_id) = &envelope.logical_user_id {
        if user_id != &identity.user_id {
            return Err(RelayError::Permission(format!(
                "connection is registered for user {}, not {user_id}",
                identity.user_id
            )));
        }
    }
    Ok(())
}

pub(crate) fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, RelayError> {
    let payload = if payload.is_null() { json!({}) } else { payload };
    Ok(serde_json::from_value(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            device_id: DeviceId::from("d1"),
            user_id: UserId::from("alice"),
        }
    }

    #[test]
    fn registration_reads_identity_from_envelope_or_payload() {
        let envelope = ClientEnvelope::new(REGISTRATION_TAG, Value::Null)
            .with_identity(&DeviceId::from("d1"), &UserId::from("alice"));
        assert_eq!(
            registration_identity(&envelope).unwrap(),
            (DeviceId::from("d1"), UserId::from("alice"))
        );

        let envelope = ClientEnvelope::new(
            REGISTRATION_TAG,
            json!({"deviceId": "d2", "logicalUserId": "bob"}),
        );
        assert_eq!(
            registration_identity(&envelope).unwrap(),
            (DeviceId::from("d2"), UserId::from("bob"))
        );

        let envelope = ClientEnvelope::new(REGISTRATION_TAG, json!({"deviceId": "d2"}));
        assert!(matches!(
            registration_identity(&envelope),
            Err(RelayError::Validation(_))
        ));
    }

    #[test]
    fn mismatched_identity_is_a_permission_error() {
        let envelope = ClientEnvelope::new("PING", Value::Null)
            .with_identity(&DeviceId::from("d1"), &UserId::from("mallory"));
        assert!(matches!(
            check_claimed_identity(&identity(), &envelope),
            Err(RelayError::Permission(_))
        ));

        let bare = ClientEnvelope::new("PING", Value::Null);
        assert!(check_claimed_identity(&identity(), &bare).is_ok());
    }
}
