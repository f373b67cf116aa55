use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::protocol::{ClientEnvelope, ServerEnvelope, REGISTRATION_TAG};
use crate::registry::{CloseReason, Transport};
use crate::router::{registration_identity, Identity, MessageRouter};

/// Per-transport protocol state, independent of the socket type.
///
/// Frames are handled one at a time in arrival order. Nothing but the
/// handshake is accepted until it succeeds, and nothing at all once the
/// transport is closed.
pub struct DeviceSession {
    router: MessageRouter,
    transport: Arc<Transport>,
    identity: Option<Identity>,
}

impl DeviceSession {
    pub fn new(router: MessageRouter, transport: Arc<Transport>) -> Self {
        Self {
            router,
            transport,
            identity: None,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.identity.is_some()
    }

    pub async fn on_text(&mut self, text: &str) {
        if self.transport.is_closed() {
            debug!(connection_id = %self.transport.id(), "ignoring frame on closed transport");
            return;
        }

        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.router
                    .reply(&self.transport, ServerEnvelope::parse_failure(err));
                return;
            }
        };

        match &self.identity {
            None if envelope.operation == REGISTRATION_TAG => self.handshake(&envelope),
            None => {
                let err = RelayError::Validation(format!(
                    "{REGISTRATION_TAG} must be the first message"
                ));
                self.router
                    .reply(&self.transport, ServerEnvelope::failure(&envelope.operation, &err));
            }
            Some(identity) if envelope.operation == REGISTRATION_TAG => {
                let identity = identity.clone();
                self.reregister(&identity, &envelope);
            }
            Some(identity) => {
                let identity = identity.clone();
                self.router.route(&self.transport, &identity, envelope).await;
            }
        }
    }

    /// Probe acknowledgement (WebSocket pong).
    pub fn on_probe_ack(&self) {
        self.router.registry().mark_probe_ack(self.transport.id());
    }

    /// Closes a transport that has not registered within `waited`.
    ///
    /// Returns the timeout error, or `None` when the handshake already succeeded.
    pub fn expire_handshake(&self, waited: Duration) -> Option<RelayError> {
        if self.is_registered() {
            return None;
        }
        let err = RelayError::Timeout(format!(
            "no {REGISTRATION_TAG} within {}ms",
            waited.as_millis()
        ));
        counter!("hearth_relay_errors_total", 1, "kind" => err.kind());
        warn!(connection_id = %self.transport.id(), error = %err, "closing unregistered connection");
        self.close(CloseReason::HandshakeTimeout);
        Some(err)
    }

    pub fn close(&self, reason: CloseReason) {
        self.router
            .registry()
            .close_transport(&self.transport, reason);
    }

    fn handshake(&mut self, envelope: &ClientEnvelope) {
        match self.router.register(&self.transport, envelope) {
            Ok(identity) => self.identity = Some(identity),
            Err(err) => {
                debug!(connection_id = %self.transport.id(), error = %err, "registration rejected");
                if err.is_reportable() {
                    self.router
                        .reply(&self.transport, ServerEnvelope::failure(REGISTRATION_TAG, &err));
                }
            }
        }
    }

    /// A repeated handshake may refresh the same identity but never change it.
    fn reregister(&mut self, identity: &Identity, envelope: &ClientEnvelope) {
        match registration_identity(envelope) {
            Ok((device_id, user_id))
                if device_id == identity.device_id && user_id == identity.user_id =>
            {
                self.handshake(envelope)
            }
            Ok(_) => {
                let err = RelayError::Permission(
                    "connection is already registered to another identity".into(),
                );
                self.router
                    .reject(&self.transport, identity, REGISTRATION_TAG, err);
            }
            Err(err) => self
                .router
                .reject(&self.transport, identity, REGISTRATION_TAG, err),
        }
    }
}
