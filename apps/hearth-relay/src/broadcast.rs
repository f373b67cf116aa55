use metrics::counter;
use serde::Serialize;
use tracing::debug;

use crate::model::{DeviceId, UserId};
use crate::protocol::ServerEnvelope;
use crate::registry::{CloseReason, ConnectionRegistry};
use crate::sync::SyncNotice;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub delivered: usize,
    /// Connections whose write failed and were closed.
    pub closed: usize,
}

/// Pushes envelopes to every live device of a user.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Best-effort, at-most-once delivery. `origin_device` is skipped.
    pub fn push_to_live_devices(
        &self,
        user: &UserId,
        envelope: &ServerEnvelope,
        origin_device: Option<&DeviceId>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        for connection in self.registry.connections_of(user) {
            if Some(connection.device_id()) == origin_device {
                continue;
            }
            match connection.transport().send(envelope.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(
                        device_id = %connection.device_id(),
                        connection_id = %connection.id(),
                        error = %err,
                        "dropping broadcast for dead connection"
                    );
                    self.registry
                        .close(connection.id(), CloseReason::TransportFailed);
                    report.closed += 1;
                }
            }
        }

        counter!(
            "hearth_relay_broadcast_deliveries_total",
            report.delivered as u64,
            "operation" => envelope.operation.clone()
        );
        report
    }

    /// Delivers a notice produced by the sync collaborator.
    ///
    /// When the notice targets the originating user, the originating device is
    /// skipped like any other broadcast.
    pub fn deliver_notice(&self, notice: SyncNotice) -> FanoutReport {
        let target = notice.target_user.clone();
        let origin_device = if notice.origin.logical_user_id == target {
            notice.origin.device_id.clone()
        } else {
            None
        };
        let envelope = notice.into_envelope();
        self.push_to_live_devices(&target, &envelope, origin_device.as_ref())
    }
}
