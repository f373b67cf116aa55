use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::model::{DeviceId, UserId};

/// A request refused because the caller does not own what it touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedAccess {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub operation: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn permission_denied(&self, record: &DeniedAccess);
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn permission_denied(&self, record: &DeniedAccess) {
        warn!(
            target: "audit",
            device_id = %record.device_id,
            user_id = %record.user_id,
            operation = %record.operation,
            reason = %record.reason,
            "permission denied"
        );
    }
}
