use hearth_recurrence::PatternError;
use thiserror::Error;

use crate::store::StoreError;
use crate::sync::SyncError;

/// Failure of a single relay operation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Permission(String),
    /// The addressed user has no live device.
    #[error("{0}")]
    TargetOffline(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl RelayError {
    /// Label carried as `errorKind` on `_ERROR` envelopes and on metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::NotFound(_) => "not_found",
            RelayError::Permission(_) => "permission",
            RelayError::TargetOffline(_) => "target_user_offline",
            RelayError::Internal(_) => "internal",
            RelayError::Transport(_) => "transport",
            RelayError::Timeout(_) => "timeout",
        }
    }

    /// Whether the error is answered to the client. Transport and timeout
    /// failures only lead to cleanup.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, RelayError::Transport(_) | RelayError::Timeout(_))
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => RelayError::NotFound(err.to_string()),
            StoreError::Conflict(reason) => RelayError::Validation(reason),
            StoreError::Backend(reason) => RelayError::Internal(reason),
        }
    }
}

impl From<SyncError> for RelayError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Unsupported | SyncError::Invalid(_) => RelayError::Validation(err.to_string()),
            SyncError::UnknownRequest(_) | SyncError::NotLinked(..) => {
                RelayError::NotFound(err.to_string())
            }
            SyncError::Denied(reason) => RelayError::Permission(reason),
            SyncError::Unavailable(reason) => RelayError::Internal(reason),
        }
    }
}

impl From<PatternError> for RelayError {
    fn from(err: PatternError) -> Self {
        RelayError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Validation(format!("invalid payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_client_facing_errors_are_reportable() {
        assert!(RelayError::Validation("bad".into()).is_reportable());
        assert!(RelayError::NotFound("gone".into()).is_reportable());
        assert!(RelayError::Permission("nope".into()).is_reportable());
        assert!(!RelayError::Transport("reset".into()).is_reportable());
        assert!(!RelayError::Timeout("handshake".into()).is_reportable());
    }

    #[test]
    fn sync_errors_map_to_client_kinds() {
        let denied: RelayError = SyncError::Denied("not yours".into()).into();
        assert_eq!(denied.kind(), "permission");
        let unknown: RelayError = SyncError::UnknownRequest(4).into();
        assert_eq!(unknown.kind(), "not_found");
        assert_eq!(unknown.to_string(), "link request 4 not found");
        let down: RelayError = SyncError::Unavailable("link service down".into()).into();
        assert_eq!(down.kind(), "internal");
        assert!(RelayError::TargetOffline("bob is offline".into()).is_reportable());
    }

    #[test]
    fn store_errors_keep_their_kind() {
        let missing: RelayError = StoreError::NotFound { entity: "task", id: 7 }.into();
        assert_eq!(missing.kind(), "not_found");
        assert_eq!(missing.to_string(), "task 7 not found");

        let conflict: RelayError = StoreError::Conflict("already deleted".into()).into();
        assert_eq!(conflict.kind(), "validation");
    }
}
