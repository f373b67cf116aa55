use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::audit::{AuditSink, TracingAudit};
use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::heartbeat::HeartbeatSupervisor;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::store::CareStore;
use crate::sync::{LinkBook, SyncCollaborator};

/// Shared handles behind every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    router: MessageRouter,
    handshake_timeout: Duration,
    heartbeat_interval: Duration,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(router: MessageRouter, config: &RelayConfig) -> Self {
        Self {
            router,
            handshake_timeout: config.handshake_timeout,
            heartbeat_interval: config.heartbeat_interval,
            metrics: None,
        }
    }

    /// Wires the bundled collaborators: the given store, a link book seeded
    /// from `config` and tracing-backed audit.
    pub fn from_config(config: &RelayConfig, store: Arc<dyn CareStore>) -> Self {
        let links = config.links.clone().unwrap_or_default();
        let sync: Arc<dyn SyncCollaborator> = Arc::new(LinkBook::new(links));
        let audit: Arc<dyn AuditSink> = Arc::new(TracingAudit);
        let router = MessageRouter::new(ConnectionRegistry::new(), store, sync, audit);
        Self::new(router, config)
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.router.registry()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        self.router.broadcaster()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn metrics(&self) -> Option<&PrometheusHandle> {
        self.metrics.as_ref()
    }

    pub fn heartbeat(&self) -> HeartbeatSupervisor {
        HeartbeatSupervisor::new(self.registry().clone(), self.heartbeat_interval)
    }
}
