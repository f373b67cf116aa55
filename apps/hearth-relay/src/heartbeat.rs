use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::registry::{CloseReason, ConnectionRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
}

/// Evicts connections that miss a probe window.
///
/// Each sweep closes connections that did not acknowledge the previous probe,
/// then clears the liveness flag of the rest and probes them again.
#[derive(Clone)]
pub struct HeartbeatSupervisor {
    registry: ConnectionRegistry,
    period: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(registry: ConnectionRegistry, period: Duration) -> Self {
        Self { registry, period }
    }

    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for connection in self.registry.live_connections() {
            if !connection.begin_probe() {
                warn!(
                    device_id = %connection.device_id(),
                    user_id = %connection.user_id(),
                    connection_id = %connection.id(),
                    "no probe acknowledgement; evicting connection"
                );
                self.registry
                    .close(connection.id(), CloseReason::ProbeTimeout);
                report.evicted += 1;
                continue;
            }
            match connection.transport().probe() {
                Ok(()) => report.probed += 1,
                Err(err) => {
                    debug!(connection_id = %connection.id(), error = %err, "probe write failed");
                    self.registry
                        .close(connection.id(), CloseReason::TransportFailed);
                    report.evicted += 1;
                }
            }
        }
        counter!("hearth_relay_heartbeat_evictions_total", report.evicted as u64);
        report
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep();
                if report.evicted > 0 {
                    debug!(probed = report.probed, evicted = report.evicted, "heartbeat sweep");
                }
            }
        })
    }
}
