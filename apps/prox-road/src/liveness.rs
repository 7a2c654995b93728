use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::registry::IdentityRegistry;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEAD_AFTER: Duration = Duration::from_secs(12);

/// Probe cadence and reap threshold. The threshold must exceed the cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub probe_interval: Duration,
    pub dead_after: Duration,
}

impl LivenessConfig {
    pub fn new(probe_interval: Duration, dead_after: Duration) -> Result<Self, ConfigError> {
        if probe_interval.is_zero() {
            return Err(ConfigError::ZeroProbeInterval);
        }
        if dead_after <= probe_interval {
            return Err(ConfigError::DeadTimeoutTooShort {
                probe_interval,
                dead_after,
            });
        }
        Ok(Self {
            probe_interval,
            dead_after,
        })
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            dead_after: DEFAULT_DEAD_AFTER,
        }
    }
}

/// Spawn the periodic liveness sweep over `registry`.
pub fn spawn_monitor(registry: IdentityRegistry, config: LivenessConfig) -> JoinHandle<()> {
    let mut interval = tokio::time::interval(config.probe_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            // Sweep at the scheduled instant so wake-up jitter does not skew
            // the probe spacing.
            let scheduled = interval.tick().await.into_std();
            let outcome = registry.sweep(scheduled, &config);
            for departure in &outcome.reaped {
                counter!("prox_road_leaves_total", 1, "reason" => "reaped");
                info!(
                    session_id = %departure.session_id,
                    identity = %departure.identity,
                    "session reaped after missing liveness deadline"
                );
            }
            if outcome.probed > 0 {
                debug!(probed = outcome.probed, "sent liveness probes");
            }
        }
    })
}
