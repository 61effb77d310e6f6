use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use tokio::sync::watch;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::api;

/// Health shared by every device slot.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

impl Health {
    /// Wire value expected by the kubelet.
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

/// Last value seen by the monitor; `Unknown` until the first tick so the
/// first observation is always published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Unknown,
    Known(Health),
}

/// Stats `path`: a missing path is unhealthy, any other I/O failure is
/// returned to the caller.
pub fn probe_health(path: &Path) -> io::Result<Health> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(Health::Healthy),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Health::Unhealthy),
        Err(e) => Err(e),
    }
}

/// Read side of the device set: fixed ids plus the latest published health.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    ids: Arc<[String]>,
    health: watch::Receiver<Health>,
}

impl DeviceRegistry {
    pub fn current_health(&self) -> Health {
        *self.health.borrow()
    }

    /// Full device list with every slot set to `health`.
    pub fn devices(&self, health: Health) -> Vec<api::Device> {
        self.ids
            .iter()
            .map(|id| api::Device {
                id: id.clone(),
                health: health.as_str().to_string(),
                topology: None,
            })
            .collect()
    }

    /// New receiver for health publications, starting at the current value.
    pub fn subscribe(&self) -> watch::Receiver<Health> {
        self.health.clone()
    }
}

/// Periodically probes the host path and publishes health changes.
#[derive(Debug)]
pub struct HealthMonitor {
    host_path: PathBuf,
    interval: Duration,
    tx: watch::Sender<Health>,
}

impl HealthMonitor {
    /// Creates the monitor and the registry it feeds. The initial health is
    /// one probe of `host_path`; a probe error counts as unhealthy.
    pub fn new(
        host_path: impl Into<PathBuf>,
        interval: Duration,
        num_devices: usize,
    ) -> (Self, DeviceRegistry) {
        let host_path = host_path.into();
        let initial = probe_health(&host_path).unwrap_or_else(|e| {
            warn!(path = %host_path.display(), error = %e, "initial health probe failed");
            Health::Unhealthy
        });
        let (tx, rx) = watch::channel(initial);
        let ids: Arc<[String]> = (0..num_devices).map(|i| i.to_string()).collect();

        let monitor = Self {
            host_path,
            interval,
            tx,
        };
        let registry = DeviceRegistry { ids, health: rx };
        (monitor, registry)
    }

    /// Runs until `cancellation_token` fires. The first probe happens one
    /// interval after start.
    pub async fn run(self, cancellation_token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Observed::Unknown;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!(path = %self.host_path.display(), "health monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let health = match probe_health(&self.host_path) {
                        Ok(health) => health,
                        Err(e) => {
                            warn!(path = %self.host_path.display(), error = %e, "health probe failed");
                            continue;
                        }
                    };
                    if last != Observed::Known(health) {
                        info!(path = %self.host_path.display(), %health, "health is changed");
                        self.tx.send_replace(health);
                    }
                    last = Observed::Known(health);
                }
            }
        }
    }
}
