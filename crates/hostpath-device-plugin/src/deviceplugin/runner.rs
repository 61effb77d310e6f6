use std::sync::Arc;

use derive_more::Display;
use error_stack::Report;
use notify::EventKind;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DevicePluginError;
use super::HostPathDevicePlugin;
use super::KubeletPaths;
use crate::config::HostPathDeviceConfig;

/// Process signals the runner reacts to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    #[display("SIGHUP")]
    Hangup,
    #[display("SIGINT")]
    Interrupt,
    #[display("SIGTERM")]
    Terminate,
    #[display("SIGQUIT")]
    Quit,
}

impl ProcessSignal {
    /// SIGHUP restarts the plugin, everything else shuts it down.
    pub fn is_reload(self) -> bool {
        matches!(self, ProcessSignal::Hangup)
    }
}

#[derive(Debug)]
pub enum LifecycleEvent {
    /// Filesystem notification from the kubelet plugin directory.
    PluginDir(notify::Event),
    WatchError(notify::Error),
    Signal(ProcessSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
    Exited,
}

/// Keeps exactly one [`HostPathDevicePlugin`] registered with the kubelet,
/// restarting it whenever the kubelet comes back.
#[derive(Debug)]
pub struct PluginRunner {
    config: Arc<HostPathDeviceConfig>,
    paths: KubeletPaths,
    plugin: Option<HostPathDevicePlugin>,
    state: LifecycleState,
}

impl PluginRunner {
    pub fn new(config: Arc<HostPathDeviceConfig>, paths: KubeletPaths) -> Self {
        Self {
            config,
            paths,
            plugin: None,
            state: LifecycleState::Idle,
        }
    }

    /// Processes `events` one at a time until a terminate signal arrives or
    /// every producer is gone.
    ///
    /// # Errors
    ///
    /// Returns [`DevicePluginError::Stop`] if an instance cannot be stopped,
    /// either before a restart or on shutdown.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) -> Result<(), Report<DevicePluginError>> {
        let kubelet_socket = self.paths.kubelet_socket();
        let mut restart = true;

        loop {
            if restart {
                self.transition(LifecycleState::Starting);
                self.stop_current().await?;

                let mut plugin = HostPathDevicePlugin::new(self.config.clone(), self.paths.clone());
                match plugin.serve().await {
                    Ok(()) => {
                        restart = false;
                        self.transition(LifecycleState::Running);
                    }
                    Err(e) => {
                        // retried after the next event
                        error!("failed to start device plugin: {e:?}");
                    }
                }
                self.plugin = Some(plugin);
            }

            let Some(event) = events.recv().await else {
                info!("event sources are closed, shutting down");
                return self.shutdown().await;
            };

            match event {
                LifecycleEvent::PluginDir(event) => {
                    if matches!(event.kind, EventKind::Create(_))
                        && event.paths.iter().any(|p| *p == kubelet_socket)
                    {
                        info!("{} created, restarting", kubelet_socket.display());
                        restart = true;
                    } else {
                        debug!("ignoring filesystem event: {:?}", event);
                    }
                }
                LifecycleEvent::WatchError(e) => {
                    warn!("plugin directory watch error: {e}");
                }
                LifecycleEvent::Signal(signal) if signal.is_reload() => {
                    info!("received {signal}, restarting");
                    restart = true;
                }
                LifecycleEvent::Signal(signal) => {
                    info!("received {signal}, shutting down");
                    return self.shutdown().await;
                }
            }
            if restart {
                self.transition(LifecycleState::Restarting);
            }
        }
    }

    async fn stop_current(&mut self) -> Result<(), Report<DevicePluginError>> {
        match self.plugin.as_mut() {
            Some(plugin) => plugin.stop().await,
            None => Ok(()),
        }
    }

    async fn shutdown(mut self) -> Result<(), Report<DevicePluginError>> {
        self.transition(LifecycleState::Stopping);
        let result = self.stop_current().await;
        self.plugin = None;
        self.transition(LifecycleState::Exited);
        result
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            debug!("device plugin lifecycle: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
