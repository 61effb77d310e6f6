use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use hostpath_device_plugin::config::HostPathDeviceConfig;
use hostpath_device_plugin::config::WebhookArgs;
use hostpath_device_plugin::webhook::HostPathMutator;
use hostpath_device_plugin::webhook::WebhookServer;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;

pub async fn run_webhook(config: Arc<HostPathDeviceConfig>, args: WebhookArgs) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    };

    WebhookServer::new(HostPathMutator::new(config), args)
        .run(shutdown)
        .await
        .map_err(|e| anyhow!("{e:?}"))
}
