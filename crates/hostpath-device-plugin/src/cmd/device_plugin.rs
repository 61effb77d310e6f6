use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use hostpath_device_plugin::config::DevicePluginArgs;
use hostpath_device_plugin::config::HostPathDeviceConfig;
use hostpath_device_plugin::deviceplugin::watcher;
use hostpath_device_plugin::deviceplugin::KubeletPaths;
use hostpath_device_plugin::deviceplugin::PluginRunner;
use tokio::sync::mpsc;

pub async fn run_device_plugin(
    config: Arc<HostPathDeviceConfig>,
    args: DevicePluginArgs,
) -> Result<()> {
    let paths = KubeletPaths::new(args.device_plugin_path);
    tracing::info!(
        "serving {} x{} from {} via {}",
        config.resource_name,
        config.num_devices,
        config.host_path.path,
        paths.plugin_dir.display()
    );

    let (tx, rx) = mpsc::channel(16);
    // dropping the watcher ends plugin dir notifications
    let _watcher =
        watcher::watch_plugin_dir(&paths.plugin_dir, tx.clone()).map_err(|e| anyhow!("{e:?}"))?;
    let signals = watcher::forward_signals(tx).map_err(|e| anyhow!("{e:?}"))?;

    let result = PluginRunner::new(config, paths).run(rx).await;
    signals.abort();
    result.map_err(|e| anyhow!("{e:?}"))
}
