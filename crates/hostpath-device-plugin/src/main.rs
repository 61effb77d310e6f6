mod cmd;

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use hostpath_device_plugin::config::Cli;
use hostpath_device_plugin::config::Commands;
use hostpath_device_plugin::config::HostPathDeviceConfig;
use utils::version;

use crate::cmd::run_device_plugin;
use crate::cmd::run_webhook;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("{}", serde_json::to_string(&version::version_info())?);
        return Ok(());
    }

    let _guard = utils::logging::init(cli.debug, cli.log_pretty);
    tracing::info!("Starting hostpath-device-plugin {}", &**version::VERSION);

    let config = HostPathDeviceConfig::load(&cli.config).map_err(|e| anyhow!("{e:?}"))?;
    let config = Arc::new(config);
    tracing::debug!("loaded config: {:?}", config);

    match cli.command {
        Commands::DevicePlugin(args) => run_device_plugin(config, args).await,
        Commands::Webhook(args) => run_webhook(config, args).await,
        Commands::Version => Ok(()),
    }
}
