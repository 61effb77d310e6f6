use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::deviceplugin::DEVICE_PLUGIN_PATH;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "HOSTPATH_DEVICE_PLUGIN_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/k8s-hostpath-device-plugin/config.yaml",
        help = "Path to the config file shared by the device plugin and the webhook"
    )]
    pub config: PathBuf,

    #[arg(long, global = true, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long,
        global = true,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Human readable logs, set to false for JSON lines"
    )]
    pub log_pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin against the local kubelet
    #[command(name = "device-plugin")]
    DevicePlugin(DevicePluginArgs),
    /// Run the mutating admission webhook
    Webhook(WebhookArgs),
    /// Print version information as JSON
    Version,
}

#[derive(Parser, Clone, Debug)]
pub struct DevicePluginArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEVICE_PLUGIN_PATH,
        help = "Kubelet device plugin directory holding kubelet.sock and the plugin socket"
    )]
    pub device_plugin_path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct WebhookArgs {
    #[arg(
        long,
        env = "WEBHOOK_LISTEN",
        default_value = "0.0.0.0:8443",
        help = "Webhook listen address"
    )]
    pub listen: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/cert/tls.crt",
        help = "TLS certificate file (PEM)"
    )]
    pub tls_cert_file: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/cert/tls.key",
        help = "TLS private key file (PEM)"
    )]
    pub tls_private_key_file: PathBuf,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds between checks for a rotated certificate"
    )]
    pub tls_reload_interval: u64,

    #[arg(long, help = "Serve plain HTTP instead of HTTPS, for local testing only")]
    pub insecure_http: bool,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds to wait for in-flight requests on shutdown"
    )]
    pub graceful_shutdown_timeout: u64,
}
