//! Kubelet device plugin: health-tracked device slots served over the
//! `v1beta1` gRPC protocol, plus the loop that keeps it registered.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod health;
pub mod runner;
pub mod server;
pub mod watcher;

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

pub use health::DeviceRegistry;
pub use health::Health;
pub use health::HealthMonitor;
pub use runner::LifecycleEvent;
pub use runner::LifecycleState;
pub use runner::PluginRunner;
pub use runner::ProcessSignal;
pub use server::HostPathDevicePlugin;
pub use server::ServerState;

pub const API_VERSION: &str = "v1beta1";
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Display)]
pub enum DevicePluginError {
    #[display("Failed to bind device plugin socket {path}")]
    Bind { path: String },
    #[display("Device plugin socket {path} does not accept connections")]
    Handshake { path: String },
    #[display("Failed to register endpoint {endpoint} for resource {resource_name} with kubelet")]
    Registration {
        endpoint: String,
        resource_name: String,
    },
    #[display("Failed to dial {path}")]
    Dial { path: String },
    #[display("Failed to stop device plugin serving {path}")]
    Stop { path: String },
    #[display("Failed to watch {path}")]
    Watch { path: String },
    #[display("Failed to install signal handlers")]
    Signal,
}

impl Error for DevicePluginError {}

/// Locations inside the kubelet device plugin directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeletPaths {
    pub plugin_dir: PathBuf,
}

impl KubeletPaths {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }

    /// The kubelet `Registration` socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET_NAME)
    }

    pub fn plugin_socket(&self, socket_name: &str) -> PathBuf {
        self.plugin_dir.join(socket_name)
    }
}

impl Default for KubeletPaths {
    fn default() -> Self {
        Self::new(DEVICE_PLUGIN_PATH)
    }
}

/// Opens a gRPC channel over the unix socket at `socket_path`, giving up
/// after `dial_timeout`.
pub async fn dial(
    socket_path: &Path,
    dial_timeout: Duration,
) -> Result<Channel, Report<DevicePluginError>> {
    let error = || DevicePluginError::Dial {
        path: socket_path.display().to_string(),
    };
    let path = socket_path.to_path_buf();

    // The URL is a placeholder, the connector always dials the unix socket.
    let endpoint = Endpoint::from_static("http://tonic");
    let connect = endpoint.connect_with_connector(service_fn(
        move |_: Uri| {
            let path = path.clone();
            async move {
                match UnixStream::connect(path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        },
    ));

    tokio::time::timeout(dial_timeout, connect)
        .await
        .change_context_lazy(error)
        .attach_printable_lazy(|| format!("timed out after {dial_timeout:?}"))?
        .change_context_lazy(error)
}
