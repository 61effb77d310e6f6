use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::api::RegisterRequest;
use super::dial;
use super::DevicePluginError;
use super::DeviceRegistry;
use super::HealthMonitor;
use super::KubeletPaths;
use super::API_VERSION;
use super::DIAL_TIMEOUT;
use crate::config::HostPathDeviceConfig;

/// Upper bound on waiting for the gRPC server to drain after stop.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Registered,
    Serving,
    Stopped,
}

/// Tasks owned by a started instance.
#[derive(Debug)]
struct RunningServer {
    cancellation_token: CancellationToken,
    server_task: JoinHandle<Result<(), tonic::transport::Error>>,
    monitor_task: JoinHandle<()>,
}

/// One device plugin instance bound to `<plugin_dir>/<socket_name>`.
#[derive(Debug)]
pub struct HostPathDevicePlugin {
    config: Arc<HostPathDeviceConfig>,
    paths: KubeletPaths,
    options: DevicePluginOptions,
    state: ServerState,
    running: Option<RunningServer>,
}

impl HostPathDevicePlugin {
    pub fn new(config: Arc<HostPathDeviceConfig>, paths: KubeletPaths) -> Self {
        Self {
            config,
            paths,
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
            state: ServerState::Created,
            running: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn socket_path(&self) -> PathBuf {
        self.paths.plugin_socket(&self.config.socket_name)
    }

    /// Binds the plugin socket, starts the gRPC server and the health
    /// monitor, then dials the socket to confirm it accepts connections.
    ///
    /// # Errors
    ///
    /// - [`DevicePluginError::Bind`] if the socket cannot be bound
    /// - [`DevicePluginError::Handshake`] if the socket is not reachable;
    ///   everything started so far is torn down
    pub async fn start(&mut self) -> Result<(), Report<DevicePluginError>> {
        let socket_path = self.socket_path();
        let bind_error = || DevicePluginError::Bind {
            path: socket_path.display().to_string(),
        };
        info!("start device plugin server: {}", socket_path.display());

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).change_context_lazy(bind_error),
        }
        let listener = UnixListener::bind(&socket_path).change_context_lazy(bind_error)?;

        let cancellation_token = CancellationToken::new();
        let (monitor, registry) = HealthMonitor::new(
            &self.config.host_path.path,
            self.config.health_check_interval,
            self.config.num_devices,
        );
        let service = DevicePluginService::new(
            registry,
            self.options,
            cancellation_token.clone(),
        );

        let server_token = cancellation_token.clone();
        let server_task = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    server_token.cancelled().await;
                    info!("shutting down gRPC server");
                })
                .await
        });
        let monitor_task = tokio::spawn(monitor.run(cancellation_token.clone()));

        self.running = Some(RunningServer {
            cancellation_token,
            server_task,
            monitor_task,
        });
        info!("gRPC server is bound to: {}", socket_path.display());

        if let Err(e) = dial(&socket_path, DIAL_TIMEOUT).await {
            let report = e.change_context(DevicePluginError::Handshake {
                path: socket_path.display().to_string(),
            });
            if let Err(stop_err) = self.stop().await {
                error!("failed to tear down after handshake failure: {stop_err:?}");
            }
            return Err(report);
        }

        self.state = ServerState::Bound;
        Ok(())
    }

    /// Registers this plugin with the kubelet listening on `kubelet_socket`.
    pub async fn register(
        &mut self,
        kubelet_socket: &Path,
        resource_name: &str,
    ) -> Result<(), Report<DevicePluginError>> {
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );
        let error = || DevicePluginError::Registration {
            endpoint: self.config.socket_name.clone(),
            resource_name: resource_name.to_string(),
        };

        let channel = dial(kubelet_socket, DIAL_TIMEOUT)
            .await
            .change_context_lazy(error)?;
        let mut client = RegistrationClient::new(channel);
        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.config.socket_name.clone(),
            resource_name: resource_name.to_string(),
            options: Some(self.options),
        };
        client
            .register(Request::new(request))
            .await
            .change_context_lazy(error)?;

        info!("successfully registered device plugin with kubelet");
        self.state = ServerState::Registered;
        Ok(())
    }

    /// Starts the server and registers it with the kubelet. A registration
    /// failure stops the server before the error is returned.
    pub async fn serve(&mut self) -> Result<(), Report<DevicePluginError>> {
        self.start().await?;

        let kubelet_socket = self.paths.kubelet_socket();
        let resource_name = self.config.resource_name.clone();
        if let Err(e) = self.register(&kubelet_socket, &resource_name).await {
            if let Err(stop_err) = self.stop().await {
                error!("failed to stop device plugin after registration failure: {stop_err:?}");
            }
            return Err(e);
        }

        info!(
            "device plugin for {} is serving on {}",
            resource_name,
            self.socket_path().display()
        );
        self.state = ServerState::Serving;
        Ok(())
    }

    /// Stops the server, the health monitor and every open stream, then
    /// removes the socket file. Calling it again, or on an instance that was
    /// never started, does nothing.
    pub async fn stop(&mut self) -> Result<(), Report<DevicePluginError>> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let socket_path = self.socket_path();
        info!("stopping device plugin server: {}", socket_path.display());

        running.cancellation_token.cancel();

        let abort_handle = running.server_task.abort_handle();
        match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, running.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {e}"),
            Ok(Err(e)) => warn!("gRPC server task failed: {e}"),
            Err(_) => {
                warn!("gRPC server did not stop within {SERVER_SHUTDOWN_TIMEOUT:?}, aborting");
                abort_handle.abort();
            }
        }
        if let Err(e) = running.monitor_task.await {
            warn!("health monitor task failed: {e}");
        }
        self.state = ServerState::Stopped;

        match std::fs::remove_file(&socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e).change_context(DevicePluginError::Stop {
                path: socket_path.display().to_string(),
            })),
        }
    }
}

/// `DevicePlugin` gRPC service backed by a [`DeviceRegistry`].
#[derive(Debug)]
pub struct DevicePluginService {
    registry: DeviceRegistry,
    options: DevicePluginOptions,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        registry: DeviceRegistry,
        options: DevicePluginOptions,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            options,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(self.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Emits the full device list now and again on every health change,
    /// until the server stops or the client goes away.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::channel(4);
        let registry = self.registry.clone();
        let mut health_rx = registry.subscribe();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut health = *health_rx.borrow_and_update();
            loop {
                let response = ListAndWatchResponse {
                    devices: registry.devices(health),
                };
                if let Err(e) = tx.send(Ok(response)).await {
                    error!("failed to send device list: {e}");
                    return;
                }

                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device watch task stopped");
                        return;
                    }
                    changed = health_rx.changed() => {
                        if changed.is_err() {
                            debug!("health publisher is gone, ending device watch");
                            return;
                        }
                        health = *health_rx.borrow_and_update();
                        debug!("re-sending device list with health {health}");
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.get_ref());
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    /// Every slot is interchangeable, the mount itself is injected by the
    /// admission webhook, so each container gets an empty response.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to container: {:?}", req);

        let container_responses = req
            .container_requests
            .iter()
            .map(|_| ContainerAllocateResponse::default())
            .collect();
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.get_ref());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
