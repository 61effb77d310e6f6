use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hostpath_device_plugin::config::HostPathDeviceConfig;
use hostpath_device_plugin::deviceplugin::api::device_plugin_client::DevicePluginClient;
use hostpath_device_plugin::deviceplugin::api::registration_server::Registration;
use hostpath_device_plugin::deviceplugin::api::registration_server::RegistrationServer;
use hostpath_device_plugin::deviceplugin::api::AllocateRequest;
use hostpath_device_plugin::deviceplugin::api::ContainerAllocateRequest;
use hostpath_device_plugin::deviceplugin::api::Empty;
use hostpath_device_plugin::deviceplugin::api::RegisterRequest;
use hostpath_device_plugin::deviceplugin::dial;
use hostpath_device_plugin::deviceplugin::DevicePluginError;
use hostpath_device_plugin::deviceplugin::HostPathDevicePlugin;
use hostpath_device_plugin::deviceplugin::KubeletPaths;
use hostpath_device_plugin::deviceplugin::LifecycleEvent;
use hostpath_device_plugin::deviceplugin::PluginRunner;
use hostpath_device_plugin::deviceplugin::ProcessSignal;
use hostpath_device_plugin::deviceplugin::ServerState;
use hostpath_device_plugin::deviceplugin::DIAL_TIMEOUT;
use notify::event::CreateKind;
use notify::Event;
use notify::EventKind;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use test_log::test;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

const RESOURCE: &str = "test.org/test-resource";
const SOCKET_NAME: &str = "test-resource.sock";
const WAIT: Duration = Duration::from_secs(5);

/// Kubelet stand-in that records every registration.
struct FakeKubelet {
    registrations: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        let _ = self.registrations.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

struct Kubelet {
    registrations: mpsc::UnboundedReceiver<RegisterRequest>,
    cancellation_token: CancellationToken,
}

impl Kubelet {
    fn start(paths: &KubeletPaths) -> Self {
        let listener = UnixListener::bind(paths.kubelet_socket()).expect("should bind kubelet socket");
        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(FakeKubelet { registrations: tx }))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), token.cancelled())
                .await
        });
        Self {
            registrations: rx,
            cancellation_token,
        }
    }

    async fn next_registration(&mut self) -> RegisterRequest {
        tokio::time::timeout(WAIT, self.registrations.recv())
            .await
            .expect("registration should arrive in time")
            .expect("kubelet should be alive")
    }
}

impl Drop for Kubelet {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

fn config(host_path: &Path, num_devices: usize) -> Arc<HostPathDeviceConfig> {
    let raw = format!(
        r#"
resourceName: {RESOURCE}
socketName: {SOCKET_NAME}
hostPath:
  path: {}
volumeMount:
  mountPath: /mnt/device
numDevices: {num_devices}
healthCheckInterval: 50ms
"#,
        host_path.display()
    );
    Arc::new(HostPathDeviceConfig::from_yaml(&raw).expect("should load config"))
}

fn setup() -> (TempDir, KubeletPaths) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let paths = KubeletPaths::new(dir.path());
    (dir, paths)
}

async fn client(paths: &KubeletPaths) -> DevicePluginClient<tonic::transport::Channel> {
    let channel = dial(&paths.plugin_socket(SOCKET_NAME), DIAL_TIMEOUT)
        .await
        .expect("should dial plugin socket");
    DevicePluginClient::new(channel)
}

#[test(tokio::test)]
async fn serve_registers_with_kubelet() {
    let (dir, paths) = setup();
    let mut kubelet = Kubelet::start(&paths);

    let mut plugin = HostPathDevicePlugin::new(config(dir.path(), 4), paths.clone());
    assert_eq!(plugin.state(), ServerState::Created);
    plugin.serve().await.expect("should serve");
    assert_eq!(plugin.state(), ServerState::Serving);
    assert!(paths.plugin_socket(SOCKET_NAME).exists());

    let registration = kubelet.next_registration().await;
    assert_eq!(registration.version, "v1beta1");
    assert_eq!(registration.endpoint, SOCKET_NAME);
    assert_eq!(registration.resource_name, RESOURCE);
    let options = registration.options.expect("options should be sent");
    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn plugin_answers_device_plugin_calls() {
    let (dir, paths) = setup();
    let _kubelet = Kubelet::start(&paths);
    let mut plugin = HostPathDevicePlugin::new(config(dir.path(), 3), paths.clone());
    plugin.serve().await.expect("should serve");

    let mut client = client(&paths).await;
    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .expect("options should succeed")
        .into_inner();
    assert!(!options.pre_start_required);

    let allocation = client
        .allocate(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["0".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["1".to_string(), "2".to_string()],
                },
            ],
        })
        .await
        .expect("allocate should succeed")
        .into_inner();
    assert_eq!(allocation.container_responses.len(), 2);
    assert!(allocation
        .container_responses
        .iter()
        .all(|r| r.envs.is_empty() && r.mounts.is_empty() && r.devices.is_empty()));

    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list and watch should succeed")
        .into_inner();
    let first = stream
        .message()
        .await
        .expect("stream should be healthy")
        .expect("initial list should be sent");
    let ids: Vec<_> = first.devices.iter().map(|d| d.id.clone()).collect();
    assert_eq!(ids, vec!["0".to_string(), "1".to_string(), "2".to_string()]);
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    plugin.stop().await.expect("should stop");
    assert_eq!(plugin.state(), ServerState::Stopped);
    assert!(!paths.plugin_socket(SOCKET_NAME).exists());

    let next = tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("stream should end after stop");
    assert!(!matches!(next, Ok(Some(_))), "no list expected after stop");

    plugin.stop().await.expect("stop should be idempotent");
}

#[test(tokio::test)]
async fn health_follows_host_path() {
    let (dir, paths) = setup();
    let _kubelet = Kubelet::start(&paths);
    let host_path = dir.path().join("device");
    let mut plugin = HostPathDevicePlugin::new(config(&host_path, 2), paths.clone());
    plugin.serve().await.expect("should serve");

    let mut stream = client(&paths)
        .await
        .list_and_watch(Empty {})
        .await
        .expect("list and watch should succeed")
        .into_inner();
    let first = stream
        .message()
        .await
        .expect("stream should be healthy")
        .expect("initial list should be sent");
    assert!(first.devices.iter().all(|d| d.health == "Unhealthy"));

    std::fs::create_dir(&host_path).expect("should create host path");
    tokio::time::timeout(WAIT, async {
        loop {
            let list = stream
                .message()
                .await
                .expect("stream should be healthy")
                .expect("stream should stay open");
            if list.devices.iter().all(|d| d.health == "Healthy") {
                assert_eq!(list.devices.len(), 2);
                return;
            }
        }
    })
    .await
    .expect("devices should turn healthy");

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn failed_registration_tears_down() {
    let (dir, paths) = setup();
    let mut plugin = HostPathDevicePlugin::new(config(dir.path(), 1), paths.clone());

    let err = plugin.serve().await.expect_err("no kubelet to register with");
    assert!(matches!(
        err.current_context(),
        DevicePluginError::Registration { .. }
    ));
    assert_eq!(plugin.state(), ServerState::Stopped);
    assert!(!paths.plugin_socket(SOCKET_NAME).exists());
}

#[test(tokio::test)]
async fn runner_restarts_on_kubelet_restart_and_reload() {
    let (dir, paths) = setup();
    let mut kubelet = Kubelet::start(&paths);
    let (tx, rx) = mpsc::channel(16);
    let runner = tokio::spawn(PluginRunner::new(config(dir.path(), 1), paths.clone()).run(rx));

    kubelet.next_registration().await;

    let created = Event::new(EventKind::Create(CreateKind::File)).add_path(paths.kubelet_socket());
    tx.send(LifecycleEvent::PluginDir(created))
        .await
        .expect("runner should be alive");
    let registration = kubelet.next_registration().await;
    assert_eq!(registration.resource_name, RESOURCE);

    // unrelated files do not restart the plugin
    let other = Event::new(EventKind::Create(CreateKind::File)).add_path(dir.path().join("other.sock"));
    tx.send(LifecycleEvent::PluginDir(other))
        .await
        .expect("runner should be alive");

    tx.send(LifecycleEvent::Signal(ProcessSignal::Hangup))
        .await
        .expect("runner should be alive");
    kubelet.next_registration().await;
    assert!(kubelet.registrations.try_recv().is_err());

    tx.send(LifecycleEvent::Signal(ProcessSignal::Terminate))
        .await
        .expect("runner should be alive");
    tokio::time::timeout(WAIT, runner)
        .await
        .expect("runner should exit")
        .expect("runner task should not panic")
        .expect("runner should stop cleanly");
    assert!(!paths.plugin_socket(SOCKET_NAME).exists());
}

#[test(tokio::test)]
async fn runner_exits_when_events_close() {
    let (dir, paths) = setup();
    let mut kubelet = Kubelet::start(&paths);
    let (tx, rx) = mpsc::channel(1);
    let runner = tokio::spawn(PluginRunner::new(config(dir.path(), 1), paths.clone()).run(rx));

    kubelet.next_registration().await;
    drop(tx);

    tokio::time::timeout(WAIT, runner)
        .await
        .expect("runner should exit")
        .expect("runner task should not panic")
        .expect("runner should stop cleanly");
    assert!(!paths.plugin_socket(SOCKET_NAME).exists());
}

/// Replaces the plugin socket with a non-empty directory so it cannot be
/// removed on stop.
fn block_socket_removal(paths: &KubeletPaths) {
    let socket = paths.plugin_socket(SOCKET_NAME);
    std::fs::remove_file(&socket).expect("should remove plugin socket");
    std::fs::create_dir(&socket).expect("should create directory at socket path");
    std::fs::write(socket.join("pinned"), b"").expect("should pin directory");
}

#[test(tokio::test)]
async fn stop_reports_socket_cleanup_failure() {
    let (dir, paths) = setup();
    let _kubelet = Kubelet::start(&paths);
    let mut plugin = HostPathDevicePlugin::new(config(dir.path(), 1), paths.clone());
    plugin.serve().await.expect("should serve");

    block_socket_removal(&paths);
    let err = plugin.stop().await.expect_err("socket removal should fail");
    assert!(matches!(err.current_context(), DevicePluginError::Stop { .. }));
    assert_eq!(plugin.state(), ServerState::Stopped);
}

#[test(tokio::test)]
async fn runner_retries_failed_start_on_next_event() {
    let (dir, paths) = setup();
    // capacity 1: the second send completes only once the runner has taken
    // the first event, which happens after its first start attempt
    let (tx, rx) = mpsc::channel(1);
    let runner = tokio::spawn(PluginRunner::new(config(dir.path(), 1), paths.clone()).run(rx));

    let unrelated = || {
        LifecycleEvent::PluginDir(
            Event::new(EventKind::Create(CreateKind::File)).add_path(dir.path().join("other.sock")),
        )
    };
    tx.send(unrelated()).await.expect("runner should be alive");
    tokio::time::timeout(WAIT, tx.send(unrelated()))
        .await
        .expect("runner should consume events")
        .expect("runner should be alive");
    assert!(!runner.is_finished(), "a failed start must not stop the runner");

    let mut kubelet = Kubelet::start(&paths);
    let created = Event::new(EventKind::Create(CreateKind::File)).add_path(paths.kubelet_socket());
    tx.send(LifecycleEvent::PluginDir(created))
        .await
        .expect("runner should be alive");
    let registration = kubelet.next_registration().await;
    assert_eq!(registration.resource_name, RESOURCE);

    tx.send(LifecycleEvent::Signal(ProcessSignal::Terminate))
        .await
        .expect("runner should be alive");
    tokio::time::timeout(WAIT, runner)
        .await
        .expect("runner should exit")
        .expect("runner task should not panic")
        .expect("runner should stop cleanly");
}

#[test(tokio::test)]
async fn runner_fails_when_previous_instance_cannot_stop() {
    let (dir, paths) = setup();
    let mut kubelet = Kubelet::start(&paths);
    let (tx, rx) = mpsc::channel(16);
    let runner = tokio::spawn(PluginRunner::new(config(dir.path(), 1), paths.clone()).run(rx));
    kubelet.next_registration().await;

    block_socket_removal(&paths);
    tx.send(LifecycleEvent::Signal(ProcessSignal::Hangup))
        .await
        .expect("runner should be alive");

    let err = tokio::time::timeout(WAIT, runner)
        .await
        .expect("runner should exit")
        .expect("runner task should not panic")
        .expect_err("stop failure should be fatal");
    assert!(matches!(err.current_context(), DevicePluginError::Stop { .. }));
    assert!(kubelet.registrations.try_recv().is_err());
}
