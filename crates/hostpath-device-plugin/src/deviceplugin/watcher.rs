//! Event sources feeding the [`PluginRunner`](super::PluginRunner).

use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::DevicePluginError;
use super::LifecycleEvent;
use super::ProcessSignal;

/// Watches `dir` (non-recursively) and forwards every notification or watch
/// error to `tx`. Events stop when the returned watcher is dropped.
pub fn watch_plugin_dir(
    dir: &Path,
    tx: mpsc::Sender<LifecycleEvent>,
) -> Result<RecommendedWatcher, Report<DevicePluginError>> {
    let error = || DevicePluginError::Watch {
        path: dir.display().to_string(),
    };

    // notify calls back on its own thread, outside the runtime
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => {
                    debug!("filesystem event: {:?}", event);
                    LifecycleEvent::PluginDir(event)
                }
                Err(e) => LifecycleEvent::WatchError(e),
            };
            let _ = tx.blocking_send(event);
        },
        Config::default(),
    )
    .change_context_lazy(error)?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .change_context_lazy(error)?;
    Ok(watcher)
}

/// Installs handlers for SIGHUP, SIGINT, SIGTERM and SIGQUIT and forwards
/// them to `tx` until the receiver is gone.
pub fn forward_signals(
    tx: mpsc::Sender<LifecycleEvent>,
) -> Result<JoinHandle<()>, Report<DevicePluginError>> {
    let mut hangup = signal(SignalKind::hangup()).change_context(DevicePluginError::Signal)?;
    let mut interrupt =
        signal(SignalKind::interrupt()).change_context(DevicePluginError::Signal)?;
    let mut terminate =
        signal(SignalKind::terminate()).change_context(DevicePluginError::Signal)?;
    let mut quit = signal(SignalKind::quit()).change_context(DevicePluginError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = hangup.recv() => ProcessSignal::Hangup,
                Some(()) = interrupt.recv() => ProcessSignal::Interrupt,
                Some(()) = terminate.recv() => ProcessSignal::Terminate,
                Some(()) = quit.recv() => ProcessSignal::Quit,
                else => return,
            };
            debug!("received {received}");
            if tx.send(LifecycleEvent::Signal(received)).await.is_err() {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use notify::EventKind;
    use test_log::test;

    use super::*;

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn socket_creation_is_forwarded() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (tx, mut rx) = mpsc::channel(16);
        let _watcher = watch_plugin_dir(dir.path(), tx).expect("should watch temp dir");

        let socket = dir.path().join("kubelet.sock");
        std::fs::write(&socket, b"").expect("should create file");

        let created = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if let LifecycleEvent::PluginDir(event) = event {
                    if matches!(event.kind, EventKind::Create(_))
                        && event.paths.iter().any(|p| p.ends_with("kubelet.sock"))
                    {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .expect("create event should arrive");
        assert!(created);
    }

    #[test]
    fn watching_missing_dir_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let err = watch_plugin_dir(Path::new("/nonexistent/device-plugins"), tx)
            .expect_err("missing dir should fail");
        assert!(matches!(err.current_context(), DevicePluginError::Watch { .. }));
    }
}
