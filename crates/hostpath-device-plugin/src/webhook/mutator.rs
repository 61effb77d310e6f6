use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::admission::Operation;
use tracing::debug;
use tracing::info;

use crate::config::HostPathDeviceConfig;

/// A pod declares its own hostPath volume on (or under) the managed path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Forbid to declare a volume with hostPath.path={path}. Request {resource_name} resource instead")]
pub struct ConflictError {
    pub path: String,
    pub resource_name: String,
}

/// Injects the configured hostPath volume into pods requesting the resource.
#[derive(Debug, Clone)]
pub struct HostPathMutator {
    config: Arc<HostPathDeviceConfig>,
}

impl HostPathMutator {
    pub fn new(config: Arc<HostPathDeviceConfig>) -> Self {
        Self { config }
    }

    /// Returns the pod to admit. Only CREATE is mutated.
    ///
    /// # Errors
    ///
    /// [`ConflictError`] if the pod already mounts the managed host path or
    /// anything below it, whether or not it requests the resource.
    pub fn mutate(&self, operation: &Operation, mut pod: Pod) -> Result<Pod, ConflictError> {
        if !matches!(operation, Operation::Create) {
            return Ok(pod);
        }
        if let Some(spec) = pod.spec.as_mut() {
            self.mutate_spec(spec)?;
        }
        Ok(pod)
    }

    fn mutate_spec(&self, spec: &mut PodSpec) -> Result<(), ConflictError> {
        self.check_conflict(spec)?;

        let resource_name = &self.config.resource_name;
        let volume_name = self.config.volume_name();
        let mount = self.config.volume_mount(&volume_name);

        let mut injected = 0usize;
        let init_containers = spec.init_containers.iter_mut().flatten();
        for container in init_containers.chain(spec.containers.iter_mut()) {
            if requests_resource(container, resource_name) {
                debug!("injecting {} into container {}", volume_name, container.name);
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(mount.clone());
                injected += 1;
            }
        }

        if injected > 0 {
            spec.volumes
                .get_or_insert_with(Vec::new)
                .push(self.config.host_path_volume(&volume_name));
            info!(
                "mounted {} into {} container(s) requesting {}",
                self.config.host_path.path, injected, resource_name
            );
        }
        Ok(())
    }

    fn check_conflict(&self, spec: &PodSpec) -> Result<(), ConflictError> {
        let managed = Path::new(&self.config.host_path.path);
        let conflict = spec
            .volumes
            .iter()
            .flatten()
            .filter_map(|volume| volume.host_path.as_ref())
            .find(|host_path| Path::new(&host_path.path).starts_with(managed));

        match conflict {
            Some(host_path) => {
                debug!("volume path {} overlaps {}", host_path.path, managed.display());
                // the denial names the managed path, not the pod's own one
                Err(ConflictError {
                    path: self.config.host_path.path.clone(),
                    resource_name: self.config.resource_name.clone(),
                })
            }
            None => Ok(()),
        }
    }
}

fn requests_resource(container: &Container, resource_name: &str) -> bool {
    let Some(resources) = container.resources.as_ref() else {
        return false;
    };
    [resources.requests.as_ref(), resources.limits.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|list| list.get(resource_name))
        .any(is_nonzero_quantity)
}

/// Extended resources are integers, so the numeric prefix decides. Anything
/// that does not parse is treated as a request.
fn is_nonzero_quantity(quantity: &Quantity) -> bool {
    let raw = quantity.0.trim();
    let numeric_len = raw
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(raw.len());
    match raw[..numeric_len].parse::<f64>() {
        Ok(value) => value != 0.0,
        Err(_) => true,
    }
}
