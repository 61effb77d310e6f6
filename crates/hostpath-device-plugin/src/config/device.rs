use core::error::Error;
use std::path::Path;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::HostPathVolumeSource;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use serde::Deserialize;
use serde::Deserializer;

/// Interval used when `healthCheckInterval` is missing or zero.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

const VOLUME_NAME_PREFIX: &str = "hostpath-device-volume-";

/// Errors raised while loading the configuration document.
#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("Failed to read config file {path}")]
    Read { path: String },
    #[display("Failed to parse config file")]
    Parse,
    #[display("Failed to validate config")]
    Validation,
}

impl Error for ConfigError {}

/// Configuration shared by the device plugin and the admission webhook.
///
/// Both subsystems must agree on `resource_name`, `host_path` and
/// `volume_mount`: the plugin advertises `num_devices` slots of the resource
/// and the webhook injects the mount for every container requesting it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPathDeviceConfig {
    /// extended resource name served by the plugin, e.g. `vendor.io/device`
    #[serde(default)]
    pub resource_name: String,
    /// file name of the plugin socket inside the kubelet device plugin directory
    #[serde(default)]
    pub socket_name: String,
    /// host path exposed to containers; also the target of the health probe
    #[serde(default)]
    pub host_path: HostPathVolumeSource,
    /// how the host path is mounted into containers, the name is derived
    #[serde(default)]
    pub volume_mount: VolumeMountSpec,
    /// number of interchangeable device slots advertised to the kubelet
    #[serde(default)]
    pub num_devices: usize,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub health_check_interval: Duration,
}

/// Container side of the injected mount. It mirrors the Kubernetes
/// `VolumeMount` without the name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    #[serde(default)]
    pub mount_path: String,
    #[serde(default)]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub sub_path_expr: Option<String>,
    #[serde(default)]
    pub mount_propagation: Option<String>,
}

impl HostPathDeviceConfig {
    /// Reads, parses and validates the config file at `path`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::Parse`] if the document is malformed
    /// - [`ConfigError::Validation`] if a required field is missing or invalid
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let raw = std::fs::read_to_string(path).change_context(ConfigError::Read {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&raw).attach_printable_lazy(|| format!("config file: {}", path.display()))
    }

    /// Parses and validates a YAML (or JSON) config document.
    pub fn from_yaml(raw: &str) -> Result<Self, Report<ConfigError>> {
        let mut config: Self = serde_yaml::from_str(raw).change_context(ConfigError::Parse)?;
        config.validate()?;
        if config.health_check_interval.is_zero() {
            config.health_check_interval = DEFAULT_HEALTH_CHECK_INTERVAL;
        }
        Ok(config)
    }

    /// Checks every rule and reports all violations at once.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let mut violations = Vec::new();
        if self.resource_name.is_empty() {
            violations.push("resourceName is required");
        }
        if self.socket_name.is_empty() {
            violations.push("socketName is required");
        }
        if self.host_path.path.is_empty() {
            violations.push("hostPath.path is required");
        }
        if self.volume_mount.mount_path.is_empty() {
            violations.push("volumeMount.mountPath is required");
        }
        if self.num_devices < 1 {
            violations.push("numDevices must be at least 1");
        }

        match violations.split_first() {
            None => Ok(()),
            Some((first, rest)) => {
                let mut report = Report::new(ConfigError::Validation).attach_printable(*first);
                for violation in rest {
                    report = report.attach_printable(*violation);
                }
                Err(report)
            }
        }
    }

    /// Name shared by the injected volume and its mounts.
    pub fn volume_name(&self) -> String {
        derive_volume_name(&self.resource_name)
    }

    /// Volume mount injected into every container requesting the resource.
    pub fn volume_mount(&self, name: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: self.volume_mount.mount_path.clone(),
            read_only: self.volume_mount.read_only,
            sub_path: self.volume_mount.sub_path.clone(),
            sub_path_expr: self.volume_mount.sub_path_expr.clone(),
            mount_propagation: self.volume_mount.mount_propagation.clone(),
            ..Default::default()
        }
    }

    /// Pod volume backing the injected mounts.
    pub fn host_path_volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            host_path: Some(self.host_path.clone()),
            ..Default::default()
        }
    }
}

/// Derives the volume name from a resource name, replacing `.` and `/`
/// so the result is a valid DNS label fragment.
pub fn derive_volume_name(resource_name: &str) -> String {
    let normalized: String = resource_name
        .chars()
        .map(|c| if matches!(c, '.' | '/') { '-' } else { c })
        .collect();
    format!("{VOLUME_NAME_PREFIX}{normalized}")
}

/// Accepts a Go style duration string (`"10s"`, `"1m30s"`) or an integer
/// number of nanoseconds, which is how Go serializes `time.Duration`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NanosOrString {
        Nanos(u64),
        String(String),
    }

    match NanosOrString::deserialize(deserializer)? {
        NanosOrString::Nanos(nanos) => Ok(Duration::from_nanos(nanos)),
        NanosOrString::String(s) => parse_go_duration(&s).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn parse_go_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{input}': expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail.find(is_number).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let value: f64 = number
            .parse()
            .map_err(|e| format!("invalid duration '{input}': {e}"))?;
        let seconds_per_unit = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("invalid duration '{input}': missing unit")),
            other => return Err(format!("invalid duration '{input}': unknown unit '{other}'")),
        };
        total += Duration::try_from_secs_f64(value * seconds_per_unit)
            .map_err(|e| format!("invalid duration '{input}': {e}"))?;
        rest = tail;
    }
    Ok(total)
}
