use std::sync::LazyLock;

use serde::Serialize;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        revision(),
        if BUILD_INFO.is_dirty() { "-dirty" } else { "" }
    )
});

/// Version report printed by the `version` subcommand.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    pub version: &'static str,
    pub revision: &'static str,
}

pub fn revision() -> &'static str {
    BUILD_INFO.commit_sha1.unwrap_or("unknown")
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("IMAGE_VERSION"),
        revision: revision(),
    }
}
