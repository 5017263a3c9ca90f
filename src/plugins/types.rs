// src/plugins/types.rs
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginStatus {
    NotStarted,
    Starting,
    Running,
    Downloading,
    DownloadFailed,
    InstallFailed,
}

impl PluginStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, PluginStatus::DownloadFailed | PluginStatus::InstallFailed)
    }
}

/// Declarative metadata shipped in every plugin bundle as `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    #[serde(alias = "pluginId")]
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: i64,
    pub version_name: String,
    #[serde(alias = "execEnter")]
    pub exec_entry: String,
    pub auto_exit: bool,
    /// Only set by a running child announcing itself during registration.
    pub endpoint: String,
}

/// Latest release as reported by the upstream version API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
    pub manifest: Manifest,
    pub plugin_id: String,
    pub version: i64,
    pub version_name: String,
    pub update_description: String,
    pub total_size: u64,
    pub download_url: String,
}

impl VersionInfo {
    pub fn latest_version(&self) -> i64 {
        self.manifest.version.max(self.version)
    }
}

/// Point-in-time copy of a plugin record, safe to serialize and hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: i64,
    pub version_name: String,
    pub exec_entry: String,
    pub status: PluginStatus,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub error_msg: String,
    pub endpoint: String,
    pub plugin_dir: PathBuf,
    pub auto_exit: bool,
    pub connections: i64,
    pub last_conn_time: i64,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUpdateResult {
    pub plugin_info: Option<PluginInfo>,
    pub installed: bool,
    pub first_installed: bool,
}
