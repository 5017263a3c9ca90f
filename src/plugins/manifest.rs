use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::plugins::types::Manifest;
use crate::utils::error::{AgentError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Plugin ids name directories under the plugin root, so only plain
/// `[A-Za-z0-9._-]` names are accepted.
pub fn is_valid_plugin_id(plugin_id: &str) -> bool {
    !plugin_id.is_empty()
        && plugin_id != "."
        && plugin_id != ".."
        && plugin_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Reads plugin manifests from `<root>/<id>/manifest.json`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id)
    }

    pub async fn read_manifest(&self, dir: &Path) -> Result<Manifest> {
        let path = dir.join(MANIFEST_FILE);
        parse_manifest(dir, &path, tokio::fs::read_to_string(&path).await)
    }

    /// Manifest of `plugin_id`, rejecting a bundle that declares another id.
    pub async fn manifest_for(&self, plugin_id: &str) -> Result<Manifest> {
        if !is_valid_plugin_id(plugin_id) {
            return Err(AgentError::NotFound(plugin_id.to_string()));
        }
        let manifest = self.read_manifest(&self.plugin_dir(plugin_id)).await?;
        if manifest.id != plugin_id {
            warn!(plugin = %plugin_id, declared = %manifest.id, "manifest id mismatch");
            return Err(AgentError::NotFound(plugin_id.to_string()));
        }
        Ok(manifest)
    }

    /// Scans every subdirectory of the root. Unreadable entries are logged and
    /// skipped; only failing to read the root itself is an error.
    ///
    /// Blocking; async callers go through [`ManifestStore::scan`].
    pub fn list_manifests(&self) -> Result<HashMap<String, Manifest>> {
        let mut manifests = HashMap::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable plugin directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join(MANIFEST_FILE);
            match parse_manifest(&path, &manifest_path, std::fs::read_to_string(&manifest_path)) {
                Ok(manifest) if entry.file_name().to_str() != Some(manifest.id.as_str()) => {
                    warn!(path = %path.display(), declared = %manifest.id, "skipping plugin stored under another id");
                }
                Ok(manifest) => {
                    debug!(plugin = %manifest.id, version = manifest.version, "discovered plugin");
                    manifests.insert(manifest.id.clone(), manifest);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping plugin"),
            }
        }
        Ok(manifests)
    }

    /// [`ManifestStore::list_manifests`] on the blocking pool.
    pub async fn scan(&self) -> Result<HashMap<String, Manifest>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_manifests())
            .await
            .map_err(|e| AgentError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

fn parse_manifest(dir: &Path, path: &Path, read: io::Result<String>) -> Result<Manifest> {
    let raw = match read {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let id = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(AgentError::NotFound(id));
        }
        Err(err) => return Err(err.into()),
    };
    let manifest: Manifest = serde_json::from_str(&raw)
        .map_err(|e| AgentError::Manifest(format!("{}: {}", path.display(), e)))?;
    if manifest.id.is_empty() {
        return Err(AgentError::Manifest(format!(
            "{}: missing plugin id",
            path.display()
        )));
    }
    Ok(manifest)
}
