//! Bundle download and extraction.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::utils::error::{AgentError, Result};

/// File name prefix of in-flight downloads in the temp directory.
pub const DOWNLOAD_PREFIX: &str = "fleetgate-bundle-";

pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[async_trait]
pub trait BundleInstaller: Send + Sync {
    /// Downloads `url` to a temp file, reporting `(total, current)` bytes.
    async fn download(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<PathBuf>;

    /// Unpacks `archive` into `dest`, creating directories with `mode`.
    async fn extract(&self, archive: &Path, dest: &Path, mode: u32) -> Result<()>;
}

pub struct HttpInstaller {
    client: reqwest::Client,
    temp_dir: PathBuf,
    stall_timeout: Duration,
}

impl HttpInstaller {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            temp_dir: std::env::temp_dir(),
            stall_timeout: Duration::from_secs(30),
        }
    }

    /// A download fails once the server sends nothing for `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    async fn fetch_into(&self, url: &str, path: &Path, on_progress: ProgressFn<'_>) -> Result<()> {
        let response = tokio::time::timeout(self.stall_timeout, self.client.get(url).send())
            .await
            .map_err(|_| self.stalled(url))?
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AgentError::DownloadFailed(e.to_string()))?;

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| AgentError::DownloadFailed(format!("{}: {}", path.display(), e)))?;
        let mut stream = response.bytes_stream();
        let mut current = 0u64;
        while let Some(chunk) = tokio::time::timeout(self.stall_timeout, stream.next())
            .await
            .map_err(|_| self.stalled(url))?
        {
            let chunk = chunk.map_err(|e| AgentError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AgentError::DownloadFailed(e.to_string()))?;
            current += chunk.len() as u64;
            on_progress(total, current);
        }
        file.flush()
            .await
            .map_err(|e| AgentError::DownloadFailed(e.to_string()))?;
        Ok(())
    }

    fn stalled(&self, url: &str) -> AgentError {
        AgentError::DownloadFailed(format!(
            "{}: no data received for {:?}",
            url, self.stall_timeout
        ))
    }
}

#[async_trait]
impl BundleInstaller for HttpInstaller {
    async fn download(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<PathBuf> {
        if url.is_empty() {
            return Err(AgentError::DownloadFailed("empty download url".into()));
        }
        let path = self
            .temp_dir
            .join(format!("{}{}.tmp", DOWNLOAD_PREFIX, Uuid::new_v4()));
        debug!(%url, path = %path.display(), "downloading bundle");

        if let Err(e) = self.fetch_into(url, &path, on_progress).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(path)
    }

    async fn extract(&self, archive: &Path, dest: &Path, mode: u32) -> Result<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || unzip(&archive, &dest, mode))
            .await
            .map_err(|e| AgentError::InstallFailed(format!("extract task: {}", e)))?
    }
}

fn unzip(archive: &Path, dest: &Path, mode: u32) -> Result<()> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    create_dir(dest, mode)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(name = entry.name(), "skipping bundle entry outside destination");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            create_dir(&out_path, mode)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            create_dir(parent, mode)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        if let Some(file_mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(file_mode & 0o7777))?;
        }
    }
    Ok(())
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)?;
    Ok(())
}

/// Deletes downloads left behind by an interrupted run.
pub async fn remove_stale_downloads(temp_dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(temp_dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(DOWNLOAD_PREFIX) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %entry.path().display(), error = %e, "could not remove stale download"),
        }
    }
    removed
}
