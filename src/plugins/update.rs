// src/plugins/update.rs
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::api::types::ApiResult;
use crate::plugins::types::VersionInfo;
use crate::utils::error::{AgentError, Result};

pub const LATEST_VERSION_PATH: &str = "client/plugin/latest-version";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionApi: Send + Sync {
    async fn latest_version(&self, plugin_id: &str, app_version: i64) -> Result<VersionInfo>;
}

/// Operating system and architecture in the naming the update server expects.
pub fn platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    (os, arch)
}

pub struct HttpVersionApi {
    client: reqwest::Client,
    api_endpoint: String,
    timeout: Duration,
}

impl HttpVersionApi {
    pub fn new(client: reqwest::Client, api_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            api_endpoint: api_endpoint.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Bounds the whole request, body included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl VersionApi for HttpVersionApi {
    async fn latest_version(&self, plugin_id: &str, app_version: i64) -> Result<VersionInfo> {
        let (os, arch) = platform();
        let url = format!(
            "{}/{}",
            self.api_endpoint.trim_end_matches('/'),
            LATEST_VERSION_PATH
        );
        let app_version = app_version.to_string();
        let envelope: ApiResult<VersionInfo> = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .query(&[
                ("os", os),
                ("arch", arch),
                ("pluginId", plugin_id),
                ("appVersion", app_version.as_str()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AgentError::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| AgentError::Upstream(e.to_string()))?;

        envelope.into_body()
    }
}

struct CachedVersion {
    info: VersionInfo,
    fetched_at: Instant,
}

/// Latest-version answers per plugin id, valid for a fixed TTL.
pub struct VersionCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedVersion>>,
}

impl VersionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn fresh(&self, plugin_id: &str) -> Option<VersionInfo> {
        let entries = self.entries.lock();
        entries
            .get(plugin_id)
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.info.clone())
    }

    pub fn store(&self, plugin_id: &str, info: VersionInfo) {
        debug!(plugin = %plugin_id, version = info.latest_version(), "caching latest version");
        self.entries.lock().insert(
            plugin_id.to_string(),
            CachedVersion {
                info,
                fetched_at: Instant::now(),
            },
        );
    }
}
