//! Lifecycle orchestration: start, stop, drain, install, update and
//! uninstall of plugins, each serialized on the plugin's record lock.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::network::transport::{PluginTransport, KILL_URI, PING_URI};
use crate::plugins::installer::BundleInstaller;
use crate::plugins::launcher::{supervise, ProcessLauncher};
use crate::plugins::manifest::{is_valid_plugin_id, ManifestStore};
use crate::plugins::registry::{PluginRecord, PluginRegistry};
use crate::plugins::types::{CheckUpdateResult, Manifest, PluginStatus, VersionInfo};
use crate::plugins::update::{VersionApi, VersionCache};
use crate::utils::error::{AgentError, Result};

/// Directory mode for unpacked bundles.
const PLUGIN_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Kill/probe rounds before a drain gives up.
    pub drain_attempts: u32,
    pub drain_interval: Duration,
    /// Pause between a drained plugin and deleting its directory.
    pub uninstall_settle: Duration,
    /// Pause before restarting a plugin that was not running.
    pub restart_delay: Duration,
    pub version_cache_ttl: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            drain_attempts: 25,
            drain_interval: Duration::from_millis(100),
            uninstall_settle: Duration::from_millis(500),
            restart_delay: Duration::from_millis(250),
            version_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Values handed to every launched plugin on its command line.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub token: String,
    pub namespace: String,
    pub api_endpoint: String,
    pub master_port: u16,
    pub debug: bool,
}

impl LaunchContext {
    pub fn args(&self) -> Vec<String> {
        vec![
            format!("-token={}", self.token),
            format!("-namespace={}", self.namespace),
            format!("-apiEndpoint={}", self.api_endpoint),
            format!("-masterPort={}", self.master_port),
            format!("-debug={}", self.debug),
        ]
    }
}

/// Side-effecting dependencies of the supervisor.
pub struct Collaborators {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub transport: Arc<dyn PluginTransport>,
    pub installer: Arc<dyn BundleInstaller>,
    pub versions: Arc<dyn VersionApi>,
}

pub struct PluginSupervisor {
    registry: Arc<PluginRegistry>,
    manifests: ManifestStore,
    launcher: Arc<dyn ProcessLauncher>,
    transport: Arc<dyn PluginTransport>,
    installer: Arc<dyn BundleInstaller>,
    versions: Arc<dyn VersionApi>,
    version_cache: VersionCache,
    launch: LaunchContext,
    settings: SupervisorSettings,
    generation: AtomicU64,
}

impl PluginSupervisor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        collaborators: Collaborators,
        launch: LaunchContext,
        settings: SupervisorSettings,
    ) -> Self {
        let manifests = ManifestStore::new(registry.plugins_dir());
        Self {
            registry,
            manifests,
            launcher: collaborators.launcher,
            transport: collaborators.transport,
            installer: collaborators.installer,
            versions: collaborators.versions,
            version_cache: VersionCache::new(settings.version_cache_ttl),
            launch,
            settings,
            generation: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Registers every installed bundle and resets states an earlier run
    /// left mid-transition. Returns the number of plugins found.
    pub async fn load_installed(&self) -> Result<usize> {
        tokio::fs::create_dir_all(self.manifests.root()).await?;
        let manifests = self.manifests.scan().await?;
        for manifest in manifests.values() {
            self.registry.upsert_from_manifest(manifest);
        }
        let reset = self.registry.reconcile();
        info!(
            plugins = manifests.len(),
            reset,
            root = %self.manifests.root().display(),
            "loaded installed plugins"
        );
        Ok(manifests.len())
    }

    pub async fn ping(&self, record: &PluginRecord) -> Result<()> {
        self.transport
            .post(record.id(), &record.endpoint(), PING_URI)
            .await
    }

    pub async fn start_plugin(&self, plugin_id: &str) -> Result<()> {
        if let Some(record) = self.registry.get(plugin_id) {
            let _guard = record.lock().await;
            if self.already_live(&record).await {
                return Ok(());
            }
        }

        let manifest = self.manifests.manifest_for(plugin_id).await?;
        let (record, _guard) = self.lock_current(&manifest).await;
        record.refresh(&manifest);
        // another caller may have launched it while we read the manifest
        if self.already_live(&record).await {
            return Ok(());
        }
        self.launch(&record)
    }

    /// Locks the registered record for `manifest.id`, creating it on first
    /// sight. A record uninstalled while we waited is left behind and its
    /// successor is locked instead.
    async fn lock_current(&self, manifest: &Manifest) -> (Arc<PluginRecord>, OwnedMutexGuard<()>) {
        loop {
            let record = match self.registry.get(&manifest.id) {
                Some(record) => record,
                None => self.registry.upsert_from_manifest(manifest),
            };
            let guard = record.lock().await;
            if self.registry.is_current(&record) {
                return (record, guard);
            }
            debug!(plugin = %manifest.id, "record removed while waiting, retrying");
        }
    }

    async fn already_live(&self, record: &PluginRecord) -> bool {
        match record.status() {
            PluginStatus::Starting => {
                debug!(plugin = %record.id(), "plugin is already starting");
                true
            }
            PluginStatus::Running => match self.ping(record).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(plugin = %record.id(), error = %e, "running plugin does not answer, relaunching");
                    false
                }
            },
            _ => false,
        }
    }

    fn launch(&self, record: &Arc<PluginRecord>) -> Result<()> {
        let exec_entry = record.exec_entry();
        if exec_entry.is_empty() {
            return Err(AgentError::Launch(format!(
                "plugin {} declares no entrypoint",
                record.id()
            )));
        }
        if let Some(previous) = record.detach_process() {
            debug!(plugin = %record.id(), pid = ?previous.pid(), "killing previous process");
            previous.force_kill();
        }
        record.clear_endpoint();
        record.set_status(PluginStatus::Starting);

        let program = record.plugin_dir().join(&exec_entry);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match self
            .launcher
            .spawn(&program, &self.launch.args(), record.plugin_dir())
        {
            Ok(child) => {
                info!(plugin = %record.id(), pid = ?child.pid(), program = %program.display(), "plugin launched");
                supervise(Arc::clone(record), child, generation);
                Ok(())
            }
            Err(e) => {
                record.set_status(PluginStatus::NotStarted);
                Err(e)
            }
        }
    }

    pub async fn stop_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| AgentError::NotRunning(plugin_id.to_string()))?;
        let _guard = record.lock().await;
        self.stop_locked(&record).await
    }

    /// Best-effort kill request. The record always ends up `NotStarted`,
    /// even when the child cannot be reached.
    async fn stop_locked(&self, record: &PluginRecord) -> Result<()> {
        let endpoint = record.endpoint();
        if endpoint.is_empty() {
            if record.status() == PluginStatus::Starting {
                if let Some(handle) = record.detach_process() {
                    info!(plugin = %record.id(), pid = ?handle.pid(), "killing plugin that never registered");
                    handle.force_kill();
                }
                record.set_status(PluginStatus::NotStarted);
            }
            return Err(AgentError::NotRunning(record.id().to_string()));
        }

        let result = self.transport.post(record.id(), &endpoint, KILL_URI).await;
        record.set_status(PluginStatus::NotStarted);
        match &result {
            Ok(()) => info!(plugin = %record.id(), "stop requested"),
            Err(e) => warn!(plugin = %record.id(), error = %e, "stop request failed"),
        }
        result
    }

    pub async fn restart_plugin(&self, plugin_id: &str) -> Result<()> {
        match self.stop_plugin(plugin_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_running() => {
                debug!(plugin = %plugin_id, "restart of a stopped plugin");
                tokio::time::sleep(self.settings.restart_delay).await;
            }
            Err(e) => warn!(plugin = %plugin_id, error = %e, "stop before restart failed"),
        }
        self.start_plugin(plugin_id).await
    }

    /// Repeats kill requests until the plugin stops answering pings.
    /// The caller must hold the record lock.
    pub async fn wait_stop_plugin(&self, record: &PluginRecord) -> Result<()> {
        for _ in 0..self.settings.drain_attempts {
            if self.ping(record).await.is_err() {
                self.release_unreachable(record);
                return Ok(());
            }
            if let Err(e) = self.stop_locked(record).await {
                debug!(plugin = %record.id(), error = %e, "drain kill failed");
            }
            tokio::time::sleep(self.settings.drain_interval).await;
        }
        if self.ping(record).await.is_err() {
            self.release_unreachable(record);
            return Ok(());
        }
        warn!(plugin = %record.id(), attempts = self.settings.drain_attempts, "plugin still answers after kill");
        Err(AgentError::StopFailed(record.id().to_string()))
    }

    /// The plugin no longer answers: drop any process we still own so its
    /// files can be replaced.
    fn release_unreachable(&self, record: &PluginRecord) {
        if let Some(handle) = record.detach_process() {
            debug!(plugin = %record.id(), pid = ?handle.pid(), "force killing drained process");
            handle.force_kill();
        }
        if matches!(
            record.status(),
            PluginStatus::Running | PluginStatus::Starting
        ) {
            record.set_status(PluginStatus::NotStarted);
        }
    }

    /// Downloads and unpacks `latest` over the plugin's directory.
    ///
    /// Concurrent callers for the same id perform a single download: a
    /// caller that finds another install finished while it waited for the
    /// lock returns without touching the filesystem.
    pub async fn install_plugin(&self, latest: &VersionInfo, manifest: &Manifest) -> Result<()> {
        if !is_valid_plugin_id(&manifest.id) {
            return Err(AgentError::NotFound(manifest.id.clone()));
        }
        // an existing record keeps its installed version until the new
        // bundle is unpacked
        let (record, _guard, before) = loop {
            let before = self
                .registry
                .get(&manifest.id)
                .map(|record| (record.version(), record.status(), record.install_seq()));
            let record = match self.registry.get(&manifest.id) {
                Some(record) => record,
                None => self.registry.upsert_from_manifest(manifest),
            };
            let guard = record.lock().await;
            if self.registry.is_current(&record) {
                break (record, guard, before);
            }
            debug!(plugin = %manifest.id, "plugin uninstalled while waiting, installing afresh");
        };
        self.wait_stop_plugin(&record).await?;

        if record.status() == PluginStatus::Downloading {
            return Ok(());
        }
        let seen_seq = before.map_or(0, |(_, _, seq)| seq);
        if record.install_seq() != seen_seq {
            debug!(plugin = %record.id(), "install finished by a concurrent caller");
            return Ok(());
        }
        if let Some((version, status, _)) = before {
            if version >= latest.latest_version() && !status.is_failure() {
                debug!(plugin = %record.id(), version, "already up to date");
                return Ok(());
            }
        }

        record.begin_download(latest.total_size);
        info!(
            plugin = %record.id(),
            version = latest.latest_version(),
            url = %latest.download_url,
            "installing plugin"
        );

        let on_progress = |total: u64, current: u64| record.set_progress(total, current);
        let archive = match self
            .installer
            .download(&latest.download_url, &on_progress)
            .await
        {
            Ok(archive) => archive,
            Err(e) => {
                let message = failure_message(&e);
                warn!(plugin = %record.id(), error = %message, "bundle download failed");
                record.fail_install(PluginStatus::DownloadFailed, message.clone());
                return Err(AgentError::DownloadFailed(message));
            }
        };

        let unpacked = self.unpack(&record, &archive).await;
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            debug!(path = %archive.display(), error = %e, "could not remove downloaded bundle");
        }

        match unpacked {
            Ok(()) => {
                record.finish_install();
                info!(plugin = %record.id(), version = record.version(), "plugin installed");
                Ok(())
            }
            Err(e) => {
                let message = failure_message(&e);
                warn!(plugin = %record.id(), error = %message, "bundle install failed");
                record.fail_install(PluginStatus::InstallFailed, message.clone());
                if let Err(e) = remove_dir(record.plugin_dir()).await {
                    warn!(plugin = %record.id(), error = %e, "could not clean up failed install");
                }
                Err(AgentError::InstallFailed(message))
            }
        }
    }

    async fn unpack(&self, record: &PluginRecord, archive: &Path) -> Result<()> {
        remove_dir(record.plugin_dir()).await?;
        self.installer
            .extract(archive, record.plugin_dir(), PLUGIN_DIR_MODE)
            .await?;

        let installed = self.manifests.read_manifest(record.plugin_dir()).await?;
        if installed.id != record.id() {
            return Err(AgentError::InstallFailed(format!(
                "bundle declares plugin id {}",
                installed.id
            )));
        }
        record.refresh(&installed);
        Ok(())
    }

    /// Installs the latest release when the plugin is missing, outdated or
    /// left in a failed install.
    pub async fn check_update(&self, plugin_id: &str, app_version: i64) -> Result<CheckUpdateResult> {
        if !is_valid_plugin_id(plugin_id) {
            return Err(AgentError::NotFound(plugin_id.to_string()));
        }
        let latest = self.latest_version(plugin_id, app_version).await?;
        let mut manifest = latest.manifest.clone();
        if manifest.id.is_empty() {
            manifest.id = plugin_id.to_string();
        } else if manifest.id != plugin_id {
            return Err(AgentError::Upstream(format!(
                "latest version of {} describes plugin {}",
                plugin_id, manifest.id
            )));
        }

        let existing = self.registry.get(plugin_id);
        let outdated = existing.as_ref().map_or(true, |record| {
            record.status().is_failure() || record.version() < latest.latest_version()
        });

        if outdated {
            self.install_plugin(&latest, &manifest).await?;
        }

        let mut result = CheckUpdateResult::default();
        if let Some(record) = self.registry.get(plugin_id) {
            let _guard = record.lock().await;
            let info = record.snapshot();
            result.installed = outdated && !info.status.is_failure();
            result.first_installed = result.installed && existing.is_none();
            result.plugin_info = Some(info);
        }
        Ok(result)
    }

    async fn latest_version(&self, plugin_id: &str, app_version: i64) -> Result<VersionInfo> {
        if let Some(info) = self.version_cache.fresh(plugin_id) {
            return Ok(info);
        }
        let info = self.versions.latest_version(plugin_id, app_version).await?;
        self.version_cache.store(plugin_id, info.clone());
        Ok(info)
    }

    pub async fn uninstall_plugin(&self, plugin_id: &str) -> Result<()> {
        if !is_valid_plugin_id(plugin_id) {
            return Err(AgentError::NotFound(plugin_id.to_string()));
        }
        let (record, _guard) = loop {
            let Some(record) = self.registry.get(plugin_id) else {
                let leftover = self.registry.plugin_dir(plugin_id);
                if let Err(e) = remove_dir(&leftover).await {
                    warn!(plugin = %plugin_id, error = %e, "could not remove leftover plugin directory");
                }
                return Ok(());
            };
            let guard = record.lock().await;
            if self.registry.is_current(&record) {
                break (record, guard);
            }
        };
        self.wait_stop_plugin(&record).await?;
        tokio::time::sleep(self.settings.uninstall_settle).await;

        remove_dir(record.plugin_dir()).await?;
        self.registry.remove(&record);
        info!(plugin = %plugin_id, "plugin uninstalled");
        Ok(())
    }

    /// Handles a child announcing itself. A still-running previous
    /// instance is asked to stop first.
    pub async fn register(&self, manifest: &Manifest) -> Result<Arc<PluginRecord>> {
        if !is_valid_plugin_id(&manifest.id) {
            return Err(AgentError::Manifest(format!(
                "invalid plugin id {:?}",
                manifest.id
            )));
        }
        if manifest.endpoint.is_empty() {
            return Err(AgentError::Manifest(format!(
                "plugin {} registered without an endpoint",
                manifest.id
            )));
        }

        let (record, _guard) = self.lock_current(manifest).await;
        if record.status() == PluginStatus::Running {
            info!(plugin = %record.id(), old = %record.endpoint(), new = %manifest.endpoint, "replacing running instance");
            if let Err(e) = self.stop_locked(&record).await {
                warn!(plugin = %record.id(), error = %e, "could not stop previous instance");
            }
            // the previous child's exit must not reset the new registration
            record.detach_process();
        }

        let record = self.registry.upsert_from_manifest(manifest);
        record.mark_running();
        info!(plugin = %record.id(), endpoint = %manifest.endpoint, version = manifest.version, "plugin registered");
        Ok(record)
    }

    /// Asks every live plugin to exit, then kills whatever is left.
    pub async fn shutdown(&self) {
        let records = self.registry.list();
        let kills = records.iter().map(|record| async move {
            let endpoint = record.endpoint();
            if endpoint.is_empty() || record.status() != PluginStatus::Running {
                return false;
            }
            if let Err(e) = self.transport.post(record.id(), &endpoint, KILL_URI).await {
                debug!(plugin = %record.id(), error = %e, "shutdown kill failed");
            }
            true
        });
        let requested = futures::future::join_all(kills).await;
        if requested.into_iter().any(|sent| sent) {
            tokio::time::sleep(self.settings.uninstall_settle).await;
        }

        for record in &records {
            if let Some(handle) = record.detach_process() {
                info!(plugin = %record.id(), pid = ?handle.pid(), "force killing plugin on shutdown");
                handle.force_kill();
            }
            if matches!(
                record.status(),
                PluginStatus::Running | PluginStatus::Starting
            ) {
                record.set_status(PluginStatus::NotStarted);
            }
        }
    }
}

fn failure_message(error: &AgentError) -> String {
    match error {
        AgentError::DownloadFailed(message) | AgentError::InstallFailed(message) => {
            message.clone()
        }
        other => other.to_string(),
    }
}

async fn remove_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::installer::ProgressFn;
    use crate::plugins::launcher::PluginProcess;
    use crate::plugins::manifest::MANIFEST_FILE;
    use crate::plugins::update::MockVersionApi;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::TempDir;

    /// Endpoints in `alive` answer pings; a kill takes them down unless
    /// `ignore_kill` is set.
    #[derive(Default)]
    struct FakeTransport {
        alive: Mutex<HashSet<String>>,
        kills: AtomicUsize,
        ignore_kill: AtomicBool,
    }

    impl FakeTransport {
        fn bring_up(&self, endpoint: &str) {
            self.alive.lock().insert(endpoint.to_string());
        }
    }

    #[async_trait]
    impl PluginTransport for FakeTransport {
        async fn post(&self, plugin_id: &str, endpoint: &str, uri: &str) -> Result<()> {
            if endpoint.is_empty() {
                return Err(AgentError::NotRunning(plugin_id.to_string()));
            }
            let mut alive = self.alive.lock();
            if !alive.contains(endpoint) {
                return Err(AgentError::unreachable(plugin_id, "connection refused"));
            }
            if uri == KILL_URI {
                self.kills.fetch_add(1, Ordering::SeqCst);
                if !self.ignore_kill.load(Ordering::SeqCst) {
                    alive.remove(endpoint);
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        spawns: AtomicUsize,
        args: Mutex<Vec<String>>,
    }

    struct IdleProcess {
        killed: bool,
    }

    #[async_trait]
    impl PluginProcess for IdleProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> std::io::Result<Option<i32>> {
            if !self.killed {
                std::future::pending::<()>().await;
            }
            Ok(None)
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn spawn(&self, _program: &Path, args: &[String], _cwd: &Path) -> Result<Box<dyn PluginProcess>> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            *self.args.lock() = args.to_vec();
            Ok(Box::new(IdleProcess { killed: false }))
        }
    }

    /// "Downloads" an empty file and "extracts" by writing `bundle` as the
    /// plugin manifest.
    struct FakeInstaller {
        scratch: TempDir,
        bundle: Mutex<Manifest>,
        downloads: AtomicUsize,
        fail_download: AtomicBool,
        delay: Duration,
    }

    impl FakeInstaller {
        fn new(bundle: Manifest, delay: Duration) -> Self {
            Self {
                scratch: TempDir::new().unwrap(),
                bundle: Mutex::new(bundle),
                downloads: AtomicUsize::new(0),
                fail_download: AtomicBool::new(false),
                delay,
            }
        }
    }

    #[async_trait]
    impl BundleInstaller for FakeInstaller {
        async fn download(&self, _url: &str, on_progress: ProgressFn<'_>) -> Result<PathBuf> {
            let n = self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_download.load(Ordering::SeqCst) {
                return Err(AgentError::DownloadFailed("404 Not Found".into()));
            }
            on_progress(10, 10);
            let path = self.scratch.path().join(format!("bundle-{n}.zip"));
            std::fs::write(&path, b"zip").unwrap();
            Ok(path)
        }

        async fn extract(&self, _archive: &Path, dest: &Path, _mode: u32) -> Result<()> {
            std::fs::create_dir_all(dest)?;
            let body = serde_json::to_string(&*self.bundle.lock())?;
            std::fs::write(dest.join(MANIFEST_FILE), body)?;
            Ok(())
        }
    }

    struct Harness {
        root: TempDir,
        transport: Arc<FakeTransport>,
        launcher: Arc<FakeLauncher>,
        installer: Arc<FakeInstaller>,
        supervisor: PluginSupervisor,
    }

    fn manifest(id: &str, version: i64) -> Manifest {
        Manifest {
            id: id.into(),
            name: id.to_uppercase(),
            version,
            exec_entry: "bin/run".into(),
            ..Manifest::default()
        }
    }

    fn release(id: &str, version: i64) -> VersionInfo {
        VersionInfo {
            manifest: manifest(id, version),
            plugin_id: id.into(),
            version,
            total_size: 10,
            download_url: format!("http://updates.test/{id}-{version}.zip"),
            ..VersionInfo::default()
        }
    }

    fn versions_returning(info: VersionInfo) -> MockVersionApi {
        let mut versions = MockVersionApi::new();
        versions
            .expect_latest_version()
            .returning(move |_, _| Ok(info.clone()));
        versions
    }

    fn harness_with(versions: MockVersionApi, bundle: Manifest, delay: Duration) -> Harness {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let launcher = Arc::new(FakeLauncher::default());
        let installer = Arc::new(FakeInstaller::new(bundle, delay));
        let supervisor = PluginSupervisor::new(
            Arc::new(PluginRegistry::new(root.path())),
            Collaborators {
                launcher: launcher.clone(),
                transport: transport.clone(),
                installer: installer.clone(),
                versions: Arc::new(versions),
            },
            LaunchContext {
                token: "tok".into(),
                namespace: "ns".into(),
                api_endpoint: "http://api.test".into(),
                master_port: 35580,
                debug: false,
            },
            SupervisorSettings {
                drain_attempts: 3,
                drain_interval: Duration::from_millis(1),
                uninstall_settle: Duration::from_millis(1),
                restart_delay: Duration::from_millis(1),
                version_cache_ttl: Duration::from_secs(60),
            },
        );
        Harness {
            root,
            transport,
            launcher,
            installer,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(MockVersionApi::new(), manifest("db", 1), Duration::ZERO)
    }

    fn install_on_disk(root: &Path, manifest: &Manifest) {
        let dir = root.join(&manifest.id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_string(manifest).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_launch_once() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("app", 1));

        let (a, b) = tokio::join!(
            h.supervisor.start_plugin("app"),
            h.supervisor.start_plugin("app")
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(h.launcher.spawns.load(Ordering::SeqCst), 1);
        let record = h.supervisor.registry().get("app").unwrap();
        assert_eq!(record.status(), PluginStatus::Starting);
        assert_eq!(record.snapshot().pid, Some(4242));
    }

    #[tokio::test]
    async fn launch_passes_context_arguments() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("app", 1));
        h.supervisor.start_plugin("app").await.unwrap();

        assert_eq!(
            *h.launcher.args.lock(),
            vec![
                "-token=tok",
                "-namespace=ns",
                "-apiEndpoint=http://api.test",
                "-masterPort=35580",
                "-debug=false",
            ]
        );
    }

    #[tokio::test]
    async fn start_without_manifest_is_not_found() {
        let h = harness();
        let err = h.supervisor.start_plugin("ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
        assert!(h.supervisor.registry().get("ghost").is_none());
    }

    #[tokio::test]
    async fn running_plugin_that_answers_is_not_relaunched() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("app", 1));
        let mut live = manifest("app", 1);
        live.endpoint = "http://127.0.0.1:4001".into();
        h.transport.bring_up(&live.endpoint);
        h.supervisor.register(&live).await.unwrap();

        h.supervisor.start_plugin("app").await.unwrap();
        assert_eq!(h.launcher.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_always_ends_not_started() {
        let h = harness();
        let mut live = manifest("app", 1);
        live.endpoint = "http://127.0.0.1:4001".into();
        h.transport.bring_up(&live.endpoint);
        h.supervisor.register(&live).await.unwrap();

        h.supervisor.stop_plugin("app").await.unwrap();
        let record = h.supervisor.registry().get("app").unwrap();
        assert_eq!(record.status(), PluginStatus::NotStarted);

        // already gone: the kill fails but the status is still settled
        record.set_status(PluginStatus::Running);
        let err = h.supervisor.stop_plugin("app").await.unwrap_err();
        assert!(matches!(err, AgentError::Unreachable { .. }));
        assert_eq!(record.status(), PluginStatus::NotStarted);
    }

    #[tokio::test]
    async fn stop_unknown_plugin_is_not_running() {
        let h = harness();
        assert!(h.supervisor.stop_plugin("nope").await.unwrap_err().is_not_running());
    }

    #[tokio::test]
    async fn restart_relaunches_unregistered_start() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("app", 1));
        h.supervisor.start_plugin("app").await.unwrap();

        h.supervisor.restart_plugin("app").await.unwrap();
        assert_eq!(h.launcher.spawns.load(Ordering::SeqCst), 2);
        let record = h.supervisor.registry().get("app").unwrap();
        assert_eq!(record.status(), PluginStatus::Starting);
    }

    #[tokio::test]
    async fn restart_of_stopped_plugin_waits_then_launches() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("app", 1));

        let started = tokio::time::Instant::now();
        h.supervisor.restart_plugin("app").await.unwrap();

        assert!(started.elapsed() >= h.supervisor.settings().restart_delay);
        assert_eq!(h.transport.kills.load(Ordering::SeqCst), 0);
        assert_eq!(h.launcher.spawns.load(Ordering::SeqCst), 1);
        let record = h.supervisor.registry().get("app").unwrap();
        assert_eq!(record.status(), PluginStatus::Starting);
    }

    #[tokio::test]
    async fn registration_replaces_running_instance() {
        let h = harness();
        let mut old = manifest("app", 1);
        old.endpoint = "http://127.0.0.1:4001".into();
        h.transport.bring_up(&old.endpoint);
        h.supervisor.register(&old).await.unwrap();

        let mut new = manifest("app", 2);
        new.endpoint = "http://127.0.0.1:4002".into();
        let record = h.supervisor.register(&new).await.unwrap();

        assert_eq!(h.transport.kills.load(Ordering::SeqCst), 1);
        assert_eq!(record.status(), PluginStatus::Running);
        assert_eq!(record.endpoint(), "http://127.0.0.1:4002");
        assert_eq!(record.version(), 2);
    }

    #[tokio::test]
    async fn registration_requires_endpoint() {
        let h = harness();
        let err = h.supervisor.register(&manifest("app", 1)).await.unwrap_err();
        assert!(matches!(err, AgentError::Manifest(_)));
    }

    #[tokio::test]
    async fn check_update_installs_newer_release() {
        let h = harness_with(versions_returning(release("db", 2)), manifest("db", 2), Duration::ZERO);
        install_on_disk(h.root.path(), &manifest("db", 1));
        h.supervisor.load_installed().await.unwrap();

        let result = h.supervisor.check_update("db", 1).await.unwrap();

        assert!(result.installed);
        assert!(!result.first_installed);
        let info = result.plugin_info.unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(info.status, PluginStatus::NotStarted);
        assert_eq!(info.downloaded_size, 10);
        assert_eq!(h.installer.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn check_update_reports_first_install() {
        let h = harness_with(versions_returning(release("db", 1)), manifest("db", 1), Duration::ZERO);
        let result = h.supervisor.check_update("db", 1).await.unwrap();
        assert!(result.installed);
        assert!(result.first_installed);
        assert!(h.root.path().join("db").join(MANIFEST_FILE).is_file());
    }

    #[tokio::test]
    async fn up_to_date_plugin_is_left_alone_and_answer_is_cached() {
        let mut versions = MockVersionApi::new();
        versions
            .expect_latest_version()
            .times(1)
            .returning(|_, _| Ok(release("db", 1)));
        let h = harness_with(versions, manifest("db", 1), Duration::ZERO);
        install_on_disk(h.root.path(), &manifest("db", 1));
        h.supervisor.load_installed().await.unwrap();

        for _ in 0..2 {
            let result = h.supervisor.check_update("db", 1).await.unwrap();
            assert!(!result.installed);
            assert!(result.plugin_info.is_some());
        }
        assert_eq!(h.installer.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_updates_download_once() {
        let h = harness_with(
            versions_returning(release("db", 2)),
            manifest("db", 2),
            Duration::from_millis(50),
        );
        let (a, b) = tokio::join!(
            h.supervisor.check_update("db", 1),
            h.supervisor.check_update("db", 1)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.installer.downloads.load(Ordering::SeqCst), 1);
        let record = h.supervisor.registry().get("db").unwrap();
        assert_eq!(record.status(), PluginStatus::NotStarted);
    }

    #[tokio::test]
    async fn failed_download_is_recorded_and_retried() {
        let h = harness_with(versions_returning(release("db", 2)), manifest("db", 2), Duration::ZERO);
        h.installer.fail_download.store(true, Ordering::SeqCst);

        let err = h.supervisor.check_update("db", 1).await.unwrap_err();
        assert!(matches!(err, AgentError::DownloadFailed(_)));
        let info = h.supervisor.registry().get("db").unwrap().snapshot();
        assert_eq!(info.status, PluginStatus::DownloadFailed);
        assert!(info.error_msg.contains("404"));

        h.installer.fail_download.store(false, Ordering::SeqCst);
        let result = h.supervisor.check_update("db", 1).await.unwrap();
        assert!(result.installed);
        let info = result.plugin_info.unwrap();
        assert_eq!(info.status, PluginStatus::NotStarted);
        assert!(info.error_msg.is_empty());
    }

    #[tokio::test]
    async fn bundle_for_another_plugin_fails_install() {
        let h = harness_with(versions_returning(release("db", 2)), manifest("other", 2), Duration::ZERO);
        let err = h.supervisor.check_update("db", 1).await.unwrap_err();
        assert!(matches!(err, AgentError::InstallFailed(_)));
        let record = h.supervisor.registry().get("db").unwrap();
        assert_eq!(record.status(), PluginStatus::InstallFailed);
        assert!(!record.plugin_dir().exists());
    }

    #[tokio::test]
    async fn undrainable_plugin_blocks_install() {
        let h = harness_with(versions_returning(release("db", 2)), manifest("db", 2), Duration::ZERO);
        install_on_disk(h.root.path(), &manifest("db", 1));
        let mut live = manifest("db", 1);
        live.endpoint = "http://127.0.0.1:4003".into();
        h.transport.bring_up(&live.endpoint);
        h.transport.ignore_kill.store(true, Ordering::SeqCst);
        h.supervisor.register(&live).await.unwrap();

        let err = h.supervisor.check_update("db", 1).await.unwrap_err();
        assert!(matches!(err, AgentError::StopFailed(_)));
        assert_eq!(h.installer.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(h.supervisor.registry().get("db").unwrap().version(), 1);
        assert!(h.root.path().join("db").join(MANIFEST_FILE).is_file());
    }

    #[tokio::test]
    async fn undrainable_plugin_blocks_uninstall() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("db", 1));
        let mut live = manifest("db", 1);
        live.endpoint = "http://127.0.0.1:4004".into();
        h.transport.bring_up(&live.endpoint);
        h.transport.ignore_kill.store(true, Ordering::SeqCst);
        h.supervisor.register(&live).await.unwrap();

        let err = h.supervisor.uninstall_plugin("db").await.unwrap_err();
        assert!(matches!(err, AgentError::StopFailed(_)));
        assert!(h.supervisor.registry().get("db").is_some());
        assert!(h.root.path().join("db").is_dir());
    }

    #[tokio::test]
    async fn uninstall_drains_and_removes() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("db", 1));
        let mut live = manifest("db", 1);
        live.endpoint = "http://127.0.0.1:4005".into();
        h.transport.bring_up(&live.endpoint);
        h.supervisor.register(&live).await.unwrap();

        h.supervisor.uninstall_plugin("db").await.unwrap();
        assert!(h.supervisor.registry().get("db").is_none());
        assert!(!h.root.path().join("db").exists());
        assert_eq!(h.transport.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_racing_uninstall_keeps_registry_and_disk_in_step() {
        let h = harness_with(versions_returning(release("db", 2)), manifest("db", 2), Duration::ZERO);
        install_on_disk(h.root.path(), &manifest("db", 1));
        let mut live = manifest("db", 1);
        live.endpoint = "http://127.0.0.1:4007".into();
        h.transport.bring_up(&live.endpoint);
        h.supervisor.register(&live).await.unwrap();

        // the uninstall takes the lock first; the update waits on the old record
        let (uninstalled, updated) = tokio::join!(
            h.supervisor.uninstall_plugin("db"),
            h.supervisor.check_update("db", 1)
        );
        uninstalled.unwrap();
        let updated = updated.unwrap();

        assert_eq!(h.installer.downloads.load(Ordering::SeqCst), 1);
        let record = h
            .supervisor
            .registry()
            .get("db")
            .expect("reinstalled plugin must be registered");
        assert!(h.root.path().join("db").join(MANIFEST_FILE).is_file());
        assert_eq!(record.version(), 2);
        assert_eq!(record.status(), PluginStatus::NotStarted);
        assert!(updated.installed);
        assert_eq!(updated.plugin_info.unwrap().version, 2);
    }

    #[tokio::test]
    async fn uninstall_unknown_plugin_removes_leftovers() {
        let h = harness();
        std::fs::create_dir_all(h.root.path().join("ghost").join("bin")).unwrap();
        h.supervisor.uninstall_plugin("ghost").await.unwrap();
        assert!(!h.root.path().join("ghost").exists());
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let h = harness();
        let err = h.supervisor.uninstall_plugin("../escape").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_installed_creates_root_and_registers_bundles() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("a", 1));
        install_on_disk(h.root.path(), &manifest("b", 3));
        assert_eq!(h.supervisor.load_installed().await.unwrap(), 2);
        assert_eq!(h.supervisor.registry().get("b").unwrap().version(), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let h = harness();
        install_on_disk(h.root.path(), &manifest("a", 1));
        h.supervisor.start_plugin("a").await.unwrap();
        let mut live = manifest("b", 1);
        live.endpoint = "http://127.0.0.1:4006".into();
        h.transport.bring_up(&live.endpoint);
        h.supervisor.register(&live).await.unwrap();

        h.supervisor.shutdown().await;
        assert_eq!(h.transport.kills.load(Ordering::SeqCst), 1);
        for record in h.supervisor.registry().list() {
            assert_eq!(record.status(), PluginStatus::NotStarted);
            assert_eq!(record.process_generation(), None);
        }
    }
}
