// src/plugins/registry.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::plugins::launcher::ProcessHandle;
use crate::plugins::types::{Manifest, PluginInfo, PluginStatus};

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
struct PluginState {
    name: String,
    description: String,
    version: i64,
    version_name: String,
    exec_entry: String,
    status: PluginStatus,
    total_size: u64,
    downloaded_size: u64,
    error_msg: String,
    endpoint: String,
    auto_exit: bool,
    process: Option<ProcessHandle>,
    /// Bumped at the end of every install attempt, successful or not.
    install_seq: u64,
}

/// Runtime state of one plugin id.
///
/// Field reads and writes go through a short synchronous lock. Transitions that
/// read then write `status` across await points must also hold [`PluginRecord::lock`].
#[derive(Debug)]
pub struct PluginRecord {
    id: String,
    plugin_dir: PathBuf,
    state: RwLock<PluginState>,
    connections: AtomicI64,
    last_conn_time: AtomicI64,
    op_lock: Arc<AsyncMutex<()>>,
}

impl PluginRecord {
    fn from_manifest(manifest: &Manifest, plugin_dir: PathBuf) -> Self {
        Self {
            id: manifest.id.clone(),
            plugin_dir,
            state: RwLock::new(PluginState {
                name: manifest.name.clone(),
                description: manifest.description.clone(),
                version: manifest.version,
                version_name: manifest.version_name.clone(),
                exec_entry: manifest.exec_entry.clone(),
                status: PluginStatus::NotStarted,
                total_size: 0,
                downloaded_size: 0,
                error_msg: String::new(),
                endpoint: manifest.endpoint.clone(),
                auto_exit: manifest.auto_exit,
                process: None,
                install_seq: 0,
            }),
            connections: AtomicI64::new(0),
            last_conn_time: AtomicI64::new(0),
            op_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Serializes status-changing operations on this plugin. The guard is
    /// owned so it can travel with the record it was taken on.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.op_lock).lock_owned().await
    }

    pub fn status(&self) -> PluginStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: PluginStatus) {
        self.state.write().status = status;
    }

    pub fn endpoint(&self) -> String {
        self.state.read().endpoint.clone()
    }

    pub fn version(&self) -> i64 {
        self.state.read().version
    }

    pub fn exec_entry(&self) -> String {
        self.state.read().exec_entry.clone()
    }

    pub fn auto_exit(&self) -> bool {
        self.state.read().auto_exit
    }

    pub fn install_seq(&self) -> u64 {
        self.state.read().install_seq
    }

    /// Refreshes manifest-owned fields. Status, sizes and counters are kept.
    /// An empty manifest endpoint never clears the live one: bundles on disk
    /// don't carry an address, only registering children do.
    pub fn refresh(&self, manifest: &Manifest) {
        let mut state = self.state.write();
        state.version = manifest.version;
        state.version_name = manifest.version_name.clone();
        state.exec_entry = manifest.exec_entry.clone();
        state.description = manifest.description.clone();
        state.auto_exit = manifest.auto_exit;
        if !manifest.endpoint.is_empty() {
            state.endpoint = manifest.endpoint.clone();
        }
    }

    pub fn begin_download(&self, total_size: u64) {
        let mut state = self.state.write();
        state.status = PluginStatus::Downloading;
        state.total_size = total_size;
        state.downloaded_size = 0;
        state.error_msg.clear();
    }

    pub fn set_progress(&self, total: u64, current: u64) {
        let mut state = self.state.write();
        if state.total_size == 0 && total > 0 {
            state.total_size = total;
        }
        state.downloaded_size = if state.total_size > 0 {
            current.min(state.total_size)
        } else {
            current
        };
    }

    pub fn fail_install(&self, status: PluginStatus, message: impl Into<String>) {
        let mut state = self.state.write();
        state.status = status;
        state.error_msg = message.into();
        state.install_seq += 1;
    }

    pub fn finish_install(&self) {
        let mut state = self.state.write();
        state.status = PluginStatus::NotStarted;
        state.error_msg.clear();
        state.install_seq += 1;
    }

    pub fn mark_running(&self) {
        let mut state = self.state.write();
        state.status = PluginStatus::Running;
        state.error_msg.clear();
        self.last_conn_time.store(now_millis(), Ordering::SeqCst);
    }

    pub fn clear_endpoint(&self) {
        self.state.write().endpoint.clear();
    }

    pub fn attach_process(&self, handle: ProcessHandle) {
        self.state.write().process = Some(handle);
    }

    /// Releases ownership of the current child. Its exit will no longer
    /// touch this record.
    pub fn detach_process(&self) -> Option<ProcessHandle> {
        self.state.write().process.take()
    }

    pub fn process_generation(&self) -> Option<u64> {
        self.state.read().process.as_ref().map(ProcessHandle::generation)
    }

    /// Called when a launched child exits. Returns false if the record has
    /// since moved on to another process.
    pub fn on_process_exit(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        match &state.process {
            Some(handle) if handle.generation() == generation => {
                state.process = None;
                state.status = PluginStatus::NotStarted;
                state.endpoint.clear();
                true
            }
            _ => false,
        }
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn last_conn_time(&self) -> i64 {
        self.last_conn_time.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_conn_time.store(now_millis(), Ordering::SeqCst);
    }

    /// Counts one in-flight proxied request until the guard is dropped.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            record: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> PluginInfo {
        let state = self.state.read();
        PluginInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            version: state.version,
            version_name: state.version_name.clone(),
            exec_entry: state.exec_entry.clone(),
            status: state.status,
            total_size: state.total_size,
            downloaded_size: state.downloaded_size,
            error_msg: state.error_msg.clone(),
            endpoint: state.endpoint.clone(),
            plugin_dir: self.plugin_dir.clone(),
            auto_exit: state.auto_exit,
            connections: self.connections(),
            last_conn_time: self.last_conn_time(),
            pid: state.process.as_ref().and_then(ProcessHandle::pid),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    record: Arc<PluginRecord>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.record.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Table of every known plugin, keyed by id.
#[derive(Debug)]
pub struct PluginRegistry {
    plugins_dir: PathBuf,
    records: Mutex<HashMap<String, Arc<PluginRecord>>>,
}

impl PluginRegistry {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(plugin_id)
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<PluginRecord>> {
        self.records.lock().get(plugin_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<PluginRecord>> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn running(&self) -> Vec<Arc<PluginRecord>> {
        self.list()
            .into_iter()
            .filter(|record| record.status() == PluginStatus::Running)
            .collect()
    }

    /// Returns the record for `manifest.id`, creating it on first sight.
    /// The table lock covers only the lookup/insert; an existing record is
    /// refreshed after it is released.
    pub fn upsert_from_manifest(&self, manifest: &Manifest) -> Arc<PluginRecord> {
        let existing = {
            let mut records = self.records.lock();
            match records.get(&manifest.id) {
                Some(record) => Arc::clone(record),
                None => {
                    let record = Arc::new(PluginRecord::from_manifest(
                        manifest,
                        self.plugin_dir(&manifest.id),
                    ));
                    records.insert(manifest.id.clone(), Arc::clone(&record));
                    debug!(plugin = %manifest.id, version = manifest.version, "registered plugin record");
                    return record;
                }
            }
        };
        existing.refresh(manifest);
        existing
    }

    /// Whether `record` is still the registered one for its id. A record
    /// dropped by an uninstall stays valid for holders of its `Arc`, but
    /// nothing done to it is visible through the registry.
    pub fn is_current(&self, record: &Arc<PluginRecord>) -> bool {
        self.records
            .lock()
            .get(record.id())
            .is_some_and(|current| Arc::ptr_eq(current, record))
    }

    /// Removes `record` if it is still the registered one for its id.
    pub fn remove(&self, record: &Arc<PluginRecord>) -> bool {
        let mut records = self.records.lock();
        match records.get(record.id()) {
            Some(current) if Arc::ptr_eq(current, record) => {
                records.remove(record.id());
                true
            }
            _ => false,
        }
    }

    /// Resets records left mid-transition by an earlier run.
    pub fn reconcile(&self) -> usize {
        let mut reset = 0;
        for record in self.list() {
            let status = record.status();
            if matches!(status, PluginStatus::Downloading | PluginStatus::Starting) {
                info!(plugin = %record.id(), ?status, "resetting interrupted plugin state");
                record.set_status(PluginStatus::NotStarted);
                reset += 1;
            }
        }
        reset
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, version: i64) -> Manifest {
        Manifest {
            id: id.into(),
            name: format!("{id} plugin"),
            version,
            exec_entry: "run.sh".into(),
            ..Manifest::default()
        }
    }

    #[test]
    fn upsert_creates_once_then_refreshes() {
        let registry = PluginRegistry::new("/plugins");
        let first = registry.upsert_from_manifest(&manifest("db", 1));
        first.set_status(PluginStatus::Running);
        first.set_progress(10, 4);

        let mut updated = manifest("db", 2);
        updated.auto_exit = true;
        let second = registry.upsert_from_manifest(&updated);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(second.version(), 2);
        assert!(second.auto_exit());
        assert_eq!(second.status(), PluginStatus::Running);
        assert_eq!(second.snapshot().downloaded_size, 4);
        assert_eq!(second.plugin_dir(), Path::new("/plugins/db"));
    }

    #[test]
    fn empty_manifest_endpoint_keeps_live_address() {
        let registry = PluginRegistry::new("/plugins");
        let mut announced = manifest("db", 1);
        announced.endpoint = "http://127.0.0.1:4100".into();
        let record = registry.upsert_from_manifest(&announced);

        registry.upsert_from_manifest(&manifest("db", 1));
        assert_eq!(record.endpoint(), "http://127.0.0.1:4100");
    }

    #[test]
    fn concurrent_upserts_yield_single_record() {
        let registry = Arc::new(PluginRegistry::new("/plugins"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.upsert_from_manifest(&manifest("x", 1)))
            })
            .collect();
        let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn connection_guard_restores_counter() {
        let registry = PluginRegistry::new("/plugins");
        let record = registry.upsert_from_manifest(&manifest("web", 1));
        {
            let _a = record.open_connection();
            let _b = record.open_connection();
            assert_eq!(record.connections(), 2);
        }
        assert_eq!(record.connections(), 0);
    }

    #[test]
    fn progress_never_exceeds_total() {
        let registry = PluginRegistry::new("/plugins");
        let record = registry.upsert_from_manifest(&manifest("big", 1));
        record.begin_download(100);
        record.set_progress(100, 250);
        let info = record.snapshot();
        assert_eq!(info.status, PluginStatus::Downloading);
        assert_eq!(info.downloaded_size, 100);
    }

    #[test]
    fn remove_ignores_replaced_record() {
        let registry = PluginRegistry::new("/plugins");
        let stale = registry.upsert_from_manifest(&manifest("a", 1));
        assert!(registry.is_current(&stale));
        assert!(registry.remove(&stale));
        assert!(!registry.is_current(&stale));
        let fresh = registry.upsert_from_manifest(&manifest("a", 1));
        assert!(!registry.remove(&stale));
        assert!(registry.get("a").is_some_and(|r| Arc::ptr_eq(&r, &fresh)));
        assert!(registry.is_current(&fresh));
    }

    #[test]
    fn reconcile_resets_interrupted_states() {
        let registry = PluginRegistry::new("/plugins");
        registry
            .upsert_from_manifest(&manifest("a", 1))
            .set_status(PluginStatus::Downloading);
        registry
            .upsert_from_manifest(&manifest("b", 1))
            .set_status(PluginStatus::DownloadFailed);

        assert_eq!(registry.reconcile(), 1);
        assert_eq!(registry.get("a").unwrap().status(), PluginStatus::NotStarted);
        assert_eq!(registry.get("b").unwrap().status(), PluginStatus::DownloadFailed);
    }
}
