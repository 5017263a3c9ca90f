// src/network/health/mod.rs
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::plugins::registry::{now_millis, PluginRecord};
use crate::plugins::supervisor::PluginSupervisor;

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub check_interval: Duration,
    /// Idle time after which an `autoExit` plugin with no open
    /// connections is stopped.
    pub auto_exit_idle: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            auto_exit_idle: Duration::from_secs(300),
        }
    }
}

/// Periodic sweep over running plugins: stops idle `autoExit` plugins and
/// plugins that no longer answer a ping.
pub struct HealthMonitor {
    supervisor: Arc<PluginSupervisor>,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<PluginSupervisor>, settings: HealthSettings) -> Self {
        Self {
            supervisor,
            settings,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(interval = ?self.settings.check_interval, "health monitor started");
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let checks = self.sweep();
                debug!(checks = checks.len(), "health sweep dispatched");
            }
        })
    }

    /// Dispatches one independent check per running plugin.
    pub fn sweep(&self) -> Vec<JoinHandle<()>> {
        let now = now_millis();
        self.supervisor
            .registry()
            .running()
            .into_iter()
            .map(|record| {
                let supervisor = Arc::clone(&self.supervisor);
                if self.is_idle(&record, now) {
                    spawn_check(record.id().to_string(), async move {
                        info!(plugin = %record.id(), "stopping idle plugin");
                        if let Err(e) = supervisor.stop_plugin(record.id()).await {
                            warn!(plugin = %record.id(), error = %e, "idle stop failed");
                        }
                    })
                } else {
                    spawn_check(record.id().to_string(), async move {
                        if let Err(e) = supervisor.ping(&record).await {
                            warn!(plugin = %record.id(), error = %e, "plugin failed health check, stopping");
                            if let Err(e) = supervisor.stop_plugin(record.id()).await {
                                debug!(plugin = %record.id(), error = %e, "stop after failed check");
                            }
                        }
                    })
                }
            })
            .collect()
    }

    fn is_idle(&self, record: &PluginRecord, now: i64) -> bool {
        let idle_ms = i64::try_from(self.settings.auto_exit_idle.as_millis()).unwrap_or(i64::MAX);
        record.auto_exit()
            && record.connections() == 0
            && now.saturating_sub(record.last_conn_time()) > idle_ms
    }
}

/// A panicking check is logged and does not affect the others.
fn spawn_check<F>(plugin_id: String, check: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if AssertUnwindSafe(check).catch_unwind().await.is_err() {
            error!(plugin = %plugin_id, "health check panicked");
        }
    })
}
