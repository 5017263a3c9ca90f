//! Child process spawning and exit observation.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::plugins::registry::PluginRecord;
use crate::utils::error::{AgentError, Result};

/// A spawned plugin process.
#[async_trait]
pub trait PluginProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolves once the process has exited, yielding its exit code if any.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, program: &Path, args: &[String], cwd: &Path) -> Result<Box<dyn PluginProcess>>;
}

/// Ownership token for a running child, stored on its plugin record.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Asks the watcher task to kill the process outright.
    pub fn force_kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Attaches `child` to `record` and spawns the task that waits for it.
///
/// When the child exits while it is still the record's current process the
/// record falls back to `NotStarted` with no endpoint.
pub fn supervise(record: Arc<PluginRecord>, mut child: Box<dyn PluginProcess>, generation: u64) {
    let (kill_tx, mut kill_rx) = oneshot::channel();
    let pid = child.pid();
    record.attach_process(ProcessHandle {
        pid,
        generation,
        kill: Some(kill_tx),
    });

    tokio::spawn(async move {
        let exit = tokio::select! {
            exit = child.wait() => exit,
            Ok(()) = &mut kill_rx => {
                if let Err(e) = child.kill().await {
                    warn!(plugin = %record.id(), error = %e, "force kill failed");
                }
                child.wait().await
            }
        };
        match exit {
            Ok(code) => info!(plugin = %record.id(), ?pid, ?code, "plugin process exited"),
            Err(e) => warn!(plugin = %record.id(), ?pid, error = %e, "waiting on plugin process failed"),
        }
        if record.on_process_exit(generation) {
            debug!(plugin = %record.id(), generation, "plugin marked stopped after exit");
        }
    });
}

/// Spawns entrypoints with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, program: &Path, args: &[String], cwd: &Path) -> Result<Box<dyn PluginProcess>> {
        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Launch(format!("{}: {}", program.display(), e)))?;
        Ok(Box::new(TokioProcess { child }))
    }
}

struct TokioProcess {
    child: Child,
}

#[async_trait]
impl PluginProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}
