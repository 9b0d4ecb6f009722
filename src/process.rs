//! Exclusive automation processes and the registry that owns them.

use crate::error::{QueueError, Result};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Automation application a process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Application {
    Excel,
    PowerPoint,
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Application::Excel => f.write_str("excel"),
            Application::PowerPoint => f.write_str("powerpoint"),
        }
    }
}

/// Starts and force-terminates automation processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a process for `application` rooted at `working_dir`, returning its pid.
    async fn start(&self, application: Application, working_dir: &Path) -> anyhow::Result<u32>;

    /// Force-terminate a process previously returned by `start`.
    async fn kill(&self, pid: u32) -> anyhow::Result<()>;
}

/// Launches a configured command line per application.
pub struct CommandLauncher {
    commands: HashMap<Application, Vec<String>>,
    children: Mutex<HashMap<u32, Child>>,
}

impl CommandLauncher {
    pub fn new(commands: HashMap<Application, Vec<String>>) -> Self {
        Self {
            commands,
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn start(&self, application: Application, working_dir: &Path) -> anyhow::Result<u32> {
        let argv = self
            .commands
            .get(&application)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| anyhow!("no launch command configured for {application}"))?;

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {:?}", argv))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("{application} exited before reporting a pid"))?;

        self.children.lock().await.insert(pid, child);
        debug!(pid, %application, cwd = %working_dir.display(), "Launched automation process");
        Ok(pid)
    }

    async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        let child = self.children.lock().await.remove(&pid);
        match child {
            // Child::kill sends SIGKILL and reaps the process.
            Some(mut child) => child.kill().await.with_context(|| format!("kill pid {pid}")),
            None => force_kill(pid),
        }
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) -> anyhow::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).with_context(|| format!("pid {pid} out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("SIGKILL pid {pid}: {e}")),
    }
}

#[cfg(not(unix))]
fn force_kill(pid: u32) -> anyhow::Result<()> {
    Err(anyhow!("pid {pid} is not owned by this launcher"))
}

/// A running automation process bound to one session.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub user_id: String,
    pub session_id: String,
    pub application: Application,
    pub started_at: SystemTime,
    pub working_dir: PathBuf,
}

/// Tracks every live automation process by pid.
pub struct ProcessRegistry {
    launcher: Arc<dyn ProcessLauncher>,
    handles: Mutex<HashMap<u32, ProcessHandle>>,
    // One per (user, application): preemption and launch of the same slot are
    // serialized, distinct slots launch in parallel.
    launch_locks: Mutex<HashMap<(String, Application), Arc<Mutex<()>>>>,
}

impl ProcessRegistry {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            handles: Mutex::new(HashMap::new()),
            launch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the user's process for `application` with a fresh one.
    pub async fn acquire(
        &self,
        user_id: &str,
        session_id: &str,
        application: Application,
        working_dir: &Path,
    ) -> Result<ProcessHandle> {
        let lock = self.launch_lock(user_id, application).await;
        let _guard = lock.lock().await;

        let preempted = self.release_all_for_user(user_id, Some(application)).await;
        if preempted > 0 {
            debug!(user_id, %application, preempted, "Preempted existing process");
        }

        let pid = self
            .launcher
            .start(application, working_dir)
            .await
            .map_err(|e| {
                error!(user_id, session_id, %application, error = %e, "Failed to launch automation process");
                QueueError::ResourceAcquisition {
                    application,
                    user_id: user_id.to_string(),
                    reason: format!("{e:#}"),
                }
            })?;

        let handle = ProcessHandle {
            pid,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            application,
            started_at: SystemTime::now(),
            working_dir: working_dir.to_path_buf(),
        };
        self.handles.lock().await.insert(pid, handle.clone());
        info!(pid, user_id, session_id, %application, "Acquired automation process");
        Ok(handle)
    }

    /// Kill and forget a process. Returns whether it was registered.
    pub async fn release(&self, pid: u32) -> bool {
        let Some(handle) = self.handles.lock().await.remove(&pid) else {
            return false;
        };
        self.terminate(&handle).await;
        true
    }

    /// Release the user's processes, optionally only those of one application.
    pub async fn release_all_for_user(&self, user_id: &str, application: Option<Application>) -> usize {
        self.release_matching(|h| {
            h.user_id == user_id && application.map_or(true, |app| h.application == app)
        })
        .await
    }

    /// Release every process bound to the session.
    pub async fn release_session(&self, session_id: &str) -> usize {
        self.release_matching(|h| h.session_id == session_id).await
    }

    pub async fn handles(&self) -> Vec<ProcessHandle> {
        self.handles.lock().await.values().cloned().collect()
    }

    pub async fn handles_for_user(&self, user_id: &str) -> Vec<ProcessHandle> {
        self.handles
            .lock()
            .await
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    async fn launch_lock(&self, user_id: &str, application: Application) -> Arc<Mutex<()>> {
        self.launch_locks
            .lock()
            .await
            .entry((user_id.to_string(), application))
            .or_default()
            .clone()
    }

    async fn release_matching(&self, predicate: impl Fn(&ProcessHandle) -> bool) -> usize {
        let removed: Vec<ProcessHandle> = {
            let mut handles = self.handles.lock().await;
            let pids: Vec<u32> = handles
                .values()
                .filter(|h| predicate(h))
                .map(|h| h.pid)
                .collect();
            pids.iter().filter_map(|pid| handles.remove(pid)).collect()
        };
        for handle in &removed {
            self.terminate(handle).await;
        }
        removed.len()
    }

    // Best effort: the entry is already gone whether or not the kill lands.
    async fn terminate(&self, handle: &ProcessHandle) {
        match self.launcher.kill(handle.pid).await {
            Ok(()) => info!(
                pid = handle.pid,
                user_id = %handle.user_id,
                application = %handle.application,
                "Terminated automation process"
            ),
            Err(e) => warn!(
                pid = handle.pid,
                user_id = %handle.user_id,
                application = %handle.application,
                error = %e,
                "Failed to terminate automation process"
            ),
        }
    }
}
