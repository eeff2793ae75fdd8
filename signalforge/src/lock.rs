//! Single-instance run lock and background loop control
//!
//! The lock is a JSON file holding `{pid, startedAt}`; its existence is the
//! lock. A held lock is reclaimed when its payload is unreadable, older than
//! the staleness threshold, or its pid is no longer alive.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPayload {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Platform process queries, substituted with a fake in tests
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    /// Graceful termination request
    fn terminate(&self, pid: u32) -> bool;
    fn kill(&self, pid: u32) -> bool;
}

/// Signals real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

#[cfg(unix)]
impl SystemProcesses {
    fn signal(pid: u32, signal: Option<nix::sys::signal::Signal>) -> nix::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)
    }
}

#[cfg(unix)]
impl ProcessProbe for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        match Self::signal(pid, None) {
            Ok(()) => true,
            // exists but owned by someone else
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: u32) -> bool {
        Self::signal(pid, Some(nix::sys::signal::Signal::SIGTERM)).is_ok()
    }

    fn kill(&self, pid: u32) -> bool {
        Self::signal(pid, Some(nix::sys::signal::Signal::SIGKILL)).is_ok()
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        pid != 0
    }

    fn terminate(&self, _pid: u32) -> bool {
        false
    }

    fn kill(&self, _pid: u32) -> bool {
        false
    }
}

/// Reads a lock payload; anything unreadable is `None`
pub async fn read_payload(path: &Path) -> Option<LockPayload> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let payload: LockPayload = serde_json::from_str(&raw).ok()?;
    (payload.pid != 0).then_some(payload)
}

pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
    probe: Arc<dyn ProcessProbe>,
    pid: u32,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            path: path.into(),
            stale_after,
            probe,
            pid: std::process::id(),
        }
    }

    /// Acts as a different process; lets tests model two holders
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Takes the lock, reclaiming a stale one at most once
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match self.try_create().await {
            Ok(guard) => return Ok(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        let existing = read_payload(&self.path).await;
        if let Some(holder) = &existing {
            if !self.is_stale(holder, Utc::now()) {
                return Err(LockError::AlreadyHeld { pid: holder.pid });
            }
        }

        warn!(
            path = %self.path.display(),
            pid = existing.as_ref().map(|p| p.pid),
            "Reclaiming stale loop lock"
        );
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        self.try_create().await.map_err(|source| {
            if source.kind() == ErrorKind::AlreadyExists {
                // another process won the reclaim race
                LockError::AlreadyHeld { pid: 0 }
            } else {
                LockError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })
    }

    fn is_stale(&self, holder: &LockPayload, now: DateTime<Utc>) -> bool {
        now - holder.started_at > self.stale_after || !self.probe.is_alive(holder.pid)
    }

    async fn try_create(&self) -> std::io::Result<LockGuard> {
        let payload = LockPayload {
            pid: self.pid,
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&payload).map_err(std::io::Error::other)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), pid = self.pid, "Acquired loop lock");
        Ok(LockGuard {
            path: self.path.clone(),
            pid: self.pid,
        })
    }
}

/// Proof of holding the lock. Call [`LockGuard::release`] when done.
#[derive(Debug)]
#[must_use = "the lock stays held until released"]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    /// Deletes the lock file only if it still names this holder
    pub async fn release(self) -> Result<(), LockError> {
        match read_payload(&self.path).await {
            Some(current) if current.pid == self.pid => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(LockError::Io {
                            path: self.path.clone(),
                            source,
                        })
                    }
                }
                debug!(path = %self.path.display(), "Released loop lock");
            }
            _ => {
                debug!(path = %self.path.display(), "Lock no longer ours, leaving it in place");
            }
        }
        Ok(())
    }
}

/// Polling schedule used while waiting for a stopped process to exit
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub attempts: u32,
    pub interval: std::time::Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            interval: std::time::Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    StaleLockCleaned { pid: Option<u32> },
    Stopped { pid: u32 },
    Failed { pid: u32 },
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOutcome::NotRunning => "not_running",
            StopOutcome::StaleLockCleaned { .. } => "stale_lock_cleaned",
            StopOutcome::Stopped { .. } => "stopped",
            StopOutcome::Failed { .. } => "failed",
        }
    }
}

/// Stops the loop instance named by the lock file
pub async fn stop_loop(
    path: &Path,
    force: bool,
    probe: &dyn ProcessProbe,
    policy: StopPolicy,
) -> Result<StopOutcome, LockError> {
    let remove = || async move {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    };

    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(StopOutcome::NotRunning);
    }

    let Some(payload) = read_payload(path).await else {
        remove().await?;
        return Ok(StopOutcome::StaleLockCleaned { pid: None });
    };
    let pid = payload.pid;

    if !probe.is_alive(pid) {
        remove().await?;
        return Ok(StopOutcome::StaleLockCleaned { pid: Some(pid) });
    }

    let exited = if force {
        false
    } else {
        info!(pid, "Sending termination signal");
        probe.terminate(pid);
        wait_for_exit(pid, probe, policy).await
    };

    let exited = exited || {
        warn!(pid, "Process still alive, sending kill signal");
        probe.kill(pid);
        wait_for_exit(pid, probe, policy).await
    };

    if !exited {
        return Ok(StopOutcome::Failed { pid });
    }

    remove().await?;
    Ok(StopOutcome::Stopped { pid })
}

async fn wait_for_exit(pid: u32, probe: &dyn ProcessProbe, policy: StopPolicy) -> bool {
    for _ in 0..policy.attempts {
        if !probe.is_alive(pid) {
            return true;
        }
        tokio::time::sleep(policy.interval).await;
    }
    !probe.is_alive(pid)
}

/// Starts `exe args..` detached from this process, output appended to `log_path`
pub fn spawn_detached(exe: &Path, args: &[String], log_path: &Path) -> anyhow::Result<u32> {
    use anyhow::Context;

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open daemon log {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate daemon log handle")?;

    let mut command = std::process::Command::new(exe);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // own process group so the parent's terminal signals do not reach it
        command.process_group(0);
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    Ok(child.id())
}
