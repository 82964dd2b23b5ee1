//! Package installation.
//!
//! The bundled [`CommandInstaller`] hands a verified package to an external
//! command (the package path is appended as last argument). The command may
//! report progress on stdout with lines like `progress 42`. Once it exits
//! successfully the update is marked finalizing, then installed.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use updater_core::{RegistryEventKind, SharedRegistry, UpdateRecord, UpdateStatus};

use crate::error::ServiceError;

/// Installs verified updates.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Start installing `download_id`. Returns once installation has begun.
    async fn trigger_install(&self, download_id: &str) -> Result<(), ServiceError>;

    /// Abort the running installation.
    async fn cancel(&self) -> Result<(), ServiceError>;

    /// Pause the running installation.
    async fn suspend(&self) -> Result<(), ServiceError>;

    /// Continue a suspended installation.
    async fn resume(&self) -> Result<(), ServiceError>;

    fn is_installing(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Continue,
    Kill,
}

struct RunningInstall {
    download_id: String,
    pid: Option<u32>,
    cancelled: Arc<AtomicBool>,
    suspended: bool,
    task: JoinHandle<()>,
}

/// Runs a configured command for each installation. One at a time.
pub struct CommandInstaller {
    registry: SharedRegistry,
    command: Vec<String>,
    current: Mutex<Option<RunningInstall>>,
}

impl CommandInstaller {
    pub fn new(registry: SharedRegistry, command: Vec<String>) -> Self {
        Self {
            registry,
            command,
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<RunningInstall>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, download_id: &str, kind: RegistryEventKind, mut change: impl FnMut(&mut UpdateRecord)) {
        set_state(&self.registry, download_id, kind, &mut change);
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn trigger_install(&self, download_id: &str) -> Result<(), ServiceError> {
        let mut current = self.lock_current();
        if let Some(running) = current.as_ref().filter(|r| !r.task.is_finished()) {
            return Err(ServiceError::Busy(format!(
                "installation of {} in progress",
                running.download_id
            )));
        }

        let update = self
            .registry
            .get_update(download_id)
            .ok_or_else(|| ServiceError::NotFound(download_id.to_string()))?;
        if !matches!(
            update.status,
            UpdateStatus::Verified
                | UpdateStatus::InstallationFailed
                | UpdateStatus::InstallationCancelled
        ) || !update.file_is_consistent()
        {
            return Err(ServiceError::invalid_state(
                download_id,
                update.status,
                "update is not verified",
            ));
        }
        let package = update
            .file_path()
            .ok_or_else(|| ServiceError::invalid_state(download_id, update.status, "update has no package"))?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ServiceError::Internal("install command is empty".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .arg(package)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(error = %e, program = %program, "Failed to spawn installer");
                ServiceError::Internal(format!("Failed to spawn installer: {}", e))
            })?;

        self.registry
            .modify(download_id, RegistryEventKind::StatusChanged, &mut |u| {
                u.status = UpdateStatus::Installing;
                u.install_progress = 0;
                u.is_finalizing = false;
            })?;

        let pid = child.id();
        let cancelled = Arc::new(AtomicBool::new(false));
        info!(download_id = %download_id, pid = ?pid, "Installation started");

        let task = tokio::spawn(supervise(
            self.registry.clone(),
            download_id.to_string(),
            child,
            cancelled.clone(),
        ));
        *current = Some(RunningInstall {
            download_id: download_id.to_string(),
            pid,
            cancelled,
            suspended: false,
            task,
        });
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ServiceError> {
        let mut current = self.lock_current();
        let running = current
            .as_mut()
            .filter(|r| !r.task.is_finished())
            .ok_or(ServiceError::NotInstalling)?;

        running.cancelled.store(true, Ordering::SeqCst);
        if let Some(pid) = running.pid {
            send_signal(pid, Signal::Kill)?;
        }
        info!(download_id = %running.download_id, "Installation cancel requested");
        Ok(())
    }

    async fn suspend(&self) -> Result<(), ServiceError> {
        let mut current = self.lock_current();
        let running = current
            .as_mut()
            .filter(|r| !r.task.is_finished())
            .ok_or(ServiceError::NotInstalling)?;
        if running.suspended {
            return Ok(());
        }

        let pid = running
            .pid
            .ok_or_else(|| ServiceError::Internal("installer has no pid".to_string()))?;
        send_signal(pid, Signal::Stop)?;
        running.suspended = true;

        self.set(&running.download_id, RegistryEventKind::StatusChanged, |u| {
            u.status = UpdateStatus::InstallationSuspended;
        });
        info!(download_id = %running.download_id, "Installation suspended");
        Ok(())
    }

    async fn resume(&self) -> Result<(), ServiceError> {
        let mut current = self.lock_current();
        let running = current
            .as_mut()
            .filter(|r| !r.task.is_finished())
            .ok_or(ServiceError::NotInstalling)?;
        if !running.suspended {
            return Ok(());
        }

        let pid = running
            .pid
            .ok_or_else(|| ServiceError::Internal("installer has no pid".to_string()))?;
        send_signal(pid, Signal::Continue)?;
        running.suspended = false;

        self.set(&running.download_id, RegistryEventKind::StatusChanged, |u| {
            u.status = UpdateStatus::Installing;
        });
        info!(download_id = %running.download_id, "Installation resumed");
        Ok(())
    }

    fn is_installing(&self) -> bool {
        self.lock_current()
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }
}

/// Follow the installer process until it exits and record the outcome.
async fn supervise(
    registry: SharedRegistry,
    download_id: String,
    mut child: Child,
    cancelled: Arc<AtomicBool>,
) {
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(progress) = parse_progress(&line) {
                        set_state(&registry, &download_id, RegistryEventKind::InstallProgress, &mut |u| {
                            u.install_progress = progress;
                        });
                    } else {
                        debug!(line = %line, "Installer output");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read installer output");
                    break;
                }
            }
        }
    }

    let exit = child.wait().await;
    if cancelled.load(Ordering::SeqCst) {
        info!(download_id = %download_id, "Installation cancelled");
        set_state(&registry, &download_id, RegistryEventKind::StatusChanged, &mut |u| {
            u.status = UpdateStatus::InstallationCancelled;
            u.install_progress = 0;
            u.is_finalizing = false;
        });
        return;
    }

    match exit {
        Ok(status) if status.success() => {
            set_state(&registry, &download_id, RegistryEventKind::InstallProgress, &mut |u| {
                u.install_progress = 100;
                u.is_finalizing = true;
            });
            set_state(&registry, &download_id, RegistryEventKind::StatusChanged, &mut |u| {
                u.status = UpdateStatus::Installed;
                u.is_finalizing = false;
            });
            info!(download_id = %download_id, "Installation completed");
        }
        Ok(status) => {
            error!(download_id = %download_id, code = ?status.code(), "Installer failed");
            set_state(&registry, &download_id, RegistryEventKind::StatusChanged, &mut |u| {
                u.status = UpdateStatus::InstallationFailed;
            });
        }
        Err(e) => {
            error!(download_id = %download_id, error = %e, "Failed to wait for installer");
            set_state(&registry, &download_id, RegistryEventKind::StatusChanged, &mut |u| {
                u.status = UpdateStatus::InstallationFailed;
            });
        }
    }
}

fn set_state(
    registry: &SharedRegistry,
    download_id: &str,
    kind: RegistryEventKind,
    change: &mut dyn FnMut(&mut UpdateRecord),
) {
    if let Err(e) = registry.modify(download_id, kind, change) {
        warn!(download_id = %download_id, error = %e, "Failed to update install state");
    }
}

/// Parse `progress 42`, `progress=42` or `progress: 42`.
fn parse_progress(line: &str) -> Option<u8> {
    let value = line
        .trim()
        .strip_prefix("progress")?
        .trim_start_matches(|c: char| c == ' ' || c == ':' || c == '=');
    value.trim().parse::<u32>().ok().map(|p| p.min(100) as u8)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), ServiceError> {
    let signo = match signal {
        Signal::Stop => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety requirements.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(ServiceError::Internal(format!(
            "Failed to send {:?} to installer: {}",
            signal,
            io::Error::last_os_error()
        )))
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: Signal) -> Result<(), ServiceError> {
    Err(ServiceError::Internal(format!(
        "{:?} is not supported on this platform: {}",
        signal,
        io::Error::from(io::ErrorKind::Unsupported)
    )))
}
