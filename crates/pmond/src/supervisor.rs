//! Child process spawn/reap and pidfile handling (spec §4.5, §6, §9).
//!
//! Recovery commands are dispatched through `systemctl` or the process's
//! init script, exactly the argv-building style the teacher uses in
//! `failover.rs` for its recovery hooks, just pointed at `systemctl`/init
//! scripts instead of MIDI device re-opens.

use std::path::Path;

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::process::{ProcessConfig, RecoveryCommand};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no recovery command configured for process")]
    NoRecoveryCommand,
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command exited with non-zero status: {0}")]
    NonZeroExit(std::process::ExitStatus),
    #[error("pidfile read failed: {0}")]
    Pidfile(std::io::Error),
}

/// Start (or restart) the process and return the pid read back from its
/// pidfile. `is_restart` only affects which init-script argv gets used.
pub async fn spawn(cfg: &ProcessConfig, is_restart: bool) -> Result<u32, SupervisorError> {
    let recovery = cfg
        .resolve_recovery_command(is_restart)
        .ok_or(SupervisorError::NoRecoveryCommand)?;

    let status = match &recovery {
        RecoveryCommand::SystemdService(unit) => {
            let verb = if is_restart { "restart" } else { "start" };
            info!(process = %cfg.process, unit, verb, "dispatching systemctl");
            Command::new("systemctl").arg(verb).arg(unit).status().await?
        }
        RecoveryCommand::InitScript { path, arg } => {
            info!(process = %cfg.process, script = ?path, arg, "dispatching init script");
            Command::new(path).arg(arg).status().await?
        }
    };

    if !status.success() {
        return Err(SupervisorError::NonZeroExit(status));
    }

    read_pidfile(&cfg.pidfile).await
}

/// Read a pid back from a pidfile, retrying briefly since some init scripts
/// return before the daemon has finished writing it.
pub async fn read_pidfile(path: &Path) -> Result<u32, SupervisorError> {
    for attempt in 0..10 {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => {
                if let Ok(pid) = s.trim().parse::<u32>() {
                    return Ok(pid);
                }
            }
            Err(_) if attempt < 9 => {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
            Err(e) => return Err(SupervisorError::Pidfile(e)),
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Err(SupervisorError::Pidfile(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "pidfile never populated",
    )))
}

/// Whether `pid` is still alive, via `kill(pid, 0)` (spec §9's Linux
/// signal-0 liveness check — no kernel process-exit notification is
/// assumed to exist, pidfile polling is the portable fallback).
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Stop a managed process. Sends `SIGTERM` first; callers decide whether
/// to escalate to `SIGKILL` on timeout.
pub fn stop(pid: u32) -> Result<(), SupervisorError> {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM)
            .map_err(|e| SupervisorError::Spawn(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        warn!("stop() unsupported on this platform");
        Ok(())
    }
}
