//! ProcessConfig / ProcessRuntime (see spec §3 Process-monitor side, §6).
//!
//! One TOML file per process under `/etc/pmon.d`, loaded the same way
//! `midi-host/src/main.rs` loads its single `host.toml` — parsed into a
//! plain `#[derive(Deserialize)]` struct via `mtce_common::config::load_toml` —
//! just looped over a glob instead of a single fixed path.

use std::path::PathBuf;
use std::time::Instant;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Passive,
    Active,
    Status,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Subfunction {
    Worker,
    Storage,
    LastConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub retry_interval_secs: u64,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_start_delay_secs")]
    pub start_delay_secs: u64,
}

fn default_debounce_secs() -> u64 {
    10
}
fn default_start_delay_secs() -> u64 {
    0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveModeConfig {
    #[serde(default = "default_active_port")]
    pub port: u16,
    pub period: u64,
    pub timeout: u64,
    pub threshold: u32,
}

fn default_active_port() -> u16 {
    mtce_common::DEFAULT_PMON_PULSE_PORT
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusModeConfig {
    pub period: u64,
    pub timeout: u64,
    pub start_arg: String,
    pub status_arg: String,
    #[serde(default)]
    pub status_failure_text_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub process: String,
    pub mode: MonitorMode,
    pub severity: Severity,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub style: Option<String>,
    pub pidfile: PathBuf,
    pub restart: RestartPolicy,
    #[serde(default)]
    pub subfunction: Option<Subfunction>,
    #[serde(default)]
    pub quorum: bool,
    #[serde(default)]
    pub full_init_reqd: bool,
    #[serde(default)]
    pub active: Option<ActiveModeConfig>,
    #[serde(default)]
    pub status: Option<StatusModeConfig>,
}

/// Recovery command resolution order (spec §4.5 `RESPAWN`): configured
/// systemd `service`, else the init script's `.service` unit if present,
/// else the raw init script with `start`/`restart` argv.
#[derive(Debug, Clone)]
pub enum RecoveryCommand {
    SystemdService(String),
    InitScript { path: PathBuf, arg: &'static str },
}

impl ProcessConfig {
    pub fn resolve_recovery_command(&self, is_restart: bool) -> Option<RecoveryCommand> {
        if let Some(service) = &self.service {
            return Some(RecoveryCommand::SystemdService(service.clone()));
        }
        let script = self.script.as_ref()?;
        for dir in ["/etc/systemd/system", "/usr/lib/systemd/system"] {
            if let Some(stem) = script.file_name().and_then(|n| n.to_str()) {
                let unit = PathBuf::from(dir).join(format!("{stem}.service"));
                if unit.exists() {
                    return Some(RecoveryCommand::SystemdService(stem.to_string()));
                }
            }
        }
        Some(RecoveryCommand::InitScript {
            path: script.clone(),
            arg: if is_restart { "restart" } else { "start" },
        })
    }
}

/// Mutable runtime state for one supervised process (spec §3 invariants).
pub struct ProcessRuntime {
    pub pid: Option<u32>,
    pub child_spawn_pid: Option<u32>,
    pub stage: crate::passive_fsm::PassiveStage,
    pub restarts_cnt: u32,
    pub debounce_cnt: u32,
    pub severity: Option<Severity>,
    pub failed: bool,
    pub stopped: bool,
    pub ignore: bool,
    pub quorum_failure: bool,
    pub quorum_unrecoverable: bool,
    pub tx_sequence: u32,
    pub rx_sequence: u32,
    pub b2b_miss_count: u32,
    pub last_spawn: Option<Instant>,
    pub registered: bool,
    pub active_stage: crate::active_fsm::ActiveStage,
    pub status_stage: crate::status_fsm::StatusStage,
}

impl ProcessRuntime {
    /// Escalate quorum-member failure tracking (spec §4.5 MANAGE, invariant
    /// 4): the first failure flags `quorum_failure`; a second failure while
    /// already flagged escalates to `quorum_unrecoverable`, which the
    /// host-watchdog keys on.
    pub fn quorum_process_failure(&mut self) {
        if self.quorum_failure {
            self.quorum_unrecoverable = true;
        } else {
            self.quorum_failure = true;
        }
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self {
            pid: None,
            child_spawn_pid: None,
            stage: crate::passive_fsm::PassiveStage::Start,
            restarts_cnt: 0,
            debounce_cnt: 0,
            severity: None,
            failed: false,
            stopped: false,
            ignore: false,
            quorum_failure: false,
            quorum_unrecoverable: false,
            tx_sequence: 0,
            rx_sequence: 0,
            b2b_miss_count: 0,
            last_spawn: None,
            registered: false,
            active_stage: crate::active_fsm::ActiveStage::Idle,
            status_stage: crate::status_fsm::StatusStage::Begin,
        }
    }
}

/// Load every `/etc/pmon.d/*.conf` file, skipping (and logging) files that
/// fail to parse rather than aborting the whole directory load.
pub async fn load_all(dir: &std::path::Path) -> anyhow::Result<Vec<ProcessConfig>> {
    let pattern = dir.join("*.conf");
    let mut configs = Vec::new();
    let paths = glob::glob(&pattern.to_string_lossy())?;
    for entry in paths {
        let path = entry?;
        match mtce_common::config::load_toml::<ProcessConfig>(&path).await {
            Ok(cfg) => configs.push(cfg),
            Err(e) => tracing::warn!(error = %e, path = ?path, "skipping unparsable process config"),
        }
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_prefers_configured_service() {
        let cfg = ProcessConfig {
            process: "nfv-vim".into(),
            mode: MonitorMode::Passive,
            severity: Severity::Major,
            service: Some("nfv-vim.service".into()),
            script: None,
            style: None,
            pidfile: "/var/run/nfv-vim.pid".into(),
            restart: RestartPolicy {
                max_restarts: 3,
                retry_interval_secs: 60,
                debounce_secs: 10,
                start_delay_secs: 0,
            },
            subfunction: None,
            quorum: true,
            full_init_reqd: false,
            active: None,
            status: None,
        };
        match cfg.resolve_recovery_command(false) {
            Some(RecoveryCommand::SystemdService(s)) => assert_eq!(s, "nfv-vim.service"),
            other => panic!("expected systemd service, got {other:?}"),
        }
    }

    #[test]
    fn recovery_falls_back_to_init_script() {
        let cfg = ProcessConfig {
            process: "legacy-mon".into(),
            mode: MonitorMode::Passive,
            severity: Severity::Minor,
            service: None,
            script: Some("/etc/init.d/legacy-mon".into()),
            style: None,
            pidfile: "/var/run/legacy-mon.pid".into(),
            restart: RestartPolicy {
                max_restarts: 3,
                retry_interval_secs: 60,
                debounce_secs: 10,
                start_delay_secs: 0,
            },
            subfunction: None,
            quorum: false,
            full_init_reqd: false,
            active: None,
            status: None,
        };
        match cfg.resolve_recovery_command(true) {
            Some(RecoveryCommand::InitScript { path, arg }) => {
                assert_eq!(path, PathBuf::from("/etc/init.d/legacy-mon"));
                assert_eq!(arg, "restart");
            }
            other => panic!("expected init script, got {other:?}"),
        }
    }
}
