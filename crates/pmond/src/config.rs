//! `pmond.conf` tuning (spec §6): audit cadence, start delay, host-watchdog
//! update period and the loopback port numbers pmond listens on.

use serde::Deserialize;

fn default_audit_period_secs() -> u64 {
    5
}
fn default_start_delay_secs() -> u64 {
    5
}
fn default_hostwd_update_period_secs() -> u64 {
    2
}
fn default_command_port() -> u16 {
    mtce_common::DEFAULT_PMON_CMD_PORT
}
fn default_pmon_dir() -> String {
    "/etc/pmon.d".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PmondConfig {
    #[serde(default = "default_audit_period_secs")]
    pub audit_period_secs: u64,
    #[serde(default = "default_start_delay_secs")]
    pub start_delay_secs: u64,
    #[serde(default = "default_hostwd_update_period_secs")]
    pub hostwd_update_period_secs: u64,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_pmon_dir")]
    pub pmon_dir: String,
}

impl Default for PmondConfig {
    fn default() -> Self {
        Self {
            audit_period_secs: default_audit_period_secs(),
            start_delay_secs: default_start_delay_secs(),
            hostwd_update_period_secs: default_hostwd_update_period_secs(),
            command_port: default_command_port(),
            pmon_dir: default_pmon_dir(),
        }
    }
}
