//! HBS configuration (see spec §6, `/etc/mtc/mtc.conf` `[agent]` section).
//!
//! Key names and defaults carry over 1:1 from the original INI contract,
//! expressed as TOML per the REDESIGN FLAGS entry in the grounding ledger;
//! shape follows `midi-host/src/main.rs`'s `HostConfig`/section-struct split.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct HbsConfig {
    pub agent: AgentSection,
    #[serde(default)]
    pub peers: HashMap<String, PeerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub hostname: String,
    #[serde(default = "default_period_ms")]
    pub heartbeat_period: u64,
    #[serde(default = "default_minor_threshold")]
    pub hbs_minor_threshold: u32,
    #[serde(default = "default_degrade_threshold")]
    pub heartbeat_degrade_threshold: u32,
    #[serde(default = "default_failure_threshold")]
    pub heartbeat_failure_threshold: u32,
    #[serde(default = "default_failure_action")]
    pub heartbeat_failure_action: FailureAction,
    pub multicast_mgmnt: String,
    #[serde(default)]
    pub multicast_clstr: Option<String>,
    #[serde(default = "default_mtc_to_hbs_cmd_port")]
    pub mtc_to_hbs_cmd_port: u16,
    #[serde(default = "default_hbs_to_mtc_event_port")]
    pub hbs_to_mtc_event_port: u16,
    #[serde(default = "default_hbs_agent_mgmnt_port")]
    pub hbs_agent_mgmnt_port: u16,
    #[serde(default = "default_hbs_client_mgmnt_port")]
    pub hbs_client_mgmnt_port: u16,
    #[serde(default = "default_hbs_agent_clstr_port")]
    pub hbs_agent_clstr_port: u16,
    #[serde(default = "default_hbs_client_clstr_port")]
    pub hbs_client_clstr_port: u16,
    #[serde(default = "default_mtcalarm_req_port")]
    pub mtcalarm_req_port: u16,
    #[serde(default = "default_scheduling_priority")]
    pub scheduling_priority: i32,
    #[serde(default = "default_sm_server_port")]
    pub sm_server_port: u16,
    #[serde(default = "default_sm_client_port")]
    pub sm_client_port: u16,
    #[serde(default = "default_cli_query_port")]
    pub cli_query_port: u16,
    #[serde(default)]
    pub interface_mgmnt: Option<String>,
    #[serde(default)]
    pub interface_clstr: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    Fail,
    Degrade,
    Alarm,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    pub hostname: String,
    #[serde(default)]
    pub controller: bool,
}

fn default_period_ms() -> u64 {
    1000
}
fn default_minor_threshold() -> u32 {
    1
}
fn default_degrade_threshold() -> u32 {
    6
}
fn default_failure_threshold() -> u32 {
    10
}
fn default_failure_action() -> FailureAction {
    FailureAction::Alarm
}
fn default_scheduling_priority() -> i32 {
    1
}
fn default_mtc_to_hbs_cmd_port() -> u16 {
    mtce_common::DEFAULT_MTC_TO_HBS_CMD_PORT
}
fn default_hbs_to_mtc_event_port() -> u16 {
    mtce_common::DEFAULT_HBS_TO_MTC_EVENT_PORT
}
fn default_hbs_agent_mgmnt_port() -> u16 {
    mtce_common::DEFAULT_HBS_AGENT_MGMNT_PORT
}
fn default_hbs_client_mgmnt_port() -> u16 {
    mtce_common::DEFAULT_HBS_CLIENT_MGMNT_PORT
}
fn default_hbs_agent_clstr_port() -> u16 {
    mtce_common::DEFAULT_HBS_AGENT_CLSTR_PORT
}
fn default_hbs_client_clstr_port() -> u16 {
    mtce_common::DEFAULT_HBS_CLIENT_CLSTR_PORT
}
fn default_mtcalarm_req_port() -> u16 {
    mtce_common::DEFAULT_MTCALARM_REQ_PORT
}
fn default_sm_server_port() -> u16 {
    mtce_common::DEFAULT_SM_SERVER_PORT
}
fn default_sm_client_port() -> u16 {
    mtce_common::DEFAULT_SM_CLIENT_PORT
}
fn default_cli_query_port() -> u16 {
    mtce_common::DEFAULT_HBS_CLI_QUERY_PORT
}
