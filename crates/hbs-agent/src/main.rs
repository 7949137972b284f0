mod command_inbox;
mod config;
mod inventory;
mod pulse_engine;
mod sm;
mod status;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mtce_common::alarm::{Alarm, AlarmManager, FmSink};
use mtce_common::event::{Event, EventCommand};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::command_inbox::Command;
use crate::config::HbsConfig;
use crate::inventory::{Inventory, Thresholds};
use crate::pulse_engine::{PulseEngine, PulseEngineConfig};
use crate::sm::SmMonitor;

#[derive(Parser, Debug)]
#[command(name = "hbs-agent", about = "Node heartbeat agent")]
struct Args {
    #[arg(short, long, default_value = "/etc/mtc/mtc.conf")]
    config: PathBuf,
}

/// Forwards raised/cleared alarms to mtcAgent's event socket, standing in
/// for the external FM daemon (see spec §1's collaborator note).
struct LoopbackFmSink {
    event_port: u16,
}

impl FmSink for LoopbackFmSink {
    fn dispatch(&self, batch: Vec<Alarm>) {
        let port = self.event_port;
        tokio::spawn(async move {
            let sock = match UdpSocket::bind("127.0.0.1:0").await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to bind FM dispatch socket");
                    return;
                }
            };
            for alarm in batch {
                let cmd = if alarm.cleared_at.is_some() {
                    EventCommand::HeartbeatClear
                } else {
                    EventCommand::HeartbeatDegrade
                };
                let ev = Event::new(
                    cmd,
                    alarm.entity_instance.clone(),
                    alarm.host.clone(),
                    serde_json::json!({
                        "alarm_id": alarm.alarm_id,
                        "severity": alarm.severity,
                        "reason": alarm.reason_text,
                    }),
                );
                if let Ok(wire) = ev.to_json() {
                    if let Err(e) = sock.send_to(&wire, ("127.0.0.1", port)).await {
                        warn!(error = %e, "FM dispatch send failed");
                    }
                }
            }
        });
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cfg: HbsConfig = mtce_common::config::load_toml(&args.config).await.map_err(|e| {
        error!(error = %e, path = ?args.config, "failed to load HBS config");
        e
    })?;

    #[cfg(target_os = "linux")]
    set_scheduling_priority(cfg.agent.scheduling_priority);

    info!(host = %cfg.agent.hostname, "hbs-agent starting");

    let mgmnt_multicast: Ipv4Addr = cfg.agent.multicast_mgmnt.parse()?;
    let clstr_multicast: Option<Ipv4Addr> = cfg
        .agent
        .multicast_clstr
        .as_ref()
        .map(|s| s.parse())
        .transpose()?;

    let thresholds = Thresholds {
        minor: cfg.agent.hbs_minor_threshold,
        degrade: cfg.agent.heartbeat_degrade_threshold,
        failure: cfg.agent.heartbeat_failure_threshold,
    };
    let mut inventory = Inventory::with_failure_action(thresholds, cfg.agent.heartbeat_failure_action);
    for peer in cfg.peers.values() {
        inventory.add_host(&peer.hostname, clstr_multicast.is_some());
    }

    let alarms = Arc::new(AlarmManager::new());
    let sink = Arc::new(LoopbackFmSink {
        event_port: cfg.agent.hbs_to_mtc_event_port,
    });

    let (mut engine, _period_rx) = PulseEngine::new(PulseEngineConfig {
        hostname: cfg.agent.hostname.clone(),
        is_controller: cfg
            .peers
            .values()
            .any(|p| p.hostname == cfg.agent.hostname && p.controller),
        mgmnt_multicast,
        mgmnt_port: cfg.agent.hbs_agent_mgmnt_port,
        clstr_multicast,
        clstr_port: cfg.agent.hbs_agent_clstr_port,
        base_period_ms: cfg.agent.heartbeat_period,
    })?;

    let sm_monitor = Arc::new(Mutex::new(SmMonitor::default()));
    let sm_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, cfg.agent.sm_server_port)).await?;
    let sm_handle = {
        let monitor = Arc::clone(&sm_monitor);
        tokio::spawn(async move {
            if let Err(e) = sm::run(sm_socket, monitor, Vec::new).await {
                error!(error = %e, "SM server exited");
            }
        })
    };

    let (snapshot_tx, snapshot_rx) = watch::channel(inventory.snapshot());
    let query_sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, cfg.agent.cli_query_port)).await?;
    tokio::spawn(status::run(query_sock, cfg.agent.hostname.clone(), snapshot_rx, Arc::clone(&alarms)));

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(32);
    let cmd_sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, cfg.agent.mtc_to_hbs_cmd_port)).await?;
    tokio::spawn(async move {
        if let Err(e) = command_inbox::run(cmd_sock, cmd_tx).await {
            error!(error = %e, "mtcAgent command inbox exited");
        }
    });

    let tick_period = Duration::from_millis(
        cfg.agent
            .heartbeat_period
            .clamp(pulse_engine::HBS_MIN_PERIOD_MS, pulse_engine::HBS_MAX_PERIOD_MS),
    );
    let mut interval = tokio::time::interval(tick_period);

    info!(period_ms = tick_period.as_millis(), "hbs-agent running");

    let mut mnfa_active = false;

    loop {
        while let Ok(cmd) = cmd_rx.try_recv() {
            apply_command(cmd, &mut inventory, &engine, alarms.as_ref(), sink.as_ref(), &mut mnfa_active);
        }

        interval.tick().await;
        engine.tick(&mut inventory, alarms.as_ref(), sink.as_ref(), tick_period).await;
        snapshot_tx.send_replace(inventory.snapshot());

        let failed_mgmnt = inventory.failed_count(inventory::Network::Mgmnt);
        if failed_mgmnt >= 3 {
            if !mnfa_active {
                for hostname in inventory.hostnames() {
                    inventory.set_mnfa(&hostname, true);
                }
                engine.backoff();
                mnfa_active = true;
                warn!(failed_mgmnt, "entering MNFA, backing off pulse period");
            }
        } else if mnfa_active {
            for hostname in inventory.hostnames() {
                inventory.set_mnfa(&hostname, false);
            }
            engine.recover_period();
            mnfa_active = false;
            info!("mgmt network recovered, MNFA exited");
        }

        sm_monitor.lock().await.audit(std::time::Instant::now());

        if sm_handle.is_finished() {
            error!("SM server task exited unexpectedly");
        }
    }
}

/// Apply one mtcAgent command (spec §4.4 step 6 / cancellation contract)
/// against the main-loop-owned inventory and pulse engine.
fn apply_command(
    cmd: Command,
    inventory: &mut Inventory,
    engine: &PulseEngine,
    alarms: &AlarmManager,
    sink: &dyn FmSink,
    mnfa_active: &mut bool,
) {
    match cmd {
        Command::Backoff => {
            engine.backoff();
            *mnfa_active = true;
            info!("pulse period backed off by mtcAgent command");
        }
        Command::Recover => {
            engine.recover_period();
            for hostname in inventory.hostnames() {
                inventory.set_mnfa(&hostname, false);
            }
            *mnfa_active = false;
            info!("pulse period recovered by mtcAgent command");
        }
        Command::DelHost { hostname } => {
            inventory.del_host(&hostname);
            alarms.clear_all(sink, &format!("host={hostname}"), now_unix());
            info!(%hostname, "host removed from inventory");
        }
        Command::StopHost { hostname } => {
            if inventory.stop_host(&hostname) {
                alarms.clear_all(sink, &format!("host={hostname}"), now_unix());
                info!(%hostname, "host monitoring stopped");
            }
        }
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Best-effort `SCHED_RR` install (spec §5 scheduling). Failure (typically
/// `EPERM` under an unprivileged test run) is logged, never fatal.
#[cfg(target_os = "linux")]
fn set_scheduling_priority(priority: i32) {
    let param = libc::sched_param { sched_priority: priority };
    // SAFETY: `param` is a valid, fully-initialized `sched_param`; pid 0
    // means "this process".
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc == 0 {
        info!(priority, "set SCHED_RR priority");
    } else {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to set SCHED_RR priority, continuing at default"
        );
    }
}
