mod active_fsm;
mod command_inbox;
mod config;
mod hostwd;
mod passive_fsm;
mod process;
mod reload;
mod status_fsm;
mod supervisor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use mtce_common::alarm::{Alarm, AlarmManager, FmSink};
use mtce_common::event::{Event, EventCommand};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::command_inbox::RuntimeTable;
use crate::config::PmondConfig;
use crate::process::{MonitorMode, ProcessConfig};
use crate::reload::ReloadFlag;

#[derive(Parser, Debug)]
#[command(name = "pmond", about = "Process monitoring daemon")]
struct Args {
    #[arg(short, long, default_value = "/etc/mtc/pmond.conf")]
    config: PathBuf,
}

/// Forwards raised/cleared alarms to mtcAgent's event socket, same shape
/// as `hbs-agent`'s `LoopbackFmSink`.
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
                    EventCommand::ProcessClear
                } else {
                    EventCommand::ProcessFailure
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

fn alarm_severity(cfg_severity: process::Severity) -> mtce_common::alarm::Severity {
    match cfg_severity {
        process::Severity::Minor => mtce_common::alarm::Severity::Minor,
        process::Severity::Major => mtce_common::alarm::Severity::Major,
        process::Severity::Critical => mtce_common::alarm::Severity::Critical,
    }
}

/// Spawn the per-process supervisor task driving whichever FSM `cfg.mode`
/// selects, looping until the runtime's FSM reports `Failed`/`Stopped`.
fn spawn_process_task(
    cfg: ProcessConfig,
    runtimes: RuntimeTable,
    alarms: Arc<AlarmManager>,
    sink: Arc<LoopbackFmSink>,
) {
    tokio::spawn(async move {
        let process = cfg.process.clone();
        let entity = format!("process={process}");

        match cfg.mode {
            MonitorMode::Passive => loop {
                let mut table = runtimes.lock().await;
                let rt = table.entry(process.clone()).or_default();
                let alive = rt.pid.map(supervisor::is_alive).unwrap_or(false);
                let outcome = rt
                    .step_passive(&cfg, alive, Instant::now(), alarms.as_ref(), sink.as_ref())
                    .await;
                let after = match outcome {
                    passive_fsm::StepOutcome::Continue { after } => after,
                    passive_fsm::StepOutcome::Failed => Duration::from_secs(3600),
                    passive_fsm::StepOutcome::Stopped => Duration::from_secs(3600),
                };
                drop(table);
                tokio::time::sleep(after).await;
            },
            MonitorMode::Active => {
                let Some(active_cfg) = cfg.active.clone() else {
                    warn!(process = %process, "active mode selected without [active] config");
                    return;
                };
                // Each active-mode process gets its own full-duplex loopback socket on an
                // ephemeral port, addressed at `active_cfg.port` -- the single aggregated
                // receive socket the original pmon used required demuxing replies by an
                // embedded process-name string, which a per-task socket makes unnecessary.
                let sock = match UdpSocket::bind(("127.0.0.1", 0)).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(process = %process, error = %e, "failed to bind active-mon socket");
                        return;
                    }
                };
                loop {
                    let mut table = runtimes.lock().await;
                    let rt = table.entry(process.clone()).or_default();
                    let outcome = rt.step_active(&process, &active_cfg, &sock, Instant::now()).await;
                    let failed = rt.failed;
                    drop(table);
                    if failed {
                        alarms.raise(
                            sink.as_ref(),
                            &cfg.process,
                            "200.006",
                            &entity,
                            alarm_severity(cfg.severity),
                            "active pulse monitoring failed",
                            now_secs(),
                        );
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        continue;
                    }
                    let after = match outcome {
                        active_fsm::StepOutcome::Continue { after } => after,
                        active_fsm::StepOutcome::Failed => Duration::from_secs(3600),
                    };
                    tokio::time::sleep(after).await;
                }
            }
            MonitorMode::Status => {
                let Some(status_cfg) = cfg.status.clone() else {
                    warn!(process = %process, "status mode selected without [status] config");
                    return;
                };
                let mut stage = status_fsm::StatusStage::Begin;
                let mut restarts_cnt = 0u32;
                loop {
                    let (next_stage, outcome) =
                        status_fsm::step(&cfg, &status_cfg, stage, &mut restarts_cnt).await;
                    stage = next_stage;
                    match outcome {
                        status_fsm::StepOutcome::Continue { after } => {
                            tokio::time::sleep(after).await;
                        }
                        status_fsm::StepOutcome::Failed => {
                            alarms.raise(
                                sink.as_ref(),
                                &cfg.process,
                                "200.006",
                                &entity,
                                alarm_severity(cfg.severity),
                                "status check failed",
                                now_secs(),
                            );
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                        }
                    }
                }
            }
        }
    });
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
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

    let cfg: PmondConfig = mtce_common::config::load_toml(&args.config)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, path = ?args.config, "no pmond.conf found, using defaults");
            PmondConfig::default()
        });

    info!(dir = %cfg.pmon_dir, "pmond starting");

    let pmon_dir = PathBuf::from(&cfg.pmon_dir);
    let process_configs = process::load_all(&pmon_dir).await?;
    info!(count = process_configs.len(), "loaded process configs");

    let alarms = Arc::new(AlarmManager::new());
    let sink = Arc::new(LoopbackFmSink {
        event_port: cfg.command_port,
    });
    let runtimes: RuntimeTable = Arc::new(Mutex::new(HashMap::new()));

    let mut known: HashMap<String, ProcessConfig> = HashMap::new();
    for pc in process_configs {
        known.insert(pc.process.clone(), pc.clone());
        spawn_process_task(pc, Arc::clone(&runtimes), Arc::clone(&alarms), Arc::clone(&sink));
    }

    let command_sock = UdpSocket::bind(("127.0.0.1", cfg.command_port)).await?;
    tokio::spawn(command_inbox::run(command_sock, Arc::clone(&runtimes)));

    let reload_flag = Arc::new(ReloadFlag::default());
    tokio::spawn(reload::watch_task(pmon_dir.clone(), Arc::clone(&reload_flag)));

    let critical_runtimes = Arc::clone(&runtimes);
    tokio::spawn(hostwd::run(
        "\0pmond-hostwd",
        Duration::from_secs(cfg.hostwd_update_period_secs),
        move || {
            critical_runtimes
                .try_lock()
                .map(|t| t.values().any(|rt| rt.quorum_unrecoverable))
                .unwrap_or(false)
        },
    ));

    let mut audit = tokio::time::interval(Duration::from_secs(cfg.audit_period_secs));
    loop {
        audit.tick().await;
        if reload_flag.take() {
            match reload::reload(&pmon_dir, &known, alarms.as_ref(), sink.as_ref(), now_secs()).await {
                Ok(next) => {
                    for (name, pc) in &next {
                        if !known.contains_key(name) {
                            spawn_process_task(
                                pc.clone(),
                                Arc::clone(&runtimes),
                                Arc::clone(&alarms),
                                Arc::clone(&sink),
                            );
                        }
                    }
                    known = next;
                    info!(count = known.len(), "process configs reloaded");
                }
                Err(e) => error!(error = %e, "config reload failed"),
            }
        }
    }
}
