//! Operator command inbox: JSON-over-loopback-UDP `start`/`stop`/`restart`
//! (spec §4.8), read by `mtce-cli` and applied against the shared runtime
//! table. Schema mirrors `mtce_common::event::Event`'s "small JSON struct
//! over loopback UDP" shape rather than inventing a new wire format.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::process::ProcessRuntime;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Start { process: String },
    Stop { process: String },
    Restart { process: String },
    Status,
}

#[derive(Debug, Serialize)]
pub struct ProcessSnapshot {
    pub process: String,
    pub pid: Option<u32>,
    pub restarts_cnt: u32,
    pub failed: bool,
    pub stopped: bool,
    pub ignore: bool,
}

pub type RuntimeTable = Arc<Mutex<HashMap<String, ProcessRuntime>>>;

pub async fn run(sock: UdpSocket, runtimes: RuntimeTable) -> anyhow::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        let (n, from) = sock.recv_from(&mut buf).await?;
        let cmd: Command = match serde_json::from_slice(&buf[..n]) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, %from, "malformed command ignored");
                continue;
            }
        };
        if matches!(cmd, Command::Status) {
            let snapshot = snapshot(&runtimes).await;
            match serde_json::to_vec(&snapshot) {
                Ok(bytes) => {
                    if let Err(e) = sock.send_to(&bytes, from).await {
                        warn!(error = %e, "status reply send failed");
                    }
                }
                Err(e) => warn!(error = %e, "status reply encode failed"),
            }
            continue;
        }
        apply(&runtimes, cmd).await;
    }
}

async fn snapshot(runtimes: &RuntimeTable) -> Vec<ProcessSnapshot> {
    runtimes
        .lock()
        .await
        .iter()
        .map(|(name, rt)| ProcessSnapshot {
            process: name.clone(),
            pid: rt.pid,
            restarts_cnt: rt.restarts_cnt,
            failed: rt.failed,
            stopped: rt.stopped,
            ignore: rt.ignore,
        })
        .collect()
}

async fn apply(runtimes: &RuntimeTable, cmd: Command) {
    let mut table = runtimes.lock().await;
    match cmd {
        Command::Stop { process } => {
            if let Some(rt) = table.get_mut(&process) {
                rt.stopped = true;
                if let Some(pid) = rt.pid {
                    if let Err(e) = crate::supervisor::stop(pid) {
                        warn!(process = %process, error = %e, "stop failed");
                    }
                }
                info!(process = %process, "process stop requested");
            }
        }
        Command::Start { process } => {
            if let Some(rt) = table.get_mut(&process) {
                rt.stopped = false;
                rt.stage = crate::passive_fsm::PassiveStage::Manage;
                info!(process = %process, "process start requested");
            }
        }
        Command::Restart { process } => {
            if let Some(rt) = table.get_mut(&process) {
                rt.stopped = false;
                rt.restarts_cnt = 0;
                rt.stage = crate::passive_fsm::PassiveStage::Manage;
                info!(process = %process, "process restart requested");
            }
        }
        Command::Status => unreachable!("handled in run() before dispatch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_marks_runtime_stopped() {
        let runtimes: RuntimeTable = Arc::new(Mutex::new(HashMap::new()));
        runtimes.lock().await.insert("proc-a".into(), ProcessRuntime::default());
        apply(&runtimes, Command::Stop { process: "proc-a".into() }).await;
        assert!(runtimes.lock().await.get("proc-a").unwrap().stopped);
    }

    #[tokio::test]
    async fn restart_resets_counters() {
        let runtimes: RuntimeTable = Arc::new(Mutex::new(HashMap::new()));
        let mut rt = ProcessRuntime::default();
        rt.restarts_cnt = 5;
        rt.stopped = true;
        runtimes.lock().await.insert("proc-b".into(), rt);
        apply(&runtimes, Command::Restart { process: "proc-b".into() }).await;
        let table = runtimes.lock().await;
        let rt = table.get("proc-b").unwrap();
        assert_eq!(rt.restarts_cnt, 0);
        assert!(!rt.stopped);
    }
}
