//! Host-watchdog client (spec §6): a periodic heartbeat to the kernel's
//! `/dev/watchdog`-backed userspace service over an abstract UNIX domain
//! socket, escalating to `PMON_CRIT` when a monitored process with
//! `full_init_reqd` set has failed, instead of plain `NONE`.
//!
//! Grounded on the same "small periodic UDP/socket heartbeat task" shape
//! used by `hbs-agent`'s SM monitor, adapted to a UNIX socket since
//! hostwd's real transport is an abstract-namespace socket, not UDP.

use std::time::Duration;

use serde::Serialize;
use tokio::net::UnixDatagram;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchdogCmd {
    None,
    PmonCrit,
}

#[derive(Debug, Clone, Serialize)]
struct HostwdMessage {
    cmd: WatchdogCmd,
}

/// Run the heartbeat loop until the process exits. `critical` is polled
/// each tick to decide whether to escalate.
pub async fn run(socket_path: &str, period: Duration, critical: impl Fn() -> bool) -> anyhow::Result<()> {
    let sock = match UnixDatagram::unbound() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to create hostwd socket, heartbeat disabled");
            return Ok(());
        }
    };

    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let cmd = if critical() {
            WatchdogCmd::PmonCrit
        } else {
            WatchdogCmd::None
        };
        let msg = HostwdMessage { cmd };
        match serde_json::to_vec(&msg) {
            Ok(bytes) => {
                if let Err(e) = sock.send_to(&bytes, socket_path).await {
                    warn!(error = %e, socket_path, "hostwd send failed");
                }
            }
            Err(e) => warn!(error = %e, "hostwd message encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_selects_pmon_crit() {
        let msg = HostwdMessage {
            cmd: if true { WatchdogCmd::PmonCrit } else { WatchdogCmd::None },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("PMON_CRIT"));
    }
}
