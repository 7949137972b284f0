//! mtcAgent command inbox: JSON-over-loopback-UDP `backoff`/`recover`/
//! `del_host`/`stop_host` (spec §4.4 step 6, cancellation contract),
//! mirroring `pmond::command_inbox`'s shape. Unlike pmond's inbox, this one
//! never touches `Inventory`/`PulseEngine` directly — both are plain locals
//! owned by the main-loop task (spec §5: "per-peer state is mutated only
//! from the main loop"), so the listener only forwards parsed commands
//! through a channel for the main loop to apply.

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    /// `MTC_BACKOFF_HBS`: slow the pulse period for MNFA.
    Backoff,
    /// `MTC_RECOVER_HBS`: restore the base pulse period and clear MNFA.
    Recover,
    /// Remove a host from inventory entirely.
    DelHost { hostname: String },
    /// Stop monitoring a host but keep its inventory entry.
    StopHost { hostname: String },
}

pub async fn run(sock: UdpSocket, tx: mpsc::Sender<Command>) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let (n, from) = sock.recv_from(&mut buf).await?;
        let cmd: Command = match serde_json::from_slice(&buf[..n]) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, %from, "malformed mtcAgent command ignored");
                continue;
            }
        };
        if tx.send(cmd).await.is_err() {
            break;
        }
    }
    Ok(())
}
