//! Loopback status query responder for `mtce-cli` (spec §6 ambient stack).
//!
//! Read-only: takes a `watch::Receiver` snapshot of the inventory (updated
//! once per tick by `main.rs`, the same single-writer/multi-reader shape
//! the pulse engine already uses for its period channel) plus a reference
//! to the alarm manager, and answers small JSON requests over UDP.

use std::sync::Arc;

use mtce_common::alarm::AlarmManager;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::warn;

use crate::inventory::PeerSnapshot;

#[derive(Debug, Deserialize)]
#[serde(tag = "query", rename_all = "lowercase")]
pub enum CliQuery {
    Status,
    Hosts,
    Alarms,
}

#[derive(Debug, Serialize)]
pub struct StatusReply {
    pub hostname: String,
    pub peer_count: usize,
    pub failed_count: usize,
}

pub async fn run(
    sock: UdpSocket,
    hostname: String,
    peers: watch::Receiver<Vec<PeerSnapshot>>,
    alarms: Arc<AlarmManager>,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 512];
    loop {
        let (n, from) = sock.recv_from(&mut buf).await?;
        let query: CliQuery = match serde_json::from_slice(&buf[..n]) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, %from, "malformed CLI query ignored");
                continue;
            }
        };

        let reply = match query {
            CliQuery::Status => {
                let snapshot = peers.borrow().clone();
                let failed = snapshot
                    .iter()
                    .filter(|p| p.mgmnt_state == crate::inventory::HbState::Failed)
                    .count();
                serde_json::to_vec(&StatusReply {
                    hostname: hostname.clone(),
                    peer_count: snapshot.len(),
                    failed_count: failed,
                })
            }
            CliQuery::Hosts => serde_json::to_vec(&*peers.borrow()),
            CliQuery::Alarms => serde_json::to_vec(&alarms.query(None)),
        };

        match reply {
            Ok(bytes) => {
                if let Err(e) = sock.send_to(&bytes, from).await {
                    warn!(error = %e, "CLI query reply send failed");
                }
            }
            Err(e) => warn!(error = %e, "CLI query reply encode failed"),
        }
    }
}
