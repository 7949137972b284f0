//! Service Manager (SM) loopback interaction (see spec §4.4 step 8).
//!
//! A JSON request/response pair over a loopback socket, in the same
//! "bind once, loop recv_from + serde_json::from_slice" shape as
//! `midi-host/src/osc_listener.rs`. Constants are taken verbatim from
//! `original_source/mtce/src/heartbeat/hbsAgent.cpp` lines 79-83.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Window within which an SM pulse must be observed before the engine
/// declares SM missing.
pub const SM_HEARTBEAT_PULSE_PERIOD_MSECS: u64 = 800;
/// Consecutive beeps required to recover from SM-missing.
pub const SM_HEARTBEAT_PULSE_CONTINUE_BEEP_TO_RECOVER: u32 = 16;
/// Window within which those beeps must land.
pub const SM_HEARTBEAT_PULSE_RECOVER_DURATION_MSEC: u64 = 1600;

#[derive(Debug, Deserialize)]
pub struct SmRequest {
    pub origin: String,
    pub service: String,
    pub request: String,
    pub reqid: u64,
}

#[derive(Debug, Serialize)]
pub struct ClusterSnapshotReply {
    pub origin: &'static str,
    pub service: &'static str,
    pub reqid: u64,
    pub hosts: Vec<HostClusterEntry>,
}

#[derive(Debug, Serialize, Clone)]
pub struct HostClusterEntry {
    pub hostname: String,
    pub reachable: bool,
    pub heartbeat_ok: bool,
}

/// Tracks whether SM pulses are arriving on schedule.
pub struct SmMonitor {
    last_pulse: Option<Instant>,
    missing: bool,
    recovering_beeps: u32,
    recovery_window_start: Option<Instant>,
}

impl Default for SmMonitor {
    fn default() -> Self {
        Self {
            last_pulse: None,
            missing: false,
            recovering_beeps: 0,
            recovery_window_start: None,
        }
    }
}

impl SmMonitor {
    pub fn on_pulse(&mut self, now: Instant) {
        self.last_pulse = Some(now);
        if self.missing {
            let window_start = *self.recovery_window_start.get_or_insert(now);
            if now.duration_since(window_start) > Duration::from_millis(SM_HEARTBEAT_PULSE_RECOVER_DURATION_MSEC) {
                // Window expired without enough beeps — restart the count.
                self.recovering_beeps = 1;
                self.recovery_window_start = Some(now);
                return;
            }
            self.recovering_beeps += 1;
            if self.recovering_beeps >= SM_HEARTBEAT_PULSE_CONTINUE_BEEP_TO_RECOVER {
                self.missing = false;
                self.recovering_beeps = 0;
                self.recovery_window_start = None;
                info!("SM heartbeat recovered");
            }
        }
    }

    /// Call once per tick; flips to missing if the pulse window elapsed.
    pub fn audit(&mut self, now: Instant) {
        if self.missing {
            return;
        }
        let overdue = match self.last_pulse {
            Some(t) => now.duration_since(t) > Duration::from_millis(SM_HEARTBEAT_PULSE_PERIOD_MSECS),
            None => true,
        };
        if overdue {
            self.missing = true;
            self.recovering_beeps = 0;
            self.recovery_window_start = None;
            warn!("SM heartbeat pulse missing");
        }
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }
}

/// Run the SM request server: accept `cluster_info` requests and reply
/// with a snapshot; `reqid == 0` is just a liveness pulse.
pub async fn run(
    sock: UdpSocket,
    monitor: std::sync::Arc<tokio::sync::Mutex<SmMonitor>>,
    snapshot: impl Fn() -> Vec<HostClusterEntry> + Send + Sync + 'static,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = sock.recv_from(&mut buf).await?;
        let req: SmRequest = match serde_json::from_slice(&buf[..len]) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed SM request, dropping");
                continue;
            }
        };

        monitor.lock().await.on_pulse(Instant::now());

        if req.reqid == 0 {
            continue;
        }

        let reply = ClusterSnapshotReply {
            origin: "hbs",
            service: "heartbeat",
            reqid: req.reqid,
            hosts: snapshot(),
        };
        if let Ok(wire) = serde_json::to_vec(&reply) {
            let _ = sock.send_to(&wire, peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_flags_missing_after_window_elapses() {
        let mut mon = SmMonitor::default();
        let t0 = Instant::now();
        mon.on_pulse(t0);
        let later = t0 + Duration::from_millis(SM_HEARTBEAT_PULSE_PERIOD_MSECS + 1);
        mon.audit(later);
        assert!(mon.is_missing());
    }

    #[test]
    fn recovery_requires_sixteen_beeps_within_window() {
        let mut mon = SmMonitor::default();
        let t0 = Instant::now();
        mon.audit(t0); // no pulse ever seen -> missing
        assert!(mon.is_missing());

        let mut t = t0;
        for _ in 0..15 {
            t += Duration::from_millis(10);
            mon.on_pulse(t);
        }
        assert!(mon.is_missing(), "15 beeps should not yet recover");

        t += Duration::from_millis(10);
        mon.on_pulse(t);
        assert!(!mon.is_missing(), "16th beep within window should recover");
    }

    #[test]
    fn single_miss_during_recovery_restarts_count() {
        let mut mon = SmMonitor::default();
        let t0 = Instant::now();
        mon.audit(t0);

        let mut t = t0;
        for _ in 0..10 {
            t += Duration::from_millis(10);
            mon.on_pulse(t);
        }
        // Jump past the recovery window without a pulse -> window resets.
        t += Duration::from_millis(SM_HEARTBEAT_PULSE_RECOVER_DURATION_MSEC + 100);
        mon.on_pulse(t);
        assert!(mon.is_missing(), "recovery count should have been reset by the gap");
    }
}
