//! HBS pulse engine: TX phase, RX phase, per-peer accounting (see spec §4.4).
//!
//! The TX/RX split and the `tokio::time::interval`-bounded drain loop are
//! grounded on `midi-host/src/broadcaster.rs::{run, run_heartbeat}`; MNFA
//! period reconfiguration reuses the `watch::channel`-driven role-switch
//! pattern from `midi-host/src/main.rs`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use mtce_common::alarm::{AlarmManager, FmSink};
use mtce_common::net::{bind_rx, bind_tx, BindRxOptions};
use mtce_common::pulse::{PulseFlags, PulseRequest, PulseResponse};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::inventory::{apply_transition, Inventory, Network};

/// Back-to-back send failures on a network before the socket is torn down
/// and reopened (spec §4.4 step 1).
pub const INTERFACE_ERRORS_FOR_REINIT: u32 = 8;

/// Period base/bounds (spec §4.4).
pub const HBS_MIN_PERIOD_MS: u64 = 100;
pub const HBS_MAX_PERIOD_MS: u64 = 1000;

/// MNFA backoff multiplier (`MTC_BACKOFF_HBS` command, spec §4.4 step 6).
pub const MNFA_BACKOFF_MULTIPLIER: u64 = 4;

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct NetworkSockets {
    tx: UdpSocket,
    rx: UdpSocket,
    dest: SocketAddr,
    consecutive_send_errors: u32,
    multicast_addr: Ipv4Addr,
    port: u16,
}

impl NetworkSockets {
    fn open(multicast_addr: Ipv4Addr, port: u16) -> anyhow::Result<Self> {
        let (tx, _) = bind_tx(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(), None)?;
        let (rx, _) = bind_rx(
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into(),
            &BindRxOptions {
                multicast_group: Some(multicast_addr),
                allow_any: true,
                ..Default::default()
            },
        )?;
        Ok(Self {
            tx,
            rx,
            dest: SocketAddrV4::new(multicast_addr, port).into(),
            consecutive_send_errors: 0,
            multicast_addr,
            port,
        })
    }

    fn reinit(&mut self) -> anyhow::Result<()> {
        warn!(port = self.port, "reinitializing heartbeat socket after repeated send failures");
        *self = Self::open(self.multicast_addr, self.port)?;
        Ok(())
    }
}

pub struct PulseEngineConfig {
    pub hostname: String,
    pub is_controller: bool,
    pub mgmnt_multicast: Ipv4Addr,
    pub mgmnt_port: u16,
    pub clstr_multicast: Option<Ipv4Addr>,
    pub clstr_port: u16,
    pub base_period_ms: u64,
}

pub struct PulseEngine {
    cfg: PulseEngineConfig,
    mgmnt: NetworkSockets,
    clstr: Option<NetworkSockets>,
    sequence: u32,
    period_tx: watch::Sender<u64>,
}

impl PulseEngine {
    pub fn new(cfg: PulseEngineConfig) -> anyhow::Result<(Self, watch::Receiver<u64>)> {
        let mgmnt = NetworkSockets::open(cfg.mgmnt_multicast, cfg.mgmnt_port)?;
        let clstr = match cfg.clstr_multicast {
            Some(addr) => Some(NetworkSockets::open(addr, cfg.clstr_port)?),
            None => None,
        };
        let base = cfg.base_period_ms.clamp(HBS_MIN_PERIOD_MS, HBS_MAX_PERIOD_MS);
        let (period_tx, period_rx) = watch::channel(base);
        Ok((
            Self {
                cfg,
                mgmnt,
                clstr,
                sequence: 0,
                period_tx,
            },
            period_rx,
        ))
    }

    /// `MTC_BACKOFF_HBS`: multiply the period by 4 for MNFA recovery.
    pub fn backoff(&self) {
        let base = self.cfg.base_period_ms.clamp(HBS_MIN_PERIOD_MS, HBS_MAX_PERIOD_MS);
        let _ = self.period_tx.send(base * MNFA_BACKOFF_MULTIPLIER);
    }

    /// `MTC_RECOVER_HBS`: restore the base period.
    pub fn recover_period(&self) {
        let base = self.cfg.base_period_ms.clamp(HBS_MIN_PERIOD_MS, HBS_MAX_PERIOD_MS);
        let _ = self.period_tx.send(base);
    }

    /// One full tick: TX phase then RX-drain phase for both networks,
    /// followed by miss accounting and ladder evaluation.
    pub async fn tick(
        &mut self,
        inventory: &mut Inventory,
        alarms: &AlarmManager,
        sink: &dyn FmSink,
        tick_duration: Duration,
    ) {
        self.sequence = self.sequence.wrapping_add(1);

        inventory.arm_period(Network::Mgmnt);
        if self.clstr.is_some() {
            inventory.arm_period(Network::Clstr);
        }

        // Computed once per tick and shared by both sends, so a receiver
        // can use it as a lookup clue regardless of which network the
        // request arrived on (spec §3).
        let rri = inventory.next_rri();

        self.send_request(Network::Mgmnt, rri).await;
        if self.clstr.is_some() {
            self.send_request(Network::Clstr, rri).await;
        }

        let deadline = tokio::time::Instant::now() + tick_duration;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => break,
                res = recv_one(&self.mgmnt.rx) => {
                    if let Some(buf) = res {
                        self.handle_response(&buf, Network::Mgmnt, inventory);
                    }
                }
                res = recv_maybe(self.clstr.as_ref().map(|c| &c.rx)), if self.clstr.is_some() => {
                    if let Some(buf) = res {
                        self.handle_response(&buf, Network::Clstr, inventory);
                    }
                }
            }
        }

        let now = now_unix();
        let action = inventory.failure_action();
        for (hostname, net, transition) in inventory.close_period(Network::Mgmnt) {
            apply_transition(alarms, sink, &hostname, net, transition, action, now);
        }
        if self.clstr.is_some() {
            for (hostname, net, transition) in inventory.close_period(Network::Clstr) {
                apply_transition(alarms, sink, &hostname, net, transition, action, now);
            }
        }
    }

    async fn send_request(&mut self, net: Network, rri: u32) {
        let mut flags = PulseFlags::HEARTBEAT_OK;
        if self.cfg.is_controller {
            flags |= PulseFlags::CONTROLLER_ORIGIN;
        }
        let req = PulseRequest {
            sequence: self.sequence,
            flags,
            rri,
            sender_hostname: self.cfg.hostname.clone(),
            cluster_snapshot: Vec::new(),
        };
        let wire = req.encode();
        let sockets = match net {
            Network::Mgmnt => &mut self.mgmnt,
            Network::Clstr => match self.clstr.as_mut() {
                Some(s) => s,
                None => return,
            },
        };
        match sockets.tx.send_to(&wire, sockets.dest).await {
            Ok(_) => {
                sockets.consecutive_send_errors = 0;
                debug!(seq = self.sequence, ?net, "sent pulse request");
            }
            Err(e) => {
                sockets.consecutive_send_errors += 1;
                warn!(error = %e, ?net, "pulse send failed");
                if sockets.consecutive_send_errors >= INTERFACE_ERRORS_FOR_REINIT {
                    if let Err(e) = sockets.reinit() {
                        warn!(error = %e, ?net, "pulse socket reinit failed");
                    }
                }
            }
        }
    }

    fn handle_response(&mut self, buf: &[u8], net: Network, inventory: &mut Inventory) {
        let resp = match PulseResponse::decode(buf) {
            Ok(r) => r,
            Err(_) => return,
        };
        if resp.sender_hostname == self.cfg.hostname {
            return;
        }
        if resp.sequence != self.sequence {
            return;
        }
        // Spec §4.4 step 2 / invariant 2: only credit a response that
        // originated from a request addressed by the same controller — a
        // response meant for the other controller must not be credited here.
        if resp.flags.contains(PulseFlags::CONTROLLER_ORIGIN) != self.cfg.is_controller {
            return;
        }
        inventory.credit_response(&resp.sender_hostname, net);
    }
}

async fn recv_one(sock: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 1024];
    match sock.recv_from(&mut buf).await {
        Ok((len, _)) => {
            buf.truncate(len);
            Some(buf)
        }
        Err(_) => None,
    }
}

async fn recv_maybe(sock: Option<&UdpSocket>) -> Option<Vec<u8>> {
    match sock {
        Some(s) => recv_one(s).await,
        None => std::future::pending().await,
    }
}

#[allow(dead_code)]
fn log_engine_ready(hostname: &str) {
    info!(host = hostname, "pulse engine ready");
}
