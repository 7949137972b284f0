//! Active-mode process FSM (spec §4.6).
//!
//! Unlike passive mode, the monitored process itself answers a loopback UDP
//! pulse request on `cfg.active.port`. Frame layout follows the same
//! magic-tagged, big-endian header style as `mtce_common::pulse`, just a
//! much smaller fixed-size frame since there is no hostname/cluster payload
//! to carry — this is a single-host loopback exchange.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::warn;

use crate::process::{ActiveModeConfig, ProcessRuntime};

pub const AMON_MAGIC_NUM: u32 = 0x414d_4f4e; // "AMON"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStage {
    Idle,
    StartMonitor,
    GapSetup,
    GapWait,
    PulseRequest,
    RequestWait,
    PulseResponse,
    Failed,
    DebounceSetup,
    Debounce,
}

#[derive(Debug, Error)]
pub enum AmonError {
    #[error("frame too short: {0} bytes")]
    Short(usize),
    #[error("bad magic: {0:#x}")]
    BadMagic(u32),
}

/// 8-byte wire frame: magic(4) | sequence(4).
pub struct AmonFrame {
    pub sequence: u32,
}

impl AmonFrame {
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&AMON_MAGIC_NUM.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AmonError> {
        if bytes.len() < 8 {
            return Err(AmonError::Short(bytes.len()));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != AMON_MAGIC_NUM {
            return Err(AmonError::BadMagic(magic));
        }
        let sequence = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        Ok(Self { sequence })
    }
}

pub enum StepOutcome {
    Continue { after: Duration },
    Failed,
}

impl ProcessRuntime {
    /// Advance the active FSM one step, using `sock` (already bound to
    /// loopback) to exchange one pulse request/response pair.
    pub async fn step_active(
        &mut self,
        process: &str,
        cfg: &ActiveModeConfig,
        sock: &UdpSocket,
        now: Instant,
    ) -> StepOutcome {
        match self.active_stage() {
            ActiveStage::Idle | ActiveStage::StartMonitor => {
                self.set_active_stage(ActiveStage::GapSetup);
                StepOutcome::Continue { after: Duration::ZERO }
            }
            ActiveStage::GapSetup => {
                self.set_active_stage(ActiveStage::GapWait);
                StepOutcome::Continue {
                    after: Duration::from_millis(cfg.period),
                }
            }
            ActiveStage::GapWait => {
                self.set_active_stage(ActiveStage::PulseRequest);
                StepOutcome::Continue { after: Duration::ZERO }
            }
            ActiveStage::PulseRequest => {
                self.tx_sequence = self.tx_sequence.wrapping_add(1);
                let frame = AmonFrame { sequence: self.tx_sequence }.encode();
                if let Err(e) = sock.send_to(&frame, ("127.0.0.1", cfg.port)).await {
                    warn!(process = %process, error = %e, "active pulse send failed");
                }
                self.set_active_stage(ActiveStage::RequestWait);
                StepOutcome::Continue {
                    after: Duration::from_millis(cfg.timeout),
                }
            }
            ActiveStage::RequestWait => {
                let mut buf = [0u8; 64];
                let deadline = Duration::from_millis(cfg.timeout);
                match timeout(deadline, sock.recv_from(&mut buf)).await {
                    Ok(Ok((n, _))) => match AmonFrame::decode(&buf[..n]) {
                        Ok(frame) if frame.sequence == self.tx_sequence => {
                            self.rx_sequence = frame.sequence;
                            self.b2b_miss_count = 0;
                            self.set_active_stage(ActiveStage::PulseResponse);
                        }
                        _ => self.register_active_miss(process, cfg, now),
                    },
                    _ => self.register_active_miss(process, cfg, now),
                }
                StepOutcome::Continue { after: Duration::ZERO }
            }
            ActiveStage::PulseResponse => {
                self.set_active_stage(ActiveStage::GapSetup);
                StepOutcome::Continue { after: Duration::ZERO }
            }
            ActiveStage::Failed => StepOutcome::Failed,
            ActiveStage::DebounceSetup => {
                self.set_active_stage(ActiveStage::Debounce);
                StepOutcome::Continue {
                    after: Duration::from_secs(1),
                }
            }
            ActiveStage::Debounce => {
                self.set_active_stage(ActiveStage::GapSetup);
                StepOutcome::Continue { after: Duration::ZERO }
            }
        }
    }

    fn register_active_miss(&mut self, process: &str, cfg: &ActiveModeConfig, _now: Instant) {
        self.b2b_miss_count += 1;
        warn!(process = %process, misses = self.b2b_miss_count, threshold = cfg.threshold, "active pulse missed");
        if self.b2b_miss_count >= cfg.threshold {
            self.failed = true;
            self.set_active_stage(ActiveStage::Failed);
        } else {
            self.set_active_stage(ActiveStage::DebounceSetup);
        }
    }

    fn active_stage(&self) -> ActiveStage {
        self.active_stage
    }

    fn set_active_stage(&mut self, stage: ActiveStage) {
        self.active_stage = stage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = AmonFrame { sequence: 42 };
        let bytes = frame.encode();
        let decoded = AmonFrame::decode(&bytes).unwrap();
        assert_eq!(decoded.sequence, 42);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = AmonFrame { sequence: 1 }.encode();
        bytes[0] = 0;
        assert!(matches!(AmonFrame::decode(&bytes), Err(AmonError::BadMagic(_))));
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(matches!(AmonFrame::decode(&[1, 2, 3]), Err(AmonError::Short(3))));
    }
}
