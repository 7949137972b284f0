//! Status-mode process FSM (spec §4.7).
//!
//! For processes that expose neither a pidfile liveness guarantee nor an
//! active pulse responder, but do ship a `status` verb (e.g. an init
//! script's `status` action). pmond shells out on an interval and treats a
//! non-zero exit as failure, restarting via the same `start`-arg path
//! `supervisor::spawn` already knows.

use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::process::{ProcessConfig, StatusModeConfig};
use crate::supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStage {
    Begin,
    ExecuteStatus,
    ExecuteStatusWait,
    ExecuteStart,
    ExecuteStartWait,
    IntervalWait,
}

pub enum StepOutcome {
    Continue { after: Duration },
    Failed,
}

pub async fn step(
    cfg: &ProcessConfig,
    status_cfg: &StatusModeConfig,
    stage: StatusStage,
    restarts_cnt: &mut u32,
) -> (StatusStage, StepOutcome) {
    match stage {
        StatusStage::Begin => (
            StatusStage::ExecuteStatus,
            StepOutcome::Continue { after: Duration::ZERO },
        ),
        StatusStage::ExecuteStatus => {
            let script = match &cfg.script {
                Some(s) => s,
                None => {
                    warn!(process = %cfg.process, "status mode requires a script path");
                    return (StatusStage::Begin, StepOutcome::Failed);
                }
            };
            let outcome = tokio::time::timeout(
                Duration::from_millis(status_cfg.timeout),
                Command::new(script).arg(&status_cfg.status_arg).status(),
            )
            .await;
            match outcome {
                Ok(Ok(status)) if status.success() => (
                    StatusStage::IntervalWait,
                    StepOutcome::Continue {
                        after: Duration::from_millis(status_cfg.period),
                    },
                ),
                _ => (
                    StatusStage::ExecuteStart,
                    StepOutcome::Continue { after: Duration::ZERO },
                ),
            }
        }
        StatusStage::ExecuteStatusWait => (
            StatusStage::Begin,
            StepOutcome::Continue { after: Duration::ZERO },
        ),
        StatusStage::ExecuteStart => {
            *restarts_cnt += 1;
            if *restarts_cnt > cfg.restart.max_restarts {
                warn!(process = %cfg.process, "status mode exceeded max restarts");
                return (StatusStage::Begin, StepOutcome::Failed);
            }
            match supervisor::spawn(cfg, true).await {
                Ok(_) => (
                    StatusStage::ExecuteStartWait,
                    StepOutcome::Continue {
                        after: Duration::from_millis(status_cfg.period),
                    },
                ),
                Err(e) => {
                    warn!(process = %cfg.process, error = %e, "status-mode restart failed");
                    (
                        StatusStage::IntervalWait,
                        StepOutcome::Continue {
                            after: Duration::from_secs(cfg.restart.retry_interval_secs),
                        },
                    )
                }
            }
        }
        StatusStage::ExecuteStartWait => (
            StatusStage::Begin,
            StepOutcome::Continue { after: Duration::ZERO },
        ),
        StatusStage::IntervalWait => (
            StatusStage::ExecuteStart,
            StepOutcome::Continue {
                after: Duration::from_millis(status_cfg.period),
            },
        ),
    }
}
