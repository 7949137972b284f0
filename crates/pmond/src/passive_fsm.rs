//! Passive-mode process FSM (spec §4.5).
//!
//! Drives a process that reports no liveness signal of its own beyond the
//! kernel's SIGCHLD/exit notification: pmond starts it, waits for it to
//! die, and decides whether to respawn, ignore or give up based on the
//! configured restart policy. Mirrors the `START → MANAGE → RESPAWN →
//! MONITOR_WAIT → MONITOR → ...` diagram one to one; each `step` call
//! advances the runtime exactly one transition, same shape as the
//! `tokio::select!`-driven step functions elsewhere in this workspace.

use std::time::{Duration, Instant};

use mtce_common::alarm::{AlarmManager, FmSink};
use tracing::{info, warn};

use crate::process::{ProcessConfig, ProcessRuntime, Severity};
use crate::supervisor;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn alarm_severity(cfg_severity: Severity) -> mtce_common::alarm::Severity {
    match cfg_severity {
        Severity::Minor => mtce_common::alarm::Severity::Minor,
        Severity::Major => mtce_common::alarm::Severity::Major,
        Severity::Critical => mtce_common::alarm::Severity::Critical,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveStage {
    Start,
    Manage,
    Respawn,
    MonitorWait,
    Monitor,
    TimerWait,
    RestartWait,
    Finish,
    Ignore,
    Polling,
    StartWait,
}

/// What the caller (the per-process supervisor task) should do after a step.
pub enum StepOutcome {
    /// No externally visible change; re-poll after `after`.
    Continue { after: Duration },
    /// Runtime entered the terminal `failed` state; alarm already raised by
    /// the time this is returned.
    Failed,
    /// Process exited and won't be restarted (config says so, or `stop`
    /// command was issued) but isn't treated as a failure.
    Stopped,
}

impl ProcessRuntime {
    /// Advance the passive FSM by one step. `child_alive` reflects the
    /// kernel notification (SIGCHLD/waitpid or pidfile poll) collected by
    /// the supervisor just before calling in.
    pub async fn step_passive(
        &mut self,
        cfg: &ProcessConfig,
        child_alive: bool,
        now: Instant,
        alarms: &AlarmManager,
        sink: &dyn FmSink,
    ) -> StepOutcome {
        let entity = format!("process={}", cfg.process);
        match self.stage {
            PassiveStage::Start => {
                if cfg.restart.start_delay_secs > 0 && self.last_spawn.is_none() {
                    self.last_spawn = Some(now);
                    return StepOutcome::Continue {
                        after: Duration::from_secs(cfg.restart.start_delay_secs),
                    };
                }
                self.stage = PassiveStage::Manage;
                StepOutcome::Continue { after: Duration::ZERO }
            }
            PassiveStage::Manage => {
                if self.stopped {
                    self.registered = false;
                    self.stage = PassiveStage::Ignore;
                    return StepOutcome::Stopped;
                }
                match supervisor::spawn(cfg, false).await {
                    Ok(pid) => {
                        self.pid = Some(pid);
                        self.child_spawn_pid = Some(pid);
                        self.last_spawn = Some(now);
                        self.registered = true;
                        self.stage = PassiveStage::MonitorWait;
                        alarms.clear(sink, "200.006", &entity, now_secs());
                        info!(process = %cfg.process, pid, "process started");
                    }
                    Err(e) => {
                        warn!(process = %cfg.process, error = %e, "spawn failed");
                        self.stage = PassiveStage::Respawn;
                    }
                }
                StepOutcome::Continue {
                    after: Duration::from_millis(200),
                }
            }
            PassiveStage::Respawn => {
                self.restarts_cnt += 1;
                if cfg.quorum {
                    self.quorum_process_failure();
                }
                if self.restarts_cnt > cfg.restart.max_restarts {
                    if cfg.severity == Severity::Critical && cfg.restart.max_restarts == 0 {
                        self.failed = true;
                        self.ignore = true;
                        self.registered = false;
                        alarms.raise(
                            sink,
                            &cfg.process,
                            "200.006",
                            &entity,
                            alarm_severity(cfg.severity),
                            "critical process failed with no restart budget",
                            now_secs(),
                        );
                        warn!(process = %cfg.process, "critical process exhausted restart budget, giving up");
                        self.stage = PassiveStage::Ignore;
                        return StepOutcome::Failed;
                    }
                    alarms.raise(
                        sink,
                        &cfg.process,
                        "200.006",
                        &entity,
                        alarm_severity(cfg.severity),
                        "process exceeded restart retries, continuing to retry",
                        now_secs(),
                    );
                    warn!(process = %cfg.process, restarts = self.restarts_cnt, "exceeded max restarts, resetting and retrying");
                    self.restarts_cnt = 0;
                }
                self.stage = PassiveStage::RestartWait;
                StepOutcome::Continue {
                    after: Duration::from_secs(cfg.restart.retry_interval_secs),
                }
            }
            PassiveStage::MonitorWait => {
                self.stage = PassiveStage::Monitor;
                StepOutcome::Continue {
                    after: Duration::from_millis(200),
                }
            }
            PassiveStage::Monitor => {
                if !child_alive {
                    self.stage = PassiveStage::TimerWait;
                    return StepOutcome::Continue { after: Duration::ZERO };
                }
                StepOutcome::Continue {
                    after: Duration::from_millis(200),
                }
            }
            PassiveStage::TimerWait => {
                let debounce = Duration::from_secs(cfg.restart.debounce_secs);
                self.debounce_cnt += 1;
                if self.last_spawn.map(|t| now.duration_since(t) < debounce).unwrap_or(false) {
                    self.stage = PassiveStage::RestartWait;
                } else {
                    self.stage = PassiveStage::Respawn;
                }
                StepOutcome::Continue { after: Duration::ZERO }
            }
            PassiveStage::RestartWait => {
                self.stage = PassiveStage::Manage;
                StepOutcome::Continue { after: Duration::ZERO }
            }
            PassiveStage::Finish => StepOutcome::Stopped,
            PassiveStage::Ignore => {
                self.ignore = true;
                StepOutcome::Continue {
                    after: Duration::from_secs(3600),
                }
            }
            PassiveStage::Polling => {
                self.stage = PassiveStage::StartWait;
                StepOutcome::Continue {
                    after: Duration::from_secs(cfg.restart.start_delay_secs.max(1)),
                }
            }
            PassiveStage::StartWait => {
                self.stage = PassiveStage::Manage;
                StepOutcome::Continue { after: Duration::ZERO }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RestartPolicy;
    use mtce_common::alarm::Alarm;

    struct NullSink;
    impl FmSink for NullSink {
        fn dispatch(&self, _alarms: Vec<Alarm>) {}
    }

    fn cfg(max_restarts: u32) -> ProcessConfig {
        ProcessConfig {
            process: "testproc".into(),
            mode: crate::process::MonitorMode::Passive,
            severity: crate::process::Severity::Major,
            service: None,
            script: None,
            style: None,
            pidfile: "/tmp/testproc.pid".into(),
            restart: RestartPolicy {
                max_restarts,
                retry_interval_secs: 0,
                debounce_secs: 0,
                start_delay_secs: 0,
            },
            subfunction: None,
            quorum: false,
            full_init_reqd: false,
            active: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn respawn_past_max_restarts_resets_and_keeps_retrying() {
        let mut rt = ProcessRuntime::default();
        rt.stage = PassiveStage::Respawn;
        rt.restarts_cnt = 2;
        let c = cfg(2);
        let alarms = AlarmManager::new();
        let outcome = rt.step_passive(&c, false, Instant::now(), &alarms, &NullSink).await;
        assert!(!rt.failed);
        assert_eq!(rt.restarts_cnt, 0);
        assert_eq!(rt.stage, PassiveStage::RestartWait);
        assert!(matches!(outcome, StepOutcome::Continue { .. }));
        assert!(!alarms.query(None).is_empty());
    }

    #[tokio::test]
    async fn critical_process_with_no_restart_budget_goes_to_ignore() {
        let mut rt = ProcessRuntime::default();
        rt.stage = PassiveStage::Respawn;
        rt.restarts_cnt = 0;
        let mut c = cfg(0);
        c.severity = crate::process::Severity::Critical;
        c.quorum = true;
        let alarms = AlarmManager::new();
        let outcome = rt.step_passive(&c, false, Instant::now(), &alarms, &NullSink).await;
        assert!(rt.failed);
        assert!(rt.ignore);
        assert!(rt.quorum_failure);
        assert_eq!(rt.stage, PassiveStage::Ignore);
        assert!(matches!(outcome, StepOutcome::Failed));
    }

    #[tokio::test]
    async fn quorum_member_failure_escalates_to_unrecoverable_on_second_restart() {
        let mut rt = ProcessRuntime::default();
        rt.stage = PassiveStage::Respawn;
        let mut c = cfg(10);
        c.quorum = true;
        let alarms = AlarmManager::new();
        rt.step_passive(&c, false, Instant::now(), &alarms, &NullSink).await;
        assert!(rt.quorum_failure);
        assert!(!rt.quorum_unrecoverable);
        rt.stage = PassiveStage::Respawn;
        rt.step_passive(&c, false, Instant::now(), &alarms, &NullSink).await;
        assert!(rt.quorum_unrecoverable);
    }

    #[tokio::test]
    async fn monitor_exits_to_timer_wait_when_child_dies() {
        let mut rt = ProcessRuntime::default();
        rt.stage = PassiveStage::Monitor;
        let c = cfg(5);
        let alarms = AlarmManager::new();
        let _ = rt.step_passive(&c, false, Instant::now(), &alarms, &NullSink).await;
        assert_eq!(rt.stage, PassiveStage::TimerWait);
    }
}
