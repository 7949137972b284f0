//! Timer service (see spec §4.1).
//!
//! Delivers a "ring" to the owner of a named timer once its duration has
//! elapsed. There is no real per-timer OS resource here -- the service is
//! polled once per main-loop tick, which is the same granularity the
//! teacher's `TaskPulse`/`TaskMonitor` watch-channel pair polls task
//! liveness at (`midi-client/src/health.rs`), just generalized from "is this
//! task still alive" to "has this named timer expired".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// No timer may be armed for longer than this.
pub const MAX_TIMER_DURATION: Duration = Duration::from_secs(30_000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("duration exceeds the {max_secs}s ceiling")]
    BadDuration { max_secs: u64 },
    #[error("timer '{0}' has no registered handler")]
    NullHandler(String),
}

struct TimerEntry {
    expiry: Instant,
    rung: bool,
}

/// Process-wide timer table. Not `Sync` -- owned and mutated only by the
/// main loop, matching the single-threaded cooperative model in §5.
pub struct TimerService {
    timers: HashMap<String, TimerEntry>,
    /// Diagnostic counter: rings observed for an identifier the service
    /// doesn't recognize (stale or already-stopped timer).
    unknown_rings: u64,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            unknown_rings: 0,
        }
    }

    /// Arm `name` to ring after `duration`. A concurrent `start` on an
    /// already-armed timer cancels and replaces the previous expiry.
    pub fn start(&mut self, name: &str, duration: Duration) -> Result<(), TimerError> {
        if duration > MAX_TIMER_DURATION {
            return Err(TimerError::BadDuration {
                max_secs: MAX_TIMER_DURATION.as_secs(),
            });
        }
        self.timers.insert(
            name.to_string(),
            TimerEntry {
                expiry: Instant::now() + duration,
                rung: false,
            },
        );
        Ok(())
    }

    /// Idempotent; safe to call on a timer that was never started.
    pub fn stop(&mut self, name: &str) {
        self.timers.remove(name);
    }

    /// True if `ring` was observed since the last `reset` or `start`.
    pub fn expired(&self, name: &str) -> bool {
        self.timers.get(name).is_some_and(|t| t.rung)
    }

    /// Clear the rung flag without disarming the timer.
    pub fn reset(&mut self, name: &str) {
        if let Some(t) = self.timers.get_mut(name) {
            t.rung = false;
        }
    }

    /// Advance the service to `now`, flipping any timer whose expiry has
    /// passed. Returns the names that rang on this call (newly, not ones
    /// already rung and unread).
    pub fn poll(&mut self, now: Instant) -> Vec<String> {
        let mut rung = Vec::new();
        for (name, entry) in self.timers.iter_mut() {
            if !entry.rung && now >= entry.expiry {
                entry.rung = true;
                rung.push(name.clone());
            }
        }
        rung
    }

    /// Record a ring for a name the service has no entry for. Does not
    /// dispatch anything -- just a diagnostic counter per the contract.
    pub fn record_unknown_ring(&mut self, name: &str) {
        if !self.timers.contains_key(name) {
            self.unknown_rings += 1;
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    pub fn unknown_ring_count(&self) -> u64 {
        self.unknown_rings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duration_over_ceiling() {
        let mut svc = TimerService::new();
        let err = svc
            .start("t1", MAX_TIMER_DURATION + Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(
            err,
            TimerError::BadDuration {
                max_secs: MAX_TIMER_DURATION.as_secs()
            }
        );
        // Failed start leaves the timer stopped, non-ringing.
        assert!(!svc.expired("t1"));
        assert_eq!(svc.active_count(), 0);
    }

    #[test]
    fn restart_cancels_previous_expiry() {
        let mut svc = TimerService::new();
        svc.start("t1", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Re-arm before polling -- the earlier (already elapsed) expiry
        // must not be observed.
        svc.start("t1", Duration::from_secs(30)).unwrap();
        let rung = svc.poll(Instant::now());
        assert!(rung.is_empty());
        assert!(!svc.expired("t1"));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut svc = TimerService::new();
        svc.stop("never-started");
        svc.start("t1", Duration::from_secs(1)).unwrap();
        svc.stop("t1");
        svc.stop("t1");
        assert_eq!(svc.active_count(), 0);
    }

    #[test]
    fn poll_rings_exactly_once() {
        let mut svc = TimerService::new();
        svc.start("t1", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let now = Instant::now();
        assert_eq!(svc.poll(now), vec!["t1".to_string()]);
        // Second poll: already rung, not reported again.
        assert!(svc.poll(now).is_empty());
        assert!(svc.expired("t1"));
    }

    #[test]
    fn reset_clears_rung_without_disarming() {
        let mut svc = TimerService::new();
        svc.start("t1", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        svc.poll(Instant::now());
        assert!(svc.expired("t1"));
        svc.reset("t1");
        assert!(!svc.expired("t1"));
        assert_eq!(svc.active_count(), 1);
    }

    #[test]
    fn unknown_ring_counted_not_dispatched() {
        let mut svc = TimerService::new();
        svc.record_unknown_ring("ghost");
        svc.record_unknown_ring("ghost");
        assert_eq!(svc.unknown_ring_count(), 2);
    }
}
