//! Config-directory reload (spec §4.9): watch `/etc/pmon.d` for changes,
//! defer the actual reload to the audit tick (never mid-FSM-step) and
//! reconcile alarms against the new process set on load.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mtce_common::alarm::{AlarmManager, FmSink};
use tracing::{info, warn};

use crate::process::ProcessConfig;

/// Set by the directory watcher task, cleared by the audit loop once it has
/// actually reloaded — reload never happens from inside the watcher
/// callback's task, only from the main loop's next audit tick.
#[derive(Default)]
pub struct ReloadFlag(AtomicBool);

impl ReloadFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

pub async fn watch_task(dir: std::path::PathBuf, flag: Arc<ReloadFlag>) {
    let mut watcher = match mtce_common::config::DirWatcher::start(&dir) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, ?dir, "failed to start config directory watcher");
            return;
        }
    };
    while watcher.events.recv().await.is_some() {
        flag.request();
    }
}

/// Reload `/etc/pmon.d/*.conf`, clearing alarms for processes that
/// disappeared and leaving untouched alarms for processes that remain.
pub async fn reload(
    dir: &Path,
    existing: &HashMap<String, ProcessConfig>,
    alarms: &AlarmManager,
    sink: &dyn FmSink,
    now: u64,
) -> anyhow::Result<HashMap<String, ProcessConfig>> {
    let loaded = crate::process::load_all(dir).await?;
    let mut next: HashMap<String, ProcessConfig> = HashMap::new();
    for cfg in loaded {
        next.insert(cfg.process.clone(), cfg);
    }

    for name in existing.keys() {
        if !next.contains_key(name) {
            let entity = format!("process={name}");
            alarms.clear(sink, "200.006", &entity, now);
            info!(process = %name, "process removed from config, alarm cleared");
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_take_resets() {
        let flag = ReloadFlag::default();
        flag.request();
        assert!(flag.take());
        assert!(!flag.take());
    }
}
