//! Alarm library: severity ladder, dedup bookkeeping, FM sink (see spec
//! §4.3, §6).
//!
//! `AlarmManager`'s active-alert map keyed by entity + history ring +
//! fire/resolve logic is generalized directly from
//! `midi-admin/src/alerting.rs::AlertManager`, widened from a handful of
//! fixed named thresholds to the arbitrary `(alarm_id, entity_instance)`
//! keying the maintenance stack needs. The fire-and-forget dispatch
//! pattern (`tokio::spawn`, log failures, never retry) mirrors that file's
//! `dispatch_webhook`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Severity ladder, ordered `Clear < Warning < Minor < Major < Critical`
/// (see spec §3's Alarm record definition).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Clear,
    Warning,
    Minor,
    Major,
    Critical,
}

/// Emission mode: `Msg` is log-only, `Set` raises a standing alarm that
/// must later be explicitly cleared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmissionMode {
    Msg,
    Set,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AlarmKey {
    pub alarm_id: String,
    pub entity_instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub host: String,
    pub alarm_id: String,
    pub entity_instance: String,
    pub severity: Severity,
    pub reason_text: String,
    pub raised_at: u64,
    pub cleared_at: Option<u64>,
}

/// Sink the `AlarmManager` forwards raised/cleared alarms to. Production
/// code uses `LoopbackFmSink`; tests use an in-memory stand-in.
pub trait FmSink: Send + Sync {
    fn dispatch(&self, batch: Vec<Alarm>);
}

pub struct AlarmManager {
    active: Mutex<HashMap<AlarmKey, Alarm>>,
    history: Mutex<Vec<Alarm>>,
}

impl Default for AlarmManager {
    fn default() -> Self {
        Self::new()
    }
}

const HISTORY_CAP: usize = 1000;

impl AlarmManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Raise (or re-raise at a new severity) an alarm. Idempotent: raising
    /// the same key at the same severity is a no-op against the sink.
    pub fn raise(
        &self,
        sink: &dyn FmSink,
        host: &str,
        alarm_id: &str,
        entity_instance: &str,
        severity: Severity,
        reason_text: &str,
        now: u64,
    ) {
        let key = AlarmKey {
            alarm_id: alarm_id.to_string(),
            entity_instance: entity_instance.to_string(),
        };
        let mut active = self.active.lock().unwrap();

        if let Some(existing) = active.get(&key) {
            if existing.severity == severity {
                return;
            }
        }

        let alarm = Alarm {
            host: host.to_string(),
            alarm_id: alarm_id.to_string(),
            entity_instance: entity_instance.to_string(),
            severity,
            reason_text: reason_text.to_string(),
            raised_at: now,
            cleared_at: None,
        };
        active.insert(key, alarm.clone());
        drop(active);

        self.push_history(alarm.clone());
        sink.dispatch(vec![alarm]);
    }

    /// Clear a single alarm. No-op if it isn't currently active.
    pub fn clear(&self, sink: &dyn FmSink, alarm_id: &str, entity_instance: &str, now: u64) {
        let key = AlarmKey {
            alarm_id: alarm_id.to_string(),
            entity_instance: entity_instance.to_string(),
        };
        let mut active = self.active.lock().unwrap();
        if let Some(mut alarm) = active.remove(&key) {
            drop(active);
            alarm.severity = Severity::Clear;
            alarm.cleared_at = Some(now);
            self.push_history(alarm.clone());
            sink.dispatch(vec![alarm]);
        }
    }

    /// Clear every active alarm under an entity root, e.g. `host=compute-1`
    /// also clears `host=compute-1.process=nfv-vim` (used on node delete /
    /// process removal; spec §4.3).
    pub fn clear_all(&self, sink: &dyn FmSink, entity_root: &str, now: u64) {
        let mut active = self.active.lock().unwrap();
        let prefix = format!("{entity_root}.");
        let keys: Vec<AlarmKey> = active
            .keys()
            .filter(|k| k.entity_instance == entity_root || k.entity_instance.starts_with(&prefix))
            .cloned()
            .collect();
        let mut cleared = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(mut alarm) = active.remove(&key) {
                alarm.severity = Severity::Clear;
                alarm.cleared_at = Some(now);
                cleared.push(alarm);
            }
        }
        drop(active);
        if cleared.is_empty() {
            return;
        }
        for alarm in &cleared {
            self.push_history(alarm.clone());
        }
        sink.dispatch(cleared);
    }

    /// Snapshot of currently active alarms, optionally filtered by entity.
    pub fn query(&self, entity_instance: Option<&str>) -> Vec<Alarm> {
        let active = self.active.lock().unwrap();
        active
            .values()
            .filter(|a| match entity_instance {
                Some(e) => a.entity_instance == e,
                None => true,
            })
            .cloned()
            .collect()
    }

    fn push_history(&self, alarm: Alarm) {
        let mut hist = self.history.lock().unwrap();
        hist.push(alarm);
        let len = hist.len();
        if len > HISTORY_CAP {
            hist.drain(0..len - HISTORY_CAP);
        }
    }
}

/// Parse the `{ "mtcalarm": [...] }` queue schema, skipping malformed
/// entries instead of discarding the whole batch.
pub fn parse_alarm_queue(buf: &[u8]) -> serde_json::Result<Vec<Alarm>> {
    #[derive(Deserialize)]
    struct Envelope {
        mtcalarm: Vec<serde_json::Value>,
    }
    let envelope: Envelope = serde_json::from_slice(buf)?;
    Ok(envelope
        .mtcalarm
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<Alarm>(v) {
            Ok(alarm) => Some(alarm),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed alarm queue entry");
                None
            }
        })
        .collect())
}

pub fn encode_alarm_queue(alarms: &[Alarm]) -> serde_json::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Envelope<'a> {
        mtcalarm: &'a [Alarm],
    }
    serde_json::to_vec(&Envelope { mtcalarm: alarms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<Vec<Alarm>>>,
    }

    impl FmSink for RecordingSink {
        fn dispatch(&self, batch: Vec<Alarm>) {
            self.batches.lock().unwrap().push(batch);
        }
    }

    #[test]
    fn raise_then_raise_same_severity_is_idempotent() {
        let mgr = AlarmManager::new();
        let sink = RecordingSink::default();
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Minor, "degraded", 1);
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Minor, "degraded", 2);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(mgr.query(None).len(), 1);
    }

    #[test]
    fn raise_at_new_severity_updates_and_dispatches_again() {
        let mgr = AlarmManager::new();
        let sink = RecordingSink::default();
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Minor, "degraded", 1);
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Major, "failed", 2);
        assert_eq!(sink.batches.lock().unwrap().len(), 2);
        let active = mgr.query(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Major);
    }

    #[test]
    fn clear_removes_from_active_set() {
        let mgr = AlarmManager::new();
        let sink = RecordingSink::default();
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Minor, "degraded", 1);
        mgr.clear(&sink, "200.005", "host=compute-1", 2);
        assert!(mgr.query(None).is_empty());
        assert_eq!(sink.batches.lock().unwrap().len(), 2);
    }

    #[test]
    fn clear_on_inactive_alarm_is_a_noop() {
        let mgr = AlarmManager::new();
        let sink = RecordingSink::default();
        mgr.clear(&sink, "200.005", "host=compute-1", 1);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_all_only_touches_matching_entity() {
        let mgr = AlarmManager::new();
        let sink = RecordingSink::default();
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Minor, "a", 1);
        mgr.raise(&sink, "compute-1", "200.006", "host=compute-1", Severity::Minor, "b", 1);
        mgr.raise(&sink, "compute-2", "200.005", "host=compute-2", Severity::Minor, "c", 1);
        mgr.clear_all(&sink, "host=compute-1", 2);
        let remaining = mgr.query(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity_instance, "host=compute-2");
    }

    #[test]
    fn clear_all_also_clears_sub_entity_alarms_under_the_root() {
        let mgr = AlarmManager::new();
        let sink = RecordingSink::default();
        mgr.raise(&sink, "compute-1", "200.005", "host=compute-1", Severity::Minor, "a", 1);
        mgr.raise(
            &sink,
            "compute-1",
            "200.006",
            "host=compute-1.process=nfv-vim",
            Severity::Major,
            "b",
            1,
        );
        mgr.raise(&sink, "compute-2", "200.005", "host=compute-2", Severity::Minor, "c", 1);
        mgr.clear_all(&sink, "host=compute-1", 2);
        let remaining = mgr.query(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity_instance, "host=compute-2");
    }

    #[test]
    fn parse_queue_skips_malformed_entry_keeps_rest() {
        let raw = br#"{"mtcalarm":[{"host":"a","alarm_id":"1","entity_instance":"e","severity":"minor","reason_text":"x","raised_at":1,"cleared_at":null},{"bad":"entry"}]}"#;
        let parsed = parse_alarm_queue(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].alarm_id, "1");
    }

    #[test]
    fn severity_ladder_orders_correctly() {
        assert!(Severity::Clear < Severity::Warning);
        assert!(Severity::Warning < Severity::Minor);
        assert!(Severity::Minor < Severity::Major);
        assert!(Severity::Major < Severity::Critical);
    }
}
