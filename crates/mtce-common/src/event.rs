//! mtcAgent event notification (see spec §4.5).
//!
//! `hbs-agent` raises these toward the maintenance agent when a peer
//! crosses a severity threshold; `pmond` raises them for process failures
//! it cannot locally recover from. Encoded as JSON over the loopback event
//! socket, following the same "small header struct + serde_json body"
//! convention the teacher uses for its admin-reporter messages
//! (`midi-client/src/admin_reporter.rs`).

use serde::{Deserialize, Serialize};

pub const EVENT_HEADER_MAGIC: &str = "mtce_event";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventCommand {
    /// Peer (or this host, on the interface in question) transitioned to
    /// a worse heartbeat state.
    HeartbeatDegrade,
    /// Peer/interface recovered.
    HeartbeatClear,
    /// A monitored process failed past its configured recovery limit.
    ProcessFailure,
    /// A monitored process (or the whole daemon) recovered/restarted
    /// cleanly.
    ProcessClear,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    #[serde(rename = "mtce_event")]
    pub header: String,
    pub cmd: EventCommand,
    /// `parm[0]` in the original wire shape: names the network interface
    /// the event pertains to (`"mgmnt"`, `"clstr"`), or the process name
    /// for PMON-raised events.
    pub parm0: String,
    pub hostname: String,
    pub body: serde_json::Value,
}

impl Event {
    pub fn new(cmd: EventCommand, parm0: impl Into<String>, hostname: impl Into<String>, body: serde_json::Value) -> Self {
        Event {
            header: EVENT_HEADER_MAGIC.to_string(),
            cmd,
            parm0: parm0.into(),
            hostname: hostname.into(),
            body,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(buf: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_round_trips_through_json() {
        let ev = Event::new(
            EventCommand::HeartbeatDegrade,
            "mgmnt",
            "compute-2",
            json!({ "misses": 3 }),
        );
        let wire = ev.to_json().unwrap();
        let decoded = Event::from_json(&wire).unwrap();
        assert_eq!(decoded, ev);
        assert_eq!(decoded.header, EVENT_HEADER_MAGIC.to_string());
    }

    #[test]
    fn header_field_serializes_under_fixed_key() {
        let ev = Event::new(EventCommand::ProcessFailure, "nfv-vim", "controller-0", json!(null));
        let wire = ev.to_json().unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("\"mtce_event\""));
    }
}
