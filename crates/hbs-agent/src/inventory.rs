//! Per-peer inventory and the heartbeat severity ladder (see spec §3, §4.4).
//!
//! Generalizes the teacher's `failover.rs::HostTracker`-shaped
//! "track a couple of fixed hosts" bookkeeping into an arbitrary peer map,
//! adding the `CLEAR → MINOR → DEGRADE → FAILED` ladder lifted from
//! `original_source/mtce/src/heartbeat/hbsAgent.cpp`.

use std::collections::HashMap;

use mtce_common::alarm::{AlarmManager, FmSink, Severity as AlarmSeverity};
use serde::Serialize;

use crate::config::FailureAction;

/// Which of the two independent heartbeat networks a peer is tracked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Mgmnt,
    Clstr,
}

/// Ladder position for one peer on one network (spec §4.4 state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HbState {
    Clear,
    Minor,
    Degrade,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub expected: u32,
    pub outstanding: u32,
    pub consecutive_misses: u32,
}

#[derive(Debug, Clone)]
pub struct PeerNetworkState {
    pub stats: NetworkStats,
    pub state: HbState,
    pub rri: u32,
}

impl Default for PeerNetworkState {
    fn default() -> Self {
        Self {
            stats: NetworkStats::default(),
            state: HbState::Clear,
            rri: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub hostname: String,
    pub mgmnt: PeerNetworkState,
    pub clstr: Option<PeerNetworkState>,
    pub monitored: bool,
    pub mnfa_active: bool,
}

impl Peer {
    pub fn new(hostname: impl Into<String>, has_clstr: bool, rri: u32) -> Self {
        let mut mgmnt = PeerNetworkState::default();
        mgmnt.rri = rri;
        let clstr = has_clstr.then(|| {
            let mut ns = PeerNetworkState::default();
            ns.rri = rri;
            ns
        });
        Self {
            hostname: hostname.into(),
            mgmnt,
            clstr,
            monitored: true,
            mnfa_active: false,
        }
    }

    fn network_mut(&mut self, net: Network) -> Option<&mut PeerNetworkState> {
        match net {
            Network::Mgmnt => Some(&mut self.mgmnt),
            Network::Clstr => self.clstr.as_mut(),
        }
    }
}

pub struct Thresholds {
    pub minor: u32,
    pub degrade: u32,
    pub failure: u32,
}

/// Outcome of one tick's accounting for a single peer/network pair, used
/// by the pulse engine to decide which events/alarms to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderTransition {
    None,
    EnteredMinor,
    EnteredDegrade,
    EnteredFailed,
    Recovered,
}

pub struct Inventory {
    peers: HashMap<String, Peer>,
    thresholds: Thresholds,
    action: FailureAction,
    next_peer_rri: u32,
    rri_cursor: usize,
}

impl Inventory {
    pub fn new(thresholds: Thresholds) -> Self {
        Self::with_failure_action(thresholds, FailureAction::Alarm)
    }

    pub fn with_failure_action(thresholds: Thresholds, action: FailureAction) -> Self {
        Self {
            peers: HashMap::new(),
            thresholds,
            action,
            next_peer_rri: 0,
            rri_cursor: 0,
        }
    }

    pub fn set_failure_action(&mut self, action: FailureAction) {
        self.action = action;
    }

    pub fn failure_action(&self) -> FailureAction {
        self.action
    }

    pub fn add_host(&mut self, hostname: &str, has_clstr: bool) {
        if self.peers.contains_key(hostname) {
            return;
        }
        let rri = self.next_peer_rri;
        self.next_peer_rri += 1;
        self.peers
            .insert(hostname.to_string(), Peer::new(hostname, has_clstr, rri));
    }

    /// Round-robin lookup clue for the outgoing request this tick: the rri
    /// of the next monitored peer in hostname order, shared by both the
    /// mgmt and clstr sends for that tick (spec §3, §4.4 step 1).
    pub fn next_rri(&mut self) -> u32 {
        let mut hostnames: Vec<&String> = self.peers.keys().collect();
        if hostnames.is_empty() {
            return 0;
        }
        hostnames.sort();
        let idx = self.rri_cursor % hostnames.len();
        self.rri_cursor = (self.rri_cursor + 1) % hostnames.len();
        self.peers[hostnames[idx]].mgmnt.rri
    }

    /// `del_host`: remove the peer from inventory entirely.
    pub fn del_host(&mut self, hostname: &str) {
        self.peers.remove(hostname);
    }

    /// `stop_host`: stop monitoring but keep the inventory entry, clearing
    /// all stats and alarms (caller is responsible for the alarm clear).
    pub fn stop_host(&mut self, hostname: &str) -> bool {
        if let Some(peer) = self.peers.get_mut(hostname) {
            peer.monitored = false;
            peer.mgmnt = PeerNetworkState::default();
            if peer.clstr.is_some() {
                peer.clstr = Some(PeerNetworkState::default());
            }
            true
        } else {
            false
        }
    }

    pub fn peer(&self, hostname: &str) -> Option<&Peer> {
        self.peers.get(hostname)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Begin a new period: every monitored peer on `net` becomes
    /// "outstanding", i.e. expected this period and not yet credited.
    pub fn arm_period(&mut self, net: Network) {
        for peer in self.peers.values_mut() {
            if !peer.monitored {
                continue;
            }
            if let Some(ns) = peer.network_mut(net) {
                ns.stats.expected = 1;
                ns.stats.outstanding = 1;
            }
        }
    }

    /// Credit a response from `hostname` on `net`: clears outstanding and
    /// resets the miss counter (invariant 2).
    pub fn credit_response(&mut self, hostname: &str, net: Network) {
        if let Some(peer) = self.peers.get_mut(hostname) {
            if let Some(ns) = peer.network_mut(net) {
                ns.stats.outstanding = 0;
                ns.stats.consecutive_misses = 0;
            }
        }
    }

    /// End of period: every peer still outstanding on `net` gets a miss;
    /// every peer credited this period is evaluated for ladder recovery.
    /// Returns `(hostname, net, transition)` for every peer whose ladder
    /// position changed this tick.
    pub fn close_period(&mut self, net: Network) -> Vec<(String, Network, LadderTransition)> {
        let mut transitions = Vec::new();
        for peer in self.peers.values_mut() {
            if !peer.monitored {
                continue;
            }
            let hostname = peer.hostname.clone();
            let Some(ns) = peer.network_mut(net) else {
                continue;
            };
            if ns.stats.outstanding > 0 {
                ns.stats.consecutive_misses += 1;
            }
            let misses = ns.stats.consecutive_misses;
            let prev = ns.state;

            let next = if misses == 0 {
                HbState::Clear
            } else if misses >= self.thresholds.failure {
                HbState::Failed
            } else if misses >= self.thresholds.degrade {
                HbState::Degrade
            } else if misses >= self.thresholds.minor {
                HbState::Minor
            } else {
                prev
            };

            if next != prev {
                ns.state = next;
                let transition = match (prev, next) {
                    (_, HbState::Clear) => LadderTransition::Recovered,
                    (_, HbState::Minor) if next > prev => LadderTransition::EnteredMinor,
                    (_, HbState::Degrade) if next > prev => LadderTransition::EnteredDegrade,
                    (_, HbState::Failed) if next > prev => LadderTransition::EnteredFailed,
                    _ => LadderTransition::None,
                };
                transitions.push((hostname, net, transition));
            }
        }
        transitions
    }

    /// Count of peers currently `Failed` on `net` — used to decide MNFA entry.
    pub fn failed_count(&self, net: Network) -> usize {
        self.peers
            .values()
            .filter(|p| {
                p.monitored
                    && match net {
                        Network::Mgmnt => p.mgmnt.state == HbState::Failed,
                        Network::Clstr => p.clstr.as_ref().is_some_and(|c| c.state == HbState::Failed),
                    }
            })
            .count()
    }

    pub fn set_mnfa(&mut self, hostname: &str, active: bool) {
        if let Some(peer) = self.peers.get_mut(hostname) {
            peer.mnfa_active = active;
        }
    }

    /// Every monitored peer currently flagged MNFA-active.
    pub fn mnfa_hostnames(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.mnfa_active)
            .map(|p| p.hostname.clone())
            .collect()
    }

    /// Spec §4.4 step 7: transitioning the failure action out of `none`
    /// clears every heartbeat alarm and resets per-peer miss accounting, so
    /// stale misses accumulated while suppressed don't immediately retrigger.
    pub fn reset_all_stats(&mut self, alarms: &AlarmManager, sink: &dyn FmSink, now: u64) {
        for peer in self.peers.values_mut() {
            peer.mgmnt.stats = NetworkStats::default();
            peer.mgmnt.state = HbState::Clear;
            if let Some(clstr) = peer.clstr.as_mut() {
                clstr.stats = NetworkStats::default();
                clstr.state = HbState::Clear;
            }
            peer.mnfa_active = false;
        }
        let hostnames: Vec<String> = self.peers.keys().cloned().collect();
        for hostname in hostnames {
            alarms.clear_all(sink, &format!("host={hostname}"), now);
        }
    }

    /// Point-in-time view for `mtce-cli`'s `hosts`/`status` subcommands.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers
            .values()
            .map(|p| PeerSnapshot {
                hostname: p.hostname.clone(),
                monitored: p.monitored,
                mnfa_active: p.mnfa_active,
                mgmnt_state: p.mgmnt.state,
                clstr_state: p.clstr.as_ref().map(|c| c.state),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub hostname: String,
    pub monitored: bool,
    pub mnfa_active: bool,
    pub mgmnt_state: HbState,
    pub clstr_state: Option<HbState>,
}

/// Translate a ladder transition into the alarm-library calls described in
/// spec §4.4/§4.3 (entity instance `host=<name>.network=<mgmnt|clstr>`).
///
/// `action == FailureAction::None` means misses are still tracked (the
/// ladder above still moves) but every alarm/event this transition would
/// otherwise raise is suppressed (spec §4.4 step 7).
pub fn apply_transition(
    alarms: &AlarmManager,
    sink: &dyn FmSink,
    hostname: &str,
    net: Network,
    transition: LadderTransition,
    action: FailureAction,
    now: u64,
) {
    if action == FailureAction::None {
        return;
    }
    let entity = format!(
        "host={hostname}.network={}",
        match net {
            Network::Mgmnt => "mgmnt",
            Network::Clstr => "clstr",
        }
    );
    match transition {
        LadderTransition::EnteredMinor | LadderTransition::None => {}
        LadderTransition::EnteredDegrade => {
            alarms.raise(
                sink,
                hostname,
                "200.004",
                &entity,
                AlarmSeverity::Minor,
                "heartbeat degrade",
                now,
            );
        }
        LadderTransition::EnteredFailed => {
            alarms.raise(
                sink,
                hostname,
                "200.004",
                &entity,
                AlarmSeverity::Major,
                "heartbeat loss",
                now,
            );
        }
        LadderTransition::Recovered => {
            alarms.clear(sink, "200.004", &entity, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl FmSink for NullSink {
        fn dispatch(&self, _alarms: Vec<mtce_common::alarm::Alarm>) {}
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            minor: 1,
            degrade: 6,
            failure: 10,
        }
    }

    #[test]
    fn miss_then_recover_resets_in_one_period() {
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-1", false);

        for _ in 0..5 {
            inv.arm_period(Network::Mgmnt);
            inv.close_period(Network::Mgmnt);
        }
        assert_eq!(inv.peer("compute-1").unwrap().mgmnt.stats.consecutive_misses, 5);
        assert_eq!(inv.peer("compute-1").unwrap().mgmnt.state, HbState::Minor);

        inv.arm_period(Network::Mgmnt);
        inv.credit_response("compute-1", Network::Mgmnt);
        let transitions = inv.close_period(Network::Mgmnt);
        assert_eq!(inv.peer("compute-1").unwrap().mgmnt.stats.consecutive_misses, 0);
        assert!(transitions
            .iter()
            .any(|(_, _, t)| *t == LadderTransition::Recovered));
    }

    #[test]
    fn eleven_misses_escalates_through_degrade_to_failed() {
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-2", false);

        let mut saw_degrade = false;
        let mut saw_failed = false;
        for _ in 0..11 {
            inv.arm_period(Network::Mgmnt);
            for (_, _, t) in inv.close_period(Network::Mgmnt) {
                if t == LadderTransition::EnteredDegrade {
                    saw_degrade = true;
                }
                if t == LadderTransition::EnteredFailed {
                    saw_failed = true;
                }
            }
        }
        assert!(saw_degrade);
        assert!(saw_failed);
        assert_eq!(inv.peer("compute-2").unwrap().mgmnt.state, HbState::Failed);
    }

    #[test]
    fn del_host_removes_from_inventory() {
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-3", false);
        inv.del_host("compute-3");
        assert!(inv.peer("compute-3").is_none());
    }

    #[test]
    fn stop_host_clears_stats_but_keeps_entry() {
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-4", false);
        inv.arm_period(Network::Mgmnt);
        inv.close_period(Network::Mgmnt);
        inv.stop_host("compute-4");
        let peer = inv.peer("compute-4").unwrap();
        assert!(!peer.monitored);
        assert_eq!(peer.mgmnt.stats.consecutive_misses, 0);
    }

    #[test]
    fn unmonitored_peer_is_excluded_from_accounting() {
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-5", false);
        inv.stop_host("compute-5");
        inv.arm_period(Network::Mgmnt);
        let transitions = inv.close_period(Network::Mgmnt);
        assert!(transitions.is_empty());
    }

    #[test]
    fn next_rri_round_robins_over_sorted_hostnames() {
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-2", false);
        inv.add_host("compute-1", false);
        let first = inv.next_rri();
        let second = inv.next_rri();
        let third = inv.next_rri();
        assert_eq!(first, inv.peer("compute-1").unwrap().mgmnt.rri);
        assert_eq!(second, inv.peer("compute-2").unwrap().mgmnt.rri);
        assert_eq!(third, first);
    }

    #[test]
    fn apply_transition_suppressed_when_action_is_none() {
        use mtce_common::alarm::AlarmManager;
        let alarms = AlarmManager::new();
        apply_transition(
            &alarms,
            &NullSink,
            "compute-6",
            Network::Mgmnt,
            LadderTransition::EnteredFailed,
            FailureAction::None,
            1,
        );
        assert!(alarms.query(None).is_empty());
    }

    #[test]
    fn reset_all_stats_clears_misses_mnfa_and_alarms() {
        use mtce_common::alarm::AlarmManager;
        let alarms = AlarmManager::new();
        let mut inv = Inventory::new(thresholds());
        inv.add_host("compute-7", false);
        for _ in 0..11 {
            inv.arm_period(Network::Mgmnt);
            for (hostname, net, transition) in inv.close_period(Network::Mgmnt) {
                apply_transition(&alarms, &NullSink, &hostname, net, transition, FailureAction::Alarm, 1);
            }
        }
        inv.set_mnfa("compute-7", true);
        assert!(!alarms.query(None).is_empty());

        inv.reset_all_stats(&alarms, &NullSink, 2);
        assert!(alarms.query(None).is_empty());
        let peer = inv.peer("compute-7").unwrap();
        assert_eq!(peer.mgmnt.stats.consecutive_misses, 0);
        assert_eq!(peer.mgmnt.state, HbState::Clear);
        assert!(!peer.mnfa_active);
    }
}
