//! Per-device last-known state.
//!
//! Only the supervisor's commit phase holds `&mut StateTracker`; probe tasks
//! hand their outcomes back instead of writing here, so no per-device lock
//! exists.

use std::collections::HashMap;
use time::OffsetDateTime;

use crate::log_buffer::{LogReason, SmartLogPolicy};
use crate::models::{ProbeKind, ProbeOutcome, Reachability, SnmpMetrics};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub last_status: Reachability,
    pub last_latency_ms: Option<u32>,
    pub last_metrics: Option<SnmpMetrics>,
    pub last_log_time: Option<OffsetDateTime>,
    pub last_kind: Option<ProbeKind>,
    pub last_change: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub from: Reachability,
    pub to: Reachability,
    /// Set when this observation counts as an up/down transition.
    pub transition: bool,
    pub log_reason: Option<LogReason>,
    /// The failure kind differs from the previous probe of this device.
    pub kind_changed: bool,
}

#[derive(Debug, Default)]
pub struct StateTracker {
    devices: HashMap<String, DeviceState>,
    notify_first_observation: bool,
}

impl StateTracker {
    pub fn new(notify_first_observation: bool) -> Self {
        Self { devices: HashMap::new(), notify_first_observation }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    /// Devices whose last reported status is down.
    pub fn offline_count(&self) -> usize {
        self.devices.values().filter(|s| s.last_status == Reachability::Down).count()
    }

    /// Offline count restricted to the given device ids (the current registry snapshot).
    pub fn offline_among<'a, I: IntoIterator<Item = &'a str>>(&self, ids: I) -> usize {
        ids.into_iter()
            .filter(|id| matches!(self.devices.get(*id), Some(s) if s.last_status == Reachability::Down))
            .count()
    }

    /// Compares `outcome` with the prior state, updates the state and reports
    /// what happened. The log time is only advanced by `mark_logged`.
    pub fn observe(&mut self, outcome: &ProbeOutcome, policy: &SmartLogPolicy) -> Observation {
        let state = self.devices.entry(outcome.device_id.clone()).or_default();
        let from = state.last_status;
        let to = Reachability::from(outcome.reachable);

        let transition = match from {
            Reachability::Unknown => self.notify_first_observation,
            known => known != to,
        };
        let log_reason = policy.logworthy(state, outcome, outcome.finished_at);
        let kind_changed = state.last_kind != Some(outcome.kind);

        if from != to {
            state.last_change = Some(outcome.finished_at);
        }
        state.last_status = to;
        state.last_latency_ms = outcome.latency_ms;
        if outcome.metrics.is_some() {
            state.last_metrics = outcome.metrics.clone();
        }
        state.last_kind = Some(outcome.kind);

        Observation { from, to, transition, log_reason, kind_changed }
    }

    pub fn mark_logged(&mut self, device_id: &str, at: OffsetDateTime) {
        if let Some(state) = self.devices.get_mut(device_id) {
            state.last_log_time = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmartLogConf;

    fn policy() -> SmartLogPolicy {
        SmartLogPolicy::from_conf(&SmartLogConf::default())
    }

    #[test]
    fn first_observation_is_not_a_transition_by_default() {
        let mut tracker = StateTracker::new(false);
        let obs = tracker.observe(&ProbeOutcome::up("d1", 10), &policy());
        assert_eq!(obs.from, Reachability::Unknown);
        assert!(!obs.transition);
        assert_eq!(obs.log_reason, Some(LogReason::FirstObservation));
    }

    #[test]
    fn first_observation_notifies_when_enabled() {
        let mut tracker = StateTracker::new(true);
        let obs = tracker.observe(&ProbeOutcome::down("d1", ProbeKind::IcmpTimeout), &policy());
        assert!(obs.transition);
    }

    #[test]
    fn flip_is_a_transition_and_same_status_is_not() {
        let mut tracker = StateTracker::new(false);
        let p = policy();
        tracker.observe(&ProbeOutcome::up("d1", 10), &p);
        let down = tracker.observe(&ProbeOutcome::down("d1", ProbeKind::IcmpTimeout), &p);
        assert!(down.transition);
        assert_eq!(down.log_reason, Some(LogReason::StatusChanged));
        let still_down = tracker.observe(&ProbeOutcome::down("d1", ProbeKind::IcmpTimeout), &p);
        assert!(!still_down.transition);
        assert!(!still_down.kind_changed);
        assert_eq!(tracker.offline_count(), 1);
    }

    #[test]
    fn latency_is_updated_on_every_observation() {
        let mut tracker = StateTracker::new(false);
        let p = policy();
        tracker.observe(&ProbeOutcome::up("d1", 10), &p);
        tracker.observe(&ProbeOutcome::up("d1", 12), &p);
        assert_eq!(tracker.get("d1").unwrap().last_latency_ms, Some(12));
        tracker.observe(&ProbeOutcome::down("d1", ProbeKind::IcmpTimeout), &p);
        assert_eq!(tracker.get("d1").unwrap().last_latency_ms, None);
    }

    #[test]
    fn offline_among_ignores_removed_devices() {
        let mut tracker = StateTracker::new(false);
        let p = policy();
        tracker.observe(&ProbeOutcome::down("gone", ProbeKind::IcmpTimeout), &p);
        tracker.observe(&ProbeOutcome::down("d1", ProbeKind::IcmpTimeout), &p);
        assert_eq!(tracker.offline_count(), 2);
        assert_eq!(tracker.offline_among(["d1", "d2"]), 1);
    }
}
