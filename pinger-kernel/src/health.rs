use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

use crate::models::ProbeKind;
use crate::supervisor::SupervisorPhase;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-error-kind counters, the only failure signal visible from outside.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    pub config_stale_served: Counter,
    pub registry_unavailable: Counter,
    pub icmp_timeout: Counter,
    pub icmp_unreachable: Counter,
    pub snmp_timeout: Counter,
    pub snmp_auth: Counter,
    pub snmp_decode: Counter,
    pub log_persist_failed: Counter,
    pub log_records_dropped: Counter,
    pub notify_failed: Counter,
    pub internal: Counter,
}

impl ErrorCounters {
    pub fn record_probe(&self, kind: ProbeKind) {
        match kind {
            ProbeKind::Ok => {}
            ProbeKind::IcmpTimeout => self.icmp_timeout.inc(),
            ProbeKind::IcmpUnreachable => self.icmp_unreachable.inc(),
            ProbeKind::SnmpTimeout => self.snmp_timeout.inc(),
            ProbeKind::SnmpAuth => self.snmp_auth.inc(),
            ProbeKind::SnmpDecode => self.snmp_decode.inc(),
            ProbeKind::Internal => self.internal.inc(),
        }
    }

    fn view(&self) -> ErrorCountersView {
        ErrorCountersView {
            config_stale_served: self.config_stale_served.get(),
            registry_unavailable: self.registry_unavailable.get(),
            icmp_timeout: self.icmp_timeout.get(),
            icmp_unreachable: self.icmp_unreachable.get(),
            snmp_timeout: self.snmp_timeout.get(),
            snmp_auth: self.snmp_auth.get(),
            snmp_decode: self.snmp_decode.get(),
            log_persist_failed: self.log_persist_failed.get(),
            log_records_dropped: self.log_records_dropped.get(),
            notify_failed: self.notify_failed.get(),
            internal: self.internal.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorCountersView {
    pub config_stale_served: u64,
    pub registry_unavailable: u64,
    pub icmp_timeout: u64,
    pub icmp_unreachable: u64,
    pub snmp_timeout: u64,
    pub snmp_auth: u64,
    pub snmp_decode: u64,
    pub log_persist_failed: u64,
    pub log_records_dropped: u64,
    pub notify_failed: u64,
    pub internal: u64,
}

/// What the supervisor publishes after each cycle (or failed cycle).
#[derive(Debug, Clone)]
pub struct CycleSnapshot {
    pub phase: SupervisorPhase,
    pub last_cycle_finish: Option<OffsetDateTime>,
    last_cycle_mono: Option<Instant>,
    pub last_cycle_failed: bool,
    pub last_cycle_duration: Duration,
    pub current_limit: usize,
    pub current_interval: Duration,
    pub offline_count: usize,
    pub device_count: usize,
    pub cycles_completed: u64,
    pub pending_log_records: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_cycle_finish: Option<OffsetDateTime>,
    pub cycle_age_seconds: u64,
    pub current_limit: usize,
    pub current_interval: u64,
    pub offline_count: usize,
    pub device_count: usize,
    pub phase: SupervisorPhase,
    pub cycles_completed: u64,
    pub last_cycle_duration_ms: u64,
    pub pending_log_records: usize,
    pub uptime_seconds: u64,
    pub errors: ErrorCountersView,
}

struct Inner {
    start_time: Instant,
    max_age: Duration,
    snapshot: parking_lot::RwLock<CycleSnapshot>,
    counters: ErrorCounters,
}

/// Shared between the supervisor (sole writer) and the HTTP responder (reader).
/// Probe tasks never touch it, so a reader never waits on network I/O.
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<Inner>,
}

impl HealthTracker {
    pub fn new(max_age_secs: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                start_time: Instant::now(),
                max_age: Duration::from_secs(max_age_secs),
                snapshot: parking_lot::RwLock::new(CycleSnapshot {
                    phase: SupervisorPhase::Idle,
                    last_cycle_finish: None,
                    last_cycle_mono: None,
                    last_cycle_failed: false,
                    last_cycle_duration: Duration::ZERO,
                    current_limit: 0,
                    current_interval: Duration::ZERO,
                    offline_count: 0,
                    device_count: 0,
                    cycles_completed: 0,
                    pending_log_records: 0,
                }),
                counters: ErrorCounters::default(),
            }),
        }
    }

    pub fn counters(&self) -> &ErrorCounters {
        &self.inner.counters
    }

    pub fn set_phase(&self, phase: SupervisorPhase) {
        self.inner.snapshot.write().phase = phase;
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        self.inner.snapshot.read().clone()
    }

    /// Records a completed cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_cycle(
        &self,
        duration: Duration,
        current_limit: usize,
        current_interval: Duration,
        offline_count: usize,
        device_count: usize,
        pending_log_records: usize,
    ) {
        let mut snap = self.inner.snapshot.write();
        snap.last_cycle_finish = Some(OffsetDateTime::now_utc());
        snap.last_cycle_mono = Some(Instant::now());
        snap.last_cycle_failed = false;
        snap.last_cycle_duration = duration;
        snap.current_limit = current_limit;
        snap.current_interval = current_interval;
        snap.offline_count = offline_count;
        snap.device_count = device_count;
        snap.cycles_completed += 1;
        snap.pending_log_records = pending_log_records;
    }

    /// Cycle skipped or crashed: report `stale` until the next good cycle.
    pub fn mark_cycle_failed(&self) {
        self.inner.snapshot.write().last_cycle_failed = true;
    }

    pub fn set_governors(&self, current_limit: usize, current_interval: Duration) {
        let mut snap = self.inner.snapshot.write();
        snap.current_limit = current_limit;
        snap.current_interval = current_interval;
    }

    pub fn report(&self) -> HealthReport {
        self.report_at(Instant::now())
    }

    pub fn report_at(&self, now: Instant) -> HealthReport {
        let snap = self.inner.snapshot.read().clone();
        let since = snap.last_cycle_mono.unwrap_or(self.inner.start_time);
        let age = now.saturating_duration_since(since);
        let status = if age <= self.inner.max_age && !snap.last_cycle_failed {
            HealthStatus::Ok
        } else {
            HealthStatus::Stale
        };
        HealthReport {
            status,
            last_cycle_finish: snap.last_cycle_finish,
            cycle_age_seconds: age.as_secs(),
            current_limit: snap.current_limit,
            current_interval: snap.current_interval.as_secs(),
            offline_count: snap.offline_count,
            device_count: snap.device_count,
            phase: snap.phase,
            cycles_completed: snap.cycles_completed,
            last_cycle_duration_ms: snap.last_cycle_duration.as_millis() as u64,
            pending_log_records: snap.pending_log_records,
            uptime_seconds: now.saturating_duration_since(self.inner.start_time).as_secs(),
            errors: self.inner.counters.view(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cycle_is_ok() {
        let health = HealthTracker::new(180);
        health.publish_cycle(Duration::from_millis(1500), 50, Duration::from_secs(30), 2, 10, 0);
        let report = health.report();
        assert_eq!(report.status, HealthStatus::Ok);
        assert_eq!(report.current_limit, 50);
        assert_eq!(report.current_interval, 30);
        assert_eq!(report.offline_count, 2);
        assert_eq!(report.last_cycle_duration_ms, 1500);
        assert!(report.last_cycle_finish.is_some());
    }

    #[test]
    fn old_cycle_is_stale() {
        let health = HealthTracker::new(180);
        health.publish_cycle(Duration::ZERO, 50, Duration::from_secs(30), 0, 1, 0);
        let later = Instant::now() + Duration::from_secs(181);
        let report = health.report_at(later);
        assert_eq!(report.status, HealthStatus::Stale);
        assert!(report.cycle_age_seconds >= 181);
    }

    #[test]
    fn failed_cycle_is_stale_until_next_success() {
        let health = HealthTracker::new(180);
        health.publish_cycle(Duration::ZERO, 50, Duration::from_secs(30), 0, 1, 0);
        health.mark_cycle_failed();
        assert_eq!(health.report().status, HealthStatus::Stale);
        health.publish_cycle(Duration::ZERO, 50, Duration::from_secs(30), 0, 1, 0);
        assert_eq!(health.report().status, HealthStatus::Ok);
    }

    #[test]
    fn no_cycle_yet_measures_from_start() {
        let health = HealthTracker::new(5);
        assert_eq!(health.report().status, HealthStatus::Ok);
        let report = health.report_at(Instant::now() + Duration::from_secs(6));
        assert_eq!(report.status, HealthStatus::Stale);
        assert!(report.last_cycle_finish.is_none());
    }

    #[test]
    fn probe_kinds_feed_counters() {
        let health = HealthTracker::new(180);
        let c = health.counters();
        c.record_probe(ProbeKind::Ok);
        c.record_probe(ProbeKind::IcmpTimeout);
        c.record_probe(ProbeKind::SnmpAuth);
        c.record_probe(ProbeKind::SnmpAuth);
        let errors = health.report().errors;
        assert_eq!(errors.icmp_timeout, 1);
        assert_eq!(errors.snmp_auth, 2);
        assert_eq!(errors.internal, 0);
    }
}
