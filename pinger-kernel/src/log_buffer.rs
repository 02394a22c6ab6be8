/**
 * SMART LOG BUFFER - decides what gets persisted and batches the writes
 *
 * ROLE:
 * Keeps the ping log small: only outcomes that say something new are
 * recorded (status change, latency jump, SNMP change) plus a periodic
 * heartbeat per device so a quiet device still shows up in the history.
 *
 * HOW:
 * - `SmartLogPolicy::logworthy` compares an outcome with the device state
 * - `LogBuffer::push` is O(1) under a short lock; the supervisor flushes as
 *   soon as `should_flush` fires, so the buffer only overflows (dropping
 *   oldest) while the sink is failing or backing off
 * - flush swaps the queue out under the same lock, writes one batch, and on
 *   failure puts it back in front with exponential backoff
 * - while retained, records older than 10x the max age are dropped
 */

use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;

use crate::config::SmartLogConf;
use crate::health::HealthTracker;
use crate::models::{ProbeOutcome, Reachability, SnmpMetrics};
use crate::ports::{MetricRecord, MetricSink, PingLogSink, PingRecord};
use crate::tracker::DeviceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogReason {
    FirstObservation,
    StatusChanged,
    LatencyChanged,
    Heartbeat,
    SnmpChanged,
}

#[derive(Debug, Clone)]
pub struct SmartLogPolicy {
    pub heartbeat: Duration,
    pub latency_change_threshold_ms: u32,
    pub signal_tolerance_db: i32,
    pub ccq_tolerance: u32,
}

impl SmartLogPolicy {
    pub fn from_conf(conf: &SmartLogConf) -> Self {
        Self {
            heartbeat: Duration::from_secs(conf.interval_secs),
            latency_change_threshold_ms: conf.latency_change_threshold_ms,
            signal_tolerance_db: conf.signal_tolerance_db,
            ccq_tolerance: conf.ccq_tolerance,
        }
    }

    /// First matching reason, checked against the state *before* this outcome.
    pub fn logworthy(&self, prior: &DeviceState, outcome: &ProbeOutcome, now: OffsetDateTime) -> Option<LogReason> {
        let status = Reachability::from(outcome.reachable);
        if prior.last_status == Reachability::Unknown {
            return Some(LogReason::FirstObservation);
        }
        if prior.last_status != status {
            return Some(LogReason::StatusChanged);
        }
        if outcome.reachable {
            if let (Some(latency), Some(prior_latency)) = (outcome.latency_ms, prior.last_latency_ms) {
                if latency.abs_diff(prior_latency) >= self.latency_change_threshold_ms {
                    return Some(LogReason::LatencyChanged);
                }
            }
        }
        let heartbeat_due = match prior.last_log_time {
            None => true,
            Some(last) => (now - last) >= self.heartbeat,
        };
        if heartbeat_due {
            return Some(LogReason::Heartbeat);
        }
        if let (Some(current), Some(previous)) = (&outcome.metrics, &prior.last_metrics) {
            if self.snmp_changed(previous, current) {
                return Some(LogReason::SnmpChanged);
            }
        }
        None
    }

    /// Traffic counters always move and are ignored here.
    fn snmp_changed(&self, previous: &SnmpMetrics, current: &SnmpMetrics) -> bool {
        let signal = match (previous.signal_dbm, current.signal_dbm) {
            (Some(a), Some(b)) => a.abs_diff(b) >= self.signal_tolerance_db.unsigned_abs(),
            (a, b) => a.is_some() != b.is_some(),
        };
        let ccq = match (previous.ccq, current.ccq) {
            (Some(a), Some(b)) => a.abs_diff(b) >= self.ccq_tolerance,
            (a, b) => a.is_some() != b.is_some(),
        };
        signal || ccq || previous.clients != current.clients
    }
}

impl PingRecord {
    pub fn from_outcome(outcome: &ProbeOutcome) -> Self {
        Self {
            device_id: outcome.device_id.clone(),
            reachable: outcome.reachable,
            latency_ms: outcome.latency_ms,
            kind: outcome.kind,
            timestamp: outcome.finished_at,
            metrics: outcome.metrics.clone().filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// Nothing buffered.
    Empty,
    /// Previous failure still backing off.
    Deferred,
    Written(usize),
    Failed,
}

struct Inner {
    queue: VecDeque<PingRecord>,
    failures: u32,
    retry_at: Option<OffsetDateTime>,
}

pub struct LogBuffer {
    capacity: usize,
    max_age: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    inner: parking_lot::Mutex<Inner>,
    health: HealthTracker,
}

impl LogBuffer {
    pub fn new(conf: &SmartLogConf, health: HealthTracker) -> Self {
        Self {
            capacity: conf.buffer_size,
            max_age: Duration::from_secs(conf.buffer_max_age_secs),
            backoff_base: Duration::from_secs(conf.backoff_base_secs),
            backoff_max: Duration::from_secs(conf.backoff_max_secs),
            inner: parking_lot::Mutex::new(Inner { queue: VecDeque::new(), failures: 0, retry_at: None }),
            health,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn oldest(&self) -> Option<OffsetDateTime> {
        self.inner.lock().queue.front().map(|r| r.timestamp)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Appends a record. Reaching capacity is a flush trigger; a record is
    /// dropped here only when that flush could not empty the buffer.
    pub fn push(&self, record: PingRecord) {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            self.health.counters().log_records_dropped.inc();
        }
        inner.queue.push_back(record);
    }

    /// Size or age trigger.
    pub fn should_flush(&self, now: OffsetDateTime) -> bool {
        let inner = self.inner.lock();
        match inner.queue.front() {
            None => false,
            Some(oldest) => inner.queue.len() >= self.capacity || (now - oldest.timestamp) >= self.max_age,
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }

    /// Writes everything buffered as one batch. `force` ignores the backoff
    /// window (used on shutdown).
    pub async fn flush(
        &self,
        sink: &dyn PingLogSink,
        metrics: Option<&dyn MetricSink>,
        now: OffsetDateTime,
        force: bool,
    ) -> FlushResult {
        let batch: Vec<PingRecord> = {
            let mut inner = self.inner.lock();
            if inner.queue.is_empty() {
                return FlushResult::Empty;
            }
            if !force {
                if let Some(retry_at) = inner.retry_at {
                    if now < retry_at {
                        return FlushResult::Deferred;
                    }
                }
            }
            std::mem::take(&mut inner.queue).into()
        };

        match sink.write_batch(&batch).await {
            Ok(()) => {
                {
                    let mut inner = self.inner.lock();
                    inner.failures = 0;
                    inner.retry_at = None;
                }
                if let Some(metric_sink) = metrics {
                    let samples: Vec<MetricRecord> = batch.iter().filter_map(PingRecord::metric_record).collect();
                    if !samples.is_empty() {
                        if let Err(e) = metric_sink.write_batch(&samples).await {
                            tracing::warn!(error = %e, samples = samples.len(), "metric batch dropped");
                        }
                    }
                }
                tracing::debug!(records = batch.len(), "log buffer flushed");
                FlushResult::Written(batch.len())
            }
            Err(e) => {
                self.health.counters().log_persist_failed.inc();
                let mut inner = self.inner.lock();
                inner.failures += 1;
                let wait = self.backoff(inner.failures);
                inner.retry_at = Some(now + wait);

                // failed batch goes back in front of anything pushed meanwhile
                let newer = std::mem::take(&mut inner.queue);
                let mut restored: VecDeque<PingRecord> = batch.into();
                restored.extend(newer);
                inner.queue = restored;
                let dropped = self.trim(&mut inner.queue, now);

                tracing::warn!(
                    error = %e,
                    failures = inner.failures,
                    retained = inner.queue.len(),
                    dropped,
                    retry_in_secs = wait.as_secs(),
                    "ping log write failed, batch retained"
                );
                FlushResult::Failed
            }
        }
    }

    /// Enforces capacity and the 10x max-age ceiling, oldest first.
    fn trim(&self, queue: &mut VecDeque<PingRecord>, now: OffsetDateTime) -> usize {
        let ceiling = self.max_age * 10;
        let mut dropped = 0;
        while let Some(oldest) = queue.front() {
            let too_old = (now - oldest.timestamp) > ceiling;
            if queue.len() > self.capacity || too_old {
                queue.pop_front();
                dropped += 1;
            } else {
                break;
            }
        }
        if dropped > 0 {
            self.health.counters().log_records_dropped.add(dropped as u64);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeKind;
    use crate::ports::SinkError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn policy() -> SmartLogPolicy {
        SmartLogPolicy::from_conf(&SmartLogConf::default())
    }

    fn up_at(latency: u32, at: OffsetDateTime) -> ProbeOutcome {
        let mut o = ProbeOutcome::up("d1", latency);
        o.started_at = at;
        o.finished_at = at;
        o
    }

    fn state(status: Reachability, latency: Option<u32>, logged: Option<OffsetDateTime>) -> DeviceState {
        DeviceState { last_status: status, last_latency_ms: latency, last_log_time: logged, ..Default::default() }
    }

    #[test]
    fn jitter_below_threshold_is_not_logworthy() {
        let p = policy();
        let prior = state(Reachability::Up, Some(10), Some(T0));
        assert_eq!(p.logworthy(&prior, &up_at(12, T0), T0), None);
        let prior = state(Reachability::Up, Some(11), Some(T0));
        assert_eq!(p.logworthy(&prior, &up_at(40, T0), T0), Some(LogReason::LatencyChanged));
    }

    #[test]
    fn heartbeat_after_interval() {
        let p = policy();
        let prior = state(Reachability::Up, Some(10), Some(T0));
        let later = T0 + time::Duration::seconds(299);
        assert_eq!(p.logworthy(&prior, &up_at(10, later), later), None);
        let later = T0 + time::Duration::seconds(300);
        assert_eq!(p.logworthy(&prior, &up_at(10, later), later), Some(LogReason::Heartbeat));
    }

    #[test]
    fn snmp_changes_respect_tolerance() {
        let p = policy();
        let mut prior = state(Reachability::Up, Some(10), Some(T0));
        prior.last_metrics = Some(SnmpMetrics { signal_dbm: Some(-60), ccq: Some(90), traffic_in: Some(1), ..Default::default() });

        let small = up_at(10, T0).with_metrics(SnmpMetrics {
            signal_dbm: Some(-62),
            ccq: Some(87),
            traffic_in: Some(999_999),
            ..Default::default()
        });
        assert_eq!(p.logworthy(&prior, &small, T0), None);

        let big = up_at(10, T0).with_metrics(SnmpMetrics { signal_dbm: Some(-66), ccq: Some(90), ..Default::default() });
        assert_eq!(p.logworthy(&prior, &big, T0), Some(LogReason::SnmpChanged));
    }

    #[test]
    fn down_device_ignores_latency_rule() {
        let p = policy();
        let prior = state(Reachability::Down, None, Some(T0));
        let o = ProbeOutcome { finished_at: T0, ..ProbeOutcome::down("d1", ProbeKind::IcmpTimeout) };
        assert_eq!(p.logworthy(&prior, &o, T0), None);
    }

    #[derive(Default)]
    struct Sink {
        fail: Mutex<bool>,
        batches: Mutex<Vec<Vec<PingRecord>>>,
    }

    #[async_trait]
    impl PingLogSink for Sink {
        async fn write_batch(&self, records: &[PingRecord]) -> Result<(), SinkError> {
            if *self.fail.lock() {
                return Err(SinkError::Unavailable("db down".into()));
            }
            self.batches.lock().push(records.to_vec());
            Ok(())
        }
    }

    fn record(second: i64) -> PingRecord {
        PingRecord::from_outcome(&up_at(10, T0 + time::Duration::seconds(second)))
    }

    fn buffer(size: usize) -> (LogBuffer, HealthTracker) {
        let health = HealthTracker::new(180);
        let conf = SmartLogConf { buffer_size: size, buffer_max_age_secs: 30, ..Default::default() };
        (LogBuffer::new(&conf, health.clone()), health)
    }

    #[test]
    fn size_and_age_triggers() {
        let (buf, _) = buffer(3);
        assert!(!buf.should_flush(T0));
        buf.push(record(0));
        assert!(!buf.should_flush(T0 + time::Duration::seconds(29)));
        assert!(buf.should_flush(T0 + time::Duration::seconds(30)));
        buf.push(record(1));
        buf.push(record(2));
        assert!(buf.should_flush(T0));
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let (buf, health) = buffer(2);
        buf.push(record(0));
        buf.push(record(1));
        buf.push(record(2));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.oldest(), Some(T0 + time::Duration::seconds(1)));
        assert_eq!(health.counters().log_records_dropped.get(), 1);
    }

    #[tokio::test]
    async fn flushing_on_the_size_trigger_loses_nothing() {
        let (buf, health) = buffer(10);
        let sink = Sink::default();
        for i in 0..25 {
            buf.push(record(i));
            if buf.should_flush(T0) {
                assert_eq!(buf.flush(&sink, None, T0, false).await, FlushResult::Written(10));
            }
        }
        assert_eq!(buf.flush(&sink, None, T0, false).await, FlushResult::Written(5));
        let total: usize = sink.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 25);
        assert_eq!(health.counters().log_records_dropped.get(), 0);
    }

    #[tokio::test]
    async fn flush_writes_one_batch() {
        let (buf, _) = buffer(10);
        let sink = Sink::default();
        buf.push(record(0));
        buf.push(record(1));
        assert_eq!(buf.flush(&sink, None, T0, false).await, FlushResult::Written(2));
        assert!(buf.is_empty());
        assert_eq!(sink.batches.lock().len(), 1);
        assert_eq!(buf.flush(&sink, None, T0, false).await, FlushResult::Empty);
    }

    #[tokio::test]
    async fn failure_retains_and_backs_off() {
        let (buf, health) = buffer(10);
        let sink = Sink::default();
        *sink.fail.lock() = true;
        buf.push(record(0));
        assert_eq!(buf.flush(&sink, None, T0, false).await, FlushResult::Failed);
        buf.push(record(1));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.oldest(), Some(T0));
        assert_eq!(health.counters().log_persist_failed.get(), 1);

        // first backoff is 1s, second 2s
        assert_eq!(buf.flush(&sink, None, T0, false).await, FlushResult::Deferred);
        let t1 = T0 + time::Duration::seconds(1);
        assert_eq!(buf.flush(&sink, None, t1, false).await, FlushResult::Failed);
        assert_eq!(buf.flush(&sink, None, t1 + time::Duration::seconds(1), false).await, FlushResult::Deferred);

        *sink.fail.lock() = false;
        let t2 = t1 + time::Duration::seconds(2);
        assert_eq!(buf.flush(&sink, None, t2, false).await, FlushResult::Written(2));
        assert_eq!(buf.consecutive_failures(), 0);
        let written = &sink.batches.lock()[0];
        assert_eq!(written[0].timestamp, T0);
    }

    #[tokio::test]
    async fn forced_flush_ignores_backoff() {
        let (buf, _) = buffer(10);
        let sink = Sink::default();
        *sink.fail.lock() = true;
        buf.push(record(0));
        buf.flush(&sink, None, T0, false).await;
        *sink.fail.lock() = false;
        assert_eq!(buf.flush(&sink, None, T0, true).await, FlushResult::Written(1));
    }

    #[tokio::test]
    async fn retained_records_expire_after_ten_max_ages() {
        let (buf, health) = buffer(10);
        let sink = Sink::default();
        *sink.fail.lock() = true;
        buf.push(record(0));
        buf.push(record(200));
        let late = T0 + time::Duration::seconds(301);
        assert_eq!(buf.flush(&sink, None, late, true).await, FlushResult::Failed);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.oldest(), Some(T0 + time::Duration::seconds(200)));
        assert_eq!(health.counters().log_records_dropped.get(), 1);
    }
}
