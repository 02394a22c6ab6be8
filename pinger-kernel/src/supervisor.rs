/**
 * CYCLE SUPERVISOR - the adaptive probe loop
 *
 * ROLE:
 * Owns every per-process component and drives them once per cycle:
 *
 *   refreshing  -> settings snapshot + device registry
 *   probing     -> one task per device, bounded by the concurrency semaphore
 *   committing  -> sequential: state tracker, log buffer, transition events;
 *                  a full (or aged) log buffer is flushed right away
 *   notifying   -> log flush attempt, then events queued to the notifier
 *   (governors) -> concurrency + interval retuned from this cycle
 *   sleeping    -> interval (or nothing after an overrun), or until shutdown
 *
 * FAILURES:
 * - registry unreadable: cycle skipped, health stale, fatal after N in a row
 * - panic anywhere in a cycle: caught here, counted, health stale, loop goes on
 * - a panicking probe only loses that device's measurement for the cycle
 *
 * SHUTDOWN:
 * Watched while probing and sleeping. In-flight probes get the grace period,
 * then are aborted; the log buffer is flushed one last time, ignoring backoff,
 * and queued notifications get the same grace period to go out.
 */

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::PingerConfig;
use crate::governor::{ConcurrencyGovernor, IntervalGovernor, IntervalRule};
use crate::health::HealthTracker;
use crate::log_buffer::{FlushResult, LogBuffer, SmartLogPolicy};
use crate::models::{Device, ProbeKind, ProbeOutcome, TransitionEvent};
use crate::notifier::{DispatchReport, Notifier};
use crate::ports::{MetricSink, PingLogSink, PingRecord};
use crate::probe::Prober;
use crate::registry::{DeviceSource, RegistryError, RegistryView};
use crate::settings::ConfigCache;
use crate::state::Shutdown;
use crate::tracker::StateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorPhase {
    Idle,
    Refreshing,
    Probing,
    Committing,
    Notifying,
    Sleeping,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("device registry unavailable for {failures} consecutive cycles: {source}")]
    RegistryExhausted {
        failures: u32,
        #[source]
        source: RegistryError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("cycle skipped: {0}")]
    Registry(#[from] RegistryError),
}

pub struct Sinks {
    pub ping_log: Arc<dyn PingLogSink>,
    pub metrics: Option<Arc<dyn MetricSink>>,
}

/// External collaborators handed to the supervisor at startup.
pub struct Components {
    pub config: ConfigCache,
    pub devices: Arc<dyn DeviceSource>,
    pub prober: Arc<dyn Prober>,
    pub sinks: Sinks,
    pub notifier: Notifier,
    pub health: HealthTracker,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub devices: usize,
    /// Outcomes actually committed (lower than `devices` after a probe panic or shutdown).
    pub probed: usize,
    pub transitions: Vec<TransitionEvent>,
    pub logged: usize,
    /// Records the sink accepted during this cycle, over every flush.
    pub written: usize,
    pub offline: usize,
    /// Result of the end-of-cycle flush.
    pub flush: FlushResult,
    pub dispatch: DispatchReport,
    pub duration: Duration,
    pub limit: usize,
    pub interval: Duration,
    pub rule: IntervalRule,
    /// Shutdown arrived while probing.
    pub interrupted: bool,
}

pub struct Supervisor {
    config: ConfigCache,
    registry: RegistryView,
    prober: Arc<dyn Prober>,
    concurrency: ConcurrencyGovernor,
    interval: IntervalGovernor,
    tracker: StateTracker,
    buffer: LogBuffer,
    policy: SmartLogPolicy,
    sinks: Sinks,
    notifier: Notifier,
    health: HealthTracker,
    registry_failures: u32,
    registry_failure_limit: u32,
    shutdown_grace: Duration,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(conf: &PingerConfig, components: Components, shutdown: Shutdown) -> Self {
        let Components { config, devices, prober, sinks, notifier, health } = components;
        let concurrency = ConcurrencyGovernor::new(conf.concurrency.clone());
        let interval = IntervalGovernor::new(conf.interval.clone());
        health.set_governors(concurrency.current_limit(), interval.current_interval());
        Self {
            config,
            registry: RegistryView::new(devices),
            prober,
            concurrency,
            interval,
            tracker: StateTracker::new(conf.smart_log.notify_first_observation),
            buffer: LogBuffer::new(&conf.smart_log, health.clone()),
            policy: SmartLogPolicy::from_conf(&conf.smart_log),
            sinks,
            notifier,
            health,
            registry_failures: 0,
            registry_failure_limit: conf.supervisor.registry_failure_limit.max(1),
            shutdown_grace: Duration::from_secs(conf.supervisor.shutdown_grace_secs),
            shutdown,
        }
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn concurrency(&self) -> &ConcurrencyGovernor {
        &self.concurrency
    }

    pub fn interval(&self) -> &IntervalGovernor {
        &self.interval
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Loops until shutdown. Returns an error only when the registry stayed
    /// unreachable for too many consecutive cycles.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        tracing::info!(
            limit = self.concurrency.current_limit(),
            interval_secs = self.interval.current_interval().as_secs(),
            transports = ?self.notifier.transport_names(),
            "supervisor started"
        );
        while !self.shutdown.is_triggered() {
            let started = Instant::now();
            let result = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
            let elapsed = started.elapsed();

            match result {
                Ok(Ok(report)) => {
                    self.registry_failures = 0;
                    if report.interrupted {
                        break;
                    }
                }
                Ok(Err(CycleError::Registry(e))) => {
                    self.registry_failures += 1;
                    self.health.counters().registry_unavailable.inc();
                    self.health.mark_cycle_failed();
                    tracing::warn!(
                        error = %e,
                        failures = self.registry_failures,
                        limit = self.registry_failure_limit,
                        "device registry unavailable, cycle skipped"
                    );
                    if self.registry_failures >= self.registry_failure_limit {
                        tracing::error!(failures = self.registry_failures, "device registry unavailable for too long, giving up");
                        self.drain().await;
                        return Err(SupervisorError::RegistryExhausted { failures: self.registry_failures, source: e });
                    }
                }
                Err(panic) => {
                    self.health.counters().internal.inc();
                    self.health.mark_cycle_failed();
                    tracing::error!(panic = %panic_message(panic.as_ref()), "cycle panicked, continuing");
                }
            }

            let pause = self.interval.sleep_for(elapsed);
            self.health.set_phase(SupervisorPhase::Sleeping);
            if pause.is_zero() {
                tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "cycle overran interval, starting next immediately");
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.shutdown.wait() => break,
            }
        }
        self.drain().await;
        Ok(())
    }

    /// One full pass over the registry.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let t0 = Instant::now();

        self.health.set_phase(SupervisorPhase::Refreshing);
        let settings = self.config.get().await;
        let devices = self.registry.refresh().await?;

        self.health.set_phase(SupervisorPhase::Probing);
        let (outcomes, interrupted) = self.probe_all(&devices).await;

        self.health.set_phase(SupervisorPhase::Committing);
        let mut transitions = Vec::new();
        let mut logged = 0;
        let mut written = 0;
        let mut probed = 0;
        for (device, outcome) in devices.iter().zip(outcomes) {
            let Some(outcome) = outcome else { continue };
            probed += 1;
            let observation = self.tracker.observe(&outcome, &self.policy);

            self.health.counters().record_probe(outcome.kind);
            if observation.kind_changed && outcome.kind != ProbeKind::Ok {
                tracing::warn!(device_id = %device.id, kind = outcome.kind.as_str(), reachable = outcome.reachable, "probe failure");
            }
            if observation.log_reason.is_some() {
                self.buffer.push(PingRecord::from_outcome(&outcome));
                self.tracker.mark_logged(&device.id, outcome.finished_at);
                logged += 1;
                if self.buffer.should_flush(OffsetDateTime::now_utc()) {
                    if let FlushResult::Written(n) = self.flush_buffer(false).await {
                        written += n;
                    }
                }
            }
            if observation.transition {
                tracing::info!(
                    device_id = %device.id,
                    from = observation.from.as_str(),
                    to = observation.to.as_str(),
                    kind = outcome.kind.as_str(),
                    "device state changed"
                );
                transitions.push(TransitionEvent {
                    event_id: uuid::Uuid::new_v4(),
                    device: device.clone(),
                    from: observation.from,
                    to: observation.to,
                    latency_ms: outcome.latency_ms,
                    kind: outcome.kind,
                    at: outcome.finished_at,
                });
            }
        }

        self.health.set_phase(SupervisorPhase::Notifying);
        let flush = self.flush_buffer(false).await;
        if let FlushResult::Written(n) = flush {
            written += n;
        }
        let dispatch = self.notifier.dispatch(&transitions, &settings);

        let duration = t0.elapsed();
        let limit = self.concurrency.record_cycle(duration);

        let offline = self.tracker.offline_among(devices.iter().map(|d| d.id.as_str()));
        let previous_interval = self.interval.current_interval();
        let rule = self.interval.evaluate(offline, transitions.len());
        let interval = self.interval.current_interval();
        if interval != previous_interval {
            tracing::info!(from_secs = previous_interval.as_secs(), to_secs = interval.as_secs(), ?rule, offline, "check interval adjusted");
        }

        self.health.publish_cycle(duration, limit, interval, offline, devices.len(), self.buffer.len());
        self.health.set_phase(SupervisorPhase::Idle);

        tracing::debug!(
            devices = devices.len(),
            probed,
            transitions = transitions.len(),
            logged,
            offline,
            duration_ms = duration.as_millis() as u64,
            "cycle complete"
        );

        Ok(CycleReport {
            devices: devices.len(),
            probed,
            transitions,
            logged,
            written,
            offline,
            flush,
            dispatch,
            duration,
            limit,
            interval,
            rule,
            interrupted,
        })
    }

    /// Outcomes in registry order; `None` where no outcome was produced.
    async fn probe_all(&mut self, devices: &[Device]) -> (Vec<Option<ProbeOutcome>>, bool) {
        let semaphore = self.concurrency.semaphore();
        let mut set = JoinSet::new();
        for (index, device) in devices.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let prober = Arc::clone(&self.prober);
            let health = self.health.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                match AssertUnwindSafe(prober.probe(&device)).catch_unwind().await {
                    Ok(outcome) => (index, Some(outcome)),
                    Err(panic) => {
                        health.counters().internal.inc();
                        tracing::error!(device_id = %device.id, panic = %panic_message(panic.as_ref()), "probe panicked");
                        (index, None)
                    }
                }
            });
        }

        let mut outcomes: Vec<Option<ProbeOutcome>> = vec![None; devices.len()];
        let mut interrupted = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((index, outcome))) => outcomes[index] = outcome,
                    Some(Err(e)) => tracing::error!(error = %e, "probe task failed"),
                    None => break,
                },
                _ = self.shutdown.wait() => {
                    interrupted = true;
                    tracing::info!(in_flight = set.len(), grace_secs = self.shutdown_grace.as_secs(), "shutdown during probing, waiting for in-flight probes");
                    let grace = tokio::time::sleep(self.shutdown_grace);
                    tokio::pin!(grace);
                    loop {
                        tokio::select! {
                            joined = set.join_next() => match joined {
                                Some(Ok((index, outcome))) => outcomes[index] = outcome,
                                Some(Err(e)) => tracing::error!(error = %e, "probe task failed"),
                                None => break,
                            },
                            _ = &mut grace => {
                                tracing::warn!(aborted = set.len(), "grace period over, aborting probes");
                                set.abort_all();
                                while set.join_next().await.is_some() {}
                                break;
                            }
                        }
                    }
                    break;
                }
            }
        }
        (outcomes, interrupted)
    }

    async fn flush_buffer(&self, force: bool) -> FlushResult {
        self.buffer
            .flush(self.sinks.ping_log.as_ref(), self.sinks.metrics.as_deref(), OffsetDateTime::now_utc(), force)
            .await
    }

    /// Last flush before exit, ignoring any backoff window; then gives queued
    /// notifications the grace period.
    async fn drain(&mut self) {
        self.health.set_phase(SupervisorPhase::Idle);
        let pending = self.buffer.len();
        let result = self.flush_buffer(true).await;
        let notifications = self.notifier.pending();
        if notifications > 0 && tokio::time::timeout(self.shutdown_grace, self.notifier.idle()).await.is_err() {
            tracing::warn!(undelivered = self.notifier.pending(), "notifications still queued at exit");
        }
        tracing::info!(pending, ?result, notifications, "supervisor stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
