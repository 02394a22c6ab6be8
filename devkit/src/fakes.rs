/*!
In-memory stand-ins for everything the kernel talks to.

Each fake records what it was asked to do so tests can assert on it
afterwards, and can be told to fail on demand.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

use pinger_kernel::models::{Device, ProbeKind, ProbeOutcome, SnmpMetrics};
use pinger_kernel::notifier::{Message, NotifyError, Target, Transport};
use pinger_kernel::ports::{MetricRecord, MetricSink, PingLogSink, PingRecord, SinkError};
use pinger_kernel::probe::Prober;
use pinger_kernel::registry::{DeviceSource, RegistryError};
use pinger_kernel::settings::{NotifySettings, SettingsError, SettingsStore};

/// What a scripted device answers to one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Up(u32),
    UpWith(u32, SnmpMetrics),
    /// Reachable, SNMP failed with the given kind.
    Degraded(u32, ProbeKind),
    Down(ProbeKind),
    Panic,
}

impl Step {
    pub fn down() -> Self {
        Step::Down(ProbeKind::IcmpTimeout)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Prober answering from per-device scripts.
///
/// A device consumes one step per probe; once its script is exhausted the
/// last step repeats. Devices without a script answer `default_step`.
/// Timestamps come from a settable clock so tests can cross the heartbeat
/// interval without waiting.
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    last: Mutex<HashMap<String, Step>>,
    default_step: Step,
    delay: Mutex<Duration>,
    clock: Mutex<OffsetDateTime>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<HashMap<String, usize>>,
}

impl Default for ScriptedProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            last: Mutex::new(HashMap::new()),
            default_step: Step::Up(10),
            delay: Mutex::new(Duration::ZERO),
            clock: Mutex::new(OffsetDateTime::now_utc()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default(mut self, step: Step) -> Self {
        self.default_step = step;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn script(&self, device_id: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts.lock().insert(device_id.to_string(), steps.into_iter().collect());
        self.last.lock().remove(device_id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn now(&self) -> OffsetDateTime {
        *self.clock.lock()
    }

    pub fn advance_clock(&self, by: Duration) {
        let mut clock = self.clock.lock();
        *clock += by;
    }

    /// Highest number of probes observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_max_in_flight(&self) {
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    pub fn calls(&self, device_id: &str) -> usize {
        self.calls.lock().get(device_id).copied().unwrap_or(0)
    }

    fn next_step(&self, device_id: &str) -> Step {
        let mut scripts = self.scripts.lock();
        let mut last = self.last.lock();
        match scripts.get_mut(device_id).and_then(|q| q.pop_front()) {
            Some(step) => {
                last.insert(device_id.to_string(), step.clone());
                step
            }
            None => last.get(device_id).cloned().unwrap_or_else(|| self.default_step.clone()),
        }
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, device: &Device) -> ProbeOutcome {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        *self.calls.lock().entry(device.id.clone()).or_default() += 1;

        let started_at = self.now();
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut outcome = match self.next_step(&device.id) {
            Step::Up(ms) => ProbeOutcome::up(device.id.clone(), ms),
            Step::UpWith(ms, metrics) => ProbeOutcome::up(device.id.clone(), ms).with_metrics(metrics),
            Step::Degraded(ms, kind) => {
                let mut o = ProbeOutcome::up(device.id.clone(), ms);
                o.kind = kind;
                o
            }
            Step::Down(kind) => ProbeOutcome::down(device.id.clone(), kind),
            Step::Panic => panic!("scripted panic for device {}", device.id),
        };
        outcome.started_at = started_at;
        outcome.finished_at = self.now();
        outcome
    }
}

/// Device registry fed from memory; can be switched to unavailable.
#[derive(Default)]
pub struct StaticDevices {
    devices: Mutex<Vec<Device>>,
    unavailable: AtomicBool,
}

impl StaticDevices {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices: Mutex::new(devices), unavailable: AtomicBool::new(false) }
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock() = devices;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceSource for StaticDevices {
    async fn list(&self) -> Result<Vec<Device>, RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry switched off by test".into()));
        }
        Ok(self.devices.lock().clone())
    }
}

#[derive(Default)]
pub struct StaticSettings {
    settings: Mutex<NotifySettings>,
    unavailable: AtomicBool,
    loads: AtomicUsize,
}

impl StaticSettings {
    pub fn new(settings: NotifySettings) -> Self {
        Self { settings: Mutex::new(settings), ..Default::default() }
    }

    pub fn set(&self, settings: NotifySettings) {
        *self.settings.lock() = settings;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn load(&self) -> Result<NotifySettings, SettingsError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SettingsError::Unavailable("settings switched off by test".into()));
        }
        Ok(self.settings.lock().clone())
    }
}

#[derive(Default)]
pub struct MemoryPingLog {
    records: Mutex<Vec<PingRecord>>,
    batches: AtomicUsize,
}

impl MemoryPingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PingRecord> {
        self.records.lock().clone()
    }

    pub fn for_device(&self, device_id: &str) -> Vec<PingRecord> {
        self.records.lock().iter().filter(|r| r.device_id == device_id).cloned().collect()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PingLogSink for MemoryPingLog {
    async fn write_batch(&self, records: &[PingRecord]) -> Result<(), SinkError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Ping log whose first `failures` writes fail; later writes are kept.
pub struct FailingPingLog {
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
    inner: MemoryPingLog,
}

impl FailingPingLog {
    pub fn new(failures: usize) -> Self {
        Self { remaining_failures: AtomicUsize::new(failures), attempts: AtomicUsize::new(0), inner: MemoryPingLog::new() }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<PingRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl PingLogSink for FailingPingLog {
    async fn write_batch(&self, records: &[PingRecord]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("database offline".into()));
        }
        self.inner.write_batch(records).await
    }
}

#[derive(Default)]
pub struct MemoryMetricLog {
    records: Mutex<Vec<MetricRecord>>,
}

impl MemoryMetricLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MetricSink for MemoryMetricLog {
    async fn write_batch(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub to: String,
    pub text: String,
    pub device_id: String,
    pub down: bool,
}

/// Transport that keeps every message instead of sending it.
/// Always enabled, with one target named `"test"`.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every send waits this long first, like a gateway that stopped answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn targets(&self, _settings: &NotifySettings) -> Vec<Target> {
        vec![Target::new("test")]
    }

    async fn send(&self, target: &Target, message: &Message<'_>) -> Result<(), NotifyError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected(503));
        }
        self.sent.lock().push(SentMessage {
            to: target.to.clone(),
            text: message.text.to_string(),
            device_id: message.event.device.id.clone(),
            down: message.event.to == pinger_kernel::models::Reachability::Down,
        });
        Ok(())
    }
}
