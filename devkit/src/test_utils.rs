/*!
Test harness for whole supervisor cycles.

Builds a real `Supervisor` around the in-memory fakes and keeps a handle on
each fake, so a test can script devices, run cycles and then look at what
reached the ping log, the metric log and the transports.
*/

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use pinger_kernel::config::PingerConfig;
use pinger_kernel::health::HealthTracker;
use pinger_kernel::models::Device;
use pinger_kernel::notifier::{Notifier, Transport};
use pinger_kernel::ports::{MetricSink, PingLogSink};
use pinger_kernel::settings::{ConfigCache, NotifySettings, SettingsStore};
use pinger_kernel::state::{shutdown_channel, ShutdownTrigger};
use pinger_kernel::supervisor::{Components, CycleReport, Sinks, Supervisor, SupervisorError};

use crate::fakes::{MemoryMetricLog, MemoryPingLog, RecordingTransport, ScriptedProber, StaticDevices, StaticSettings};
use crate::fixtures::test_config;

/// Routes kernel logs to the test output; `RUST_LOG` still applies.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pinger_kernel=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init().ok();
}

pub struct HarnessBuilder {
    config: PingerConfig,
    devices: Vec<Device>,
    prober: ScriptedProber,
    settings: NotifySettings,
    ping_log: Option<Arc<dyn PingLogSink>>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: PingerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn prober(mut self, prober: ScriptedProber) -> Self {
        self.prober = prober;
        self
    }

    pub fn settings(mut self, settings: NotifySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the default `MemoryPingLog`; `TestHarness::ping_log` then stays empty.
    pub fn ping_log(mut self, sink: Arc<dyn PingLogSink>) -> Self {
        self.ping_log = Some(sink);
        self
    }

    pub async fn build(self) -> Result<TestHarness> {
        init_test_logging();
        let health = HealthTracker::new(self.config.health.max_age_secs);
        let prober = Arc::new(self.prober);
        let devices = Arc::new(StaticDevices::new(self.devices));
        let settings = Arc::new(StaticSettings::new(self.settings));
        let ping_log = Arc::new(MemoryPingLog::new());
        let metrics = Arc::new(MemoryMetricLog::new());
        let transport = Arc::new(RecordingTransport::new());

        let store: Arc<dyn SettingsStore> = settings.clone();
        let config = ConfigCache::init(
            store,
            Duration::from_secs(self.config.supervisor.config_cache_ttl_secs),
            health.clone(),
        )
        .await?;

        let ping_sink: Arc<dyn PingLogSink> = match self.ping_log {
            Some(sink) => sink,
            None => ping_log.clone(),
        };
        let metric_sink: Arc<dyn MetricSink> = metrics.clone();
        let recording: Arc<dyn Transport> = transport.clone();
        let notifier = Notifier::new(vec![recording], &self.config.notify, health.clone());

        let (trigger, shutdown) = shutdown_channel();
        let supervisor = Supervisor::new(
            &self.config,
            Components {
                config,
                devices: devices.clone(),
                prober: prober.clone(),
                sinks: Sinks { ping_log: ping_sink, metrics: Some(metric_sink) },
                notifier,
                health: health.clone(),
            },
            shutdown,
        );

        Ok(TestHarness { supervisor, prober, devices, settings, ping_log, metrics, transport, health, trigger })
    }
}

pub struct TestHarness {
    pub supervisor: Supervisor,
    pub prober: Arc<ScriptedProber>,
    pub devices: Arc<StaticDevices>,
    pub settings: Arc<StaticSettings>,
    pub ping_log: Arc<MemoryPingLog>,
    pub metrics: Arc<MemoryMetricLog>,
    pub transport: Arc<RecordingTransport>,
    pub health: HealthTracker,
    trigger: ShutdownTrigger,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: test_config(),
            devices: Vec::new(),
            prober: ScriptedProber::new(),
            settings: NotifySettings::default(),
            ping_log: None,
        }
    }

    /// Harness over `devices` with default config and a prober answering `Up(10)`.
    pub async fn new(devices: Vec<Device>) -> Result<Self> {
        Self::builder().devices(devices).build().await
    }

    /// One cycle, then waits until its notifications were attempted so the
    /// recording transport is up to date.
    pub async fn cycle(&mut self) -> Result<CycleReport> {
        let report = self.supervisor.run_cycle().await?;
        self.supervisor.notifier().idle().await;
        Ok(report)
    }

    /// Runs `n` cycles, moving the prober clock forward by `spacing` before each.
    pub async fn cycles(&mut self, n: usize, spacing: Duration) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::with_capacity(n);
        for i in 0..n {
            if i > 0 {
                self.prober.advance_clock(spacing);
            }
            reports.push(self.cycle().await?);
        }
        Ok(reports)
    }

    pub fn trigger_shutdown(&self) {
        self.trigger.trigger();
    }

    /// Runs the supervisor loop, requesting shutdown after `after`.
    pub async fn run_for(self, after: Duration) -> std::result::Result<(), SupervisorError> {
        let TestHarness { supervisor, trigger, .. } = self;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trigger.trigger();
        });
        supervisor.run().await
    }
}
