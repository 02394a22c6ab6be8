/**
 * PINGER KERNEL - process entry point
 *
 * Wires the static config, the external stores and sinks, the transports and
 * the health endpoint around one supervisor, then runs it until SIGTERM /
 * Ctrl-C. Exit code 0 on a clean shutdown; non-zero when the settings store
 * cannot be read at startup, the health port cannot be bound or stops
 * serving, or the device registry stays unreachable.
 */

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pinger_kernel::config::{config_path, load_config};
use pinger_kernel::health::HealthTracker;
use pinger_kernel::http::{self, AppState};
use pinger_kernel::logging;
use pinger_kernel::mqtt::{self, MqttTransport};
use pinger_kernel::notifier::telegram::TelegramTransport;
use pinger_kernel::notifier::whatsapp::WhatsAppTransport;
use pinger_kernel::notifier::{Notifier, Transport};
use pinger_kernel::ports::jsonl::{JsonlMetricLog, JsonlPingLog};
use pinger_kernel::ports::{MetricSink, PingLogSink};
use pinger_kernel::probe::NetworkProber;
use pinger_kernel::registry::YamlDeviceSource;
use pinger_kernel::settings::{ConfigCache, YamlSettingsStore};
use pinger_kernel::state::{shutdown_channel, ShutdownTrigger};
use pinger_kernel::supervisor::{Components, Sinks, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();
    logging::init()?;

    let path = config_path();
    let cfg = load_config(&path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;

    let (trigger, shutdown) = shutdown_channel();
    let health = HealthTracker::new(cfg.health.max_age_secs);

    let store = Arc::new(YamlSettingsStore::new(&cfg.sources.settings_file));
    let config = ConfigCache::init(store, Duration::from_secs(cfg.supervisor.config_cache_ttl_secs), health.clone())
        .await
        .with_context(|| format!("initial settings load from {}", cfg.sources.settings_file.display()))?;

    let ping_log: Arc<dyn PingLogSink> = Arc::new(
        JsonlPingLog::new(&cfg.sources.ping_log_file)
            .with_context(|| format!("opening ping log {}", cfg.sources.ping_log_file.display()))?,
    );
    let metrics = match &cfg.sources.metric_log_file {
        Some(p) => {
            let sink = JsonlMetricLog::new(p).with_context(|| format!("opening metric log {}", p.display()))?;
            Some(Arc::new(sink) as Arc<dyn MetricSink>)
        }
        None => None,
    };

    let notify_timeout = Duration::from_secs(cfg.notify.timeout_secs);
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    let telegram = TelegramTransport::new(&cfg.notify.telegram_api_url, notify_timeout)
        .context("building telegram client")?;
    transports.push(Arc::new(telegram));
    if let Some(url) = &cfg.notify.whatsapp_api_url {
        let whatsapp = WhatsAppTransport::new(url, notify_timeout).context("building whatsapp client")?;
        transports.push(Arc::new(whatsapp));
    }
    if let Some(mqtt_conf) = &cfg.mqtt {
        transports.push(Arc::new(MqttTransport::connect(mqtt_conf, shutdown.clone())));
        mqtt::spawn_health_publisher(health.clone(), mqtt_conf, shutdown.clone());
    }
    let notifier = Notifier::new(transports, &cfg.notify, health.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.health.port));
    let listener = http::bind(addr)
        .await
        .with_context(|| format!("binding health endpoint {addr}"))?;

    let trigger = Arc::new(trigger);
    let server = tokio::spawn({
        let trigger = Arc::clone(&trigger);
        let app_state = AppState { health: health.clone() };
        let http_shutdown = shutdown.clone();
        async move {
            let served = http::serve(listener, app_state, http_shutdown).await;
            if let Err(e) = &served {
                tracing::error!(%addr, error = %e, "health endpoint failed, shutting down");
                trigger.trigger();
            }
            served
        }
    });

    spawn_signal_listener(Arc::clone(&trigger));

    let supervisor = Supervisor::new(
        &cfg,
        Components {
            config,
            devices: Arc::new(YamlDeviceSource::new(&cfg.sources.devices_file)),
            prober: Arc::new(NetworkProber::new(&cfg.probe)),
            sinks: Sinks { ping_log, metrics },
            notifier,
            health,
        },
        shutdown,
    );
    let result = supervisor.run().await;

    // the registry path returns without a shutdown request
    trigger.trigger();
    let served = tokio::time::timeout(Duration::from_secs(5), server).await;
    result.context("supervisor stopped")?;
    if let Ok(Ok(Err(e))) = served {
        return Err(anyhow::Error::new(e).context("health endpoint failed"));
    }
    Ok(())
}

fn spawn_signal_listener(trigger: Arc<ShutdownTrigger>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested");
        trigger.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
