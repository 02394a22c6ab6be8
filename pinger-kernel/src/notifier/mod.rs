/**
 * NOTIFIER GATEWAY - transition events out to humans and other systems
 *
 * ROLE:
 * Receives the transition events committed during a cycle, renders the
 * operator templates and hands each message to every enabled transport.
 *
 * HOW:
 * - templates come from the current `NotifySettings` snapshot
 * - a transport decides from the settings which targets it has (none = off)
 * - each transport has its own delivery task fed by a bounded queue;
 *   `dispatch` only enqueues, so a slow gateway never holds up the cycle
 * - one attempt per target, bounded by the notify timeout
 * - failures (and a full queue) are logged and counted in health
 *
 * One queue per transport, drained in order, so per device the messages
 * leave in the same order the transitions happened.
 */

pub mod telegram;
pub mod whatsapp;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use tokio::sync::{mpsc, Notify};

use crate::config::NotifyConf;
use crate::health::HealthTracker;
use crate::models::{Reachability, TransitionEvent};
use crate::settings::NotifySettings;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport rejected message with status {0}")]
    Rejected(u16),
    #[error("mqtt publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport did not answer within {0:?}")]
    Timeout(Duration),
    #[error("transport misconfigured: {0}")]
    Misconfigured(String),
}

/// One destination of a transport (a chat, a phone number, a topic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub to: String,
    /// Per-target secret, e.g. the Telegram bot token.
    pub credential: Option<String>,
}

impl Target {
    pub fn new(to: impl Into<String>) -> Self {
        Self { to: to.into(), credential: None }
    }
}

pub struct Message<'a> {
    pub event: &'a TransitionEvent,
    pub text: &'a str,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Targets enabled by the current settings. Empty means the transport is off.
    fn targets(&self, settings: &NotifySettings) -> Vec<Target>;

    async fn send(&self, target: &Target, message: &Message<'_>) -> Result<(), NotifyError>;
}

/// What `dispatch` handed over; delivery results only show up in health.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages (event x target) queued for delivery.
    pub queued: usize,
    /// Messages refused because a transport queue was full or closed.
    pub dropped: usize,
}

/// Fills `{id} {name} {address} {kind} {status} {latency} {time}`.
/// Unknown placeholders are left untouched.
pub fn render(template: &str, event: &TransitionEvent) -> String {
    let time = event
        .at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC"))
        .unwrap_or_default();
    let latency = event.latency_ms.map(|ms| ms.to_string()).unwrap_or_else(|| "-".to_string());
    let status = match event.to {
        Reachability::Up => "UP",
        Reachability::Down => "DOWN",
        Reachability::Unknown => "UNKNOWN",
    };
    template
        .replace("{id}", &event.device.id)
        .replace("{name}", event.device.display_name())
        .replace("{address}", &event.device.address)
        .replace("{kind}", event.kind.as_str())
        .replace("{status}", status)
        .replace("{latency}", &latency)
        .replace("{time}", &time)
}

struct Job {
    event: TransitionEvent,
    text: String,
    targets: Vec<Target>,
}

/// Queued jobs not yet delivered, across all transports.
#[derive(Default)]
struct Backlog {
    pending: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

struct Lane {
    transport: Arc<dyn Transport>,
    queue: mpsc::Sender<Job>,
}

pub struct Notifier {
    lanes: Vec<Lane>,
    backlog: Arc<Backlog>,
    health: HealthTracker,
}

impl Notifier {
    /// Spawns one delivery task per transport; must run inside a tokio runtime.
    pub fn new(transports: Vec<Arc<dyn Transport>>, conf: &NotifyConf, health: HealthTracker) -> Self {
        let timeout = Duration::from_secs(conf.timeout_secs);
        let backlog = Arc::new(Backlog::default());
        let lanes = transports
            .into_iter()
            .map(|transport| {
                let (queue, jobs) = mpsc::channel(conf.queue_size.max(1));
                tokio::spawn(deliver(Arc::clone(&transport), jobs, timeout, health.clone(), Arc::clone(&backlog)));
                Lane { transport, queue }
            })
            .collect();
        Self { lanes, backlog, health }
    }

    pub fn transport_names(&self) -> Vec<&'static str> {
        self.lanes.iter().map(|l| l.transport.name()).collect()
    }

    /// Renders and enqueues; never waits on a transport.
    pub fn dispatch(&self, events: &[TransitionEvent], settings: &NotifySettings) -> DispatchReport {
        let mut report = DispatchReport::default();
        if events.is_empty() {
            return report;
        }
        let routes: Vec<(&Lane, Vec<Target>)> = self
            .lanes
            .iter()
            .map(|l| (l, l.transport.targets(settings)))
            .filter(|(_, targets)| !targets.is_empty())
            .collect();

        for event in events {
            let template = match event.to {
                Reachability::Down => &settings.tmpl_down,
                _ => &settings.tmpl_up,
            };
            let text = render(template, event);

            for (lane, targets) in &routes {
                let job = Job { event: event.clone(), text: text.clone(), targets: targets.clone() };
                self.backlog.pending.fetch_add(1, Ordering::SeqCst);
                match lane.queue.try_send(job) {
                    Ok(()) => report.queued += targets.len(),
                    Err(e) => {
                        self.backlog.done();
                        report.dropped += targets.len();
                        self.health.counters().notify_failed.add(targets.len() as u64);
                        tracing::warn!(
                            transport = lane.transport.name(),
                            device_id = %event.device.id,
                            event_id = %event.event_id,
                            error = %e,
                            "notification not queued"
                        );
                    }
                }
            }
        }
        if report.queued > 0 || report.dropped > 0 {
            tracing::debug!(events = events.len(), queued = report.queued, dropped = report.dropped, "notifications queued");
        }
        report
    }

    /// Resolves once every queued notification has been attempted.
    pub async fn idle(&self) {
        loop {
            let drained = self.backlog.drained.notified();
            if self.backlog.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.backlog.pending.load(Ordering::SeqCst)
    }
}

async fn deliver(
    transport: Arc<dyn Transport>,
    mut jobs: mpsc::Receiver<Job>,
    timeout: Duration,
    health: HealthTracker,
    backlog: Arc<Backlog>,
) {
    while let Some(job) = jobs.recv().await {
        let message = Message { event: &job.event, text: &job.text };
        for target in &job.targets {
            let result = match tokio::time::timeout(timeout, transport.send(target, &message)).await {
                Ok(r) => r,
                Err(_) => Err(NotifyError::Timeout(timeout)),
            };
            match result {
                Ok(()) => tracing::debug!(transport = transport.name(), device_id = %job.event.device.id, "notification sent"),
                Err(e) => {
                    health.counters().notify_failed.inc();
                    tracing::warn!(
                        transport = transport.name(),
                        device_id = %job.event.device.id,
                        event_id = %job.event.event_id,
                        error = %e,
                        "notification failed"
                    );
                }
            }
        }
        backlog.done();
    }
}
