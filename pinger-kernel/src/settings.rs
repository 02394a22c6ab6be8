/**
 * CONFIG CACHE - notification settings snapshot refreshed on TTL
 *
 * ROLE:
 * Holds the operator-editable options (Telegram token/chat, WhatsApp targets,
 * message templates, transport switches) read from the external settings
 * store. The supervisor calls `get()` once per cycle.
 *
 * HOW:
 * - snapshot = immutable `Arc<NotifySettings>`, replaced wholesale on refresh
 * - stale after `ttl` -> `get()` reloads before returning
 * - reload failure -> previous snapshot is served and counted
 * - only the very first load (`init`) is fatal
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::health::HealthTracker;

pub const DEFAULT_TMPL_DOWN: &str = "🔴 {name} ({address}) is DOWN since {time} [{kind}]";
pub const DEFAULT_TMPL_UP: &str = "🟢 {name} ({address}) is UP again, {latency} ms at {time}";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings store unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings store invalid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("settings store unavailable: {0}")]
    Unavailable(String),
}

/// The fixed option set of the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub token: Option<String>,
    pub chat_id: Option<String>,
    pub tmpl_down: String,
    pub tmpl_up: String,
    pub tg_enabled: bool,
    pub wa_enabled: bool,
    pub wa_target: Option<String>,
    pub wa_target_group: Option<String>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            token: None,
            chat_id: None,
            tmpl_down: DEFAULT_TMPL_DOWN.to_string(),
            tmpl_up: DEFAULT_TMPL_UP.to_string(),
            tg_enabled: false,
            wa_enabled: false,
            wa_target: None,
            wa_target_group: None,
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<NotifySettings, SettingsError>;
}

/// Settings kept in a YAML file that operators edit in place.
pub struct YamlSettingsStore {
    path: PathBuf,
}

impl YamlSettingsStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsStore for YamlSettingsStore {
    async fn load(&self) -> Result<NotifySettings, SettingsError> {
        let txt = tokio::fs::read_to_string(&self.path).await?;
        if txt.trim().is_empty() {
            return Ok(NotifySettings::default());
        }
        Ok(serde_yaml::from_str(&txt)?)
    }
}

pub struct ConfigCache {
    store: Arc<dyn SettingsStore>,
    ttl: Duration,
    current: Arc<NotifySettings>,
    last_update: Instant,
    health: HealthTracker,
}

impl ConfigCache {
    /// Initial load. Failing here is fatal for the collector.
    pub async fn init(
        store: Arc<dyn SettingsStore>,
        ttl: Duration,
        health: HealthTracker,
    ) -> Result<Self, SettingsError> {
        let settings = store.load().await?;
        tracing::info!(
            tg_enabled = settings.tg_enabled,
            wa_enabled = settings.wa_enabled,
            "notification settings loaded"
        );
        Ok(Self {
            store,
            ttl,
            current: Arc::new(settings),
            last_update: Instant::now(),
            health,
        })
    }

    pub fn is_stale(&self) -> bool {
        self.last_update.elapsed() > self.ttl
    }

    /// Current snapshot, refreshed first if the TTL elapsed.
    pub async fn get(&mut self) -> Arc<NotifySettings> {
        if self.is_stale() {
            self.refresh().await;
        }
        Arc::clone(&self.current)
    }

    async fn refresh(&mut self) {
        match self.store.load().await {
            Ok(settings) => {
                if *self.current != settings {
                    tracing::info!("notification settings changed");
                }
                self.current = Arc::new(settings);
                self.last_update = Instant::now();
            }
            Err(e) => {
                // keep serving the old snapshot; retry on the next get()
                self.health.counters().config_stale_served.inc();
                tracing::warn!(error = %e, "settings refresh failed, serving previous snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FlakyStore {
        answers: Mutex<Vec<Result<NotifySettings, SettingsError>>>,
    }

    #[async_trait]
    impl SettingsStore for FlakyStore {
        async fn load(&self) -> Result<NotifySettings, SettingsError> {
            let mut answers = self.answers.lock();
            if answers.is_empty() {
                return Err(SettingsError::Unavailable("exhausted".into()));
            }
            answers.remove(0)
        }
    }

    fn settings(token: &str) -> NotifySettings {
        NotifySettings { token: Some(token.into()), ..Default::default() }
    }

    #[tokio::test]
    async fn initial_failure_is_fatal() {
        let store = Arc::new(FlakyStore { answers: Mutex::new(vec![]) });
        let res = ConfigCache::init(store, Duration::from_secs(60), HealthTracker::new(180)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn fresh_cache_does_not_reload() {
        let store = Arc::new(FlakyStore { answers: Mutex::new(vec![Ok(settings("a")), Ok(settings("b"))]) });
        let mut cache = ConfigCache::init(store, Duration::from_secs(60), HealthTracker::new(180)).await.unwrap();
        assert_eq!(cache.get().await.token.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn stale_cache_reloads_and_failure_serves_previous() {
        let health = HealthTracker::new(180);
        let store = Arc::new(FlakyStore {
            answers: Mutex::new(vec![
                Ok(settings("a")),
                Ok(settings("b")),
                Err(SettingsError::Unavailable("down".into())),
            ]),
        });
        let mut cache = ConfigCache::init(store, Duration::ZERO, health.clone()).await.unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get().await.token.as_deref(), Some("b"));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get().await.token.as_deref(), Some("b"));
        assert_eq!(health.counters().config_stale_served.get(), 1);
    }

    #[tokio::test]
    async fn yaml_store_reads_fixed_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "token: abc\nchat_id: \"-100\"\ntg_enabled: true\nwa_target: \"+5511\"\n").unwrap();
        let s = YamlSettingsStore::new(&path).load().await.unwrap();
        assert!(s.tg_enabled);
        assert!(!s.wa_enabled);
        assert_eq!(s.chat_id.as_deref(), Some("-100"));
        assert_eq!(s.tmpl_down, DEFAULT_TMPL_DOWN);
    }
}
