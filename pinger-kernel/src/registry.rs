//! Device registry view: the ordered device list used for one cycle.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::Device;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device registry unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("device registry invalid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("device registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn list(&self) -> Result<Vec<Device>, RegistryError>;
}

/// `devices.yaml`: a plain YAML list of devices (towers + equipment).
pub struct YamlDeviceSource {
    path: PathBuf,
}

impl YamlDeviceSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeviceSource for YamlDeviceSource {
    async fn list(&self) -> Result<Vec<Device>, RegistryError> {
        let txt = tokio::fs::read_to_string(&self.path).await?;
        if txt.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str(&txt)?)
    }
}

pub struct RegistryView {
    source: Arc<dyn DeviceSource>,
    snapshot: Arc<[Device]>,
}

impl RegistryView {
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        Self { source, snapshot: Arc::from(Vec::new()) }
    }

    /// Re-reads the source. On error the previous snapshot is left untouched.
    pub async fn refresh(&mut self) -> Result<Arc<[Device]>, RegistryError> {
        let devices = self.source.list().await?;
        let mut seen = HashSet::with_capacity(devices.len());
        let mut unique = Vec::with_capacity(devices.len());
        for device in devices {
            if seen.insert(device.id.clone()) {
                unique.push(device);
            } else {
                tracing::warn!(device_id = %device.id, "duplicate device id in registry, ignored");
            }
        }
        if unique.len() != self.snapshot.len() {
            tracing::info!(devices = unique.len(), "device registry refreshed");
        }
        self.snapshot = Arc::from(unique);
        Ok(Arc::clone(&self.snapshot))
    }
}
