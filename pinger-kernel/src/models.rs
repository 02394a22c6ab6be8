use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Tower,
    Equipment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    #[default]
    V2c,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnmpCredentials {
    pub community: String,
    #[serde(default)]
    pub version: SnmpVersion,
    #[serde(default = "default_snmp_port")]
    pub port: u16,
    #[serde(default)]
    pub interface_index: Option<u32>,
}

fn default_snmp_port() -> u16 {
    161
}

/// A monitored device as read from the registry. Immutable during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: DeviceKind,
    /// IP literal or resolvable host name
    pub address: String,
    #[serde(default)]
    pub snmp: Option<SnmpCredentials>,
    #[serde(default)]
    pub is_mikrotik: bool,
}

impl Device {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Failure classification of a probe. `Ok` means every stage that ran succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Ok,
    IcmpTimeout,
    IcmpUnreachable,
    SnmpTimeout,
    SnmpAuth,
    SnmpDecode,
    Internal,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Ok => "ok",
            ProbeKind::IcmpTimeout => "icmp_timeout",
            ProbeKind::IcmpUnreachable => "icmp_unreachable",
            ProbeKind::SnmpTimeout => "snmp_timeout",
            ProbeKind::SnmpAuth => "snmp_auth",
            ProbeKind::SnmpDecode => "snmp_decode",
            ProbeKind::Internal => "internal",
        }
    }
}

/// Optional SNMP enrichment. A field the device did not answer stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnmpMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys_descr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_dbm: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<u32>,
}

impl SnmpMetrics {
    pub fn is_empty(&self) -> bool {
        self.sys_descr.is_none()
            && self.signal_dbm.is_none()
            && self.ccq.is_none()
            && self.traffic_in.is_none()
            && self.traffic_out.is_none()
            && self.clients.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub device_id: String,
    pub reachable: bool,
    pub latency_ms: Option<u32>,
    pub metrics: Option<SnmpMetrics>,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub kind: ProbeKind,
}

impl ProbeOutcome {
    pub fn up(device_id: impl Into<String>, latency_ms: u32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            device_id: device_id.into(),
            reachable: true,
            latency_ms: Some(latency_ms),
            metrics: None,
            started_at: now,
            finished_at: now,
            kind: ProbeKind::Ok,
        }
    }

    pub fn down(device_id: impl Into<String>, kind: ProbeKind) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            device_id: device_id.into(),
            reachable: false,
            latency_ms: None,
            metrics: None,
            started_at: now,
            finished_at: now,
            kind,
        }
    }

    pub fn with_metrics(mut self, metrics: SnmpMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Last reported reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    #[default]
    Unknown,
    Up,
    Down,
}

impl From<bool> for Reachability {
    fn from(reachable: bool) -> Self {
        if reachable { Reachability::Up } else { Reachability::Down }
    }
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Unknown => "unknown",
            Reachability::Up => "up",
            Reachability::Down => "down",
        }
    }
}

/// Up/down change of one device, produced by the state tracker in the commit phase.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub event_id: uuid::Uuid,
    pub device: Device,
    pub from: Reachability,
    pub to: Reachability,
    pub latency_ms: Option<u32>,
    pub kind: ProbeKind,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}
