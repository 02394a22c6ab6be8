/**
 * SINK PORTS - write side of the collector
 *
 * ROLE:
 * Contracts for the two persistence targets the collector writes to:
 * - PingLogSink  = reachability history, one record per logworthy outcome
 * - MetricSink   = optional SNMP samples (signal, CCQ, traffic, clients)
 *
 * HOW:
 * - batches only: the smart log buffer hands over a whole flush at once
 * - a sink must tolerate the same `(device_id, timestamp)` twice, because a
 *   batch whose write failed midway is retried as a whole
 * - records serialize to flat JSON objects; absent optionals are omitted
 */

pub mod jsonl;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{ProbeKind, SnmpMetrics};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// One line of the ping log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    pub device_id: String,
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    pub kind: ProbeKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SnmpMetrics>,
}

impl PingRecord {
    pub fn key(&self) -> (String, i128) {
        (self.device_id.clone(), self.timestamp.unix_timestamp_nanos())
    }

    /// SNMP part of the record, if any numeric sample was collected.
    pub fn metric_record(&self) -> Option<MetricRecord> {
        let m = self.metrics.as_ref()?;
        let record = MetricRecord {
            device_id: self.device_id.clone(),
            signal_dbm: m.signal_dbm,
            ccq: m.ccq,
            traffic_in: m.traffic_in,
            traffic_out: m.traffic_out,
            clients: m.clients,
            timestamp: self.timestamp,
        };
        if record.is_empty() { None } else { Some(record) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub device_id: String,
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
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl MetricRecord {
    pub fn key(&self) -> (String, i128) {
        (self.device_id.clone(), self.timestamp.unix_timestamp_nanos())
    }

    fn is_empty(&self) -> bool {
        self.signal_dbm.is_none()
            && self.ccq.is_none()
            && self.traffic_in.is_none()
            && self.traffic_out.is_none()
            && self.clients.is_none()
    }
}

#[async_trait]
pub trait PingLogSink: Send + Sync {
    async fn write_batch(&self, records: &[PingRecord]) -> Result<(), SinkError>;
}

#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn write_batch(&self, records: &[MetricRecord]) -> Result<(), SinkError>;
}
