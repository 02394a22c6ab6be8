/**
 * JSONL SINKS - append-only files for ping log and SNMP metrics
 *
 * ROLE:
 * Default sink adapters so the collector runs without a database. Each
 * record becomes one JSON line; the file is only ever appended to, which
 * makes it a write-ahead log that a loader can replay into a database.
 *
 * HOW:
 * - a batch is serialized completely before touching the file
 * - one append + `sync_data` per batch
 * - recently written `(device_id, timestamp)` keys are remembered so a
 *   retried batch does not duplicate lines
 */

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{MetricRecord, MetricSink, PingLogSink, PingRecord, SinkError};

const RECENT_KEYS: usize = 4096;

#[derive(Default)]
struct RecentKeys {
    order: VecDeque<(String, i128)>,
    set: HashSet<(String, i128)>,
}

impl RecentKeys {
    fn contains(&self, key: &(String, i128)) -> bool {
        self.set.contains(key)
    }

    fn insert(&mut self, key: (String, i128)) {
        if !self.set.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > RECENT_KEYS {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

struct JsonlFile {
    path: PathBuf,
    recent: parking_lot::Mutex<RecentKeys>,
}

impl JsonlFile {
    fn new(path: PathBuf) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path, recent: parking_lot::Mutex::new(RecentKeys::default()) })
    }

    async fn append<T: Serialize>(
        &self,
        records: &[T],
        key: impl Fn(&T) -> (String, i128),
    ) -> Result<usize, SinkError> {
        let mut buf = Vec::new();
        let mut keys = Vec::new();
        {
            let recent = self.recent.lock();
            for record in records {
                let k = key(record);
                if recent.contains(&k) || keys.contains(&k) {
                    continue;
                }
                serde_json::to_writer(&mut buf, record)?;
                buf.push(b'\n');
                keys.push(k);
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;

        let written = keys.len();
        let mut recent = self.recent.lock();
        for k in keys {
            recent.insert(k);
        }
        Ok(written)
    }
}

pub struct JsonlPingLog {
    file: JsonlFile,
}

impl JsonlPingLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, SinkError> {
        let file = JsonlFile::new(path.into())?;
        tracing::info!(path = %file.path.display(), "ping log sink ready");
        Ok(Self { file })
    }
}

#[async_trait]
impl PingLogSink for JsonlPingLog {
    async fn write_batch(&self, records: &[PingRecord]) -> Result<(), SinkError> {
        let written = self.file.append(records, PingRecord::key).await?;
        tracing::debug!(written, batch = records.len(), "ping log batch appended");
        Ok(())
    }
}

pub struct JsonlMetricLog {
    file: JsonlFile,
}

impl JsonlMetricLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, SinkError> {
        Ok(Self { file: JsonlFile::new(path.into())? })
    }
}

#[async_trait]
impl MetricSink for JsonlMetricLog {
    async fn write_batch(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        self.file.append(records, MetricRecord::key).await?;
        Ok(())
    }
}

/// Reads back every line of a JSONL log.
pub async fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, SinkError> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut out = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProbeKind, SnmpMetrics};
    use time::macros::datetime;

    fn record(id: &str, second: u8) -> PingRecord {
        PingRecord {
            device_id: id.into(),
            reachable: true,
            latency_ms: Some(12),
            kind: ProbeKind::Ok,
            timestamp: datetime!(2024-05-01 12:00:00 UTC) + time::Duration::seconds(second as i64),
            metrics: None,
        }
    }

    #[tokio::test]
    async fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/ping.jsonl");
        let sink = JsonlPingLog::new(&path).unwrap();
        sink.write_batch(&[record("a", 0), record("b", 0)]).await.unwrap();
        sink.write_batch(&[record("a", 1)]).await.unwrap();
        let back: Vec<PingRecord> = read_records(&path).await.unwrap();
        assert_eq!(back, vec![record("a", 0), record("b", 0), record("a", 1)]);
    }

    #[tokio::test]
    async fn retried_batch_is_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ping.jsonl");
        let sink = JsonlPingLog::new(&path).unwrap();
        let batch = [record("a", 0), record("b", 0)];
        sink.write_batch(&batch).await.unwrap();
        sink.write_batch(&batch).await.unwrap();
        sink.write_batch(&[record("a", 0), record("a", 0), record("c", 0)]).await.unwrap();
        let back: Vec<PingRecord> = read_records(&path).await.unwrap();
        assert_eq!(back.len(), 3);
    }

    #[tokio::test]
    async fn metric_log_writes_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let sink = JsonlMetricLog::new(&path).unwrap();
        let mut r = record("t1", 0);
        r.metrics = Some(SnmpMetrics { signal_dbm: Some(-70), ccq: Some(88), ..Default::default() });
        let metric = r.metric_record().unwrap();
        sink.write_batch(std::slice::from_ref(&metric)).await.unwrap();
        let back: Vec<MetricRecord> = read_records(&path).await.unwrap();
        assert_eq!(back, vec![metric]);
    }
}
