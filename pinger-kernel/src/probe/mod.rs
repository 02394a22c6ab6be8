/**
 * PROBE EXECUTOR - one reachability measurement of one device
 *
 * ROLE:
 * Turns a `Device` into a `ProbeOutcome`. Never fails towards the caller:
 * every problem becomes an outcome with a `ProbeKind`.
 *
 * HOW:
 * 1. resolve address (literal or DNS)        -> icmp_timeout / icmp_unreachable
 * 2. ICMP echo, retries, per-attempt deadline -> icmp_timeout / icmp_unreachable
 * 3. SNMP enrichment if credentials exist     -> snmp_* kinds, device stays up
 *
 * Reachability is decided by ICMP alone.
 */

pub mod icmp;
pub mod snmp;
pub mod vendor;

use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

use crate::config::ProbeConf;
use crate::models::{Device, ProbeKind, ProbeOutcome};
use icmp::{IcmpError, IcmpPinger};
use snmp::SnmpCollector;
use vendor::VendorTable;

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, device: &Device) -> ProbeOutcome;
}

pub struct NetworkProber {
    icmp: IcmpPinger,
    snmp: SnmpCollector,
    resolve_timeout: Duration,
}

impl NetworkProber {
    pub fn new(conf: &ProbeConf) -> Self {
        Self {
            icmp: IcmpPinger::new(Duration::from_millis(conf.icmp_timeout_ms), conf.icmp_retries),
            snmp: SnmpCollector::new(Duration::from_millis(conf.snmp_timeout_ms), VendorTable::default()),
            resolve_timeout: Duration::from_millis(conf.icmp_timeout_ms),
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, device: &Device) -> ProbeOutcome {
        let started_at = OffsetDateTime::now_utc();
        let finish = |reachable: bool, latency_ms: Option<u32>, kind: ProbeKind| ProbeOutcome {
            device_id: device.id.clone(),
            reachable,
            latency_ms,
            metrics: None,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            kind,
        };

        let ip = match icmp::resolve(&device.address, self.resolve_timeout).await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::debug!(device_id = %device.id, address = %device.address, error = %e, "address does not resolve");
                let kind = if e == IcmpError::Timeout { ProbeKind::IcmpTimeout } else { ProbeKind::IcmpUnreachable };
                return finish(false, None, kind);
            }
        };

        let rtt = match self.icmp.ping(ip).await {
            Ok(rtt) => rtt,
            Err(IcmpError::Timeout) => return finish(false, None, ProbeKind::IcmpTimeout),
            Err(IcmpError::Unreachable(reason)) => {
                tracing::debug!(device_id = %device.id, %reason, "icmp unreachable");
                return finish(false, None, ProbeKind::IcmpUnreachable);
            }
            Err(IcmpError::Unavailable(family)) => {
                tracing::debug!(device_id = %device.id, family, "no icmp socket");
                return finish(false, None, ProbeKind::Internal);
            }
        };
        let latency_ms = Some(icmp::to_millis(rtt));

        let Some(creds) = &device.snmp else {
            return finish(true, latency_ms, ProbeKind::Ok);
        };

        let report = self.snmp.collect(ip, creds, device.is_mikrotik).await;
        let kind = report.failure.map(ProbeKind::from).unwrap_or(ProbeKind::Ok);
        let mut outcome = finish(true, latency_ms, kind);
        if !report.metrics.is_empty() {
            outcome.metrics = Some(report.metrics);
        }
        outcome
    }
}
