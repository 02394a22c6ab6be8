//! SNMP enrichment for reachable devices.
//!
//! Reads sysDescr, the configured interface's octet counters and the vendor
//! profile's wireless OIDs. Every GET has its own deadline. A field the
//! device does not answer (noSuchObject / noSuchInstance) stays `None`.

use snmp2::{AsyncSession, Oid, Value};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

use super::vendor::{self, VendorTable};
use crate::models::{ProbeKind, SnmpCredentials, SnmpMetrics, SnmpVersion};

const MAX_DESCR_LEN: usize = 200;
// RFC 3416 authorizationError
const ERR_AUTHORIZATION: u32 = 16;
// SNMPv1 noSuchName
const ERR_NO_SUCH_NAME: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SnmpFailure {
    #[error("snmp request timed out")]
    Timeout,
    #[error("snmp community rejected")]
    Auth,
    #[error("snmp response undecodable")]
    Decode,
}

impl From<SnmpFailure> for ProbeKind {
    fn from(f: SnmpFailure) -> Self {
        match f {
            SnmpFailure::Timeout => ProbeKind::SnmpTimeout,
            SnmpFailure::Auth => ProbeKind::SnmpAuth,
            SnmpFailure::Decode => ProbeKind::SnmpDecode,
        }
    }
}

fn classify(e: &snmp2::Error) -> SnmpFailure {
    match e {
        snmp2::Error::CommunityMismatch => SnmpFailure::Auth,
        _ => SnmpFailure::Decode,
    }
}

fn as_text(v: &Value<'_>) -> Result<Option<String>, SnmpFailure> {
    match v {
        Value::OctetString(bytes) => {
            let mut s = String::from_utf8_lossy(bytes).trim().to_string();
            if s.len() > MAX_DESCR_LEN {
                let mut cut = MAX_DESCR_LEN;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                s.truncate(cut);
            }
            Ok(if s.is_empty() { None } else { Some(s) })
        }
        Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView | Value::Null => Ok(None),
        _ => Err(SnmpFailure::Decode),
    }
}

fn as_i64(v: &Value<'_>) -> Result<Option<i64>, SnmpFailure> {
    match v {
        Value::Integer(i) => Ok(Some(*i)),
        Value::Counter32(n) | Value::Unsigned32(n) | Value::Timeticks(n) => Ok(Some(i64::from(*n))),
        Value::Counter64(n) => Ok(i64::try_from(*n).ok()),
        Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView | Value::Null => Ok(None),
        _ => Err(SnmpFailure::Decode),
    }
}

fn as_u64(v: &Value<'_>) -> Result<Option<u64>, SnmpFailure> {
    match v {
        Value::Counter64(n) => Ok(Some(*n)),
        _ => match as_i64(v)? {
            Some(i) if i < 0 => Err(SnmpFailure::Decode),
            other => Ok(other.map(|i| i as u64)),
        },
    }
}

struct Session {
    inner: AsyncSession,
    deadline: Duration,
}

impl Session {
    async fn open(ip: IpAddr, creds: &SnmpCredentials, deadline: Duration) -> Result<Self, SnmpFailure> {
        let addr = SocketAddr::new(ip, creds.port);
        let community = creds.community.as_bytes();
        let opened = match creds.version {
            SnmpVersion::V1 => timeout(deadline, AsyncSession::new_v1(addr, community, 0)).await,
            SnmpVersion::V2c => timeout(deadline, AsyncSession::new_v2c(addr, community, 0)).await,
        };
        match opened {
            Ok(Ok(inner)) => Ok(Self { inner, deadline }),
            Ok(Err(_)) => Err(SnmpFailure::Decode),
            Err(_) => Err(SnmpFailure::Timeout),
        }
    }

    /// One GET, converted while the response still borrows the session buffer.
    async fn get<T>(
        &mut self,
        arcs: &[u64],
        convert: impl Fn(&Value<'_>) -> Result<Option<T>, SnmpFailure>,
    ) -> Result<Option<T>, SnmpFailure> {
        let oid = Oid::from(arcs).map_err(|_| SnmpFailure::Decode)?;
        let mut pdu = match timeout(self.deadline, self.inner.get(&oid)).await {
            Err(_) => return Err(SnmpFailure::Timeout),
            Ok(Err(e)) => return Err(classify(&e)),
            Ok(Ok(pdu)) => pdu,
        };
        match pdu.error_status {
            0 => {}
            ERR_NO_SUCH_NAME => return Ok(None),
            ERR_AUTHORIZATION => return Err(SnmpFailure::Auth),
            _ => return Err(SnmpFailure::Decode),
        }
        match pdu.varbinds.next() {
            Some((_, value)) => convert(&value),
            None => Ok(None),
        }
    }
}

pub struct SnmpCollector {
    deadline: Duration,
    vendors: VendorTable,
}

/// Partial results plus the first failure met, if any.
#[derive(Debug, Default)]
pub struct SnmpReport {
    pub metrics: SnmpMetrics,
    pub failure: Option<SnmpFailure>,
    pub vendor: Option<&'static str>,
}

impl SnmpReport {
    fn fail(&mut self, f: SnmpFailure) {
        if self.failure.is_none() {
            self.failure = Some(f);
        }
    }
}

impl SnmpCollector {
    pub fn new(deadline: Duration, vendors: VendorTable) -> Self {
        Self { deadline, vendors }
    }

    pub async fn collect(&self, ip: IpAddr, creds: &SnmpCredentials, is_mikrotik: bool) -> SnmpReport {
        let mut report = SnmpReport::default();
        let mut session = match Session::open(ip, creds, self.deadline).await {
            Ok(s) => s,
            Err(f) => {
                report.fail(f);
                return report;
            }
        };

        // timeout or auth errors end the walk; decode errors only lose one field
        macro_rules! fetch {
            ($arcs:expr, $conv:expr) => {
                match session.get($arcs, $conv).await {
                    Ok(v) => v,
                    Err(f @ (SnmpFailure::Timeout | SnmpFailure::Auth)) => {
                        report.fail(f);
                        return report;
                    }
                    Err(f) => {
                        report.fail(f);
                        None
                    }
                }
            };
        }

        report.metrics.sys_descr = fetch!(vendor::OID_SYS_DESCR, as_text);
        let profile = self.vendors.select(is_mikrotik, report.metrics.sys_descr.as_deref());
        report.vendor = Some(profile.name);

        if let Some(index) = creds.interface_index {
            let index = u64::from(index);
            report.metrics.traffic_in = fetch!(&vendor::indexed(vendor::OID_IF_IN_OCTETS, index), as_u64);
            report.metrics.traffic_out = fetch!(&vendor::indexed(vendor::OID_IF_OUT_OCTETS, index), as_u64);
        }

        let row = creds.interface_index.map(u64::from).unwrap_or(profile.default_index);
        if let Some(base) = profile.signal {
            let signal = fetch!(&vendor::indexed(base, row), as_i64);
            report.metrics.signal_dbm = signal.and_then(|s| i32::try_from(s).ok());
        }
        if let Some(base) = profile.ccq {
            let ccq = fetch!(&vendor::indexed(base, row), as_u64);
            report.metrics.ccq = ccq.and_then(|c| u32::try_from(c).ok());
        }
        if let Some(base) = profile.clients {
            let clients = fetch!(&vendor::indexed(base, row), as_u64);
            report.metrics.clients = clients.and_then(|c| u32::try_from(c).ok());
        }
        report
    }
}
