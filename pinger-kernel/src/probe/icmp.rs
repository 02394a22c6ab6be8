//! ICMP echo with per-attempt deadline and retries.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, SurgeError, ICMP};

const PAYLOAD: [u8; 56] = [0u8; 56];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IcmpError {
    #[error("no echo reply within deadline")]
    Timeout,
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// Raw socket could not be opened (missing CAP_NET_RAW, IPv6 disabled ...).
    #[error("icmp socket unavailable for {0}")]
    Unavailable(&'static str),
}

pub struct IcmpPinger {
    v4: Option<Client>,
    v6: Option<Client>,
    timeout: Duration,
    retries: u32,
    next_id: AtomicU16,
}

impl IcmpPinger {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        let v4 = match Client::new(&Config::default()) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::error!(error = %e, "ICMPv4 socket unavailable, every probe will fail");
                None
            }
        };
        let v6 = match Client::new(&Config::builder().kind(ICMP::V6).build()) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "ICMPv6 socket unavailable");
                None
            }
        };
        Self { v4, v6, timeout, retries: retries.max(1), next_id: AtomicU16::new(1) }
    }

    /// Round-trip time of the first answered attempt.
    pub async fn ping(&self, ip: IpAddr) -> Result<Duration, IcmpError> {
        let client = match ip {
            IpAddr::V4(_) => self.v4.as_ref().ok_or(IcmpError::Unavailable("ipv4"))?,
            IpAddr::V6(_) => self.v6.as_ref().ok_or(IcmpError::Unavailable("ipv6"))?,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pinger = client.pinger(ip, PingIdentifier(id)).await;
        pinger.timeout(self.timeout);

        let mut last = IcmpError::Timeout;
        for seq in 0..self.retries {
            match pinger.ping(PingSequence(seq as u16), &PAYLOAD).await {
                Ok((_packet, rtt)) => return Ok(rtt),
                Err(SurgeError::Timeout { .. }) => {}
                Err(e) => last = IcmpError::Unreachable(e.to_string()),
            }
        }
        Err(last)
    }
}

/// Integer milliseconds, rounded to nearest.
pub fn to_millis(rtt: Duration) -> u32 {
    (rtt.as_secs_f64() * 1000.0).round().min(u32::MAX as f64) as u32
}

/// IP literal, or the first address DNS returns for a host name within `deadline`.
pub async fn resolve(address: &str, deadline: Duration) -> Result<IpAddr, IcmpError> {
    let address = address.trim();
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }
    first_address(tokio::net::lookup_host((address, 0)), deadline).await
}

async fn first_address<F, I>(lookup: F, deadline: Duration) -> Result<IpAddr, IcmpError>
where
    F: Future<Output = std::io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    match tokio::time::timeout(deadline, lookup).await {
        Err(_) => Err(IcmpError::Timeout),
        Ok(Err(e)) => Err(IcmpError::Unreachable(format!("resolve: {e}"))),
        Ok(Ok(mut addrs)) => addrs
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| IcmpError::Unreachable("resolve: no address".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_are_rounded() {
        assert_eq!(to_millis(Duration::from_micros(12_400)), 12);
        assert_eq!(to_millis(Duration::from_micros(12_600)), 13);
        assert_eq!(to_millis(Duration::from_micros(200)), 0);
    }

    #[tokio::test]
    async fn literals_resolve_without_dns() {
        let deadline = Duration::from_secs(1);
        assert_eq!(resolve("10.1.2.3", deadline).await, Ok("10.1.2.3".parse().unwrap()));
        assert_eq!(resolve(" ::1 ", deadline).await, Ok("::1".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_resolver_times_out() {
        let hung = std::future::pending::<std::io::Result<std::vec::IntoIter<SocketAddr>>>();
        let started = tokio::time::Instant::now();
        assert_eq!(first_address(hung, Duration::from_secs(2)).await, Err(IcmpError::Timeout));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn failed_lookup_is_unreachable() {
        let failed = async { Err::<std::vec::IntoIter<SocketAddr>, _>(std::io::Error::other("NXDOMAIN")) };
        assert!(matches!(first_address(failed, Duration::from_secs(2)).await, Err(IcmpError::Unreachable(_))));
        let empty = async { Ok(Vec::<SocketAddr>::new().into_iter()) };
        assert!(matches!(first_address(empty, Duration::from_secs(2)).await, Err(IcmpError::Unreachable(_))));
    }

    #[tokio::test]
    async fn unresolvable_name_is_an_error_within_the_deadline() {
        let started = std::time::Instant::now();
        assert!(resolve("no-such-device.invalid", Duration::from_secs(2)).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
