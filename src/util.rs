use std::io::{Error, ErrorKind};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dns_lookup::{lookup_addr, lookup_host};

use crate::error::ProbeError;

/// Name lookups needed by a session: one forward lookup for the destination
/// and a reverse lookup for every responding address.
pub trait Resolver {
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, ProbeError>;

    /// Name for `address`, falling back to its dotted form.
    fn reverse(&self, address: Ipv4Addr) -> String;
}

/// System resolver (getaddrinfo / getnameinfo).
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, ProbeError> {
        if let Ok(address) = host.parse::<Ipv4Addr>() {
            return Ok(address);
        }

        let addrs = lookup_host(host).map_err(|source| ProbeError::Resolution {
            host: host.to_string(),
            source,
        })?;

        addrs
            .into_iter()
            .find_map(|addr| match addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| ProbeError::Resolution {
                host: host.to_string(),
                source: Error::new(ErrorKind::NotFound, "no IPv4 address for host"),
            })
    }

    fn reverse(&self, address: Ipv4Addr) -> String {
        lookup_addr(&IpAddr::V4(address)).unwrap_or_else(|_| address.to_string())
    }
}

/// Internet checksum (RFC 1071) of `data`. Words are read big endian and an
/// odd trailing byte is padded with a zero low byte.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = sum_be_words(data);
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !sum as u16 // The checksum field should be the ones complement of the sum
}

/// Computes the checksum of `data` with the word at word offset `location`
/// zeroed, and stores it there.
pub fn set_checksum(data: &mut [u8], location: usize) {
    data[location * 2] = 0;
    data[location * 2 + 1] = 0;
    let sum = checksum(data);
    data[location * 2..location * 2 + 2].copy_from_slice(&sum.to_be_bytes());
}

fn sum_be_words(data: &[u8]) -> u32 {
    data.chunks(2)
        .map(|word| match *word {
            [wh] => u16::from_be_bytes([wh, 0]),
            [wh, wl] => u16::from_be_bytes([wh, wl]),
            _ => unreachable!(),
        })
        .fold(0u32, |acc, w| {
            // Fold as we go so arbitrarily long inputs cannot overflow.
            let acc = acc + w as u32;
            (acc & 0xFFFF) + (acc >> 16)
        })
}

/// Microseconds since the UNIX epoch. This is the unit of the timestamp
/// embedded in every probe payload.
pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Time between an embedded send stamp and `now`, both from `timestamp_micros`.
/// A stamp from the future (clock step) reads as zero.
pub fn elapsed_between(sent: u64, now: u64) -> Duration {
    Duration::from_micros(now.saturating_sub(sent))
}

/// Parses a timeout given either as plain seconds (`2`, `0.5`) or as a
/// humantime duration (`500ms`, `2s`).
pub fn parse_timeout(text: &str) -> Result<Duration, ProbeError> {
    let timeout = match text.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Ok(_) => return Err(ProbeError::InvalidArgument("timeout must be positive".into())),
        Err(_) => humantime::parse_duration(text).map_err(|e| {
            ProbeError::InvalidArgument(format!("invalid timeout {:?} (ex: 2, 0.5, 400ms): {}", text, e))
        })?,
    };

    if timeout == Duration::from_secs(0) {
        return Err(ProbeError::InvalidArgument("timeout must be positive".into()));
    }
    Ok(timeout)
}

/// Milliseconds with two decimals, the unit every report line uses.
pub fn format_millis(d: Duration) -> String {
    format!("{:.2}", d.as_micros() as f64 / 1000f64)
}
