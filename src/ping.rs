use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::ProbeError;
use crate::packet::{build_echo_request, ICMP_HEADER_LEN, IPV4_HEADER_LEN, TIMESTAMP_LEN};
use crate::sink::LogSink;
use crate::transport::{receive_matching, send, Matcher, ProbeResult, Transport};
use crate::util::{self, Resolver};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingConfig {
    /// Echo requests to send.
    pub count: u32,
    /// How long to wait for each reply.
    pub timeout: Duration,
    /// Bytes after the ICMP header, timestamp included.
    pub payload_size: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            count: 4,
            timeout: Duration::from_secs(2),
            payload_size: 56,
        }
    }
}

impl PingConfig {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.count == 0 {
            return Err(ProbeError::InvalidArgument("count must be positive".into()));
        }
        if self.timeout == Duration::from_secs(0) {
            return Err(ProbeError::InvalidArgument("timeout must be positive".into()));
        }
        if self.payload_size < TIMESTAMP_LEN {
            return Err(ProbeError::InvalidArgument(format!(
                "payload size must be at least {} bytes",
                TIMESTAMP_LEN
            )));
        }
        Ok(())
    }
}

/// Identifier shared by every probe of this process: the pid masked to 16 bits.
pub fn process_identifier() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

#[derive(Debug, Clone, PartialEq)]
pub enum PingOutcome {
    Reply {
        size: usize,
        name: String,
        address: Ipv4Addr,
        sequence: u16,
        ttl: u8,
        rtt: Duration,
    },
    Timeout {
        sequence: u16,
        after: Duration,
    },
}

impl PingOutcome {
    pub fn sequence(&self) -> u16 {
        match self {
            PingOutcome::Reply { sequence, .. } | PingOutcome::Timeout { sequence, .. } => *sequence,
        }
    }
}

impl fmt::Display for PingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingOutcome::Reply {
                size,
                name,
                address,
                sequence,
                ttl,
                rtt,
            } => write!(
                f,
                "{} bytes from {} ({}): icmp_seq={} ttl={} time={} ms",
                size,
                name,
                address,
                sequence,
                ttl,
                util::format_millis(*rtt)
            ),
            PingOutcome::Timeout { sequence, after } => write!(
                f,
                "Request timeout for icmp_seq={} (no reply within {})",
                sequence,
                humantime::format_duration(*after)
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingSummary {
    pub outcomes: Vec<PingOutcome>,
}

impl PingSummary {
    pub fn transmitted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn received(&self) -> usize {
        self.rtts().count()
    }

    pub fn loss_percent(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        100f64 * (self.transmitted() - self.received()) as f64 / self.transmitted() as f64
    }

    /// (min, avg, max) round-trip time over the replies received.
    pub fn rtt_stats(&self) -> Option<(Duration, Duration, Duration)> {
        let min = self.rtts().min()?;
        let max = self.rtts().max()?;
        let total: Duration = self.rtts().sum();
        Some((min, total / self.received() as u32, max))
    }

    fn rtts(&self) -> impl Iterator<Item = Duration> + '_ {
        self.outcomes.iter().filter_map(|o| match o {
            PingOutcome::Reply { rtt, .. } => Some(*rtt),
            PingOutcome::Timeout { .. } => None,
        })
    }

    pub fn report(&self, host: &str, sink: &mut dyn LogSink) {
        sink.record(&format!("--- {} ping statistics ---", host));
        sink.record(&format!(
            "{} packets transmitted, {} received, {:.1}% packet loss",
            self.transmitted(),
            self.received(),
            self.loss_percent()
        ));
        if let Some((min, avg, max)) = self.rtt_stats() {
            sink.record(&format!(
                "rtt min/avg/max = {}/{}/{} ms",
                util::format_millis(min),
                util::format_millis(avg),
                util::format_millis(max)
            ));
        }
    }
}

/// Pings one destination `count` times, one probe and one socket at a time.
pub struct PingSession<T, R> {
    host: String,
    config: PingConfig,
    identifier: u16,
    transport: T,
    resolver: R,
    interrupted: Option<Arc<AtomicBool>>,
}

impl<T: Transport, R: Resolver> PingSession<T, R> {
    pub fn new(host: &str, config: PingConfig, transport: T, resolver: R) -> Self {
        PingSession {
            host: host.to_string(),
            config,
            identifier: process_identifier(),
            transport,
            resolver,
            interrupted: None,
        }
    }

    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    /// Stop before the next probe once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Runs the whole session, writing one line per probe to `sink`.
    ///
    /// Lost probes are reported and the session moves on. Bad configuration,
    /// a failed lookup or a missing raw-socket privilege end the session with
    /// an error before or instead of the remaining probes.
    pub fn run(&self, sink: &mut dyn LogSink) -> Result<PingSummary, ProbeError> {
        self.config.validate()?;
        let address = self.resolver.resolve(&self.host)?;

        sink.record(&format!(
            "PING {} ({}) {}({}) bytes of data.",
            self.host,
            address,
            self.config.payload_size,
            self.config.payload_size + ICMP_HEADER_LEN + IPV4_HEADER_LEN
        ));

        let mut summary = PingSummary::default();
        let mut sequence: u16 = 0;
        for _ in 0..self.config.count {
            if self.is_interrupted() {
                debug!(host = %self.host, "Ping interrupted");
                break;
            }

            sequence = sequence.wrapping_add(1);
            if sequence == 0 {
                sequence = 1;
            }

            let outcome = self.probe(address, sequence)?;
            sink.record(&outcome.to_string());
            summary.outcomes.push(outcome);
        }

        summary.report(&self.host, sink);
        Ok(summary)
    }

    fn probe(&self, address: Ipv4Addr, sequence: u16) -> Result<PingOutcome, ProbeError> {
        let packet = build_echo_request(self.identifier, sequence, self.config.payload_size)?;

        let mut socket = self.transport.open(None)?;
        send(&mut socket, address, &packet)?;
        let result = receive_matching(
            &mut socket,
            self.identifier,
            self.config.timeout,
            Matcher::echo_reply(sequence, address),
        )?;

        Ok(match result {
            ProbeResult::Reply(reply) => PingOutcome::Reply {
                size: reply.size,
                name: self.resolver.reverse(reply.address),
                address: reply.address,
                sequence: reply.sequence,
                ttl: reply.ttl,
                rtt: reply.rtt,
            },
            ProbeResult::TimeExceeded(_) | ProbeResult::Timeout => PingOutcome::Timeout {
                sequence,
                after: self.config.timeout,
            },
        })
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }
}
