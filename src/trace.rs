use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::debug;

use crate::error::ProbeError;
use crate::packet::{build_echo_request, TIMESTAMP_LEN};
use crate::ping::process_identifier;
use crate::sink::LogSink;
use crate::transport::{receive_matching, send, Matcher, ProbeResult, Transport};
use crate::util::{self, Resolver};

/// Probes sent at each TTL.
pub const PROBES_PER_HOP: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceConfig {
    pub first_ttl: u8,
    pub max_hops: u8,
    /// How long to wait for each probe.
    pub timeout: Duration,
    pub payload_size: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            first_ttl: 1,
            max_hops: 30,
            timeout: Duration::from_millis(100),
            payload_size: 60,
        }
    }
}

impl TraceConfig {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.max_hops == 0 {
            return Err(ProbeError::InvalidArgument("max hops must be positive".into()));
        }
        if self.first_ttl == 0 || self.first_ttl > self.max_hops {
            return Err(ProbeError::InvalidArgument(format!(
                "first ttl must be between 1 and {}",
                self.max_hops
            )));
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

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HopProbe {
    Rtt(Duration),
    /// Answered, but the quote did not carry our timestamp.
    Unknown,
    Lost,
}

impl fmt::Display for HopProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopProbe::Rtt(rtt) => write!(f, "{} ms", util::format_millis(*rtt)),
            HopProbe::Unknown => f.write_str("?"),
            HopProbe::Lost => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Responder {
    pub name: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub ttl: u8,
    /// Last address that answered at this TTL.
    pub responder: Option<Responder>,
    pub probes: Vec<HopProbe>,
    /// The destination itself answered.
    pub reached: bool,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.responder {
            Some(responder) => {
                write!(f, "{:2}  {} ({})", self.ttl, responder.name, responder.address)?;
                for probe in &self.probes {
                    write!(f, "  {}", probe)?;
                }
                Ok(())
            }
            None => write!(f, "{:2}  * * *", self.ttl),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub destination: Ipv4Addr,
    pub hops: Vec<Hop>,
}

impl Trace {
    pub fn reached(&self) -> bool {
        self.hops.last().map_or(false, |hop| hop.reached)
    }
}

/// Sweeps TTLs from `first_ttl` to `max_hops` toward one destination.
pub struct TraceSession<T, R> {
    host: String,
    config: TraceConfig,
    identifier: u16,
    transport: T,
    resolver: R,
}

impl<T: Transport, R: Resolver> TraceSession<T, R> {
    pub fn new(host: &str, config: TraceConfig, transport: T, resolver: R) -> Self {
        TraceSession {
            host: host.to_string(),
            config,
            identifier: process_identifier(),
            transport,
            resolver,
        }
    }

    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    /// Runs the sweep, writing one line per hop to `sink`. Stops at the hop
    /// where the destination answers, or after `max_hops`.
    pub fn run(&self, sink: &mut dyn LogSink) -> Result<Trace, ProbeError> {
        self.config.validate()?;
        let destination = self.resolver.resolve(&self.host)?;

        sink.record(&format!(
            "traceroute to {} ({}), {} hops max, {} byte packets",
            self.host, destination, self.config.max_hops, self.config.payload_size
        ));

        let mut trace = Trace {
            destination,
            hops: Vec::new(),
        };
        for ttl in self.config.first_ttl..=self.config.max_hops {
            let hop = self.hop(destination, ttl)?;
            sink.record(&hop.to_string());

            let reached = hop.reached;
            trace.hops.push(hop);
            if reached {
                debug!(ttl, %destination, "Destination reached");
                break;
            }
        }

        Ok(trace)
    }

    /// One socket with its TTL set, up to `PROBES_PER_HOP` probes through it.
    fn hop(&self, destination: Ipv4Addr, ttl: u8) -> Result<Hop, ProbeError> {
        let mut socket = self.transport.open(Some(ttl))?;

        let mut responder = None;
        let mut probes = Vec::with_capacity(PROBES_PER_HOP as usize);
        let mut reached = false;
        for n in 0..PROBES_PER_HOP {
            // Unique across the sweep so late answers can't be credited to the wrong probe.
            let sequence = (ttl as u16 - 1) * PROBES_PER_HOP + n + 1;
            let packet = build_echo_request(self.identifier, sequence, self.config.payload_size)?;

            send(&mut socket, destination, &packet)?;
            match receive_matching(
                &mut socket,
                self.identifier,
                self.config.timeout,
                Matcher::hop(sequence),
            )? {
                ProbeResult::Reply(reply) => {
                    probes.push(HopProbe::Rtt(reply.rtt));
                    responder = Some(reply.address);
                    if reply.address == destination {
                        reached = true;
                        break;
                    }
                }
                ProbeResult::TimeExceeded(exceeded) => {
                    probes.push(exceeded.rtt.map_or(HopProbe::Unknown, HopProbe::Rtt));
                    responder = Some(exceeded.address);
                }
                ProbeResult::Timeout => probes.push(HopProbe::Lost),
            }
        }

        Ok(Hop {
            ttl,
            responder: responder.map(|address| Responder {
                name: self.resolver.reverse(address),
                address,
            }),
            probes,
            reached,
        })
    }
}
