//! One probe out, one matching reply back, over a raw ICMP socket.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::error::ProbeError;
use crate::packet::{
    read_timestamp, Datagram, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_TIME_EXCEEDED, IPPROTO_ICMP,
};
use crate::util;

const RECV_BUFFER_LEN: usize = 4096;

/// The socket operations a probe needs. Implemented by `RawSocket` and by
/// in-memory sockets in tests.
pub trait ProbeSocket {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize>;

    /// Blocks for at most `timeout` waiting for one datagram. `Ok(None)` means
    /// nothing arrived in time.
    fn recv_within(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, Ipv4Addr)>>;
}

/// Hands out a fresh socket for every probe (ping) or hop (traceroute). A
/// socket is dropped before the next one is opened, so datagrams buffered for
/// one probe never leak into the next.
pub trait Transport {
    type Socket: ProbeSocket;

    fn open(&self, ttl: Option<u8>) -> Result<Self::Socket, ProbeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawTransport;

impl Transport for RawTransport {
    type Socket = RawSocket;

    fn open(&self, ttl: Option<u8>) -> Result<RawSocket, ProbeError> {
        RawSocket::new(ttl)
    }
}

pub struct RawSocket {
    socket: Socket,
}

impl RawSocket {
    pub fn new(ttl: Option<u8>) -> Result<Self, ProbeError> {
        let socket = Socket::new(Domain::ipv4(), Type::raw(), Some(Protocol::icmpv4()))
            .map_err(ProbeError::from_socket_open)?;

        if let Some(ttl) = ttl {
            socket.set_ttl(ttl as u32).map_err(ProbeError::Io)?;
        }
        trace!(?ttl, "Opened raw ICMP socket");

        Ok(RawSocket { socket })
    }
}

impl ProbeSocket for RawSocket {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        let address = SockAddr::from(SocketAddr::from((destination, 0)));
        self.socket.send_to(packet, &address)
    }

    fn recv_within(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, Ipv4Addr)>> {
        // A zero read timeout means "block forever" to the OS.
        if timeout == Duration::from_secs(0) {
            return Ok(None);
        }
        self.socket.set_read_timeout(Some(timeout))?;

        match self.socket.recv_from(buf) {
            Ok((len, from)) => {
                let from = match from.as_std() {
                    Some(SocketAddr::V4(v4)) => *v4.ip(),
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                Ok(Some((len, from)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// What counts as an answer to the probe in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    pub sequence: u16,
    /// Only accept Echo-Replies sent from this address.
    pub reply_from: Option<Ipv4Addr>,
    /// Accept Time-Exceeded messages from routers on the path.
    pub time_exceeded: bool,
}

impl Matcher {
    pub fn echo_reply(sequence: u16, from: Ipv4Addr) -> Self {
        Matcher {
            sequence,
            reply_from: Some(from),
            time_exceeded: false,
        }
    }

    pub fn hop(sequence: u16) -> Self {
        Matcher {
            sequence,
            reply_from: None,
            time_exceeded: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Bytes of ICMP message received (header and payload).
    pub size: usize,
    pub address: Ipv4Addr,
    pub sequence: u16,
    pub ttl: u8,
    pub rtt: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exceeded {
    pub address: Ipv4Addr,
    /// `None` when the router's quote was too short to carry our timestamp.
    pub rtt: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Reply(Reply),
    TimeExceeded(Exceeded),
    Timeout,
}

pub fn send<S: ProbeSocket + ?Sized>(
    socket: &mut S,
    destination: Ipv4Addr,
    packet: &[u8],
) -> Result<(), ProbeError> {
    socket
        .send_to(packet, destination)
        .map_err(|e| ProbeError::from_send(destination, e))?;
    Ok(())
}

/// Waits up to `timeout` for a datagram that answers the probe described by
/// `identifier` and `matcher`.
///
/// Malformed and unrelated datagrams are dropped and the wait resumes with
/// whatever is left of the budget; the time spent receiving them is not
/// refunded.
pub fn receive_matching<S: ProbeSocket + ?Sized>(
    socket: &mut S,
    identifier: u16,
    timeout: Duration,
    matcher: Matcher,
) -> Result<ProbeResult, ProbeError> {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    let mut remaining = timeout;

    loop {
        if remaining == Duration::from_secs(0) {
            return Ok(ProbeResult::Timeout);
        }

        let started = Instant::now();
        let received = socket.recv_within(&mut buf, remaining).map_err(ProbeError::Io)?;
        remaining = remaining.saturating_sub(started.elapsed());

        let (len, from) = match received {
            Some(r) => r,
            None => return Ok(ProbeResult::Timeout),
        };
        let now = util::timestamp_micros();

        match classify(&buf[..len], from, identifier, matcher, now) {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => trace!(%from, len, "Ignored unrelated ICMP datagram"),
            Err(e) if e.is_skippable() => debug!(%from, len, error = %e, "Dropped malformed datagram"),
            Err(e) => return Err(e),
        }
        trace!(remaining_ms = remaining.as_millis() as u64, "Still waiting for reply");
    }
}

/// Decides whether `bytes` answers our probe. `Ok(None)` for other traffic.
fn classify(
    bytes: &[u8],
    from: Ipv4Addr,
    identifier: u16,
    matcher: Matcher,
    now: u64,
) -> Result<Option<ProbeResult>, ProbeError> {
    let datagram = Datagram::parse(bytes)?;
    if !datagram.checksum_ok() {
        debug!(%from, "Dropped datagram with bad ICMP checksum");
        return Ok(None);
    }

    let function = datagram.icmp.function();
    if function == ICMP_ECHO_REPLY {
        if datagram.icmp.identifier != identifier || datagram.icmp.sequence != matcher.sequence {
            return Ok(None);
        }
        if matches!(matcher.reply_from, Some(expected) if expected != from) {
            return Ok(None);
        }

        let sent = read_timestamp(datagram.payload).ok_or(ProbeError::Format {
            what: "echo reply payload",
            expected: crate::packet::TIMESTAMP_LEN,
            actual: datagram.payload.len(),
        })?;

        return Ok(Some(ProbeResult::Reply(Reply {
            size: datagram.message.len(),
            address: from,
            sequence: datagram.icmp.sequence,
            ttl: datagram.ip.ttl,
            rtt: util::elapsed_between(sent, now),
        })));
    }

    if function == ICMP_TIME_EXCEEDED && matcher.time_exceeded {
        let rtt = match datagram.quoted() {
            Ok(quoted) => {
                let ours = quoted.ip.protocol == IPPROTO_ICMP
                    && quoted.icmp.function() == ICMP_ECHO_REQUEST
                    && quoted.icmp.identifier == identifier
                    && quoted.icmp.sequence == matcher.sequence;
                if !ours {
                    return Ok(None);
                }
                read_timestamp(quoted.payload).map(|sent| util::elapsed_between(sent, now))
            }
            // Routers may quote only part of our datagram. Take it, minus the timing.
            Err(_) => None,
        };

        return Ok(Some(ProbeResult::TimeExceeded(Exceeded { address: from, rtt })));
    }

    Ok(None)
}
