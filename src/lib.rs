//! ICMP echo probing: `ping` and `traceroute` over raw IPv4 sockets.
//!
//! Every probe is an Echo-Request whose payload starts with the send time, so
//! round-trip times come straight out of the reply. Sessions own their
//! identifier and sequence counter and open a fresh socket per probe (ping)
//! or per hop (traceroute).

pub mod error;
pub mod packet;
pub mod ping;
pub mod sink;
pub mod trace;
pub mod transport;
pub mod util;

#[cfg(test)]
mod fake;

pub use error::ProbeError;
pub use ping::{PingConfig, PingOutcome, PingSession, PingSummary};
pub use sink::{ConsoleSink, FileSink, LogSink};
pub use trace::{Hop, HopProbe, Trace, TraceConfig, TraceSession};
pub use transport::{ProbeResult, RawTransport};
pub use util::DnsResolver;
