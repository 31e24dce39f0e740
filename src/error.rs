//! Error types for ping and traceroute sessions.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to resolve {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Destination {address} is unreachable: {source}")]
    Unroutable {
        address: Ipv4Addr,
        #[source]
        source: io::Error,
    },

    #[error("Raw sockets need elevated privileges (run as superuser): {0}")]
    Permission(#[source] io::Error),

    #[error("Malformed {what}: expected {expected} bytes, got {actual}")]
    Format {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to encode or decode header: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Socket error: {0}")]
    Io(#[source] io::Error),
}

impl ProbeError {
    /// Errors raised while parsing a received datagram. The receive loop drops
    /// the datagram and keeps waiting instead of failing the probe.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Format { .. } | Self::Encoding(_))
    }

    pub(crate) fn from_socket_open(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ProbeError::Permission(err),
            _ => ProbeError::Io(err),
        }
    }

    pub(crate) fn from_send(address: Ipv4Addr, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            return ProbeError::Permission(err);
        }
        if is_unreachable(&err) {
            return ProbeError::Unroutable {
                address,
                source: err,
            };
        }
        ProbeError::Io(err)
    }
}

#[cfg(unix)]
fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH)
    ) || err.kind() == io::ErrorKind::AddrNotAvailable
}

#[cfg(not(unix))]
fn is_unreachable(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AddrNotAvailable
}
