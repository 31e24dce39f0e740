//! IPv4 and ICMP header codecs and the echo-request builder.
//!
//! Headers go through `bincode` in big-endian mode, the same way the
//! on-wire structs are laid out: fixed-width integers, no length prefixes.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::util;

pub const IPV4_HEADER_LEN: usize = 20;
pub const ICMP_HEADER_LEN: usize = 8;
/// Width of the send stamp at the front of every probe payload.
pub const TIMESTAMP_LEN: usize = 8;

pub const IPPROTO_ICMP: u8 = 1;

/// ICMP (type, code) pairs this crate understands.
pub const ICMP_ECHO_REQUEST: (u8, u8) = (8, 0);
pub const ICMP_ECHO_REPLY: (u8, u8) = (0, 0);
pub const ICMP_TIME_EXCEEDED: (u8, u8) = (11, 0);

#[allow(deprecated)] // bincode 1.3 prefers `Options`, the legacy config keeps fixed-width ints
fn coder() -> bincode::Config {
    let mut coder = bincode::config();
    coder.big_endian(); // Network byte order
    coder
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub message_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpHeader {
    pub fn new(function: (u8, u8), identifier: u16, sequence: u16) -> Self {
        IcmpHeader {
            message_type: function.0,
            code: function.1,
            checksum: 0,
            identifier,
            sequence,
        }
    }

    /// The (type, code) pair that tells reply kinds apart.
    pub fn function(&self) -> (u8, u8) {
        (self.message_type, self.code)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProbeError> {
        Ok(coder().serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProbeError> {
        if bytes.len() != ICMP_HEADER_LEN {
            return Err(ProbeError::Format {
                what: "ICMP header",
                expected: ICMP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        Ok(coder().deserialize(bytes)?)
    }
}

/// On-wire layout of the fixed IPv4 header.
#[derive(Serialize, Deserialize)]
struct Ipv4Wire {
    version_and_header_len: u8,
    type_of_service: u8,
    total_length: u16,
    identification: u16,
    flags_and_frag_offset: u16,
    ttl: u8,
    protocol: u8,
    checksum: u16,
    source: [u8; 4],
    destination: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,          // 4 bits
    pub header_len_words: u8, // 4 bits, in 32-bit words
    pub type_of_service: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,            // 3 bits
    pub fragment_offset: u16, // 13 bits
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
}

impl Ipv4Header {
    /// A header without options carrying `payload_len` bytes of ICMP.
    pub fn icmp(source: Ipv4Addr, destination: Ipv4Addr, ttl: u8, payload_len: usize) -> Self {
        Ipv4Header {
            version: 4,
            header_len_words: (IPV4_HEADER_LEN / 4) as u8,
            type_of_service: 0,
            total_length: (IPV4_HEADER_LEN + payload_len) as u16,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl,
            protocol: IPPROTO_ICMP,
            checksum: 0,
            source: source.octets(),
            destination: destination.octets(),
        }
    }

    pub fn header_len(&self) -> usize {
        self.header_len_words as usize * 4
    }

    pub fn source_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.source)
    }

    pub fn destination_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.destination)
    }

    /// Packs the header. Sub-byte fields are masked to their widths.
    pub fn encode(&self) -> Result<Vec<u8>, ProbeError> {
        let wire = Ipv4Wire {
            version_and_header_len: (self.version & 0x0F) << 4 | (self.header_len_words & 0x0F),
            type_of_service: self.type_of_service,
            total_length: self.total_length,
            identification: self.identification,
            flags_and_frag_offset: ((self.flags & 0x07) as u16) << 13
                | (self.fragment_offset & 0x1FFF),
            ttl: self.ttl,
            protocol: self.protocol,
            checksum: self.checksum,
            source: self.source,
            destination: self.destination,
        };
        Ok(coder().serialize(&wire)?)
    }

    /// Packs the header with its checksum field filled in.
    pub fn encode_with_checksum(&self) -> Result<Vec<u8>, ProbeError> {
        let mut bytes = Ipv4Header { checksum: 0, ..*self }.encode()?;
        util::set_checksum(&mut bytes, 5);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProbeError> {
        if bytes.len() != IPV4_HEADER_LEN {
            return Err(ProbeError::Format {
                what: "IPv4 header",
                expected: IPV4_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let wire: Ipv4Wire = coder().deserialize(bytes)?;
        Ok(Ipv4Header {
            version: wire.version_and_header_len >> 4,
            header_len_words: wire.version_and_header_len & 0x0F,
            type_of_service: wire.type_of_service,
            total_length: wire.total_length,
            identification: wire.identification,
            flags: (wire.flags_and_frag_offset >> 13) as u8,
            fragment_offset: wire.flags_and_frag_offset & 0x1FFF,
            ttl: wire.ttl,
            protocol: wire.protocol,
            checksum: wire.checksum,
            source: wire.source,
            destination: wire.destination,
        })
    }
}

/// Builds an ICMP Echo-Request stamped with the current time.
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload_size: usize,
) -> Result<Vec<u8>, ProbeError> {
    build_echo_request_at(identifier, sequence, payload_size, util::timestamp_micros())
}

/// Builds an ICMP Echo-Request whose payload starts with `stamp`
/// (microseconds, big endian) followed by zero padding up to `payload_size`.
pub fn build_echo_request_at(
    identifier: u16,
    sequence: u16,
    payload_size: usize,
    stamp: u64,
) -> Result<Vec<u8>, ProbeError> {
    if payload_size < TIMESTAMP_LEN {
        return Err(ProbeError::InvalidArgument(format!(
            "payload size must be at least {} bytes, got {}",
            TIMESTAMP_LEN, payload_size
        )));
    }

    let header = IcmpHeader::new(ICMP_ECHO_REQUEST, identifier, sequence);
    let mut packet = header.encode()?;
    packet.reserve(payload_size);
    packet.extend(coder().serialize(&stamp)?);
    packet.resize(ICMP_HEADER_LEN + payload_size, 0);

    let header = IcmpHeader {
        checksum: util::checksum(&packet),
        ..header
    };
    packet[..ICMP_HEADER_LEN].copy_from_slice(&header.encode()?);
    Ok(packet)
}

/// Reads the send stamp from the front of a probe payload, if it is all there.
pub fn read_timestamp(payload: &[u8]) -> Option<u64> {
    if payload.len() < TIMESTAMP_LEN {
        return None;
    }
    coder().deserialize(&payload[..TIMESTAMP_LEN]).ok()
}

/// A received IPv4 datagram split into its headers and ICMP payload.
#[derive(Debug)]
pub struct Datagram<'a> {
    pub ip: Ipv4Header,
    pub icmp: IcmpHeader,
    /// ICMP header and payload as received.
    pub message: &'a [u8],
    /// Bytes after the ICMP header.
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProbeError> {
        if bytes.len() < IPV4_HEADER_LEN {
            return Err(ProbeError::Format {
                what: "IPv4 header",
                expected: IPV4_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let ip = Ipv4Header::decode(&bytes[..IPV4_HEADER_LEN])?;

        let offset = ip.header_len();
        if offset < IPV4_HEADER_LEN || bytes.len() < offset + ICMP_HEADER_LEN {
            return Err(ProbeError::Format {
                what: "ICMP header",
                expected: offset.max(IPV4_HEADER_LEN) + ICMP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let icmp = IcmpHeader::decode(&bytes[offset..offset + ICMP_HEADER_LEN])?;

        Ok(Datagram {
            ip,
            icmp,
            message: &bytes[offset..],
            payload: &bytes[offset + ICMP_HEADER_LEN..],
        })
    }

    pub fn checksum_ok(&self) -> bool {
        util::checksum(self.message) == 0
    }

    /// For a Time-Exceeded message, the original datagram the router quoted.
    pub fn quoted(&self) -> Result<Datagram<'a>, ProbeError> {
        Datagram::parse(self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_icmp_header_layout() {
        let header = IcmpHeader {
            message_type: 8,
            code: 0,
            checksum: 0xABCD,
            identifier: 0x1234,
            sequence: 0x0102,
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![8, 0, 0xAB, 0xCD, 0x12, 0x34, 0x01, 0x02]);
        assert_eq!(IcmpHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.function(), ICMP_ECHO_REQUEST);
    }

    #[test]
    fn test_icmp_decode_rejects_bad_length() {
        let err = IcmpHeader::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProbeError::Format { expected: 8, actual: 3, .. }));
        assert!(IcmpHeader::decode(&[0; 9]).is_err());
    }

    #[test]
    fn test_ipv4_header_layout() {
        let header = Ipv4Header {
            flags: 0b010,
            fragment_offset: 0x0123,
            identification: 0xBEEF,
            ..Ipv4Header::icmp(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 64, 16)
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), IPV4_HEADER_LEN);
        assert_eq!(bytes[0], 0x45);
        assert_eq!(&bytes[2..4], &[0, 36]);
        assert_eq!(&bytes[6..8], &[0x41, 0x23]);
        assert_eq!(bytes[8], 64);
        assert_eq!(bytes[9], IPPROTO_ICMP);
        assert_eq!(&bytes[12..16], &[10, 0, 0, 1]);
        assert_eq!(&bytes[16..20], &[10, 0, 0, 2]);
    }

    #[test]
    fn test_ipv4_decode_rejects_bad_length() {
        assert!(matches!(
            Ipv4Header::decode(&[0x45; 19]).unwrap_err(),
            ProbeError::Format { expected: 20, actual: 19, .. }
        ));
        assert!(Ipv4Header::decode(&[0x45; 21]).is_err());
    }

    #[test]
    fn test_header_round_trip_random_fields() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let ip = Ipv4Header {
                version: rng.gen_range(0, 16),
                header_len_words: rng.gen_range(0, 16),
                type_of_service: rng.gen(),
                total_length: rng.gen(),
                identification: rng.gen(),
                flags: rng.gen_range(0, 8),
                fragment_offset: rng.gen_range(0, 0x2000),
                ttl: rng.gen(),
                protocol: rng.gen(),
                checksum: rng.gen(),
                source: rng.gen(),
                destination: rng.gen(),
            };
            assert_eq!(Ipv4Header::decode(&ip.encode().unwrap()).unwrap(), ip);

            let icmp = IcmpHeader {
                message_type: rng.gen(),
                code: rng.gen(),
                checksum: rng.gen(),
                identifier: rng.gen(),
                sequence: rng.gen(),
            };
            assert_eq!(IcmpHeader::decode(&icmp.encode().unwrap()).unwrap(), icmp);
        }
    }

    #[test]
    fn test_ipv4_checksum_verifies() {
        let header = Ipv4Header::icmp(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 9), 5, 64);
        let bytes = header.encode_with_checksum().unwrap();
        assert_eq!(util::checksum(&bytes), 0);
        assert_ne!(Ipv4Header::decode(&bytes).unwrap().checksum, 0);
    }

    #[test]
    fn test_build_rejects_short_payload() {
        for size in 0..TIMESTAMP_LEN {
            assert!(matches!(
                build_echo_request(1, 1, size).unwrap_err(),
                ProbeError::InvalidArgument(_)
            ));
        }
    }

    #[test]
    fn test_build_minimum_payload() {
        let packet = build_echo_request_at(0x4242, 7, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(packet.len(), ICMP_HEADER_LEN + 8);
        assert_eq!(&packet[8..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(util::checksum(&packet), 0);

        let header = IcmpHeader::decode(&packet[..ICMP_HEADER_LEN]).unwrap();
        assert_eq!(header.function(), ICMP_ECHO_REQUEST);
        assert_eq!(header.identifier, 0x4242);
        assert_eq!(header.sequence, 7);
    }

    #[test]
    fn test_build_pads_with_zeros() {
        let packet = build_echo_request_at(1, 2, 56, 99).unwrap();
        assert_eq!(packet.len(), ICMP_HEADER_LEN + 56);
        assert_eq!(read_timestamp(&packet[ICMP_HEADER_LEN..]), Some(99));
        assert!(packet[ICMP_HEADER_LEN + TIMESTAMP_LEN..].iter().all(|&b| b == 0));
        assert_eq!(util::checksum(&packet), 0);
    }

    #[test]
    fn test_read_timestamp_truncated() {
        assert_eq!(read_timestamp(&[0; 7]), None);
    }

    #[test]
    fn test_parse_datagram() {
        let icmp = build_echo_request_at(3, 4, 16, 1234).unwrap();
        let mut bytes = Ipv4Header::icmp(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 57, icmp.len())
            .encode_with_checksum()
            .unwrap();
        bytes.extend(&icmp);

        let datagram = Datagram::parse(&bytes).unwrap();
        assert_eq!(datagram.ip.ttl, 57);
        assert_eq!(datagram.ip.source_addr(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(datagram.icmp.sequence, 4);
        assert_eq!(datagram.message.len(), 24);
        assert_eq!(read_timestamp(datagram.payload), Some(1234));
        assert!(datagram.checksum_ok());

        assert!(Datagram::parse(&bytes[..25]).is_err());
        assert!(Datagram::parse(&bytes[..10]).is_err());
    }

    #[test]
    fn test_parse_rejects_short_header_len() {
        let mut bytes = vec![0u8; 28];
        bytes[0] = 0x43; // IHL of 3 words is below the minimum
        assert!(Datagram::parse(&bytes).unwrap_err().is_skippable());
    }
}
