//! In-memory sockets and a scripted network for tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::error::ProbeError;
use crate::packet::{IcmpHeader, Ipv4Header, ICMP_TIME_EXCEEDED, IPV4_HEADER_LEN};
use crate::transport::{ProbeSocket, Transport};
use crate::util::{self, Resolver};

pub(crate) const US: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

pub(crate) fn with_ip_header(source: Ipv4Addr, destination: Ipv4Addr, ttl: u8, message: &[u8]) -> Vec<u8> {
    let mut bytes = Ipv4Header::icmp(source, destination, ttl, message.len())
        .encode_with_checksum()
        .unwrap();
    bytes.extend_from_slice(message);
    bytes
}

/// The datagram `from` sends back for the Echo-Request `request`.
pub(crate) fn echo_reply(from: Ipv4Addr, to: Ipv4Addr, ttl: u8, request: &[u8]) -> Vec<u8> {
    let mut message = request.to_vec();
    message[0] = 0;
    util::set_checksum(&mut message, 1);
    with_ip_header(from, to, ttl, &message)
}

/// A Time-Exceeded from `router` quoting the IP header of `request` and
/// `quote_len` bytes of its ICMP message.
pub(crate) fn time_exceeded(
    router: Ipv4Addr,
    us: Ipv4Addr,
    target: Ipv4Addr,
    request: &[u8],
    quote_len: usize,
) -> Vec<u8> {
    let mut quoted = with_ip_header(us, target, 1, request);
    quoted.truncate(IPV4_HEADER_LEN + quote_len);

    let mut message = IcmpHeader::new(ICMP_TIME_EXCEEDED, 0, 0).encode().unwrap();
    message.extend(quoted);
    util::set_checksum(&mut message, 1);
    with_ip_header(router, us, 254, &message)
}

/// What the network saw for one send.
#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub ttl: Option<u8>,
    pub destination: Ipv4Addr,
    pub packet: Vec<u8>,
}

type Responder = dyn Fn(&Sent) -> Vec<(Ipv4Addr, Vec<u8>)>;

struct NetState {
    responder: Box<Responder>,
    opened: RefCell<Vec<Option<u8>>>,
    sent: RefCell<Vec<Sent>>,
    deny: bool,
}

/// A network that answers each probe through `responder`. Silence from the
/// responder plays out as a timeout.
#[derive(Clone)]
pub(crate) struct FakeNet {
    state: Rc<NetState>,
}

impl FakeNet {
    pub fn new(responder: impl Fn(&Sent) -> Vec<(Ipv4Addr, Vec<u8>)> + 'static) -> Self {
        FakeNet {
            state: Rc::new(NetState {
                responder: Box::new(responder),
                opened: RefCell::new(Vec::new()),
                sent: RefCell::new(Vec::new()),
                deny: false,
            }),
        }
    }

    /// Every socket open fails as if run without privileges.
    pub fn unprivileged() -> Self {
        FakeNet {
            state: Rc::new(NetState {
                responder: Box::new(|_| Vec::new()),
                opened: RefCell::new(Vec::new()),
                sent: RefCell::new(Vec::new()),
                deny: true,
            }),
        }
    }

    pub fn opened(&self) -> Vec<Option<u8>> {
        self.state.opened.borrow().clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.sent.borrow().clone()
    }
}

impl Transport for FakeNet {
    type Socket = ScriptedSocket;

    fn open(&self, ttl: Option<u8>) -> Result<ScriptedSocket, ProbeError> {
        if self.state.deny {
            return Err(ProbeError::from_socket_open(io::Error::from(
                ErrorKind::PermissionDenied,
            )));
        }
        self.state.opened.borrow_mut().push(ttl);
        Ok(ScriptedSocket {
            net: Some((self.clone(), ttl)),
            ..ScriptedSocket::default()
        })
    }
}

#[derive(Default)]
pub(crate) struct ScriptedSocket {
    inbox: VecDeque<(Ipv4Addr, Vec<u8>)>,
    delay: Duration,
    send_error: Option<ErrorKind>,
    net: Option<(FakeNet, Option<u8>)>,
}

impl ScriptedSocket {
    pub fn push(&mut self, from: Ipv4Addr, datagram: Vec<u8>) {
        self.inbox.push_back((from, datagram));
    }

    /// Each queued datagram takes `delay` to arrive.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_sends(mut self, kind: ErrorKind) -> Self {
        self.send_error = Some(kind);
        self
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl ProbeSocket for ScriptedSocket {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        if let Some(kind) = self.send_error {
            return Err(io::Error::from(kind));
        }
        if let Some((net, ttl)) = &self.net {
            let sent = Sent {
                ttl: *ttl,
                destination,
                packet: packet.to_vec(),
            };
            let replies = (net.state.responder)(&sent);
            net.state.sent.borrow_mut().push(sent);
            self.inbox.extend(replies);
        }
        Ok(packet.len())
    }

    fn recv_within(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, Ipv4Addr)>> {
        if self.inbox.is_empty() || self.delay > timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(self.delay);

        match self.inbox.pop_front() {
            Some((from, datagram)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Some((len, from)))
            }
            None => Ok(None),
        }
    }
}

/// Resolves a fixed set of names; reverse lookups yield `host-a-b-c-d`.
pub(crate) struct StaticResolver {
    pub names: Vec<(&'static str, Ipv4Addr)>,
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, ProbeError> {
        self.names
            .iter()
            .find(|(name, _)| *name == host)
            .map(|(_, address)| *address)
            .ok_or_else(|| ProbeError::Resolution {
                host: host.to_string(),
                source: io::Error::new(ErrorKind::NotFound, "unknown host"),
            })
    }

    fn reverse(&self, address: Ipv4Addr) -> String {
        let [a, b, c, d] = address.octets();
        format!("host-{}-{}-{}-{}", a, b, c, d)
    }
}
