//! Single-question transport driver.
//!
//! One submitted query is walked through a non-blocking state machine:
//! UDP connect/send/receive, then a fresh TCP connection with 2-byte length
//! framing when the UDP answer comes back truncated. Replies are verified
//! against the outstanding question; transaction ids come from a keyed
//! permutor so they never repeat within 65535 queries on one socket.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use rand::RngCore;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use crate::clock::SharedClock;
use crate::error::{Error, Result, Step};
use crate::packet::{self, Packet, HEADER_LEN};
use crate::permutor::IdPermutor;
use crate::records::{RecordClass, RecordType};

const UDP_ANSWER_SIZE: usize = 4096;

/// Which transports a query may use. `Any` starts on UDP and upgrades to
/// TCP on truncation; the other two pin the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Any,
    Dgram,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    UdpInit,
    UdpConn,
    UdpSend,
    UdpRecv,
    UdpDone,
    TcpInit,
    TcpConn,
    TcpSend,
    TcpRecv,
    TcpDone,
}

enum Tcp {
    Connecting(Socket),
    Connected(TcpStream),
}

/// Errors that mean "not yet" rather than failure.
fn retriable(e: &std::io::Error) -> bool {
    if matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    ) {
        return true;
    }
    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return code == libc::EINPROGRESS || code == libc::EALREADY;
    }
    false
}

pub struct QuerySocket {
    udp: Option<UdpSocket>,
    tcp: Option<Tcp>,
    local: SocketAddr,
    remote: SocketAddr,
    transport: Transport,
    ids: IdPermutor,
    clock: SharedClock,
    state: QueryState,
    qid: u16,
    qname: String,
    qtype: RecordType,
    qclass: RecordClass,
    query: Vec<u8>,
    out_pos: usize,
    len_buf: [u8; 2],
    answer: Vec<u8>,
    in_pos: usize,
    began: Instant,
}

impl QuerySocket {
    pub fn new(
        local: SocketAddr,
        transport: Transport,
        clock: SharedClock,
        rng: &mut dyn RngCore,
    ) -> Self {
        let began = clock.now();
        Self {
            udp: None,
            tcp: None,
            local,
            remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            transport,
            ids: IdPermutor::new(1, 65535, rng),
            clock,
            state: QueryState::Idle,
            qid: 0,
            qname: String::new(),
            qtype: RecordType::A,
            qclass: RecordClass::IN,
            query: Vec::new(),
            out_pos: 0,
            len_buf: [0; 2],
            answer: Vec::new(),
            in_pos: 0,
            began,
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Abandon any in-flight query: the TCP connection (if any) is closed,
    /// buffers are dropped, and the socket is ready for a new submit. The
    /// UDP socket and the id permutor are retained.
    pub fn reset(&mut self) {
        self.state = QueryState::Idle;
        self.tcp = None;
        self.query.clear();
        self.answer.clear();
        self.out_pos = 0;
        self.in_pos = 0;
        self.len_buf = [0; 2];
    }

    /// Arm the driver with a single-question query for `remote`. A zero
    /// header id is stamped with a fresh permutor draw.
    pub fn submit(&mut self, query: &Packet, remote: SocketAddr) -> Result<()> {
        self.reset();

        let q = query.question()?;
        self.qname = q.name;
        self.qtype = q.qtype;
        self.qclass = q.qclass;

        self.query = query.as_bytes().to_vec();
        let id = query.id();
        self.qid = if id == 0 { self.ids.step() } else { id };
        self.query[..2].copy_from_slice(&self.qid.to_be_bytes());

        self.remote = remote;
        self.began = self.clock.now();
        self.state = match self.transport {
            Transport::Stream => QueryState::TcpInit,
            _ => QueryState::UdpInit,
        };
        Ok(())
    }

    /// Advance the state machine as far as it will go without blocking.
    pub fn check(&mut self) -> Result<Step> {
        loop {
            match self.state {
                QueryState::Idle => return Err(Error::Unknown("no query in flight")),

                QueryState::UdpInit => {
                    let families_match = self
                        .udp
                        .as_ref()
                        .and_then(|s| s.local_addr().ok())
                        .map(|a| a.is_ipv4() == self.remote.is_ipv4());
                    if families_match != Some(true) {
                        self.udp = Some(self.open_udp()?);
                    }
                    self.state = QueryState::UdpConn;
                }

                QueryState::UdpConn => {
                    self.udp()?.connect(self.remote)?;
                    self.state = QueryState::UdpSend;
                }

                QueryState::UdpSend => match self.udp()?.send(&self.query) {
                    Ok(_) => self.state = QueryState::UdpRecv,
                    Err(e) if retriable(&e) => return Ok(Step::Pending),
                    Err(e) => return Err(e.into()),
                },

                QueryState::UdpRecv => {
                    let mut buf = vec![0u8; UDP_ANSWER_SIZE];
                    match self.udp()?.recv(&mut buf) {
                        Ok(n) => {
                            if !self.verify(&buf[..n]) {
                                // Silently drop and keep listening.
                                debug!("discarding unverifiable UDP answer ({} bytes)", n);
                                continue;
                            }
                            buf.truncate(n);
                            self.answer = buf;
                            let truncated = self.answer[2] & 0x02 != 0;
                            if truncated && self.transport != Transport::Dgram {
                                self.state = QueryState::TcpInit;
                            } else {
                                self.state = QueryState::UdpDone;
                            }
                        }
                        Err(e) if retriable(&e) => return Ok(Step::Pending),
                        Err(e) => return Err(e.into()),
                    }
                }

                QueryState::UdpDone | QueryState::TcpDone => return Ok(Step::Ready),

                QueryState::TcpInit => {
                    // Any previous connection is torn down; truncation gets
                    // a fresh socket bound to the same local address.
                    self.tcp = None;
                    self.answer.clear();
                    self.out_pos = 0;
                    self.in_pos = 0;

                    let sock = self.open_tcp()?;
                    match sock.connect(&SockAddr::from(self.remote)) {
                        Ok(()) => self.tcp = Some(Tcp::Connected(sock.into())),
                        Err(e) if retriable(&e) => self.tcp = Some(Tcp::Connecting(sock)),
                        Err(e) => return Err(e.into()),
                    }
                    self.state = QueryState::TcpConn;
                }

                QueryState::TcpConn => {
                    match self.tcp.take() {
                        Some(Tcp::Connected(s)) => {
                            self.tcp = Some(Tcp::Connected(s));
                            self.state = QueryState::TcpSend;
                        }
                        Some(Tcp::Connecting(sock)) => {
                            match sock.connect(&SockAddr::from(self.remote)) {
                                Ok(()) => {
                                    self.tcp = Some(Tcp::Connected(sock.into()));
                                    self.state = QueryState::TcpSend;
                                }
                                #[cfg(unix)]
                                Err(e) if e.raw_os_error() == Some(libc::EISCONN) => {
                                    self.tcp = Some(Tcp::Connected(sock.into()));
                                    self.state = QueryState::TcpSend;
                                }
                                Err(e) if retriable(&e) => {
                                    self.tcp = Some(Tcp::Connecting(sock));
                                    return Ok(Step::Pending);
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }
                        None => return Err(Error::Unknown("tcp socket missing")),
                    }
                }

                QueryState::TcpSend => {
                    let frame_len = (self.query.len() as u16).to_be_bytes();
                    let total = 2 + self.query.len();
                    let Some(Tcp::Connected(stream)) = self.tcp.as_mut() else {
                        return Err(Error::Unknown("tcp socket missing"));
                    };
                    while self.out_pos < total {
                        let chunk: &[u8] = if self.out_pos < 2 {
                            &frame_len[self.out_pos..]
                        } else {
                            &self.query[self.out_pos - 2..]
                        };
                        match stream.write(chunk) {
                            Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                            Ok(n) => self.out_pos += n,
                            Err(e) if retriable(&e) => return Ok(Step::Pending),
                            Err(e) => return Err(e.into()),
                        }
                    }
                    self.in_pos = 0;
                    self.state = QueryState::TcpRecv;
                }

                QueryState::TcpRecv => {
                    let Some(Tcp::Connected(stream)) = self.tcp.as_mut() else {
                        return Err(Error::Unknown("tcp socket missing"));
                    };
                    while self.in_pos < 2 {
                        match stream.read(&mut self.len_buf[self.in_pos..]) {
                            Ok(0) => {
                                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
                            }
                            Ok(n) => self.in_pos += n,
                            Err(e) if retriable(&e) => return Ok(Step::Pending),
                            Err(e) => return Err(e.into()),
                        }
                    }
                    let alen = u16::from_be_bytes(self.len_buf) as usize;
                    if self.answer.len() < alen {
                        self.answer.resize(alen, 0);
                    }
                    while self.in_pos < 2 + alen {
                        match stream.read(&mut self.answer[self.in_pos - 2..]) {
                            Ok(0) => {
                                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
                            }
                            Ok(n) => self.in_pos += n,
                            Err(e) if retriable(&e) => return Ok(Step::Pending),
                            Err(e) => return Err(e.into()),
                        }
                    }
                    // A TCP answer that fails verification is a hard error;
                    // there is nothing else coming on this connection.
                    if !self.verify_answer() {
                        return Err(Error::Unknown("TCP answer failed verification"));
                    }
                    self.state = QueryState::TcpDone;
                }
            }
        }
    }

    /// The verified answer, once `check` reported [`Step::Ready`].
    pub fn fetch(&self) -> Result<Packet> {
        match self.state {
            QueryState::UdpDone | QueryState::TcpDone => Packet::from_bytes(&self.answer),
            _ => Err(Error::Unknown("answer not ready")),
        }
    }

    /// Fd to wait readable on, if the machine is parked on a read.
    pub fn pollin(&self) -> Option<RawFd> {
        match self.state {
            QueryState::UdpRecv => self.udp.as_ref().map(|s| s.as_raw_fd()),
            QueryState::TcpRecv => self.tcp_fd(),
            _ => None,
        }
    }

    /// Fd to wait writable on, if the machine is parked on connect/send.
    pub fn pollout(&self) -> Option<RawFd> {
        match self.state {
            QueryState::UdpConn | QueryState::UdpSend => self.udp.as_ref().map(|s| s.as_raw_fd()),
            QueryState::TcpConn | QueryState::TcpSend => self.tcp_fd(),
            _ => None,
        }
    }

    /// Monotonic time since the current query was submitted.
    pub fn elapsed(&self) -> Duration {
        self.clock
            .now()
            .checked_duration_since(self.began)
            .unwrap_or_default()
    }

    fn tcp_fd(&self) -> Option<RawFd> {
        match &self.tcp {
            Some(Tcp::Connecting(s)) => Some(s.as_raw_fd()),
            Some(Tcp::Connected(s)) => Some(s.as_raw_fd()),
            None => None,
        }
    }

    fn udp(&self) -> Result<&UdpSocket> {
        self.udp.as_ref().ok_or(Error::Unknown("udp socket missing"))
    }

    fn bind_addr(&self) -> SocketAddr {
        if self.local.is_ipv4() == self.remote.is_ipv4() {
            self.local
        } else if self.remote.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        }
    }

    fn open_udp(&self) -> Result<UdpSocket> {
        let domain = if self.remote.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_nonblocking(true)?;
        sock.bind(&SockAddr::from(self.bind_addr()))?;
        Ok(sock.into())
    }

    fn open_tcp(&self) -> Result<Socket> {
        let domain = if self.remote.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        sock.bind(&SockAddr::from(self.bind_addr()))?;
        Ok(sock)
    }

    fn verify_answer(&self) -> bool {
        self.verify(&self.answer)
    }

    /// Accept an answer iff it is addressed to the outstanding question:
    /// same id, at least one question entry, and a first question whose
    /// name/type/class match what was sent.
    fn verify(&self, bytes: &[u8]) -> bool {
        if bytes.len() < HEADER_LEN {
            return false;
        }
        if u16::from_be_bytes([bytes[0], bytes[1]]) != self.qid {
            return false;
        }
        let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);
        if qdcount < 1 {
            return false;
        }
        let Ok((qname, next)) = packet::parse_name(bytes, HEADER_LEN) else {
            return false;
        };
        if next + 4 > bytes.len() {
            return false;
        }
        let qtype = RecordType::from_u16(u16::from_be_bytes([bytes[next], bytes[next + 1]]));
        let qclass = RecordClass::from_u16(u16::from_be_bytes([bytes[next + 2], bytes[next + 3]]));
        qtype == self.qtype && qclass == self.qclass && crate::name::eq(&qname, &self.qname)
    }
}
