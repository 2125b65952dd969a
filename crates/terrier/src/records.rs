//! Resource record model: types, classes and typed rdata views.
//!
//! `RData` keeps one variant per record type the engine understands and an
//! `Opaque` fallback that preserves unknown rdata verbatim. Compressed wire
//! encoding happens in `packet`; this module owns parsing, the canonical
//! (uncompressed, lowercased) form used for ordering and deduplication, and
//! display.

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::name;
use crate::packet::{parse_name, Section};

/// DNS record types the engine knows how to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    ANY,
    Unknown(u16),
}

impl RecordType {
    pub fn from_u16(val: u16) -> Self {
        match val {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            12 => Self::PTR,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA,
            33 => Self::SRV,
            255 => Self::ANY,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::A => 1,
            Self::NS => 2,
            Self::CNAME => 5,
            Self::SOA => 6,
            Self::PTR => 12,
            Self::MX => 15,
            Self::TXT => 16,
            Self::AAAA => 28,
            Self::SRV => 33,
            Self::ANY => 255,
            Self::Unknown(v) => v,
        }
    }
}

#[allow(unreachable_patterns)]
impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::NS => write!(f, "NS"),
            Self::CNAME => write!(f, "CNAME"),
            Self::SOA => write!(f, "SOA"),
            Self::PTR => write!(f, "PTR"),
            Self::MX => write!(f, "MX"),
            Self::TXT => write!(f, "TXT"),
            Self::AAAA => write!(f, "AAAA"),
            Self::SRV => write!(f, "SRV"),
            Self::ANY => write!(f, "ANY"),
            Self::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "NS" => Ok(Self::NS),
            "CNAME" => Ok(Self::CNAME),
            "SOA" => Ok(Self::SOA),
            "PTR" => Ok(Self::PTR),
            "MX" => Ok(Self::MX),
            "TXT" => Ok(Self::TXT),
            "AAAA" => Ok(Self::AAAA),
            "SRV" => Ok(Self::SRV),
            "ANY" => Ok(Self::ANY),
            _ => Err(Error::Unknown("unrecognized record type")),
        }
    }
}

/// DNS record class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    IN,
    Any,
    Unknown(u16),
}

impl RecordClass {
    pub fn from_u16(val: u16) -> Self {
        match val {
            1 => Self::IN,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::IN => 1,
            Self::Any => 255,
            Self::Unknown(v) => v,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IN => write!(f, "IN"),
            Self::Any => write!(f, "ANY"),
            Self::Unknown(v) => write!(f, "CLASS{}", v),
        }
    }
}

/// Typed rdata. Unknown record types are carried through untouched.
#[derive(Debug, Clone)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    NS(String),
    PTR(String),
    CNAME(String),
    MX {
        preference: u16,
        exchange: String,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    SOA {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    /// Character strings concatenated, per RFC 1035 §3.3.14.
    TXT(String),
    Opaque(Vec<u8>),
}

impl RData {
    /// Parse rdata at `offset..offset+rdlength` of a full message buffer.
    /// Embedded names may point anywhere in the message, so the whole buffer
    /// is required. Length mismatches for fixed-size types degrade to
    /// `Opaque`; reads past the buffer are malformed.
    pub fn parse(buf: &[u8], offset: usize, rdlength: usize, rtype: RecordType) -> Result<Self> {
        if offset + rdlength > buf.len() {
            return Err(Error::Illegal("rdata past end of packet"));
        }
        let raw = &buf[offset..offset + rdlength];

        match rtype {
            RecordType::A => {
                if rdlength != 4 {
                    return Ok(Self::Opaque(raw.to_vec()));
                }
                Ok(Self::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))
            }
            RecordType::AAAA => {
                if rdlength != 16 {
                    return Ok(Self::Opaque(raw.to_vec()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                Ok(Self::AAAA(Ipv6Addr::from(octets)))
            }
            RecordType::NS | RecordType::PTR | RecordType::CNAME => {
                let (target, _) = parse_name(buf, offset)?;
                Ok(match rtype {
                    RecordType::NS => Self::NS(target),
                    RecordType::PTR => Self::PTR(target),
                    _ => Self::CNAME(target),
                })
            }
            RecordType::MX => {
                if rdlength < 3 {
                    return Ok(Self::Opaque(raw.to_vec()));
                }
                let preference = u16::from_be_bytes([raw[0], raw[1]]);
                let (exchange, _) = parse_name(buf, offset + 2)?;
                Ok(Self::MX { preference, exchange })
            }
            RecordType::SRV => {
                if rdlength < 7 {
                    return Ok(Self::Opaque(raw.to_vec()));
                }
                let priority = u16::from_be_bytes([raw[0], raw[1]]);
                let weight = u16::from_be_bytes([raw[2], raw[3]]);
                let port = u16::from_be_bytes([raw[4], raw[5]]);
                let (target, _) = parse_name(buf, offset + 6)?;
                Ok(Self::SRV { priority, weight, port, target })
            }
            RecordType::SOA => {
                let (mname, off) = parse_name(buf, offset)?;
                let (rname, off) = parse_name(buf, off)?;
                if off + 20 > buf.len() {
                    return Err(Error::Illegal("truncated SOA rdata"));
                }
                let int = |i: usize| {
                    u32::from_be_bytes([buf[off + i], buf[off + i + 1], buf[off + i + 2], buf[off + i + 3]])
                };
                Ok(Self::SOA {
                    mname,
                    rname,
                    serial: int(0),
                    refresh: int(4),
                    retry: int(8),
                    expire: int(12),
                    minimum: int(16),
                })
            }
            RecordType::TXT => {
                let mut txt = String::new();
                let mut pos = 0;
                while pos < raw.len() {
                    let len = raw[pos] as usize;
                    pos += 1;
                    if pos + len > raw.len() {
                        return Err(Error::Illegal("truncated TXT string"));
                    }
                    txt.push_str(&String::from_utf8_lossy(&raw[pos..pos + len]));
                    pos += len;
                }
                Ok(Self::TXT(txt))
            }
            _ => Ok(Self::Opaque(raw.to_vec())),
        }
    }

    /// The record type a variant naturally encodes as. `Opaque` has no type
    /// of its own; callers carry it on the record.
    pub fn rtype(&self) -> Option<RecordType> {
        Some(match self {
            Self::A(_) => RecordType::A,
            Self::AAAA(_) => RecordType::AAAA,
            Self::NS(_) => RecordType::NS,
            Self::PTR(_) => RecordType::PTR,
            Self::CNAME(_) => RecordType::CNAME,
            Self::MX { .. } => RecordType::MX,
            Self::SRV { .. } => RecordType::SRV,
            Self::SOA { .. } => RecordType::SOA,
            Self::TXT(_) => RecordType::TXT,
            Self::Opaque(_) => return None,
        })
    }

    /// Uncompressed, lowercased serialization. This is the form ordering and
    /// deduplication work over; it is never written to the wire as-is for
    /// types that compress.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::A(ip) => out.extend_from_slice(&ip.octets()),
            Self::AAAA(ip) => out.extend_from_slice(&ip.octets()),
            Self::NS(n) | Self::PTR(n) | Self::CNAME(n) => push_lower_name(&mut out, n),
            Self::MX { preference, exchange } => {
                out.extend_from_slice(&preference.to_be_bytes());
                push_lower_name(&mut out, exchange);
            }
            Self::SRV { priority, weight, port, target } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                push_lower_name(&mut out, target);
            }
            Self::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
                push_lower_name(&mut out, mname);
                push_lower_name(&mut out, rname);
                for v in [serial, refresh, retry, expire, minimum] {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            Self::TXT(text) => {
                let bytes = text.as_bytes();
                for chunk in bytes.chunks(255) {
                    out.push(chunk.len() as u8);
                    out.extend_from_slice(chunk);
                }
                if bytes.is_empty() {
                    out.push(0);
                }
            }
            Self::Opaque(data) => out.extend_from_slice(data),
        }
        out
    }
}

fn push_lower_name(out: &mut Vec<u8>, n: &str) {
    for label in name::labels(n) {
        let len = label.len().min(name::MAX_LABEL_LEN);
        out.push(len as u8);
        out.extend(label.as_bytes()[..len].iter().map(|b| b.to_ascii_lowercase()));
    }
    out.push(0);
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A(ip) => write!(f, "{}", ip),
            Self::AAAA(ip) => write!(f, "{}", ip),
            Self::NS(n) | Self::PTR(n) | Self::CNAME(n) => write!(f, "{}", name::anchor(n)),
            Self::MX { preference, exchange } => {
                write!(f, "{} {}", preference, name::anchor(exchange))
            }
            Self::SRV { priority, weight, port, target } => {
                write!(f, "{} {} {} {}", priority, weight, port, name::anchor(target))
            }
            Self::SOA { mname, rname, serial, refresh, retry, expire, minimum } => write!(
                f,
                "{} {} {} {} {} {} {}",
                name::anchor(mname),
                name::anchor(rname),
                serial,
                refresh,
                retry,
                expire,
                minimum
            ),
            Self::TXT(text) => write!(f, "\"{}\"", text),
            Self::Opaque(data) => {
                write!(f, "\\# {}", data.len())?;
                for b in data {
                    write!(f, " {:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// A resource record together with the section it lives in (or is destined
/// for). `pos` is the wire offset of the owner name for records parsed out
/// of a packet, 0 for records built in memory.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: RecordClass,
    pub ttl: u32,
    pub rdata: RData,
    pub section: Section,
    pub pos: usize,
}

impl DnsRecord {
    pub fn new(name: &str, rtype: RecordType, ttl: u32, rdata: RData) -> Self {
        Self {
            name: name.to_string(),
            rtype,
            class: RecordClass::IN,
            ttl,
            rdata,
            section: Section::Answer,
            pos: 0,
        }
    }

    pub fn a(name: &str, ip: Ipv4Addr, ttl: u32) -> Self {
        Self::new(name, RecordType::A, ttl, RData::A(ip))
    }

    pub fn aaaa(name: &str, ip: Ipv6Addr, ttl: u32) -> Self {
        Self::new(name, RecordType::AAAA, ttl, RData::AAAA(ip))
    }

    pub fn ns(name: &str, host: &str, ttl: u32) -> Self {
        Self::new(name, RecordType::NS, ttl, RData::NS(host.to_string()))
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        Self::new(name, RecordType::CNAME, ttl, RData::CNAME(target.to_string()))
    }

    pub fn ptr(name: &str, target: &str, ttl: u32) -> Self {
        Self::new(name, RecordType::PTR, ttl, RData::PTR(target.to_string()))
    }

    pub fn mx(name: &str, preference: u16, exchange: &str, ttl: u32) -> Self {
        Self::new(
            name,
            RecordType::MX,
            ttl,
            RData::MX { preference, exchange: exchange.to_string() },
        )
    }

    pub fn in_section(mut self, section: Section) -> Self {
        self.section = section;
        self
    }

    /// Total order on (type, class, owner name case-insensitively, canonical
    /// rdata). TTL and position do not participate.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.rtype
            .to_u16()
            .cmp(&other.rtype.to_u16())
            .then_with(|| self.class.to_u16().cmp(&other.class.to_u16()))
            .then_with(|| name::key(&self.name).cmp(&name::key(&other.name)))
            .then_with(|| self.rdata.canonical_bytes().cmp(&other.rdata.canonical_bytes()))
    }

    /// RR equality for deduplication: same tuple as `canonical_cmp`.
    pub fn same_rr(&self, other: &Self) -> bool {
        self.canonical_cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            name::anchor(&self.name),
            self.ttl,
            self.class,
            self.rtype,
            self.rdata
        )
    }
}
