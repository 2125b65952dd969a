//! In-memory hosts table, answering A/AAAA/PTR questions from entries
//! loaded out of hosts(5) text. Answers carry ttl 0 so they are never
//! cached beyond the transaction at hand.

use std::net::IpAddr;
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::name;
use crate::packet::Packet;
use crate::records::{DnsRecord, RData, RecordClass, RecordType};

#[derive(Debug, Clone)]
pub struct HostsEntry {
    pub addr: IpAddr,
    pub name: String,
    /// Reverse-lookup owner form of `addr`, precomputed at insert.
    pub arpa: String,
    /// Alias rows answer forward lookups but are skipped for PTR.
    pub alias: bool,
}

/// Append-only list of host entries.
#[derive(Debug, Default)]
pub struct HostsTable {
    entries: Vec<HostsEntry>,
}

impl HostsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: IpAddr, host: &str, alias: bool) {
        self.entries.push(HostsEntry {
            addr,
            name: host.to_string(),
            arpa: name::arpa(addr),
            alias,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load hosts(5) text: `address canonical-name [aliases...]` per line,
    /// `#` comments. The first name on a line is the canonical one; the
    /// rest are alias rows. Returns the number of entries added.
    pub fn load_str(&mut self, text: &str) -> usize {
        let before = self.entries.len();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
                continue;
            };
            for (i, host) in fields.enumerate() {
                self.insert(addr, host, i > 0);
            }
        }
        self.entries.len() - before
    }

    pub fn load_path(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        Ok(self.load_str(&text))
    }

    /// Answer a question from the table. The reply echoes the question with
    /// QR set; matches are appended to the answer section with ttl 0.
    pub fn query(&self, qname: &str, qtype: RecordType, qclass: RecordClass) -> Result<Packet> {
        let mut reply = Packet::new(4096);
        reply.set_qr(true);
        reply.push_question(qname, qtype, qclass)?;

        if !matches!(qclass, RecordClass::IN | RecordClass::Any) {
            return Ok(reply);
        }

        match qtype {
            RecordType::PTR => {
                for e in self.entries.iter().filter(|e| !e.alias) {
                    if name::eq(&e.arpa, qname) {
                        reply.push(&DnsRecord::ptr(qname, &e.name, 0))?;
                    }
                }
            }
            RecordType::A | RecordType::AAAA | RecordType::ANY => {
                for e in &self.entries {
                    if !name::eq(&e.name, qname) {
                        continue;
                    }
                    match (e.addr, qtype) {
                        (IpAddr::V4(v4), RecordType::A | RecordType::ANY) => {
                            reply.push(&DnsRecord::a(qname, v4, 0))?;
                        }
                        (IpAddr::V6(v6), RecordType::AAAA | RecordType::ANY) => {
                            reply.push(&DnsRecord::aaaa(qname, v6, 0))?;
                        }
                        _ => {}
                    }
                }
            }
            other => {
                debug!("hosts table cannot answer {} questions", other);
            }
        }

        Ok(reply)
    }
}
