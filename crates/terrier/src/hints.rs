//! Per-zone nameserver address pools feeding the iterative resolver its
//! "where do I ask next" answer.
//!
//! A zone holds up to 16 `(address, priority)` pairs; inserting past the cap
//! overwrites in ring order. Iteration visits every address once, lowest
//! priority first, with equal priorities shuffled by a per-iteration seed so
//! load spreads without losing determinism inside one query.

use std::net::{IpAddr, SocketAddr};

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::name;
use crate::packet::{Packet, Section};
use crate::records::{DnsRecord, RecordClass, RecordType};
use crate::resconf::ResolvConf;
use crate::permutor;

pub const ZONE_CAP: usize = 16;

/// Owner name under which synthesized hint address records are attached.
pub const HINTS_OWNER: &str = "hints.local.";

/// The baked-in root server list.
const ROOT_SERVERS: [[u8; 4]; 14] = [
    [198, 41, 0, 4],     // a.root-servers.net
    [199, 9, 14, 201],   // b.root-servers.net
    [192, 228, 79, 201], // b.root-servers.net (previous)
    [192, 33, 4, 12],    // c.root-servers.net
    [199, 7, 91, 13],    // d.root-servers.net
    [192, 203, 230, 10], // e.root-servers.net
    [192, 5, 5, 241],    // f.root-servers.net
    [192, 112, 36, 4],   // g.root-servers.net
    [198, 97, 190, 53],  // h.root-servers.net
    [192, 36, 148, 17],  // i.root-servers.net
    [192, 58, 128, 30],  // j.root-servers.net
    [193, 0, 14, 129],   // k.root-servers.net
    [199, 7, 83, 42],    // l.root-servers.net
    [202, 12, 27, 33],   // m.root-servers.net
];

#[derive(Debug, Clone)]
struct HintsZone {
    zone: String,
    addrs: Vec<(SocketAddr, u16)>,
    count: usize,
}

impl HintsZone {
    /// Indices of `addrs` in visit order: priority ascending, ties broken
    /// by the seeded shuffle. A zero seed is bumped so the shuffle key is
    /// never degenerate.
    fn order(&self, seed: u32) -> Vec<usize> {
        let seed = if seed == 0 { 1 } else { seed };
        let mut idx: Vec<usize> = (0..self.addrs.len()).collect();
        idx.sort_by_key(|&i| (self.addrs[i].1, permutor::shuffle16(i as u16, seed)));
        idx
    }
}

/// Zones keyed case-insensitively by anchored name.
#[derive(Debug, Default)]
pub struct HintsTable {
    zones: FxHashMap<String, HintsZone>,
}

impl HintsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hints for stub operation: the configured nameservers under the root
    /// zone. Without `rotate` each server keeps its configured rank; with
    /// it they share a priority and the per-query shuffle spreads load.
    pub fn local(conf: &ResolvConf) -> Self {
        let mut hints = Self::new();
        for (i, addr) in conf.nameservers.iter().enumerate() {
            let priority = if conf.options.rotate { 0 } else { i as u16 };
            hints.insert(".", *addr, priority);
        }
        hints
    }

    /// Hints for full iteration: the root server list.
    pub fn root() -> Self {
        let mut hints = Self::new();
        for octets in ROOT_SERVERS {
            hints.insert(".", SocketAddr::new(IpAddr::from(octets), 53), 0);
        }
        hints
    }

    /// Add or update an address under a zone. An existing address has its
    /// priority updated in place; past [`ZONE_CAP`] entries the ring wraps
    /// and old entries are overwritten.
    pub fn insert(&mut self, zone: &str, addr: SocketAddr, priority: u16) {
        let entry = self
            .zones
            .entry(name::key(zone))
            .or_insert_with(|| HintsZone {
                zone: name::anchor(zone),
                addrs: Vec::new(),
                count: 0,
            });

        if let Some(slot) = entry.addrs.iter_mut().find(|(a, _)| *a == addr) {
            slot.1 = priority;
            return;
        }
        if entry.addrs.len() < ZONE_CAP {
            entry.addrs.push((addr, priority));
        } else {
            entry.addrs[entry.count % ZONE_CAP] = (addr, priority);
        }
        entry.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// The addresses of the zone closest over `qname`, in visit order for
    /// `seed`. Mostly for tests; `query` is the engine-facing surface.
    pub fn addrs(&self, qname: &str, seed: u32) -> Vec<SocketAddr> {
        match self.closest_zone(qname) {
            Some(zone) => zone.order(seed).into_iter().map(|i| zone.addrs[i].0).collect(),
            None => Vec::new(),
        }
    }

    fn closest_zone(&self, qname: &str) -> Option<&HintsZone> {
        let mut cand = name::key(qname);
        loop {
            if let Some(zone) = self.zones.get(&cand) {
                return Some(zone);
            }
            cand = name::cleave(&cand)?.to_string();
        }
    }

    /// Synthesize a reply seeding iteration for a question: QR set, the
    /// question echoed, one AUTHORITY NS row per address naming
    /// [`HINTS_OWNER`], and the addresses themselves as ADDITIONAL A/AAAA
    /// glue in priority/shuffle order. None when no zone covers the name.
    pub fn query(
        &self,
        qname: &str,
        qtype: RecordType,
        qclass: RecordClass,
        seed: u32,
    ) -> Result<Option<Packet>> {
        let Some(zone) = self.closest_zone(qname) else {
            return Ok(None);
        };

        let mut reply = Packet::new(4096);
        reply.set_qr(true);
        reply.push_question(qname, qtype, qclass)?;

        let order = zone.order(seed);
        for _ in &order {
            reply.push(
                &DnsRecord::ns(&zone.zone, HINTS_OWNER, 0).in_section(Section::Authority),
            )?;
        }
        for i in order {
            let rec = match zone.addrs[i].0.ip() {
                IpAddr::V4(v4) => DnsRecord::a(HINTS_OWNER, v4, 0),
                IpAddr::V6(v6) => DnsRecord::aaaa(HINTS_OWNER, v6, 0),
            };
            reply.push(&rec.in_section(Section::Additional))?;
        }

        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Filter, Sort};
    use crate::records::RData;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_root_hints_have_fourteen_addresses() {
        let hints = HintsTable::root();
        assert_eq!(hints.addrs(".", 1).len(), 14);
    }

    #[test]
    fn test_every_entry_visited_once_per_iteration() {
        let mut hints = HintsTable::new();
        for i in 0..5 {
            hints.insert("example.com.", sa(&format!("10.0.0.{}:53", i)), 0);
        }
        let seen = hints.addrs("www.example.com.", 77);
        assert_eq!(seen.len(), 5);
        let mut uniq = seen.clone();
        uniq.sort();
        uniq.dedup();
        assert_eq!(uniq.len(), 5);
    }

    #[test]
    fn test_order_depends_only_on_seed() {
        let mut hints = HintsTable::new();
        for i in 0..8 {
            hints.insert(".", sa(&format!("10.9.0.{}:53", i)), 0);
        }
        assert_eq!(hints.addrs("x.test.", 5), hints.addrs("x.test.", 5));
        assert_ne!(hints.addrs("x.test.", 5), hints.addrs("x.test.", 6));
    }

    #[test]
    fn test_priority_beats_shuffle() {
        let mut hints = HintsTable::new();
        hints.insert("example.", sa("10.0.0.1:53"), 5);
        hints.insert("example.", sa("10.0.0.2:53"), 1);
        hints.insert("example.", sa("10.0.0.3:53"), 5);
        for seed in 1..32 {
            assert_eq!(hints.addrs("example.", seed)[0], sa("10.0.0.2:53"));
        }
    }

    #[test]
    fn test_insert_updates_in_place() {
        let mut hints = HintsTable::new();
        hints.insert("example.", sa("10.0.0.1:53"), 5);
        hints.insert("example.", sa("10.0.0.1:53"), 0);
        assert_eq!(hints.addrs("example.", 1).len(), 1);
    }

    #[test]
    fn test_ring_overwrite_beyond_cap() {
        let mut hints = HintsTable::new();
        for i in 0..20u8 {
            hints.insert("big.", sa(&format!("10.1.1.{}:53", i)), 0);
        }
        let addrs = hints.addrs("big.", 3);
        assert_eq!(addrs.len(), ZONE_CAP);
        // entries 16..19 displaced 0..3
        assert!(addrs.contains(&sa("10.1.1.19:53")));
        assert!(!addrs.contains(&sa("10.1.1.0:53")));
        assert!(addrs.contains(&sa("10.1.1.4:53")));
    }

    #[test]
    fn test_zone_match_walks_suffixes_case_insensitively() {
        let mut hints = HintsTable::new();
        hints.insert("Example.COM.", sa("10.2.0.1:53"), 0);
        assert_eq!(hints.addrs("deep.sub.example.com.", 1).len(), 1);
        assert!(hints.addrs("example.net.", 1).is_empty());
    }

    #[test]
    fn test_query_synthesizes_ns_and_glue() {
        let mut hints = HintsTable::new();
        hints.insert("com.", sa("10.3.0.1:53"), 0);
        hints.insert("com.", sa("10.3.0.2:53"), 0);

        let reply = hints
            .query("www.example.com.", RecordType::A, RecordClass::IN, 9)
            .unwrap()
            .unwrap();
        assert!(reply.qr());
        assert_eq!(reply.nscount(), 2);
        assert_eq!(reply.arcount(), 2);

        let ns = reply
            .select(&Filter::default().section(Section::Authority), Sort::Packet)
            .unwrap();
        assert!(ns.iter().all(|r| matches!(&r.rdata, RData::NS(h) if name::eq(h, HINTS_OWNER))));
        assert!(name::eq(&ns[0].name, "com."));

        let glue = reply
            .select(
                &Filter::default().section(Section::Additional).name(HINTS_OWNER),
                Sort::Packet,
            )
            .unwrap();
        assert_eq!(glue.len(), 2);
    }

    #[test]
    fn test_query_without_zone_is_none() {
        let hints = HintsTable::new();
        assert!(hints
            .query("www.example.com.", RecordType::A, RecordClass::IN, 1)
            .unwrap()
            .is_none());
    }
}
