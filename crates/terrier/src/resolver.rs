//! The resolution engine: a fixed-depth stack of restartable frames driven
//! by a single re-entrant `check`.
//!
//! Frame zero carries the caller's question through the configured lookup
//! order (hosts file, nameservers). Child frames resolve nameserver
//! addresses that arrived without glue, follow CNAME chains, and run
//! smart-mode target lookups. A child that completes hands its answer back
//! to the state its parent parked itself in before the push.
//!
//! Every path that would block bubbles [`Step::Pending`] to the caller,
//! which waits on the fd from `pollin`/`pollout` and calls `check` again.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::clock::{Monotonic, SharedClock};
use crate::error::{Error, Result, Step};
use crate::hints::HintsTable;
use crate::hosts::HostsTable;
use crate::name;
use crate::packet::{build_query, Packet, Section};
use crate::query::{QuerySocket, Transport};
use crate::records::{DnsRecord, RData, RecordClass, RecordType};
use crate::resconf::{Lookup, ResolvConf};

/// Hard recursion depth. A push past this is treated as a leaf.
pub const MAX_FRAMES: usize = 8;

/// Delegation chains longer than this are abandoned as loops.
const MAX_DELEGATIONS: u32 = 10;

const RCODE_SERVFAIL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Init,
    Glue,
    Switch,
    File,
    Bind,
    Search,
    Hints,
    Iterate,
    EachNs,
    EachAddr,
    Query,
    NsReturn,
    CnameReturn,
    SmartReturn,
    Finish,
    ServFail,
    Done,
}

struct Frame {
    state: FrameState,
    qname: String,
    qtype: RecordType,
    qclass: RecordClass,
    lookup_i: usize,
    search_state: usize,
    attempts: u32,
    delegations: u32,
    query: Option<Packet>,
    answer: Option<Packet>,
    hints: Option<Packet>,
    /// Packet end when the current hints were installed; glue at or past
    /// this offset was attached during iteration.
    hints_end: usize,
    /// Shuffle seed for the current iteration, stable for its lifetime.
    seed: u32,
    ns_order: Vec<String>,
    hints_i: usize,
    glue: Vec<Ipv4Addr>,
    hints_j: usize,
    ns_tried: FxHashSet<String>,
    smart_done: FxHashSet<String>,
    mx_fallback_done: bool,
}

impl Frame {
    fn new(qname: String, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            state: FrameState::Init,
            qname,
            qtype,
            qclass,
            lookup_i: 0,
            search_state: 0,
            attempts: 0,
            delegations: 0,
            query: None,
            answer: None,
            hints: None,
            hints_end: 0,
            seed: 1,
            ns_order: Vec::new(),
            hints_i: 0,
            glue: Vec::new(),
            hints_j: 0,
            ns_tried: FxHashSet::default(),
            smart_done: FxHashSet::default(),
            mx_fallback_done: false,
        }
    }
}

pub struct Resolver {
    conf: Arc<ResolvConf>,
    hosts: Arc<HostsTable>,
    hints: Arc<HintsTable>,
    socket: QuerySocket,
    clock: SharedClock,
    rng: SmallRng,
    qname: String,
    qtype: RecordType,
    qclass: RecordClass,
    began: Instant,
    frames: Vec<Frame>,
    child_answer: Option<Packet>,
}

impl Resolver {
    pub fn new(conf: Arc<ResolvConf>, hosts: Arc<HostsTable>, hints: Arc<HintsTable>) -> Self {
        Self::with_parts(conf, hosts, hints, Arc::new(Monotonic), SmallRng::from_os_rng())
    }

    /// Construction with an explicit clock and RNG, for deterministic
    /// embedding and tests.
    pub fn with_parts(
        conf: Arc<ResolvConf>,
        hosts: Arc<HostsTable>,
        hints: Arc<HintsTable>,
        clock: SharedClock,
        mut rng: SmallRng,
    ) -> Self {
        let socket = QuerySocket::new(conf.local_addr, Transport::Any, clock.clone(), &mut rng);
        let began = clock.now();
        Self {
            conf,
            hosts,
            hints,
            socket,
            clock,
            rng,
            qname: String::new(),
            qtype: RecordType::A,
            qclass: RecordClass::IN,
            began,
            frames: Vec::with_capacity(MAX_FRAMES),
            child_answer: None,
        }
    }

    /// Abandon any in-flight resolution and return to a submit-ready state.
    /// Configuration handles and the id permutor are retained.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.child_answer = None;
        self.socket.reset();
    }

    /// Arm the engine with a question.
    pub fn submit(&mut self, qname: &str, qtype: RecordType, qclass: RecordClass) -> Result<()> {
        self.reset();
        self.qname = qname.to_string();
        self.qtype = qtype;
        self.qclass = qclass;
        self.began = self.clock.now();
        self.frames
            .push(Frame::new(self.qname.clone(), qtype, qclass));
        Ok(())
    }

    /// Current frame stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Monotonic time since submit.
    pub fn elapsed(&self) -> Duration {
        self.clock
            .now()
            .checked_duration_since(self.began)
            .unwrap_or_default()
    }

    /// Fd to wait readable on while suspended, if any.
    pub fn pollin(&self) -> Option<RawFd> {
        match self.frames.last() {
            Some(f) if f.state == FrameState::Query => self.socket.pollin(),
            _ => None,
        }
    }

    /// Fd to wait writable on while suspended, if any.
    pub fn pollout(&self) -> Option<RawFd> {
        match self.frames.last() {
            Some(f) if f.state == FrameState::Query => self.socket.pollout(),
            _ => None,
        }
    }

    /// The completed answer. `check` must have returned [`Step::Ready`].
    pub fn fetch(&self) -> Result<Packet> {
        match self.frames.first() {
            Some(f) if f.state == FrameState::Done => {
                f.answer.clone().ok_or(Error::Unknown("no answer produced"))
            }
            _ => Err(Error::Unknown("answer not ready")),
        }
    }

    fn nonzero_seed(&mut self) -> u32 {
        loop {
            let s: u32 = self.rng.random();
            if s != 0 {
                return s;
            }
        }
    }

    fn push_child(&mut self, qname: String, qtype: RecordType, qclass: RecordClass) -> bool {
        if self.frames.len() >= MAX_FRAMES {
            return false;
        }
        self.frames.push(Frame::new(qname, qtype, qclass));
        true
    }

    /// Where a failed bind-leg candidate goes: the root frame tries the
    /// next search candidate, children have no search list to fall back on.
    fn bind_failed(&self, sp: usize) -> FrameState {
        if sp == 0 {
            FrameState::Search
        } else {
            FrameState::Switch
        }
    }

    /// Drive the engine as far as it will go without blocking.
    pub fn check(&mut self) -> Result<Step> {
        loop {
            let sp = self
                .frames
                .len()
                .checked_sub(1)
                .ok_or(Error::Unknown("no query submitted"))?;

            match self.frames[sp].state {
                FrameState::Init => {
                    self.frames[sp].state = if sp > 0 {
                        FrameState::Glue
                    } else {
                        FrameState::Switch
                    };
                }

                FrameState::Glue => self.step_glue(sp)?,
                FrameState::Switch => self.step_switch(sp),
                FrameState::File => self.step_file(sp)?,

                FrameState::Bind => {
                    if sp == 0 {
                        self.frames[sp].state = FrameState::Search;
                    } else {
                        let f = &self.frames[sp];
                        let query =
                            build_query(&f.qname, f.qtype, f.qclass, !self.conf.options.recurse)?;
                        self.frames[sp].query = Some(query);
                        self.frames[sp].state = FrameState::Hints;
                    }
                }

                FrameState::Search => {
                    match self
                        .conf
                        .search_next(&self.qname, &mut self.frames[sp].search_state)
                    {
                        Some(candidate) => {
                            let f = &self.frames[sp];
                            let query = build_query(
                                &candidate,
                                f.qtype,
                                f.qclass,
                                !self.conf.options.recurse,
                            )?;
                            let f = &mut self.frames[sp];
                            f.qname = candidate;
                            f.query = Some(query);
                            f.attempts = 0;
                            f.delegations = 0;
                            f.state = FrameState::Hints;
                        }
                        None => self.frames[sp].state = FrameState::Switch,
                    }
                }

                FrameState::Hints => {
                    let seed = self.nonzero_seed();
                    let f = &self.frames[sp];
                    match self.hints.query(&f.qname, f.qtype, f.qclass, seed)? {
                        Some(pkt) => {
                            let f = &mut self.frames[sp];
                            f.seed = seed;
                            f.hints_end = pkt.end();
                            f.hints = Some(pkt);
                            f.ns_tried.clear();
                            f.state = FrameState::Iterate;
                        }
                        None => self.frames[sp].state = self.bind_failed(sp),
                    }
                }

                FrameState::Iterate => self.step_iterate(sp)?,
                FrameState::EachNs => self.step_each_ns(sp)?,
                FrameState::EachAddr => self.step_each_addr(sp)?,
                FrameState::Query => {
                    if let Some(step) = self.step_query(sp)? {
                        return Ok(step);
                    }
                }
                FrameState::NsReturn => self.step_ns_return(sp)?,
                FrameState::CnameReturn => self.step_cname_return(sp)?,
                FrameState::SmartReturn => self.step_smart_return(sp)?,
                FrameState::Finish => self.step_finish(sp)?,

                FrameState::ServFail => {
                    let f = &self.frames[sp];
                    let qname = if sp == 0 { self.qname.clone() } else { f.qname.clone() };
                    let mut pkt = Packet::new(512);
                    pkt.set_qr(true);
                    pkt.set_rd(!self.conf.options.recurse);
                    pkt.set_rcode(RCODE_SERVFAIL);
                    pkt.push_question(&qname, f.qtype, f.qclass)?;
                    let f = &mut self.frames[sp];
                    f.answer = Some(pkt);
                    f.state = FrameState::Done;
                }

                FrameState::Done => {
                    if sp == 0 {
                        return Ok(Step::Ready);
                    }
                    let child = self.frames.pop().ok_or(Error::Unknown("frame stack empty"))?;
                    self.child_answer = child.answer;
                    // the parent parked itself in the state that consumes
                    // this answer before pushing the child
                }
            }
        }
    }

    /// Child frames first look for an answer already sitting in the stack:
    /// any record attached to any active frame that matches the child's
    /// question, following CNAMEs along the way.
    fn step_glue(&mut self, sp: usize) -> Result<()> {
        let qtype = self.frames[sp].qtype;
        let qclass = self.frames[sp].qclass;
        let mut current = self.frames[sp].qname.clone();
        let mut chain: Vec<DnsRecord> = Vec::new();
        let mut direct: Vec<DnsRecord> = Vec::new();

        'follow: for _ in 0..MAX_FRAMES {
            let mut cname: Option<(String, DnsRecord)> = None;
            for frame in &self.frames {
                for pkt in [frame.hints.as_ref(), frame.answer.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    let Ok(recs) = pkt.scan() else { continue };
                    for r in recs {
                        if r.section == Section::Question || !name::eq(&r.name, &current) {
                            continue;
                        }
                        if r.rtype == qtype {
                            direct.push(r);
                        } else if cname.is_none() {
                            if let RData::CNAME(target) = &r.rdata {
                                cname = Some((target.clone(), r.clone()));
                            }
                        }
                    }
                }
            }
            if !direct.is_empty() {
                break 'follow;
            }
            match cname {
                Some((target, rec)) => {
                    chain.push(rec);
                    current = target;
                }
                None => break 'follow,
            }
        }

        if direct.is_empty() {
            self.frames[sp].state = FrameState::Switch;
            return Ok(());
        }

        let f = &self.frames[sp];
        let mut pkt = Packet::new(4096);
        pkt.set_qr(true);
        pkt.push_question(&f.qname, f.qtype, qclass)?;
        for rec in chain.into_iter().chain(direct) {
            let rec = rec.in_section(Section::Answer);
            if pkt.push(&rec).is_err() {
                break;
            }
        }
        let f = &mut self.frames[sp];
        f.answer = Some(pkt);
        f.state = FrameState::Done;
        Ok(())
    }

    /// Pick the next lookup source; exhaustion fails the query (root frame)
    /// or returns the child with whatever it accumulated.
    fn step_switch(&mut self, sp: usize) {
        let f = &mut self.frames[sp];
        match self.conf.lookup.get(f.lookup_i) {
            Some(Lookup::File) => {
                f.lookup_i += 1;
                f.search_state = 0;
                f.state = FrameState::File;
            }
            Some(Lookup::Bind) => {
                f.lookup_i += 1;
                f.search_state = 0;
                f.attempts = 0;
                f.state = FrameState::Bind;
            }
            None => {
                f.state = if sp == 0 {
                    FrameState::ServFail
                } else {
                    FrameState::Done
                };
            }
        }
    }

    fn step_file(&mut self, sp: usize) -> Result<()> {
        if sp == 0 {
            loop {
                let mut state = self.frames[sp].search_state;
                let candidate = self.conf.search_next(&self.qname, &mut state);
                self.frames[sp].search_state = state;
                let Some(candidate) = candidate else {
                    self.frames[sp].state = FrameState::Switch;
                    return Ok(());
                };
                let f = &self.frames[sp];
                let reply = self.hosts.query(&candidate, f.qtype, f.qclass)?;
                if reply.ancount() > 0 {
                    let f = &mut self.frames[sp];
                    f.answer = Some(reply);
                    f.state = FrameState::Finish;
                    return Ok(());
                }
            }
        }

        let f = &self.frames[sp];
        let reply = self.hosts.query(&f.qname, f.qtype, f.qclass)?;
        let f = &mut self.frames[sp];
        if reply.ancount() > 0 {
            f.answer = Some(reply);
            f.state = FrameState::Done;
        } else {
            f.state = FrameState::Switch;
        }
        Ok(())
    }

    /// Order the AUTHORITY nameservers of the current hints: glued hosts
    /// first, originally-glued before glue attached mid-iteration, ties
    /// shuffled by the iteration seed.
    fn step_iterate(&mut self, sp: usize) -> Result<()> {
        let f = &self.frames[sp];
        let pkt = f.hints.as_ref().ok_or(Error::Unknown("iteration without hints"))?;
        let recs = pkt.scan()?;

        let mut candidates: Vec<(String, bool, bool, usize)> = Vec::new();
        for r in recs.iter().filter(|r| r.section == Section::Authority) {
            let RData::NS(host) = &r.rdata else { continue };
            if candidates.iter().any(|(h, ..)| name::eq(h, host)) {
                continue;
            }
            let glue_pos = recs
                .iter()
                .filter(|g| matches!(g.rdata, RData::A(_)) && name::eq(&g.name, host))
                .map(|g| g.pos)
                .min();
            let idx = candidates.len();
            candidates.push((
                host.clone(),
                glue_pos.is_some(),
                glue_pos.is_some_and(|p| p < f.hints_end),
                idx,
            ));
        }

        let seed = f.seed;
        candidates.sort_by_key(|(_, has_glue, original, idx)| {
            (
                !has_glue,
                !original,
                crate::permutor::shuffle16(*idx as u16, seed),
            )
        });

        let f = &mut self.frames[sp];
        f.ns_order = candidates.into_iter().map(|(h, ..)| h).collect();
        f.hints_i = 0;
        f.state = FrameState::EachNs;
        Ok(())
    }

    fn step_each_ns(&mut self, sp: usize) -> Result<()> {
        if self.frames[sp].hints_i >= self.frames[sp].ns_order.len() {
            let attempts = self.conf.options.attempts.max(1);
            let failed = self.bind_failed(sp);
            let f = &mut self.frames[sp];
            f.attempts += 1;
            f.state = if f.attempts >= attempts {
                failed
            } else {
                FrameState::Iterate
            };
            return Ok(());
        }

        let host = self.frames[sp].ns_order[self.frames[sp].hints_i].clone();
        let f = &self.frames[sp];
        let pkt = f.hints.as_ref().ok_or(Error::Unknown("iteration without hints"))?;
        let glue: Vec<Ipv4Addr> = pkt
            .scan()?
            .into_iter()
            .filter(|g| name::eq(&g.name, &host))
            .filter_map(|g| match g.rdata {
                RData::A(ip) => Some(ip),
                _ => None,
            })
            .collect();

        if glue.is_empty() {
            // resolve the nameserver's address in a child frame, once
            let tried = self.frames[sp].ns_tried.contains(&name::key(&host));
            if tried || self.frames.len() >= MAX_FRAMES {
                self.frames[sp].hints_i += 1;
                return Ok(());
            }
            self.frames[sp].ns_tried.insert(name::key(&host));
            self.frames[sp].state = FrameState::NsReturn;
            if !self.push_child(host, RecordType::A, RecordClass::IN) {
                self.frames[sp].state = FrameState::EachNs;
                self.frames[sp].hints_i += 1;
            }
            return Ok(());
        }

        let f = &mut self.frames[sp];
        f.glue = glue;
        f.hints_j = 0;
        f.state = FrameState::EachAddr;
        Ok(())
    }

    fn step_each_addr(&mut self, sp: usize) -> Result<()> {
        if self.frames[sp].hints_j >= self.frames[sp].glue.len() {
            let f = &mut self.frames[sp];
            f.hints_i += 1;
            f.state = FrameState::EachNs;
            return Ok(());
        }

        let ip = self.frames[sp].glue[self.frames[sp].hints_j];
        self.frames[sp].hints_j += 1;
        let addr = SocketAddr::new(IpAddr::V4(ip), self.conf.options.port);
        let query = self.frames[sp]
            .query
            .clone()
            .ok_or(Error::Unknown("no query built for iteration"))?;
        debug!("querying {} for {}", addr, self.frames[sp].qname);
        self.socket.submit(&query, addr)?;
        self.frames[sp].state = FrameState::Query;
        Ok(())
    }

    /// Drive the transport; classify the verified answer. Timeouts and
    /// transport failures rotate to the next candidate address.
    fn step_query(&mut self, sp: usize) -> Result<Option<Step>> {
        match self.socket.check() {
            Ok(Step::Pending) => {
                let timeout = Duration::from_secs(self.conf.options.timeout_secs);
                if self.socket.elapsed() > timeout {
                    debug!("server timed out after {:?}, rotating", timeout);
                    self.socket.reset();
                    self.frames[sp].state = FrameState::EachAddr;
                    return Ok(None);
                }
                return Ok(Some(Step::Pending));
            }
            Ok(Step::Ready) => {}
            Err(e) => {
                debug!("query failed ({}), rotating", e);
                self.socket.reset();
                self.frames[sp].state = FrameState::EachAddr;
                return Ok(None);
            }
        }

        let pkt = self.socket.fetch()?;

        // A stub takes the nameserver's word for it.
        if !self.conf.options.recurse {
            let f = &mut self.frames[sp];
            f.answer = Some(pkt);
            f.state = FrameState::Finish;
            return Ok(None);
        }

        let recs = match pkt.scan() {
            Ok(recs) => recs,
            Err(e) => {
                debug!("unparseable answer ({}), rotating", e);
                self.frames[sp].state = FrameState::EachAddr;
                return Ok(None);
            }
        };

        let qname = self.frames[sp].qname.clone();
        let qtype = self.frames[sp].qtype;

        let answered = recs.iter().any(|r| {
            r.section == Section::Answer
                && name::eq(&r.name, &qname)
                && (r.rtype == qtype || qtype == RecordType::ANY)
        });
        if answered {
            let f = &mut self.frames[sp];
            f.answer = Some(pkt);
            f.state = FrameState::Finish;
            return Ok(None);
        }

        let cname = recs.iter().find_map(|r| {
            if r.section == Section::Answer && name::eq(&r.name, &qname) {
                if let RData::CNAME(target) = &r.rdata {
                    return Some(target.clone());
                }
            }
            None
        });
        if let Some(target) = cname {
            let qclass = self.frames[sp].qclass;
            self.frames[sp].answer = Some(pkt);
            self.frames[sp].state = FrameState::CnameReturn;
            if !self.push_child(target, qtype, qclass) {
                // depth exhausted: the chain so far is the answer
                self.frames[sp].state = FrameState::Finish;
            }
            return Ok(None);
        }

        let delegated = recs
            .iter()
            .any(|r| r.section == Section::Authority && r.rtype == RecordType::NS);
        if delegated {
            let failed = self.bind_failed(sp);
            let f = &mut self.frames[sp];
            f.delegations += 1;
            if f.delegations > MAX_DELEGATIONS {
                debug!("delegation chain too long, giving up on this lookup");
                f.state = failed;
                return Ok(None);
            }
            f.hints_end = pkt.end();
            f.hints = Some(pkt);
            f.ns_tried.clear();
            f.state = FrameState::Iterate;
            let seed = self.nonzero_seed();
            self.frames[sp].seed = seed;
            return Ok(None);
        }

        if pkt.aa() {
            // authoritative denial is an answer
            let f = &mut self.frames[sp];
            f.answer = Some(pkt);
            f.state = FrameState::Finish;
            return Ok(None);
        }

        self.frames[sp].state = FrameState::EachAddr;
        Ok(None)
    }

    /// A child came back with (hopefully) addresses for a glueless
    /// nameserver: attach them as ADDITIONAL glue and re-sort.
    fn step_ns_return(&mut self, sp: usize) -> Result<()> {
        let child = self.child_answer.take();
        let host = self.frames[sp]
            .ns_order
            .get(self.frames[sp].hints_i)
            .cloned()
            .ok_or(Error::Unknown("nameserver cursor out of range"))?;

        let mut attached = false;
        if let Some(ans) = child {
            if let Ok(recs) = ans.scan() {
                let hints = self.frames[sp]
                    .hints
                    .as_mut()
                    .ok_or(Error::Unknown("iteration without hints"))?;
                for r in recs.iter().filter(|r| r.section == Section::Answer) {
                    let RData::A(ip) = &r.rdata else { continue };
                    let rec = DnsRecord::a(&host, *ip, r.ttl).in_section(Section::Additional);
                    match hints.push_grow(&rec) {
                        Ok(()) => attached = true,
                        Err(Error::NoBufs) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let f = &mut self.frames[sp];
        if attached {
            f.state = FrameState::Iterate;
        } else {
            f.hints_i += 1;
            f.state = FrameState::EachNs;
        }
        Ok(())
    }

    /// Fold a followed CNAME chain's answer into ours.
    fn step_cname_return(&mut self, sp: usize) -> Result<()> {
        let child = self.child_answer.take();
        if let Some(ans) = child {
            match self.frames[sp].answer.as_mut() {
                Some(answer) => {
                    if let Err(e) = answer.merge(&ans) {
                        debug!("keeping partial answer, merge failed: {}", e);
                    }
                }
                None => self.frames[sp].answer = Some(ans),
            }
        }
        self.frames[sp].state = FrameState::Finish;
        Ok(())
    }

    /// Lift a smart lookup's addresses into our ADDITIONAL section.
    fn step_smart_return(&mut self, sp: usize) -> Result<()> {
        let child = self.child_answer.take();
        if let Some(ans) = child {
            if let (Some(answer), Ok(recs)) = (self.frames[sp].answer.as_mut(), ans.scan()) {
                let have = answer.scan().unwrap_or_default();
                for r in recs.into_iter().filter(|r| r.section == Section::Answer) {
                    if !matches!(r.rdata, RData::A(_)) {
                        continue;
                    }
                    if have.iter().any(|h| h.same_rr(&r)) {
                        continue;
                    }
                    let rec = r.in_section(Section::Additional);
                    if let Err(e) = answer.push_grow(&rec) {
                        debug!("dropping smart glue: {}", e);
                        break;
                    }
                }
            }
        }
        self.frames[sp].state = FrameState::Finish;
        Ok(())
    }

    /// Smart mode: resolve the hosts named by NS/MX/SRV answers that have
    /// no address record alongside, one child frame at a time. An MX query
    /// that produced no MX records falls back to a single address lookup of
    /// the original name.
    fn step_finish(&mut self, sp: usize) -> Result<()> {
        if sp != 0 || !self.conf.options.smart {
            self.frames[sp].state = FrameState::Done;
            return Ok(());
        }

        let Some(answer) = self.frames[sp].answer.as_ref() else {
            self.frames[sp].state = FrameState::Done;
            return Ok(());
        };
        let recs = answer.scan().unwrap_or_default();

        let mut target: Option<String> = None;
        for r in recs.iter().filter(|r| r.section == Section::Answer) {
            let host = match &r.rdata {
                RData::NS(h) => h,
                RData::MX { exchange, .. } => exchange,
                RData::SRV { target, .. } => target,
                _ => continue,
            };
            if self.frames[sp].smart_done.contains(&name::key(host)) {
                continue;
            }
            let has_addr = recs
                .iter()
                .any(|g| matches!(g.rdata, RData::A(_)) && name::eq(&g.name, host));
            if has_addr {
                continue;
            }
            target = Some(host.clone());
            break;
        }

        if target.is_none() && self.qtype == RecordType::MX && !self.frames[sp].mx_fallback_done {
            let any_mx = recs
                .iter()
                .any(|r| r.section == Section::Answer && r.rtype == RecordType::MX);
            if !any_mx {
                self.frames[sp].mx_fallback_done = true;
                target = Some(self.qname.clone());
            }
        }

        match target {
            Some(host) => {
                let qclass = self.frames[sp].qclass;
                self.frames[sp].smart_done.insert(name::key(&host));
                self.frames[sp].state = FrameState::SmartReturn;
                if !self.push_child(host, RecordType::A, qclass) {
                    self.frames[sp].state = FrameState::Done;
                }
            }
            None => self.frames[sp].state = FrameState::Done,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::packet::{Filter, Sort};
    use std::net::Ipv4Addr;

    fn parts(conf: ResolvConf, hosts: HostsTable) -> Resolver {
        let conf = Arc::new(conf);
        let hints = Arc::new(HintsTable::local(&conf));
        Resolver::with_parts(
            conf,
            Arc::new(hosts),
            hints,
            Arc::new(ManualClock::new()),
            SmallRng::seed_from_u64(1),
        )
    }

    fn drain(resolver: &mut Resolver) -> Packet {
        match resolver.check().expect("resolution error") {
            Step::Ready => resolver.fetch().unwrap(),
            Step::Pending => panic!("file-only resolution should not suspend"),
        }
    }

    #[test]
    fn test_hosts_answer_through_engine() {
        let mut conf = ResolvConf::default();
        conf.lookup = vec![Lookup::File];
        let mut hosts = HostsTable::new();
        hosts.load_str("127.0.0.1 localhost\n");

        let mut resolver = parts(conf, hosts);
        resolver
            .submit("localhost.", RecordType::A, RecordClass::IN)
            .unwrap();
        let answer = drain(&mut resolver);

        assert_eq!(answer.ancount(), 1);
        let recs = answer
            .select(&Filter::default().section(Section::Answer), Sort::Packet)
            .unwrap();
        assert_eq!(recs[0].ttl, 0);
        assert!(matches!(recs[0].rdata, RData::A(ip) if ip == Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn test_hosts_ptr_through_engine() {
        let mut conf = ResolvConf::default();
        conf.lookup = vec![Lookup::File];
        let mut hosts = HostsTable::new();
        hosts.load_str("127.0.0.1 localhost\n");

        let mut resolver = parts(conf, hosts);
        resolver
            .submit("1.0.0.127.in-addr.arpa.", RecordType::PTR, RecordClass::IN)
            .unwrap();
        let answer = drain(&mut resolver);
        assert_eq!(answer.ancount(), 1);
        let recs = answer.scan().unwrap();
        assert!(matches!(&recs[0].rdata, RData::PTR(h) if name::eq(h, "localhost.")));
    }

    #[test]
    fn test_search_list_tried_for_file_lookups() {
        let mut conf = ResolvConf::default();
        conf.lookup = vec![Lookup::File];
        conf.search = vec!["example.com".to_string()];
        let mut hosts = HostsTable::new();
        hosts.load_str("10.0.0.5 www.example.com\n");

        let mut resolver = parts(conf, hosts);
        resolver.submit("www", RecordType::A, RecordClass::IN).unwrap();
        let answer = drain(&mut resolver);
        assert_eq!(answer.ancount(), 1);
        assert!(name::eq(&answer.question().unwrap().name, "www.example.com."));
    }

    #[test]
    fn test_exhausted_lookups_yield_servfail() {
        let mut conf = ResolvConf::default();
        conf.lookup = vec![Lookup::File];
        let mut resolver = parts(conf, HostsTable::new());
        resolver
            .submit("nowhere.invalid.", RecordType::A, RecordClass::IN)
            .unwrap();
        let answer = drain(&mut resolver);
        assert_eq!(answer.rcode(), RCODE_SERVFAIL);
        assert!(answer.qr());
        assert!(name::eq(&answer.question().unwrap().name, "nowhere.invalid."));
    }

    #[test]
    fn test_bind_without_nameservers_falls_through() {
        // default lookup is bind,file; with no nameservers configured the
        // bind leg finds no hints zone and the file leg answers
        let mut hosts = HostsTable::new();
        hosts.load_str("127.0.0.1 localhost\n");
        let mut resolver = parts(ResolvConf::default(), hosts);
        resolver
            .submit("localhost.", RecordType::A, RecordClass::IN)
            .unwrap();
        let answer = drain(&mut resolver);
        assert_eq!(answer.ancount(), 1);
    }

    #[test]
    fn test_fetch_before_submit_errors() {
        let resolver = parts(ResolvConf::default(), HostsTable::new());
        assert!(resolver.fetch().is_err());
        assert!(resolver.pollin().is_none());
        assert!(resolver.pollout().is_none());
    }

    #[test]
    fn test_reset_returns_to_submit_ready() {
        let mut conf = ResolvConf::default();
        conf.lookup = vec![Lookup::File];
        let mut hosts = HostsTable::new();
        hosts.load_str("127.0.0.1 localhost\n");
        let mut resolver = parts(conf, hosts);

        resolver.submit("localhost.", RecordType::A, RecordClass::IN).unwrap();
        let _ = drain(&mut resolver);
        resolver.reset();
        assert!(resolver.check().is_err());

        resolver.submit("localhost.", RecordType::PTR, RecordClass::IN).unwrap();
        // PTR of a forward name finds nothing, falls through to servfail
        let answer = drain(&mut resolver);
        assert_eq!(answer.rcode(), RCODE_SERVFAIL);
    }
}
