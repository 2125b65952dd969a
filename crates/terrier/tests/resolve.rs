//! End-to-end resolution against scripted loopback nameservers.
//!
//! Recursive tests place each mock server on its own 127.0.0.x address
//! sharing one port, so addresses learned from glue stay reachable; the
//! shared port is injected through `Options::port`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use terrier::clock::ManualClock;
use terrier::packet::{Filter, Packet, Section, Sort};
use terrier::resolver::Resolver;
use terrier::{
    DnsRecord, HintsTable, HostsTable, Lookup, RData, RecordClass, RecordType, ResolvConf, Step,
};

/// Start answering on `sock` with `handler` until the read times out.
/// The reply gets the request's id stamped on regardless of what the
/// handler produced.
fn serve(
    sock: UdpSocket,
    counter: Arc<AtomicUsize>,
    handler: impl Fn(&Packet) -> Option<Packet> + Send + 'static,
) -> JoinHandle<()> {
    thread::spawn(move || {
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 4096];
        while let Ok((n, src)) = sock.recv_from(&mut buf) {
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(request) = Packet::from_bytes(&buf[..n]) else {
                continue;
            };
            let Some(reply) = handler(&request) else {
                continue;
            };
            let mut bytes = reply.as_bytes().to_vec();
            bytes[..2].copy_from_slice(&buf[..2]);
            let _ = sock.send_to(&bytes, src);
        }
    })
}

/// A reply skeleton echoing the request's question.
fn reply_to(request: &Packet) -> Packet {
    let q = request.question().unwrap();
    let mut p = Packet::new(4096);
    p.set_qr(true);
    p.push_question(&q.name, q.qtype, q.qclass).unwrap();
    p
}

fn eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Drive to completion with real sleeps, tracking the deepest frame stack
/// seen along the way.
fn drive(resolver: &mut Resolver) -> (Packet, usize) {
    let mut max_depth = 0;
    for _ in 0..10_000 {
        max_depth = max_depth.max(resolver.depth());
        match resolver.check().expect("resolution failed") {
            Step::Ready => return (resolver.fetch().unwrap(), max_depth),
            Step::Pending => thread::sleep(Duration::from_millis(1)),
        }
    }
    panic!("resolution never completed");
}

fn stub_conf(server: SocketAddr) -> ResolvConf {
    let mut conf = ResolvConf::default();
    conf.nameservers = vec![server];
    conf.lookup = vec![Lookup::Bind];
    conf.options.recurse = false;
    conf.options.port = server.port();
    conf
}

fn resolver_for(conf: ResolvConf, hints: HintsTable) -> Resolver {
    let conf = Arc::new(conf);
    Resolver::with_parts(
        conf,
        Arc::new(HostsTable::new()),
        Arc::new(hints),
        Arc::new(ManualClock::new()),
        SmallRng::seed_from_u64(11),
    )
}

#[test]
fn test_stub_resolution_issues_one_query() {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server = sock.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let handle = serve(sock, hits.clone(), |req| {
        let mut p = reply_to(req);
        p.push(&DnsRecord::a("www.google.com", Ipv4Addr::new(142, 250, 1, 1), 300))
            .unwrap();
        Some(p)
    });

    let conf = stub_conf(server);
    let hints = HintsTable::local(&conf);
    let mut resolver = resolver_for(conf, hints);
    resolver
        .submit("www.google.com.", RecordType::A, RecordClass::IN)
        .unwrap();
    let (answer, _) = drive(&mut resolver);
    drop(handle);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(answer.ancount(), 1);
    assert_eq!(answer.rcode(), 0);
    let recs = answer
        .select(&Filter::default().section(Section::Answer), Sort::Packet)
        .unwrap();
    assert!(matches!(recs[0].rdata, RData::A(ip) if ip == Ipv4Addr::new(142, 250, 1, 1)));
}

#[test]
fn test_dead_server_rotates_to_next() {
    // two nameservers sharing a port on distinct loopback addresses; the
    // first never answers (stub glue keeps only the address, so the shared
    // port goes through Options::port)
    let dead = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = dead.local_addr().unwrap().port();
    let live_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), port);
    let live = UdpSocket::bind(live_addr).expect("cannot bind secondary loopback address");
    let live_hits = Arc::new(AtomicUsize::new(0));
    let _live = serve(live, live_hits.clone(), |req| {
        let mut p = reply_to(req);
        p.push(&DnsRecord::a("slow.test", Ipv4Addr::new(192, 0, 2, 31), 60))
            .unwrap();
        Some(p)
    });

    let mut conf = ResolvConf::default();
    conf.nameservers = vec![dead.local_addr().unwrap(), live_addr];
    conf.lookup = vec![Lookup::Bind];
    conf.options.recurse = false;
    conf.options.timeout_secs = 3;
    conf.options.port = port;

    let hints = HintsTable::local(&conf);
    let clock = Arc::new(ManualClock::new());
    let mut resolver = Resolver::with_parts(
        Arc::new(conf),
        Arc::new(HostsTable::new()),
        Arc::new(hints),
        clock.clone(),
        SmallRng::seed_from_u64(5),
    );
    resolver
        .submit("slow.test.", RecordType::A, RecordClass::IN)
        .unwrap();

    // first pending is the dead server; advance past the timeout once
    let mut advanced = false;
    let answer = loop {
        match resolver.check().expect("resolution failed") {
            Step::Ready => break resolver.fetch().unwrap(),
            Step::Pending => {
                if !advanced {
                    clock.advance(Duration::from_secs(4));
                    advanced = true;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    };

    assert_eq!(answer.ancount(), 1);
    assert_eq!(live_hits.load(Ordering::SeqCst), 1);
}

/// Bind `n` sockets on consecutive 127.0.0.10x addresses sharing one port.
fn bind_shared_port(n: usize) -> Vec<UdpSocket> {
    'outer: for _ in 0..16 {
        let first = UdpSocket::bind("127.0.0.101:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let mut socks = vec![first];
        for i in 1..n {
            let addr = format!("127.0.0.{}:{}", 101 + i, port);
            match UdpSocket::bind(&addr) {
                Ok(s) => socks.push(s),
                Err(_) => continue 'outer,
            }
        }
        return socks;
    }
    panic!("could not bind {} loopback sockets on a shared port", n);
}

#[test]
fn test_recursive_iteration_with_glueless_delegation_and_cname() {
    let socks = bind_shared_port(3);
    let port = socks[0].local_addr().unwrap().port();
    let tld_ip = Ipv4Addr::new(127, 0, 0, 102);
    let auth_ip = Ipv4Addr::new(127, 0, 0, 103);
    let mut socks = socks.into_iter();

    // root: delegates everything under com. to a glueless nameserver, but
    // answers that nameserver's address itself
    let root_hits = Arc::new(AtomicUsize::new(0));
    let _root = serve(socks.next().unwrap(), root_hits.clone(), move |req| {
        let q = req.question().unwrap();
        let mut p = reply_to(req);
        if eq(&q.name, "ns.tld.test.") && q.qtype == RecordType::A {
            p.set_aa(true);
            p.push(&DnsRecord::a(&q.name, tld_ip, 300)).unwrap();
        } else {
            p.push(&DnsRecord::ns("com.", "ns.tld.test.", 300).in_section(Section::Authority))
                .unwrap();
        }
        Some(p)
    });

    // tld: delegates example.com. with glue
    let tld_hits = Arc::new(AtomicUsize::new(0));
    let _tld = serve(socks.next().unwrap(), tld_hits.clone(), move |req| {
        let mut p = reply_to(req);
        p.push(&DnsRecord::ns("example.com.", "ns.example.com.", 300).in_section(Section::Authority))
            .unwrap();
        p.push(&DnsRecord::a("ns.example.com.", auth_ip, 300).in_section(Section::Additional))
            .unwrap();
        Some(p)
    });

    // authoritative: CNAME for www, terminal A for the target
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let _auth = serve(socks.next().unwrap(), auth_hits.clone(), move |req| {
        let q = req.question().unwrap();
        let mut p = reply_to(req);
        p.set_aa(true);
        if eq(&q.name, "www.example.com.") {
            p.push(&DnsRecord::cname("www.example.com.", "web.example.com.", 300))
                .unwrap();
        } else if eq(&q.name, "web.example.com.") {
            p.push(&DnsRecord::a("web.example.com.", Ipv4Addr::new(192, 0, 2, 55), 300))
                .unwrap();
        }
        Some(p)
    });

    let mut conf = ResolvConf::default();
    conf.lookup = vec![Lookup::Bind];
    conf.options.recurse = true;
    conf.options.port = port;
    conf.options.attempts = 1;

    let mut hints = HintsTable::new();
    hints.insert(".", SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 101)), port), 0);

    let mut resolver = resolver_for(conf, hints);
    resolver
        .submit("www.example.com.", RecordType::A, RecordClass::IN)
        .unwrap();
    let (answer, max_depth) = drive(&mut resolver);

    assert!(max_depth <= 3, "frame depth reached {}", max_depth);
    assert_eq!(answer.rcode(), 0);

    let an = answer
        .select(&Filter::default().section(Section::Answer), Sort::Packet)
        .unwrap();
    assert!(
        an.iter()
            .any(|r| matches!(&r.rdata, RData::CNAME(t) if eq(t, "web.example.com."))),
        "answer should retain the CNAME"
    );
    assert!(
        an.iter().any(
            |r| eq(&r.name, "web.example.com.")
                && matches!(r.rdata, RData::A(ip) if ip == Ipv4Addr::new(192, 0, 2, 55))
        ),
        "answer should contain the terminal A"
    );
    // dedup'd: each RR at most once
    for (i, a) in an.iter().enumerate() {
        assert!(!an[i + 1..].iter().any(|b| a.same_rr(b)), "duplicate RR in answer");
    }

    assert!(root_hits.load(Ordering::SeqCst) >= 3);
    assert!(tld_hits.load(Ordering::SeqCst) >= 2);
    assert!(auth_hits.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_smart_mode_attaches_mx_target_addresses() {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server = sock.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let _server = serve(sock, hits.clone(), |req| {
        let q = req.question().unwrap();
        let mut p = reply_to(req);
        match q.qtype {
            RecordType::MX => {
                p.push(&DnsRecord::mx(&q.name, 10, "mail.smart.test.", 300)).unwrap();
            }
            RecordType::A if eq(&q.name, "mail.smart.test.") => {
                p.push(&DnsRecord::a(&q.name, Ipv4Addr::new(192, 0, 2, 66), 300)).unwrap();
            }
            _ => {}
        }
        Some(p)
    });

    let mut conf = stub_conf(server);
    conf.options.smart = true;
    let hints = HintsTable::local(&conf);
    let mut resolver = resolver_for(conf, hints);
    resolver
        .submit("smart.test.", RecordType::MX, RecordClass::IN)
        .unwrap();
    let (answer, _) = drive(&mut resolver);

    assert_eq!(answer.ancount(), 1);
    let additional = answer
        .select(
            &Filter::default().section(Section::Additional).rtype(RecordType::A),
            Sort::Packet,
        )
        .unwrap();
    assert!(
        additional.iter().any(|r| eq(&r.name, "mail.smart.test.")
            && matches!(r.rdata, RData::A(ip) if ip == Ipv4Addr::new(192, 0, 2, 66))),
        "smart mode should lift the MX target's address into ADDITIONAL"
    );
}

#[test]
fn test_smart_mode_mx_fallback_to_address_lookup() {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server = sock.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let _server = serve(sock, hits.clone(), |req| {
        let q = req.question().unwrap();
        let mut p = reply_to(req);
        p.set_aa(true);
        if q.qtype == RecordType::A {
            p.push(&DnsRecord::a(&q.name, Ipv4Addr::new(192, 0, 2, 77), 300)).unwrap();
        }
        // MX questions get an empty authoritative answer
        Some(p)
    });

    let mut conf = stub_conf(server);
    conf.options.smart = true;
    let hints = HintsTable::local(&conf);
    let mut resolver = resolver_for(conf, hints);
    resolver
        .submit("bare.test.", RecordType::MX, RecordClass::IN)
        .unwrap();
    let (answer, _) = drive(&mut resolver);

    assert_eq!(answer.ancount(), 0);
    let additional = answer
        .select(&Filter::default().section(Section::Additional), Sort::Packet)
        .unwrap();
    assert!(
        additional.iter().any(|r| eq(&r.name, "bare.test.")
            && matches!(r.rdata, RData::A(ip) if ip == Ipv4Addr::new(192, 0, 2, 77))),
        "empty MX answer should fall back to an address lookup of the name"
    );
}
