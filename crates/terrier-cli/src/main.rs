use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use terrier::logging::QueryLogger;
use terrier::packet::{Filter, Packet, Section, Sort};
use terrier::{drive, HintsTable, HostsTable, Lookup, RecordClass, RecordType, ResolvConf, Resolver};

struct Args {
    qname: String,
    qtype: RecordType,
    recurse: bool,
    smart: bool,
    servers: Vec<SocketAddr>,
    resconf_path: PathBuf,
    hosts_path: PathBuf,
    log_path: Option<String>,
    timeout_secs: u64,
}

const USAGE: &str = "usage: terrier [options] NAME [TYPE]
  -R          iterate from the root hints instead of asking a recursive server
  -S          smart mode: resolve NS/MX/SRV targets into ADDITIONAL
  -s ADDR     nameserver to ask (repeatable; overrides resolv.conf)
  -c PATH     resolv.conf to load (default /etc/resolv.conf)
  -H PATH     hosts file to load (default /etc/hosts)
  -l PATH     append a JSONL query log at PATH
  -t SECS     overall timeout (default 30)
  -h          this help";

fn parse_args() -> Result<Args> {
    let mut args = Args {
        qname: String::new(),
        qtype: RecordType::A,
        recurse: false,
        smart: false,
        servers: Vec::new(),
        resconf_path: PathBuf::from("/etc/resolv.conf"),
        hosts_path: PathBuf::from("/etc/hosts"),
        log_path: None,
        timeout_secs: 30,
    };

    let mut positional = Vec::new();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-R" => args.recurse = true,
            "-S" => args.smart = true,
            "-s" => {
                let v = it.next().context("-s needs an address")?;
                args.servers.push(parse_server(&v)?);
            }
            "-c" => args.resconf_path = PathBuf::from(it.next().context("-c needs a path")?),
            "-H" => args.hosts_path = PathBuf::from(it.next().context("-H needs a path")?),
            "-l" => args.log_path = Some(it.next().context("-l needs a path")?),
            "-t" => {
                args.timeout_secs = it
                    .next()
                    .context("-t needs seconds")?
                    .parse()
                    .context("-t needs a number of seconds")?
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option {:?}\n{}", other, USAGE),
            other => positional.push(other.to_string()),
        }
    }

    match positional.len() {
        0 => bail!("missing NAME\n{}", USAGE),
        1 => args.qname = positional.remove(0),
        2 => {
            args.qname = positional.remove(0);
            args.qtype = positional[0]
                .parse()
                .with_context(|| format!("unrecognized record type {:?}", positional[0]))?;
        }
        _ => bail!("too many arguments\n{}", USAGE),
    }
    Ok(args)
}

fn parse_server(s: &str) -> Result<SocketAddr> {
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let ip: IpAddr = s.parse().with_context(|| format!("bad nameserver {:?}", s))?;
    Ok(SocketAddr::new(ip, 53))
}

fn print_section(answer: &Packet, section: Section, label: &str) {
    let Ok(recs) = answer.select(&Filter::default().section(section), Sort::Packet) else {
        return;
    };
    if recs.is_empty() {
        return;
    }
    println!(";; {} SECTION:", label);
    for rec in recs {
        println!("{}", rec);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;

    let mut conf = ResolvConf::default();
    if args.resconf_path.exists() {
        conf.load_path(&args.resconf_path)
            .with_context(|| format!("loading {}", args.resconf_path.display()))?;
    } else {
        debug!("no resolv.conf at {}", args.resconf_path.display());
    }
    if !args.servers.is_empty() {
        conf.nameservers = args.servers.clone();
    }
    conf.options.recurse = args.recurse;
    conf.options.smart = args.smart;
    if conf.lookup.is_empty() {
        conf.lookup = vec![Lookup::Bind, Lookup::File];
    }

    let mut hosts = HostsTable::new();
    if args.hosts_path.exists() {
        let n = hosts
            .load_path(&args.hosts_path)
            .with_context(|| format!("loading {}", args.hosts_path.display()))?;
        debug!("loaded {} hosts entries", n);
    }

    let hints = if args.recurse {
        HintsTable::root()
    } else {
        if conf.nameservers.is_empty() {
            bail!("no nameservers configured; use -s or resolv.conf, or -R to iterate");
        }
        HintsTable::local(&conf)
    };

    let logger = args.log_path.as_deref().map(QueryLogger::new);

    let mut resolver = Resolver::new(Arc::new(conf), Arc::new(hosts), Arc::new(hints));
    resolver.submit(&args.qname, args.qtype, RecordClass::IN)?;

    info!("resolving {} {}", args.qname, args.qtype);
    let started = std::time::Instant::now();
    let answer = tokio::time::timeout(
        Duration::from_secs(args.timeout_secs),
        drive::resolve(&mut resolver),
    )
    .await
    .map_err(|_| anyhow::anyhow!("resolution timed out after {}s", args.timeout_secs))??;
    let elapsed = started.elapsed();

    if let Some(logger) = &logger {
        logger.log(
            &args.qname,
            &args.qtype.to_string(),
            answer.rcode(),
            answer.ancount(),
            elapsed.as_millis() as u64,
        );
    }

    println!(
        ";; rcode {}  answers {}  authority {}  additional {}  in {:?}",
        answer.rcode(),
        answer.ancount(),
        answer.nscount(),
        answer.arcount(),
        elapsed
    );
    println!();
    print_section(&answer, Section::Answer, "ANSWER");
    print_section(&answer, Section::Authority, "AUTHORITY");
    print_section(&answer, Section::Additional, "ADDITIONAL");

    Ok(())
}
