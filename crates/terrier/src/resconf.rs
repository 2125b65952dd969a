//! Resolver configuration: nameservers, search list, lookup order and
//! options, with a loader for classic resolv.conf text. The tables here are
//! inputs to the engine; they are immutable once a resolver holds them.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::name;

pub const MAX_NAMESERVERS: usize = 4;
pub const MAX_SEARCH: usize = 8;

/// One step of the lookup order: consult the hosts file or ask nameservers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lookup {
    File,
    Bind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Dots needed in a raw name before it is tried as-is ahead of the
    /// search list.
    #[serde(default = "default_ndots")]
    pub ndots: u32,
    /// Per-server wait before rotating to the next candidate.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Full passes over the candidate set before giving up.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Iterate from the hints ourselves instead of asking a recursive
    /// nameserver.
    #[serde(default)]
    pub recurse: bool,
    /// Resolve the targets of NS/MX/SRV answers into ADDITIONAL.
    #[serde(default)]
    pub smart: bool,
    /// Randomize nameserver order per query instead of per configuration.
    #[serde(default)]
    pub rotate: bool,
    /// Destination port for iteration targets derived from glue.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_ndots() -> u32 {
    1
}
fn default_timeout() -> u64 {
    3
}
fn default_attempts() -> u32 {
    2
}
fn default_port() -> u16 {
    53
}

impl Default for Options {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvConf {
    #[serde(default)]
    pub nameservers: Vec<SocketAddr>,
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default = "default_lookup")]
    pub lookup: Vec<Lookup>,
    #[serde(default)]
    pub options: Options,
    /// Local address outgoing sockets bind to.
    #[serde(default = "default_local_addr")]
    pub local_addr: SocketAddr,
}

fn default_lookup() -> Vec<Lookup> {
    vec![Lookup::Bind, Lookup::File]
}

fn default_local_addr() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

impl Default for ResolvConf {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl ResolvConf {
    /// Parse resolv.conf text into this configuration, appending to the
    /// capped nameserver/search tables. Unknown keywords are skipped.
    ///
    /// Recognized: `nameserver ADDR`, `search DOMAIN...`, `domain DOMAIN`,
    /// `lookup {file|bind|f|b}...`, `options key[:value]...`.
    pub fn load_str(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split(['#', ';']).next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let Some(keyword) = fields.next() else { continue };

            match keyword {
                "nameserver" => {
                    if let Some(addr) = fields.next().and_then(parse_server) {
                        if self.nameservers.len() < MAX_NAMESERVERS {
                            self.nameservers.push(addr);
                        }
                    }
                }
                "domain" => {
                    if let Some(d) = fields.next() {
                        self.search = vec![d.to_string()];
                    }
                }
                "search" => {
                    self.search = fields
                        .take(MAX_SEARCH)
                        .map(|d| d.to_string())
                        .collect();
                }
                "lookup" => {
                    let mut order = Vec::new();
                    for word in fields {
                        match word {
                            "file" | "f" => order.push(Lookup::File),
                            "bind" | "b" => order.push(Lookup::Bind),
                            other => debug!("ignoring lookup keyword {:?}", other),
                        }
                    }
                    if !order.is_empty() {
                        self.lookup = order;
                    }
                }
                "options" => {
                    for opt in fields {
                        self.apply_option(opt);
                    }
                }
                other => debug!("ignoring resolv.conf keyword {:?}", other),
            }
        }
    }

    fn apply_option(&mut self, opt: &str) {
        let (key, value) = match opt.split_once(':') {
            Some((k, v)) => (k, Some(v)),
            None => (opt, None),
        };
        let number = value.and_then(|v| v.parse::<u64>().ok());
        match key {
            "ndots" => {
                if let Some(n) = number {
                    self.options.ndots = n.min(15) as u32;
                }
            }
            "timeout" => {
                if let Some(n) = number {
                    self.options.timeout_secs = n.min(30);
                }
            }
            "attempts" => {
                if let Some(n) = number {
                    self.options.attempts = n.clamp(1, 5) as u32;
                }
            }
            "port" => {
                if let Some(n) = number {
                    self.options.port = n as u16;
                }
            }
            "rotate" => self.options.rotate = true,
            "recurse" => self.options.recurse = true,
            "smart" => self.options.smart = true,
            other => debug!("ignoring resolv.conf option {:?}", other),
        }
    }

    pub fn load_path(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.load_str(&text);
        Ok(())
    }

    /// Restartable search-list expansion. `state` indexes into the
    /// candidate sequence for `qname` and is the only iteration state, so
    /// callers can hold it across suspensions.
    ///
    /// Names with at least `ndots` dots are tried as-is first, then with
    /// each search suffix; short names try the suffixes first and the bare
    /// name last.
    pub fn search_next(&self, qname: &str, state: &mut usize) -> Option<String> {
        let as_is_first = name::ndots(qname) as u32 >= self.options.ndots;
        let mut seq = Vec::with_capacity(self.search.len() + 1);
        if as_is_first {
            seq.push(name::anchor(qname));
        }
        for entry in self.search.iter().filter(|e| !e.is_empty()) {
            seq.push(name::anchor(&format!(
                "{}.{}",
                qname.trim_end_matches('.'),
                entry
            )));
        }
        if !as_is_first {
            seq.push(name::anchor(qname));
        }

        let out = seq.get(*state).cloned();
        if out.is_some() {
            *state += 1;
        }
        out
    }
}

fn parse_server(s: &str) -> Option<SocketAddr> {
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Some(sa);
    }
    s.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
}
