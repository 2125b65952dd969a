//! terrier — a restartable, non-blocking DNS resolution engine.
//!
//! The engine answers a single question at a time, from the hosts table,
//! from configured nameservers as a stub, or by iterating from the root
//! hints, and hands back a verified reply message. It is built for
//! single-threaded event loops: nothing here blocks, every suspension point
//! is exposed as a pollable file descriptor, and progress is made by
//! re-invoking `check` after the fd turns ready. The `drive` module adapts
//! one resolution into a tokio future for async embedders.

pub mod clock;
pub mod drive;
pub mod error;
pub mod hints;
pub mod hosts;
pub mod logging;
pub mod name;
pub mod packet;
pub mod permutor;
pub mod query;
pub mod records;
pub mod resconf;
pub mod resolver;

pub use error::{Error, Result, Step};
pub use hints::HintsTable;
pub use hosts::HostsTable;
pub use packet::{build_query, Filter, Packet, Section, Sort};
pub use records::{DnsRecord, RData, RecordClass, RecordType};
pub use resconf::{Lookup, Options, ResolvConf};
pub use resolver::Resolver;
