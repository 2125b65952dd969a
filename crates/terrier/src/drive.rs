//! Embedding helper for tokio event loops.
//!
//! The engine itself is synchronous and non-blocking; this adapter turns
//! one resolution into a future by awaiting readiness of whichever fd the
//! resolver is suspended on and re-invoking `check`.

use std::os::fd::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{Result, Step};
use crate::packet::Packet;
use crate::resolver::Resolver;

/// A borrowed fd; the resolver keeps ownership of the socket behind it.
struct PollFd(RawFd);

impl AsRawFd for PollFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Drive a submitted resolution to completion.
pub async fn resolve(resolver: &mut Resolver) -> Result<Packet> {
    loop {
        match resolver.check()? {
            Step::Ready => return resolver.fetch(),
            Step::Pending => wait_ready(resolver).await?,
        }
    }
}

async fn wait_ready(resolver: &Resolver) -> std::io::Result<()> {
    if let Some(fd) = resolver.pollin() {
        let afd = AsyncFd::with_interest(PollFd(fd), Interest::READABLE)?;
        let mut guard = afd.readable().await?;
        guard.clear_ready();
    } else if let Some(fd) = resolver.pollout() {
        let afd = AsyncFd::with_interest(PollFd(fd), Interest::WRITABLE)?;
        let mut guard = afd.writable().await?;
        guard.clear_ready();
    } else {
        // suspended without an fd; let other tasks run and retry
        tokio::task::yield_now().await;
    }
    Ok(())
}
