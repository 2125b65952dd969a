use thiserror::Error;

/// Errors surfaced by the engine. Suspension is not an error: re-entrant
/// operations report it through [`Step::Pending`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Packet buffer full")]
    NoBufs,

    #[error("Malformed wire data: {0}")]
    Illegal(&'static str),

    #[error("Unexpected answer or state: {0}")]
    Unknown(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of one re-entrant `check` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The operation completed; results may be fetched.
    Ready,
    /// The operation would block. Wait for readiness on the fd reported by
    /// `pollin`/`pollout` and call `check` again.
    Pending,
}

impl Step {
    pub fn is_ready(self) -> bool {
        matches!(self, Step::Ready)
    }
}
