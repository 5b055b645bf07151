use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The queue lock could not be taken and forced recovery was disabled or exhausted.
    #[error("timed out after {waited:?} waiting for queue lock held by {holder:#x}")]
    LockTimeout { holder: i64, waited: Duration },
    /// Raised by the pretoucher once its queue is closed; the scheduler should drop it.
    #[error("pretoucher terminated: queue closed")]
    HandlerTerminated,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("segment for cycle {cycle} is full")]
    SegmentFull { cycle: i32 },
    #[error("cycle {cycle} cannot index more excerpts")]
    CycleFull { cycle: i32 },
}

impl Error {
    pub(crate) fn closed(what: &str) -> Self {
        Error::InvalidState(format!("{what} is closed"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
