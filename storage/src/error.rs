use thiserror::Error;

/// Errors raised by the log and its compactor.
#[derive(Debug, Error)]
pub enum Error {
    /// The on-disk representation failed to round-trip.
    #[error("log corruption: {0}")]
    Corruption(String),
    /// An operation violated a log invariant.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A caller-supplied argument was out of range.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
