use storage::SessionId;
use thiserror::Error;

/// The failure taxonomy visible across the RPC boundary.
///
/// Transient errors are retriable by re-routing; session errors are fatal to
/// the session; validation errors abort the offending operation only;
/// storage errors are fatal to the server. Application errors carry whatever
/// the user state machine raised and never crash consensus.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("no leader available")]
    NoLeader,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("request timed out")]
    Timeout,

    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} expired")]
    SessionExpired(SessionId),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("log corruption: {0}")]
    Corruption(String),
    #[error("io error: {0}")]
    Io(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry against another server.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NoLeader | Error::ConnectionLost(_) | Error::Timeout
        )
    }

    /// Whether the session this request rode on is unusable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::UnknownSession(_) | Error::SessionExpired(_))
    }
}

impl From<storage::Error> for Error {
    fn from(err: storage::Error) -> Self {
        match err {
            storage::Error::Corruption(msg) => Error::Corruption(msg),
            storage::Error::IllegalState(msg) => Error::IllegalState(msg),
            storage::Error::IllegalArgument(msg) => Error::IllegalArgument(msg),
            storage::Error::Io(e) => Error::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_transient_errors() {
        assert!(Error::NoLeader.is_transient());
        assert!(Error::ConnectionLost("reset".into()).is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(!Error::UnknownSession(1).is_transient());
        assert!(!Error::Application("boom".into()).is_transient());
    }

    #[test]
    fn should_classify_session_fatal_errors() {
        assert!(Error::SessionExpired(3).is_session_fatal());
        assert!(!Error::NoLeader.is_session_fatal());
    }
}
