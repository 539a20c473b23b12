use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

/// Structured socket error codes. These travel in [crate::message::Message::error] between the
///  library and the proxies, so the numeric values are part of the protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SocketError {
    Success = 0,
    Fatal = 1,
    #[num_enum(default)]
    Unknown = 2,
    Closed = 3,
    Aborted = 4,
    Timeout = 5,
    Comm = 6,
    NoAddress = 7,
    BadFlags = 8,
    Refused = 9,
    NoHost = 10,
    Network = 11,
    Duplicate = 12,
    NotSupported = 13,
    Arg = 14,
    Retry = 15,
    Missing = 16,
    NoBuffers = 17,
    BadVersion = 18,
}

impl SocketError {
    pub fn is_success(&self) -> bool {
        *self == SocketError::Success
    }

    pub fn code(&self) -> i32 {
        (*self).into()
    }
}

/// The error type of the socket facing API.
///
/// `Timeout` is a local deadline that expired, which is different from a proxy reporting a
///  timeout: that arrives as `Remote(SocketError::Timeout)`.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("operation timed out locally: {0}")]
    Timeout(String),
    #[error("proxy reported {0:?}")]
    Remote(SocketError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("socket closed")]
    Closed,
    #[error("no proxy link available: {0}")]
    NotLinked(String),
    #[error("all {} branches failed, last error: {}", .0.len(), .0.last().map(|e| e.to_string()).unwrap_or_default())]
    Aggregate(Vec<ProxyError>),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn timeout(what: impl Into<String>) -> ProxyError {
        ProxyError::Timeout(what.into())
    }

    pub fn protocol(what: impl Into<String>) -> ProxyError {
        ProxyError::Protocol(what.into())
    }

    /// Wraps the errors of a fan-out where no branch succeeded. A single error is returned as
    ///  it is.
    pub fn aggregate(mut errors: Vec<ProxyError>) -> ProxyError {
        match errors.len() {
            0 => ProxyError::NotLinked("no branches to fan out to".to_string()),
            1 => errors.remove(0),
            _ => ProxyError::Aggregate(errors),
        }
    }

    /// The structured code a socket facade would report for this error
    pub fn code(&self) -> SocketError {
        match self {
            ProxyError::Timeout(_) => SocketError::Timeout,
            ProxyError::Remote(e) => *e,
            ProxyError::Protocol(_) => SocketError::Comm,
            ProxyError::Closed => SocketError::Closed,
            ProxyError::NotLinked(_) => SocketError::NoAddress,
            ProxyError::Aggregate(errors) => errors.last()
                .map(|e| e.code())
                .unwrap_or(SocketError::Unknown),
            ProxyError::Transport(_) => SocketError::Network,
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout(value.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use rstest::rstest;

    #[rstest]
    #[case::success(0, SocketError::Success)]
    #[case::timeout(5, SocketError::Timeout)]
    #[case::bad_version(18, SocketError::BadVersion)]
    #[case::unknown_positive(1000, SocketError::Unknown)]
    #[case::unknown_negative(-1, SocketError::Unknown)]
    fn test_socket_error_from_code(#[case] raw: i32, #[case] expected: SocketError) {
        assert_eq!(SocketError::from(raw), expected);
    }

    #[rstest]
    #[case::local_timeout(ProxyError::timeout("connect"), SocketError::Timeout)]
    #[case::remote(ProxyError::Remote(SocketError::Refused), SocketError::Refused)]
    #[case::protocol(ProxyError::protocol("unexpected"), SocketError::Comm)]
    #[case::closed(ProxyError::Closed, SocketError::Closed)]
    #[case::transport(ProxyError::Transport(anyhow!("down")), SocketError::Network)]
    #[case::aggregate(ProxyError::Aggregate(vec![ProxyError::Closed, ProxyError::Remote(SocketError::NoHost)]), SocketError::NoHost)]
    fn test_code(#[case] error: ProxyError, #[case] expected: SocketError) {
        assert_eq!(error.code(), expected);
    }

    #[test]
    fn test_aggregate_single_is_unwrapped() {
        let e = ProxyError::aggregate(vec![ProxyError::Closed]);
        assert!(matches!(e, ProxyError::Closed));

        let e = ProxyError::aggregate(vec![ProxyError::Closed, ProxyError::timeout("x")]);
        assert!(matches!(e, ProxyError::Aggregate(v) if v.len() == 2));
    }

    #[test]
    fn test_local_timeout_distinct_from_remote_timeout() {
        let local = ProxyError::timeout("send");
        let remote = ProxyError::Remote(SocketError::Timeout);
        assert_eq!(local.code(), remote.code());
        assert!(matches!(local, ProxyError::Timeout(_)));
        assert!(!matches!(remote, ProxyError::Timeout(_)));
    }
}
