//! Error types for relaycore

use thiserror::Error;

/// Main error type for relaycore
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("no network specified")]
    NoNetworkConfigured,

    #[error("unable to get destination")]
    NoDestination,

    #[error("failed to dispatch request: {0}")]
    Dispatch(#[source] Box<Error>),

    #[error("connection ends: {0}")]
    Transport(#[source] Box<Error>),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    /// Wrap an error observed while dispatching.
    pub fn dispatch(err: Error) -> Self {
        Error::Dispatch(Box::new(err))
    }

    /// Wrap an error observed on either copy direction.
    pub fn transport(err: Error) -> Self {
        Error::Transport(Box::new(err))
    }

    /// True for errors that only mean "the other side went away".
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::Cancelled => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::Transport(inner) | Error::Dispatch(inner) => inner.is_closed(),
            _ => false,
        }
    }
}

/// Result type alias for relaycore
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_classification() {
        assert!(Error::ConnectionClosed.is_closed());
        assert!(Error::transport(Error::Cancelled).is_closed());

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(Error::Io(reset).is_closed());

        assert!(!Error::NoDestination.is_closed());
        assert!(!Error::DialFailed("refused".into()).is_closed());
    }

    #[test]
    fn test_wrapped_messages() {
        let err = Error::dispatch(Error::DialFailed("no route".into()));
        assert_eq!(err.to_string(), "failed to dispatch request: Dial failed: no route");
    }
}
