use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while exchanging addressing info over the side channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Binding or listening on the well-known port failed.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Accepting the single expected connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Connecting to the configured peer failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The accepted connection's peer address could not be read.
    #[error("peer address lookup failed: {0}")]
    PeerAddr(#[source] io::Error),

    /// A send or receive failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection before the whole record was moved.
    #[error("unexpected end of stream after {transferred} of {expected} bytes")]
    UnexpectedEof { transferred: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_eof() {
        let err = ChannelError::UnexpectedEof {
            transferred: 12,
            expected: 28,
        };
        assert_eq!(
            err.to_string(),
            "unexpected end of stream after 12 of 28 bytes"
        );
    }

    #[test]
    fn test_display_connect() {
        let err = ChannelError::Connect {
            addr: "10.0.0.2:12347".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("connect to 10.0.0.2:12347 failed"));
    }

    #[test]
    fn test_io_from() {
        let err: ChannelError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, ChannelError::Io(_)));
    }
}
