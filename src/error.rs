use crate::socks::{AuthenticationMethod, ConnectCode, Endpoint};
use std::io;
use thiserror::Error;

/// Malformed bytes on the wire. Never retryable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid version byte 0x{found:02x}, expected 0x{expected:02x}")]
    InvalidVersion { expected: u8, found: u8 },
    #[error("reserved byte must be zero, got 0x{0:02x}")]
    ReservedByte(u8),
    #[error("unknown address type 0x{0:02x}")]
    UnknownAddressType(u8),
    #[error("unknown connect method 0x{0:02x}")]
    UnknownConnectMethod(u8),
    #[error("unknown connect code 0x{0:02x}")]
    UnknownConnectCode(u8),
    #[error("domain name is not valid utf-8")]
    InvalidDomain,
    #[error("domain name of {0} bytes does not fit a length byte")]
    DomainTooLong(usize),
    #[error("`{0}` is not a valid address for its address type")]
    InvalidAddress(String),
    #[error("cannot encode an endpoint of unknown address type")]
    UnknownEndpoint,
    #[error("{0} authentication methods do not fit a count byte")]
    TooManyMethods(usize),
    #[error("credential of {0} bytes does not fit a length byte")]
    CredentialTooLong(usize),
    #[error("message truncated")]
    Truncated,
}

/// Misuse of an engine's public API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("handshake can only be started once")]
    AlreadyStarted,
    #[error("not connected yet")]
    NotConnected,
    #[error("transport is closed")]
    Closed,
    #[error("no remote stream to proxy")]
    NoRemoteStream,
    #[error("tunnel is already running")]
    TunnelActive,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no acceptable authentication method")]
    NoAcceptableMethods,
    #[error("authentication method {0:?} is not supported")]
    UnsupportedMethod(AuthenticationMethod),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("connect failed: {0}")]
    ConnectFailed(ConnectCode),
    #[error("server answered with endpoint {received}, requested {requested}")]
    EndpointMismatch {
        requested: Endpoint,
        received: Endpoint,
    },
    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    State(#[from] StateError),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The reply code carried by a failed connect, if any.
    pub fn connect_code(&self) -> Option<ConnectCode> {
        match self {
            Error::ConnectFailed(code) => Some(*code),
            _ => None,
        }
    }
}

// A short read is a truncated message, not a plain I/O failure.
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::Protocol(ProtocolError::Truncated)
        } else {
            Error::Io(err)
        }
    }
}
