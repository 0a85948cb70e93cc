pub mod auth;
pub mod client;
pub mod error;
pub mod message;
pub mod server;
pub mod socks;
pub mod transport;
pub mod tunnel;

pub use auth::AuthenticationHandler;
pub use client::{ClientOptions, Socks5Client};
pub use error::{Error, ProtocolError, StateError};
pub use server::{ServerOptions, Socks5Server};
pub use socks::{
    AddressType, AuthenticationMethod, ConnectCode, ConnectMethod, ConnectionResult, Endpoint,
};
pub use transport::{BoxStream, ConnectionLog, ConnectionRole, LogEntry};
pub use tunnel::{Tunnel, TunnelControl, TunnelStats};

/// Handshake progress of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Authentication,
    Connection,
    Connected,
}
