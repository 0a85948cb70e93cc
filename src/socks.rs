use crate::{transport::BoxStream, Error};
use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

pub mod v5 {
    pub const VERSION: u8 = 5;
    pub const RESERVED: u8 = 0;

    pub const METH_NO_AUTH: u8 = 0x00;
    // pub const METH_GSSAPI: u8 = 0x01;
    pub const METH_USER_PASS: u8 = 0x02;
    pub const METH_SSL: u8 = 0x06;
    pub const METH_NO_ACCEPTABLE: u8 = 0xff;

    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    /// RFC 1929 subnegotiation version.
    pub const USER_PASS_VERSION: u8 = 0x01;
}

/// Layout of the address field of a connect request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    IPv4,
    DomainName,
    IPv6,
    /// Placeholder for "no endpoint"; never written to the wire.
    Unknown,
}

impl AddressType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            v5::ATYP_IPV4 => Some(AddressType::IPv4),
            v5::ATYP_DOMAIN => Some(AddressType::DomainName),
            v5::ATYP_IPV6 => Some(AddressType::IPv6),
            _ => None,
        }
    }

    pub fn to_byte(self) -> Option<u8> {
        match self {
            AddressType::IPv4 => Some(v5::ATYP_IPV4),
            AddressType::DomainName => Some(v5::ATYP_DOMAIN),
            AddressType::IPv6 => Some(v5::ATYP_IPV6),
            AddressType::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationMethod {
    NoAuthenticationRequired,
    UsernamePassword,
    SecureSocketsLayer,
    NoAcceptableMethods,
    /// A method this crate does not implement (GSSAPI, CHAP, ...).
    Other(u8),
}

impl From<u8> for AuthenticationMethod {
    fn from(b: u8) -> Self {
        match b {
            v5::METH_NO_AUTH => AuthenticationMethod::NoAuthenticationRequired,
            v5::METH_USER_PASS => AuthenticationMethod::UsernamePassword,
            v5::METH_SSL => AuthenticationMethod::SecureSocketsLayer,
            v5::METH_NO_ACCEPTABLE => AuthenticationMethod::NoAcceptableMethods,
            other => AuthenticationMethod::Other(other),
        }
    }
}

impl From<AuthenticationMethod> for u8 {
    fn from(method: AuthenticationMethod) -> u8 {
        match method {
            AuthenticationMethod::NoAuthenticationRequired => v5::METH_NO_AUTH,
            AuthenticationMethod::UsernamePassword => v5::METH_USER_PASS,
            AuthenticationMethod::SecureSocketsLayer => v5::METH_SSL,
            AuthenticationMethod::NoAcceptableMethods => v5::METH_NO_ACCEPTABLE,
            AuthenticationMethod::Other(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectMethod {
    TcpConnect,
    TcpBind,
    UdpAssociate,
}

impl ConnectMethod {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            v5::CMD_CONNECT => Some(ConnectMethod::TcpConnect),
            v5::CMD_BIND => Some(ConnectMethod::TcpBind),
            v5::CMD_UDP_ASSOCIATE => Some(ConnectMethod::UdpAssociate),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ConnectMethod::TcpConnect => v5::CMD_CONNECT,
            ConnectMethod::TcpBind => v5::CMD_BIND,
            ConnectMethod::UdpAssociate => v5::CMD_UDP_ASSOCIATE,
        }
    }
}

/// Reply field of a connect response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectCode {
    Succeeded = 0x00,
    SocksFailure = 0x01,
    NotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ConnectCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => ConnectCode::Succeeded,
            0x01 => ConnectCode::SocksFailure,
            0x02 => ConnectCode::NotAllowedByRuleset,
            0x03 => ConnectCode::NetworkUnreachable,
            0x04 => ConnectCode::HostUnreachable,
            0x05 => ConnectCode::ConnectionRefused,
            0x06 => ConnectCode::TtlExpired,
            0x07 => ConnectCode::CommandNotSupported,
            0x08 => ConnectCode::AddressTypeNotSupported,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectCode::Succeeded => "succeeded",
            ConnectCode::SocksFailure => "general SOCKS server failure",
            ConnectCode::NotAllowedByRuleset => "connection not allowed by ruleset",
            ConnectCode::NetworkUnreachable => "network unreachable",
            ConnectCode::HostUnreachable => "host unreachable",
            ConnectCode::ConnectionRefused => "connection refused",
            ConnectCode::TtlExpired => "TTL expired",
            ConnectCode::CommandNotSupported => "command not supported",
            ConnectCode::AddressTypeNotSupported => "address type not supported",
        };
        write!(f, "{} (0x{:02x})", s, self.to_byte())
    }
}

/// Picks the reply code matching a failed outbound dial.
impl From<&io::Error> for ConnectCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ConnectCode::NotAllowedByRuleset,
            io::ErrorKind::ConnectionRefused => ConnectCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => ConnectCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ConnectCode::NetworkUnreachable,
            io::ErrorKind::TimedOut => ConnectCode::TtlExpired,
            _ => ConnectCode::SocksFailure,
        }
    }
}

/// An (address type, address, port) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address_type: AddressType,
    address: String,
    port: u16,
}

impl Endpoint {
    /// IP literals are stored in their canonical text form, so `0:0::1` and
    /// `::1` name the same endpoint.
    pub fn new(address_type: AddressType, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        let address = match address_type {
            AddressType::IPv4 => canonical_ip::<Ipv4Addr>(address),
            AddressType::IPv6 => canonical_ip::<Ipv6Addr>(address),
            _ => address,
        };
        Endpoint {
            address_type,
            address,
            port,
        }
    }

    /// The "no endpoint yet" sentinel.
    pub fn invalid() -> Self {
        Endpoint::new(AddressType::Unknown, "0.0.0.0", 0)
    }

    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Endpoint::new(AddressType::IPv4, ip.to_string(), port)
    }

    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        Endpoint::new(AddressType::IPv6, ip.to_string(), port)
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Endpoint::new(AddressType::DomainName, name, port)
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_invalid(&self) -> bool {
        self.address_type == AddressType::Unknown
    }
}

// unparsable text is kept and rejected when encoded
fn canonical_ip<T>(address: String) -> String
where
    T: FromStr + fmt::Display,
{
    match address.parse::<T>() {
        Ok(ip) => ip.to_string(),
        Err(_) => address,
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::invalid()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Endpoint::ipv4(ip, addr.port()),
            IpAddr::V6(ip) => Endpoint::ipv6(ip, addr.port()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `1.2.3.4:80`, `[::1]:80` or `example.com:80`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("missing port in endpoint `{}`", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidArgument(format!("invalid port in endpoint `{}`", s)))?;
        if host.is_empty() || host.contains(':') {
            return Err(Error::InvalidArgument(format!("invalid host in endpoint `{}`", s)));
        }

        Ok(Endpoint::domain(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address_type {
            AddressType::IPv6 => write!(f, "[{}]:{}", self.address, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// Outcome of a server side connect attempt.
///
/// Only [`ConnectionResult::succeeded`] carries a target stream, and only a
/// failed result carries a code other than `Succeeded`.
pub struct ConnectionResult(Outcome);

enum Outcome {
    Success {
        stream: BoxStream,
        local_endpoint: Endpoint,
    },
    Failure(ConnectCode),
}

impl ConnectionResult {
    pub fn succeeded(stream: BoxStream, local_endpoint: Endpoint) -> Result<Self, Error> {
        if local_endpoint.is_invalid() {
            return Err(Error::InvalidArgument(
                "local endpoint of a successful connect must not be unknown".into(),
            ));
        }
        Ok(ConnectionResult(Outcome::Success {
            stream,
            local_endpoint,
        }))
    }

    pub fn failed(code: ConnectCode) -> Result<Self, Error> {
        if code == ConnectCode::Succeeded {
            return Err(Error::InvalidArgument(format!("{} is not a failure code", code)));
        }
        Ok(ConnectionResult(Outcome::Failure(code)))
    }

    /// Failure with a code known not to be `Succeeded`.
    pub(crate) fn failure(code: ConnectCode) -> Self {
        debug_assert_ne!(code, ConnectCode::Succeeded);
        ConnectionResult(Outcome::Failure(code))
    }

    pub fn code(&self) -> ConnectCode {
        match &self.0 {
            Outcome::Success { .. } => ConnectCode::Succeeded,
            Outcome::Failure(code) => *code,
        }
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        match &self.0 {
            Outcome::Success { local_endpoint, .. } => Some(local_endpoint),
            Outcome::Failure(_) => None,
        }
    }

    /// Splits a success into `(stream, local_endpoint)`; a failure yields its code.
    pub fn into_parts(self) -> Result<(BoxStream, Endpoint), ConnectCode> {
        match self.0 {
            Outcome::Success {
                stream,
                local_endpoint,
            } => Ok((stream, local_endpoint)),
            Outcome::Failure(code) => Err(code),
        }
    }
}

impl fmt::Debug for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Outcome::Success { local_endpoint, .. } => f
                .debug_struct("Success")
                .field("local_endpoint", local_endpoint)
                .finish_non_exhaustive(),
            Outcome::Failure(code) => f.debug_tuple("Failure").field(code).finish(),
        }
    }
}
