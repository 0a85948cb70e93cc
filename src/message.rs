//! Handshake messages of [RFC 1928].
//!
//! Every message is encoded into a single buffer sized by
//! [`Encode::message_size`] and written in one go. Reads consume exactly the
//! number of bytes each field declares; running out of input is a
//! [`ProtocolError::Truncated`].
//!
//! [RFC 1928]: https://datatracker.ietf.org/doc/html/rfc1928

use crate::{
    error::ProtocolError,
    socks::{v5, AddressType, AuthenticationMethod, ConnectCode, ConnectMethod, Endpoint},
    Error,
};
use bytes::{BufMut, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub trait Encode {
    /// Exact number of bytes [`Encode::write_to_buf`] produces.
    fn message_size(&self) -> usize;

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError>;

    fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.message_size());
        self.write_to_buf(&mut buf)?;
        Ok(buf)
    }
}

/// Encodes `message` and writes it out with a single write + flush.
pub async fn write_message<W, M>(w: &mut W, message: &M) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    M: Encode,
{
    let buf = message.encode()?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) fn check_version(expected: u8, found: u8) -> Result<(), ProtocolError> {
    if expected != found {
        return Err(ProtocolError::InvalidVersion { expected, found });
    }
    Ok(())
}

/// The client's greeting.
///
/// ```plain
/// +-----+----------+----------+
/// | VER | NMETHODS | METHODS  |
/// +-----+----------+----------+
/// |  1  |    1     | 1 to 255 |
/// +-----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRequest {
    pub methods: Vec<AuthenticationMethod>,
}

impl AuthenticationRequest {
    pub fn new(methods: Vec<AuthenticationMethod>) -> Self {
        AuthenticationRequest { methods }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        check_version(v5::VERSION, r.read_u8().await?)?;

        let count = r.read_u8().await?;
        let mut raw = vec![0; count as usize];
        r.read_exact(&mut raw).await?;

        Ok(AuthenticationRequest {
            methods: raw.into_iter().map(AuthenticationMethod::from).collect(),
        })
    }
}

impl Encode for AuthenticationRequest {
    fn message_size(&self) -> usize {
        2 + self.methods.len()
    }

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        if self.methods.len() > u8::MAX as usize {
            return Err(ProtocolError::TooManyMethods(self.methods.len()));
        }

        buf.put_u8(v5::VERSION);
        buf.put_u8(self.methods.len() as u8);
        for method in &self.methods {
            buf.put_u8((*method).into());
        }
        Ok(())
    }
}

/// The method the server picked.
///
/// ```plain
/// +-----+--------+
/// | VER | METHOD |
/// +-----+--------+
/// |  1  |   1    |
/// +-----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationResponse {
    pub method: AuthenticationMethod,
}

impl AuthenticationResponse {
    pub fn new(method: AuthenticationMethod) -> Self {
        AuthenticationResponse { method }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        check_version(v5::VERSION, r.read_u8().await?)?;
        let method = r.read_u8().await?.into();
        Ok(AuthenticationResponse { method })
    }
}

impl Encode for AuthenticationResponse {
    fn message_size(&self) -> usize {
        2
    }

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        buf.put_u8(v5::VERSION);
        buf.put_u8(self.method.into());
        Ok(())
    }
}

/// ```plain
/// +-----+-----+-------+------+----------+----------+
/// | VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +-----+-----+-------+------+----------+----------+
/// |  1  |  1  | X'00' |  1   | Variable |    2     |
/// +-----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub method: ConnectMethod,
    pub endpoint: Endpoint,
}

impl ConnectRequest {
    pub fn new(method: ConnectMethod, endpoint: Endpoint) -> Self {
        ConnectRequest { method, endpoint }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let (b, endpoint) = read_connect_message(r).await?;
        let method = ConnectMethod::from_byte(b).ok_or(ProtocolError::UnknownConnectMethod(b))?;
        Ok(ConnectRequest { method, endpoint })
    }
}

impl Encode for ConnectRequest {
    fn message_size(&self) -> usize {
        4 + endpoint_size(&self.endpoint)
    }

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        write_connect_message(self.method.to_byte(), &self.endpoint, buf)
    }
}

/// Same layout as [`ConnectRequest`], with the reply code in place of the
/// command and the bound address in place of the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub code: ConnectCode,
    pub endpoint: Endpoint,
}

impl ConnectResponse {
    pub fn new(code: ConnectCode, endpoint: Endpoint) -> Self {
        ConnectResponse { code, endpoint }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let (b, endpoint) = read_connect_message(r).await?;
        let code = ConnectCode::from_byte(b).ok_or(ProtocolError::UnknownConnectCode(b))?;
        Ok(ConnectResponse { code, endpoint })
    }
}

impl Encode for ConnectResponse {
    fn message_size(&self) -> usize {
        4 + endpoint_size(&self.endpoint)
    }

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        write_connect_message(self.code.to_byte(), &self.endpoint, buf)
    }
}

fn endpoint_size(endpoint: &Endpoint) -> usize {
    2 + match endpoint.address_type() {
        AddressType::IPv4 => 4,
        AddressType::DomainName => 1 + endpoint.address().len(),
        AddressType::IPv6 => 16,
        AddressType::Unknown => 0,
    }
}

fn write_connect_message<B: BufMut>(
    head: u8,
    endpoint: &Endpoint,
    buf: &mut B,
) -> Result<(), ProtocolError> {
    let invalid = || ProtocolError::InvalidAddress(endpoint.address().to_owned());

    // validate before anything hits the buffer
    let address: Vec<u8> = match endpoint.address_type() {
        AddressType::IPv4 => endpoint
            .address()
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid())?
            .octets()
            .to_vec(),
        AddressType::IPv6 => endpoint
            .address()
            .parse::<Ipv6Addr>()
            .map_err(|_| invalid())?
            .octets()
            .to_vec(),
        AddressType::DomainName => {
            let name = endpoint.address().as_bytes();
            if name.len() > u8::MAX as usize {
                return Err(ProtocolError::DomainTooLong(name.len()));
            }
            let mut raw = Vec::with_capacity(1 + name.len());
            raw.push(name.len() as u8);
            raw.extend_from_slice(name);
            raw
        }
        AddressType::Unknown => return Err(ProtocolError::UnknownEndpoint),
    };
    let atyp = endpoint
        .address_type()
        .to_byte()
        .ok_or(ProtocolError::UnknownEndpoint)?;

    buf.put_u8(v5::VERSION);
    buf.put_u8(head);
    buf.put_u8(v5::RESERVED);
    buf.put_u8(atyp);
    buf.put_slice(&address);
    buf.put_u16(endpoint.port());
    Ok(())
}

async fn read_connect_message<R>(r: &mut R) -> Result<(u8, Endpoint), Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;

    check_version(v5::VERSION, header[0])?;
    if header[2] != v5::RESERVED {
        return Err(ProtocolError::ReservedByte(header[2]).into());
    }

    let endpoint = match AddressType::from_byte(header[3]) {
        Some(AddressType::IPv4) => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            let port = r.read_u16().await?;
            Endpoint::ipv4(Ipv4Addr::from(octets), port)
        }
        Some(AddressType::IPv6) => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            let port = r.read_u16().await?;
            Endpoint::ipv6(Ipv6Addr::from(octets), port)
        }
        Some(AddressType::DomainName) => {
            let len = r.read_u8().await?;
            let mut raw = vec![0; len as usize];
            r.read_exact(&mut raw).await?;
            let port = r.read_u16().await?;
            let name = String::from_utf8(raw).map_err(|_| ProtocolError::InvalidDomain)?;
            Endpoint::domain(name, port)
        }
        _ => return Err(ProtocolError::UnknownAddressType(header[3]).into()),
    };

    Ok((header[1], endpoint))
}
