use bytebuffer::ByteBuffer;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use strum_macros::{Display, FromRepr};
use tokio::io::AsyncReadExt;

use crate::Result;

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// ATYP field of a request or reply.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Name = 0x03,
    Ipv6 = 0x04,
}

/// REP status byte of a reply.
#[derive(FromRepr, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Success = 0x00,
    GeneralFailure = 0x01,
    Disallowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandUnsupported = 0x07,
    AddressTypeUnsupported = 0x08,
}

/// Fixed success reply used when a connection is intercepted:
/// SUCCESS, ATYP IPv4, address 0.0.0.0, port 0.
pub const SYNTHETIC_SUCCESS_REPLY: [u8; 10] =
    [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// A decoded CONNECT request. Produced once per session and handed
/// read-only to the dispatch hook.
///
/// `command` is kept as the raw byte: unsupported commands still decode
/// so the session can answer them with CMDUNSUPP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub version: u8,
    pub command: u8,
    pub address_type: AddressType,
    pub destination: String,
    pub port: u16,
}

/// Reads a method-selection message and returns the offered method ids.
///
/// The version byte is read but not validated.
pub async fn read_method_selection<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let _version = reader.read_u8().await?;
    let method_num = reader.read_u8().await?;

    let mut methods = vec![0; method_num as usize];
    if method_num > 0 {
        reader.read_exact(&mut methods).await?;
    }
    Ok(methods)
}

/// Picks the method the server answers with: NOAUTH iff it was offered
/// anywhere in the list, otherwise the no-acceptable-methods marker.
pub fn select_method(methods: &[u8]) -> u8 {
    if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPTABLE
    }
}

pub fn encode_method_reply(method: u8) -> [u8; 2] {
    [SOCKS_VERSION, method]
}

/// Error replies carry no address payload, only version and REP.
pub fn encode_error_reply(code: ReplyCode) -> [u8; 2] {
    [SOCKS_VERSION, code as u8]
}

/// Reads a SOCKS5 request.
///
/// Only the NAME address type is implemented. IPv4 and IPv6 literals in
/// a request fail the session outright rather than producing a SOCKS
/// error reply.
pub async fn read_request<R>(reader: &mut R) -> Result<Socks5Request>
where
    R: AsyncReadExt + Unpin,
{
    let version = reader.read_u8().await?;
    let command = reader.read_u8().await?;
    let _reserved = reader.read_u8().await?;
    let atyp = reader.read_u8().await?;

    let address_type = match AddressType::from_repr(atyp) {
        Some(AddressType::Name) => AddressType::Name,
        Some(_) => {
            return Err(Error::new(
                ErrorKind::Unsupported,
                "address literals are not implemented",
            ));
        }
        None => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("invalid address type: {atyp}"),
            ));
        }
    };

    let name_len = reader.read_u8().await?;
    let mut name = vec![0; name_len as usize];
    reader.read_exact(&mut name).await?;
    let destination = String::from_utf8(name)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "domain is not utf8"))?;

    let port = reader.read_u16().await?;

    Ok(Socks5Request {
        version,
        command,
        address_type,
        destination,
        port,
    })
}

/// Converts a textual IP address into its wire bytes: 4 for IPv4,
/// 16 for IPv6 (eight groups packed big-endian). Malformed input is an
/// error, never a partial result.
pub fn ip_to_bytes(ip: &str) -> Result<Vec<u8>> {
    if ip.contains(':') {
        let addr: std::net::Ipv6Addr = ip
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("error parsing ip: {ip}")))?;
        let mut bytes = Vec::with_capacity(16);
        for group in addr.segments() {
            bytes.extend_from_slice(&group.to_be_bytes());
        }
        Ok(bytes)
    } else {
        let mut bytes = Vec::with_capacity(4);
        for part in ip.split('.') {
            let octet: u8 = part
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("error parsing ip: {ip}")))?;
            bytes.push(octet);
        }
        if bytes.len() != 4 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("error parsing ip: {ip}"),
            ));
        }
        Ok(bytes)
    }
}

/// Encodes the success reply announcing the proxy's egress identity,
/// taken from the outbound socket's locally-bound address.
pub fn encode_success_reply(bound: SocketAddr) -> Result<Vec<u8>> {
    let addr_bytes = ip_to_bytes(&bound.ip().to_string())?;
    let atyp = match bound.ip() {
        IpAddr::V4(_) => AddressType::Ipv4,
        IpAddr::V6(_) => AddressType::Ipv6,
    };

    let mut msg = ByteBuffer::new();
    msg.write_u8(SOCKS_VERSION);
    msg.write_u8(ReplyCode::Success as u8);
    msg.write_u8(0x00);
    msg.write_u8(atyp as u8);
    msg.write_bytes(&addr_bytes);
    msg.write_u16(bound.port());
    Ok(msg.into_vec())
}

/// Maps a network error onto the REP byte of the error reply. Total:
/// anything unrecognized degrades to a general failure.
pub fn reply_code_for(error: &Error) -> ReplyCode {
    match error.kind() {
        ErrorKind::HostUnreachable | ErrorKind::NotFound | ErrorKind::TimedOut => {
            ReplyCode::HostUnreachable
        }
        ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        _ => ReplyCode::GeneralFailure,
    }
}
