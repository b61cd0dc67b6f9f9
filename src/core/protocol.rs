//! Trojan protocol parsing
//!
//! Implements the Trojan protocol format:
//! - 56-byte password (SHA224 hex encoded)
//! - CRLF
//! - Command (1 byte: CONNECT=1, UDP_ASSOCIATE=3)
//! - Address (ATYP + address + port)
//! - CRLF
//! - Payload
//!
//! The password line is consumed by the listener before anything here runs;
//! this module decodes everything after it straight from the connection.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::lookup_host;

use crate::error::ProtocolError;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

const CRLF: [u8; 2] = *b"\r\n";

const DNS_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Trojan command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrojanCmd {
    /// TCP connect
    Connect = 1,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for TrojanCmd {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TrojanCmd::Connect),
            3 => Ok(TrojanCmd::UdpAssociate),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }
}

impl std::fmt::Display for TrojanCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrojanCmd::Connect => write!(f, "tcp"),
            TrojanCmd::UdpAssociate => write!(f, "udp"),
        }
    }
}

/// Address types supported by Trojan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name, 1..=255 bytes
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => Address::IPv6(v6.ip().octets(), v6.port()),
        }
    }
}

impl Address {
    /// Read an address (type tag included) from the stream.
    ///
    /// The tag decides exactly how many bytes follow, so the reader is left
    /// on the first byte after the port.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        Self::read_body(atyp, r).await
    }

    /// Read the remainder of an address whose type tag was already consumed
    pub async fn read_body<R>(atyp: u8, r: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                r.read_exact(&mut ip).await?;
                let port = r.read_u16().await?;
                Ok(Address::IPv4(ip, port))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                r.read_exact(&mut ip).await?;
                let port = r.read_u16().await?;
                Ok(Address::IPv6(ip, port))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProtocolError::InvalidDomain);
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let port = r.read_u16().await?;
                let domain = String::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?;
                Ok(Address::Domain(domain, port))
            }
            other => Err(ProtocolError::InvalidAddressType(other)),
        }
    }

    /// Encode address to buffer
    /// Returns the number of bytes written
    ///
    /// A domain must be 1..=255 bytes to fit its length prefix; anything else
    /// fails with [`ProtocolError::InvalidDomain`] and leaves `buf` untouched.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        let start_len = buf.len();
        match self {
            Address::IPv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                let len = u8::try_from(domain.len())
                    .ok()
                    .filter(|&len| len > 0)
                    .ok_or(ProtocolError::InvalidDomain)?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(buf.len() - start_len)
    }

    /// Size of the wire encoding
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::IPv4(..) => 1 + 4 + 2,
            Address::IPv6(..) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Resolve to socket address
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(domain, port) => {
                let mut addrs =
                    tokio::time::timeout(DNS_RESOLVE_TIMEOUT, lookup_host((domain.as_str(), *port)))
                        .await
                        .map_err(|_| {
                            std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                format!("DNS resolution of {} timed out", domain),
                            )
                        })??;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

/// Read the two separator bytes and insist on CR LF
async fn read_crlf<R>(r: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut sep = [0u8; 2];
    r.read_exact(&mut sep).await?;
    if sep != CRLF {
        return Err(ProtocolError::MissingCrlf);
    }
    Ok(())
}

/// Trojan request header following the password line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    /// Command type
    pub cmd: TrojanCmd,
    /// Target address
    pub addr: Address,
}

impl TrojanRequest {
    /// Decode `command → address → CRLF` from the stream.
    ///
    /// The command byte is checked before the address is read, so an unknown
    /// command fails without consuming anything further. On success the
    /// reader is positioned at the first payload byte.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let cmd = TrojanCmd::try_from(r.read_u8().await?)?;
        let addr = Address::read_from(r).await?;
        read_crlf(r).await?;
        Ok(TrojanRequest { cmd, addr })
    }

    /// Encode the header (client side, used by tests and tooling)
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let start_len = buf.len();
        buf.push(self.cmd as u8);
        if let Err(e) = self.addr.encode(buf) {
            buf.truncate(start_len);
            return Err(e);
        }
        buf.extend_from_slice(&CRLF);
        Ok(())
    }
}

/// Trojan UDP packet format (within TCP stream)
///
/// Format: ATYP(1) + DST.ADDR(variable) + DST.PORT(2) + Length(2) + CRLF(2) + Payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanUdpPacket {
    /// Destination (outbound) or source (inbound) address
    pub addr: Address,
    /// Payload data
    pub payload: Bytes,
}

impl TrojanUdpPacket {
    /// Largest payload the 2-byte length field can describe
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    /// Read one frame from the stream.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub async fn read_from<R>(r: &mut R) -> Result<Option<Self>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = match r.read_u8().await {
            Ok(atyp) => atyp,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let addr = Address::read_body(atyp, r).await?;
        let len = r.read_u16().await? as usize;
        read_crlf(r).await?;

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;

        Ok(Some(TrojanUdpPacket {
            addr,
            payload: Bytes::from(payload),
        }))
    }

    /// Encode one frame
    ///
    /// Fails if `payload` exceeds [`Self::MAX_PAYLOAD`] or the address cannot
    /// be encoded.
    pub fn encode(addr: &Address, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
        let mut buf = Vec::with_capacity(addr.encoded_len() + 4 + payload.len());
        addr.encode(&mut buf)?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&CRLF);
        buf.extend_from_slice(payload);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(buf: &[u8]) -> Result<Address, ProtocolError> {
        let mut reader = buf;
        Address::read_from(&mut reader).await
    }

    #[test]
    fn test_trojan_cmd_try_from() {
        assert!(matches!(TrojanCmd::try_from(1), Ok(TrojanCmd::Connect)));
        assert!(matches!(TrojanCmd::try_from(3), Ok(TrojanCmd::UdpAssociate)));
        assert!(matches!(
            TrojanCmd::try_from(0),
            Err(ProtocolError::InvalidCommand(0))
        ));
        assert!(matches!(
            TrojanCmd::try_from(2),
            Err(ProtocolError::InvalidCommand(2))
        ));
        assert!(TrojanCmd::try_from(4).is_err());
    }

    #[tokio::test]
    async fn test_address_decode_ipv4() {
        let buf = [1, 192, 168, 1, 1, 0x1F, 0x90]; // 192.168.1.1:8080
        let addr = decode(&buf).await.unwrap();
        assert_eq!(addr, Address::IPv4([192, 168, 1, 1], 8080));
    }

    #[tokio::test]
    async fn test_address_decode_ipv6() {
        let mut buf = vec![4]; // ATYP_IPV6
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]); // ::1
        buf.extend_from_slice(&[0x01, 0xBB]); // port 443

        let addr = decode(&buf).await.unwrap();
        assert!(matches!(addr, Address::IPv6(_, 443)));
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_address_decode_domain() {
        let mut buf = vec![3, 11]; // ATYP_DOMAIN, length
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&[0x00, 0x50]); // port 80

        let addr = decode(&buf).await.unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 80));
    }

    #[tokio::test]
    async fn test_address_decode_does_not_over_read() {
        let mut buf = vec![1, 10, 0, 0, 1, 0, 53];
        buf.extend_from_slice(b"rest");
        let mut reader = &buf[..];

        let addr = Address::read_from(&mut reader).await.unwrap();
        assert_eq!(addr, Address::IPv4([10, 0, 0, 1], 53));
        assert_eq!(reader, b"rest");
    }

    #[tokio::test]
    async fn test_address_decode_truncated() {
        assert!(matches!(
            decode(&[1, 192, 168]).await,
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode(&[4, 0, 0, 0]).await,
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode(&[3, 11, b'e', b'x']).await,
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(decode(&[]).await, Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn test_address_decode_invalid() {
        assert!(matches!(
            decode(&[99, 0, 0, 0, 0, 0, 0]).await,
            Err(ProtocolError::InvalidAddressType(99))
        ));
        assert!(matches!(
            decode(&[3, 0, 0, 80]).await,
            Err(ProtocolError::InvalidDomain)
        ));
        assert!(matches!(
            decode(&[3, 2, 0xff, 0xfe, 0, 80]).await,
            Err(ProtocolError::InvalidDomain)
        ));
    }

    #[test]
    fn test_address_display() {
        let ipv4 = Address::IPv4([192, 168, 1, 1], 8080);
        assert_eq!(format!("{}", ipv4), "192.168.1.1:8080");

        let ipv6 = Address::IPv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443);
        assert_eq!(format!("{}", ipv6), "[::1]:443");

        let domain = Address::Domain("example.com".to_string(), 80);
        assert_eq!(format!("{}", domain), "example.com:80");
    }

    #[test]
    fn test_address_encode_domain() {
        let addr = Address::Domain("example.com".to_string(), 80);
        let mut buf = Vec::new();
        let len = addr.encode(&mut buf).unwrap();
        assert_eq!(len, 15); // 1 (atyp) + 1 (len) + 11 (domain) + 2 (port)
        assert_eq!(len, addr.encoded_len());
        assert_eq!(buf[0], 3); // ATYP_DOMAIN
        assert_eq!(buf[1], 11); // domain length
        assert_eq!(&buf[2..13], b"example.com");
        assert_eq!(buf[13..15], [0x00, 0x50]); // port 80
    }

    #[test]
    fn test_address_encode_rejects_unencodable_domain() {
        for domain in [String::new(), "x".repeat(256)] {
            let mut buf = vec![0xAA];
            let addr = Address::Domain(domain, 80);
            assert!(matches!(addr.encode(&mut buf), Err(ProtocolError::InvalidDomain)));
            assert_eq!(buf, [0xAA]);
        }

        let req = TrojanRequest {
            cmd: TrojanCmd::Connect,
            addr: Address::Domain("y".repeat(300), 443),
        };
        let mut buf = Vec::new();
        assert!(req.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_address_roundtrip_domain_length_bounds() {
        let addresses = vec![
            Address::IPv4([192, 168, 1, 1], 8080),
            Address::IPv6([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443),
            Address::Domain("a".to_string(), 1),
            Address::Domain("x".repeat(255), u16::MAX),
        ];

        for original in addresses {
            let mut buf = Vec::new();
            original.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), original.encoded_len());
            assert_eq!(decode(&buf).await.unwrap(), original);
        }
    }

    #[test]
    fn test_address_from_socket_addr() {
        let v4: SocketAddr = "8.8.8.8:53".parse().unwrap();
        assert_eq!(Address::from(v4), Address::IPv4([8, 8, 8, 8], 53));

        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        assert_eq!(Address::from(v6).to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_address_to_socket_addr_ipv4() {
        let addr = Address::IPv4([127, 0, 0, 1], 8080);
        let socket_addr = addr.to_socket_addr().await.unwrap();
        assert_eq!(socket_addr.to_string(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_address_to_socket_addr_domain() {
        let addr = Address::Domain("localhost".to_string(), 80);
        let result = addr.to_socket_addr().await;
        assert_eq!(result.unwrap().port(), 80);
    }

    #[tokio::test]
    async fn test_request_decode_connect() {
        let mut buf = vec![1]; // CONNECT
        buf.extend_from_slice(&[3, 7]);
        buf.extend_from_slice(b"a.b.com");
        buf.extend_from_slice(&[0x00, 0x50]);
        buf.extend_from_slice(b"\r\nGET /");
        let mut reader = &buf[..];

        let req = TrojanRequest::read_from(&mut reader).await.unwrap();
        assert_eq!(req.cmd, TrojanCmd::Connect);
        assert_eq!(req.addr, Address::Domain("a.b.com".to_string(), 80));
        // positioned at the first payload byte
        assert_eq!(reader, b"GET /");
    }

    #[tokio::test]
    async fn test_request_decode_udp_associate() {
        let req = TrojanRequest {
            cmd: TrojanCmd::UdpAssociate,
            addr: Address::IPv4([0, 0, 0, 0], 0),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();
        let mut reader = &buf[..];

        assert_eq!(TrojanRequest::read_from(&mut reader).await.unwrap(), req);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_request_decode_invalid_command_stops_early() {
        let buf = [2u8, 1, 127, 0, 0, 1, 0, 80, b'\r', b'\n'];
        let mut reader = &buf[..];

        let err = TrojanRequest::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(2)));
        // only the command byte was consumed
        assert_eq!(reader.len(), buf.len() - 1);
    }

    #[tokio::test]
    async fn test_request_decode_invalid_crlf() {
        let buf = [1u8, 1, 127, 0, 0, 1, 0, 80, b'\n', b'\r'];
        let mut reader = &buf[..];
        assert!(matches!(
            TrojanRequest::read_from(&mut reader).await,
            Err(ProtocolError::MissingCrlf)
        ));
    }

    #[tokio::test]
    async fn test_request_decode_truncated() {
        let buf = [1u8, 1, 127, 0];
        let mut reader = &buf[..];
        assert!(matches!(
            TrojanRequest::read_from(&mut reader).await,
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_trojan_udp_packet_encode() {
        let addr = Address::IPv4([8, 8, 8, 8], 53);
        let encoded = TrojanUdpPacket::encode(&addr, b"hello").unwrap();

        assert_eq!(encoded[0], 1); // ATYP_IPV4
        assert_eq!(&encoded[1..5], &[8, 8, 8, 8]); // IP
        assert_eq!(&encoded[5..7], &[0x00, 0x35]); // port 53
        assert_eq!(&encoded[7..9], &[0x00, 0x05]); // length 5
        assert_eq!(&encoded[9..11], b"\r\n"); // CRLF
        assert_eq!(&encoded[11..], b"hello"); // payload
    }

    #[test]
    fn test_trojan_udp_packet_encode_limits() {
        let addr = Address::IPv4([8, 8, 8, 8], 53);
        let max = vec![0u8; TrojanUdpPacket::MAX_PAYLOAD];
        let encoded = TrojanUdpPacket::encode(&addr, &max).unwrap();
        assert_eq!(&encoded[7..9], &[0xFF, 0xFF]);

        let oversized = vec![0u8; TrojanUdpPacket::MAX_PAYLOAD + 1];
        assert!(matches!(
            TrojanUdpPacket::encode(&addr, &oversized),
            Err(ProtocolError::PayloadTooLarge(65536))
        ));
        assert!(matches!(
            TrojanUdpPacket::encode(&Address::Domain("z".repeat(256), 53), b"x"),
            Err(ProtocolError::InvalidDomain)
        ));
    }

    #[tokio::test]
    async fn test_trojan_udp_packet_read_multiple() {
        let mut buf = TrojanUdpPacket::encode(&Address::IPv4([1, 1, 1, 1], 53), b"first").unwrap();
        buf.extend(
            TrojanUdpPacket::encode(&Address::Domain("dns.com".to_string(), 53), b"second")
                .unwrap(),
        );
        let mut reader = &buf[..];

        let p1 = TrojanUdpPacket::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(p1.addr, Address::IPv4([1, 1, 1, 1], 53));
        assert_eq!(p1.payload.as_ref(), b"first");

        let p2 = TrojanUdpPacket::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(p2.addr, Address::Domain("dns.com".to_string(), 53));
        assert_eq!(p2.payload.as_ref(), b"second");

        // clean end on a frame boundary
        assert!(TrojanUdpPacket::read_from(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trojan_udp_packet_read_errors() {
        // payload shorter than announced
        let mut buf = vec![1, 8, 8, 8, 8, 0x00, 0x35, 0x00, 0x10];
        buf.extend_from_slice(b"\r\nshort");
        let mut reader = &buf[..];
        assert!(matches!(
            TrojanUdpPacket::read_from(&mut reader).await,
            Err(ProtocolError::Truncated)
        ));

        // separator in the wrong order
        let mut buf = vec![1, 8, 8, 8, 8, 0x00, 0x35, 0x00, 0x05];
        buf.extend_from_slice(b"\n\rhello");
        let mut reader = &buf[..];
        assert!(matches!(
            TrojanUdpPacket::read_from(&mut reader).await,
            Err(ProtocolError::MissingCrlf)
        ));
    }

    #[tokio::test]
    async fn test_trojan_udp_packet_empty_payload() {
        let addr = Address::IPv4([127, 0, 0, 1], 8080);
        let encoded = TrojanUdpPacket::encode(&addr, b"").unwrap();
        let mut reader = &encoded[..];

        let packet = TrojanUdpPacket::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(packet.addr, addr);
        assert!(packet.payload.is_empty());
    }
}
