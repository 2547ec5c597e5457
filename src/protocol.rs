//! SOCKS4 wire format.
//!
//! ```text
//! request:  | VN | CD | DSTPORT |   DSTIP   | USERID ... | NUL |
//!              1    1      2          4        variable     1
//! reply:    | VN | CD | DSTPORT |   DSTIP   |
//!              1    1      2          4
//! ```
//!
//! All multi-byte fields are big-endian. Nothing in this module performs I/O.

use std::net::{Ipv4Addr, SocketAddrV4};

pub const PROTOCOL_VERSION: u8 = 0x04;
pub const REPLY_VERSION: u8 = 0x00;

pub const PROXY_CMD_CONNECT: u8 = 0x01;
// pub const PROXY_CMD_BIND: u8 = 0x02;

/// Fixed part of a request: version, command, port and address.
pub const REQUEST_HEADER_SIZE: usize = 1 + 1 + 2 + 4;
pub const REPLY_SIZE: usize = 8;

/// Upper bound on the user id, terminating NUL included.
pub const MAX_USERID_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message truncated")]
    Truncated,
    #[error("invalid SOCKS version: 0x{0:02x}")]
    InvalidVersion(u8),
    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),
    #[error("user id exceeds 1024 bytes")]
    UserIdTooLong,
    #[error("user id contains a NUL byte")]
    UserIdContainsNul,
    #[error("invalid reply version: 0x{0:02x}")]
    InvalidReplyVersion(u8),
    #[error("unknown reply status: {0}")]
    UnknownStatus(u8),
}

/// Status byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Granted = 90,
    Rejected = 91,
    IdentdUnreachable = 92,
    IdentdMismatch = 93,
}

impl ReplyCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            90 => Some(ReplyCode::Granted),
            91 => Some(ReplyCode::Rejected),
            92 => Some(ReplyCode::IdentdUnreachable),
            93 => Some(ReplyCode::IdentdMismatch),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A fully decoded CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub destination: SocketAddrV4,
    pub user_id: String,
}

/// Decodes the fixed 8-byte header and returns the requested destination.
pub fn parse_header(header: &[u8]) -> Result<SocketAddrV4, ProtocolError> {
    if header.len() < REQUEST_HEADER_SIZE {
        return Err(ProtocolError::Truncated);
    }
    if header[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::InvalidVersion(header[0]));
    }
    if header[1] != PROXY_CMD_CONNECT {
        return Err(ProtocolError::UnsupportedCommand(header[1]));
    }

    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Decodes a complete request held in memory: header, user id and terminator.
pub fn parse_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let destination = parse_header(bytes)?;
    let rest = &bytes[REQUEST_HEADER_SIZE..];

    let window = &rest[..rest.len().min(MAX_USERID_SIZE)];
    match window.iter().position(|&b| b == 0) {
        Some(end) => Ok(Request {
            destination,
            user_id: decode_user_id(&window[..end]),
        }),
        None if rest.len() >= MAX_USERID_SIZE => Err(ProtocolError::UserIdTooLong),
        None => Err(ProtocolError::Truncated),
    }
}

/// Encodes a CONNECT request for `destination` on behalf of `user_id`.
pub fn build_connect_request(
    destination: SocketAddrV4,
    user_id: &str,
) -> Result<Vec<u8>, ProtocolError> {
    if user_id.len() >= MAX_USERID_SIZE {
        return Err(ProtocolError::UserIdTooLong);
    }
    if user_id.as_bytes().contains(&0) {
        return Err(ProtocolError::UserIdContainsNul);
    }

    let mut request = Vec::with_capacity(REQUEST_HEADER_SIZE + user_id.len() + 1);
    request.push(PROTOCOL_VERSION);
    request.push(PROXY_CMD_CONNECT);
    request.extend_from_slice(&destination.port().to_be_bytes());
    request.extend_from_slice(&destination.ip().octets());
    request.extend_from_slice(user_id.as_bytes());
    request.push(0);
    Ok(request)
}

/// Encodes a reply. Port and address are only meaningful for BIND and stay zero.
pub fn build_reply(code: ReplyCode) -> [u8; REPLY_SIZE] {
    let mut reply = [0u8; REPLY_SIZE];
    reply[0] = REPLY_VERSION;
    reply[1] = code.as_u8();
    reply
}

pub fn parse_reply(reply: &[u8]) -> Result<ReplyCode, ProtocolError> {
    if reply.len() < REPLY_SIZE {
        return Err(ProtocolError::Truncated);
    }
    if reply[0] != REPLY_VERSION {
        return Err(ProtocolError::InvalidReplyVersion(reply[0]));
    }
    ReplyCode::from_u8(reply[1]).ok_or(ProtocolError::UnknownStatus(reply[1]))
}

pub(crate) fn decode_user_id(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn request_round_trip() {
        for (dest, user) in [
            ("127.0.0.1:80", ""),
            ("10.1.2.3:65535", "alice"),
            ("0.0.0.0:0", "bob"),
            ("255.255.255.255:1", "\u{00e9}t\u{00e9}"),
        ] {
            let bytes = build_connect_request(addr(dest), user).unwrap();
            let request = parse_request(&bytes).unwrap();
            assert_eq!(request.destination, addr(dest));
            assert_eq!(request.user_id, user);
            assert_eq!(parse_header(&bytes[..REQUEST_HEADER_SIZE]).unwrap(), addr(dest));
        }
    }

    #[test]
    fn request_layout_is_big_endian() {
        let bytes = build_connect_request(addr("192.168.0.1:8080"), "u").unwrap();
        assert_eq!(bytes, [4, 1, 0x1f, 0x90, 192, 168, 0, 1, b'u', 0]);
    }

    #[test]
    fn header_rejects_wrong_version_and_command() {
        assert_eq!(
            parse_header(&[5, 1, 0, 80, 127, 0, 0, 1]),
            Err(ProtocolError::InvalidVersion(5))
        );
        assert_eq!(
            parse_header(&[4, 2, 0, 80, 127, 0, 0, 1]),
            Err(ProtocolError::UnsupportedCommand(2))
        );
        assert_eq!(parse_header(&[4, 1, 0]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn user_id_limits() {
        let max = "x".repeat(MAX_USERID_SIZE - 1);
        let bytes = build_connect_request(addr("1.2.3.4:5"), &max).unwrap();
        assert_eq!(parse_request(&bytes).unwrap().user_id, max);

        let long = "x".repeat(MAX_USERID_SIZE);
        assert_eq!(
            build_connect_request(addr("1.2.3.4:5"), &long),
            Err(ProtocolError::UserIdTooLong)
        );

        let mut unterminated = vec![4, 1, 0, 5, 1, 2, 3, 4];
        unterminated.extend(std::iter::repeat(b'x').take(MAX_USERID_SIZE));
        assert_eq!(parse_request(&unterminated), Err(ProtocolError::UserIdTooLong));

        assert_eq!(
            parse_request(&[4, 1, 0, 5, 1, 2, 3, 4, b'a']),
            Err(ProtocolError::Truncated)
        );
        assert_eq!(
            build_connect_request(addr("1.2.3.4:5"), "a\0b"),
            Err(ProtocolError::UserIdContainsNul)
        );
    }

    #[test]
    fn reply_encoding() {
        assert_eq!(build_reply(ReplyCode::Granted), [0, 90, 0, 0, 0, 0, 0, 0]);
        assert_eq!(build_reply(ReplyCode::Rejected), [0, 91, 0, 0, 0, 0, 0, 0]);
        assert_eq!(parse_reply(&[0, 90, 0, 0, 0, 0, 0, 0]), Ok(ReplyCode::Granted));
        assert_eq!(parse_reply(&[0, 93, 1, 2, 3, 4, 5, 6]), Ok(ReplyCode::IdentdMismatch));
        assert_eq!(
            parse_reply(&[4, 90, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::InvalidReplyVersion(4))
        );
        assert_eq!(
            parse_reply(&[0, 17, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownStatus(17))
        );
    }
}
