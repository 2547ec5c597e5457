//! Client side: tunnelling through a chain of SOCKS4 proxies.
//!
//! A single TCP connection is opened to the first hop. Every later hop, and
//! finally the destination, is reached with one more CONNECT handshake sent
//! through the tunnel built so far. Each handshake presents the user id of the
//! hop *before* the one being requested.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::{self, ReplyCode, REPLY_SIZE};
use crate::transport;

/// One proxy in a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHop {
    pub endpoint: SocketAddr,
    pub user_id: String,
}

impl ProxyHop {
    pub fn new(endpoint: SocketAddr, user_id: impl Into<String>) -> Self {
        ProxyHop {
            endpoint,
            user_id: user_id.into(),
        }
    }
}

/// Performs one CONNECT handshake for `target` over an established stream.
pub async fn handshake<S>(stream: &mut S, target: SocketAddr, user_id: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let destination = match target {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => return Err(Error::UnsupportedAddress(target)),
    };

    let request = protocol::build_connect_request(destination, user_id)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; REPLY_SIZE];
    if let Err(e) = stream.read_exact(&mut reply).await {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::PeerClosed,
            _ => e.into(),
        });
    }

    match protocol::parse_reply(&reply)? {
        ReplyCode::Granted => Ok(()),
        code => Err(Error::Rejected {
            target,
            status: code.as_u8(),
        }),
    }
}

/// Connects to `destination` through `hops`, or directly if there are none.
pub async fn connect_chain(hops: &[ProxyHop], destination: SocketAddr) -> Result<TcpStream> {
    let first = match hops.first() {
        Some(hop) => hop.endpoint,
        None => destination,
    };
    let stream = TcpStream::connect(first).await?;
    traverse(stream, hops, destination).await
}

/// Like [`connect_chain`], with the initial TCP connect bounded by `timeout`.
pub async fn connect_chain_with_timeout(
    hops: &[ProxyHop],
    destination: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream> {
    let first = match hops.first() {
        Some(hop) => hop.endpoint,
        None => destination,
    };
    let stream = transport::connect(first, timeout).await?;
    traverse(stream, hops, destination).await
}

async fn traverse(
    mut stream: TcpStream,
    hops: &[ProxyHop],
    destination: SocketAddr,
) -> Result<TcpStream> {
    let Some((mut previous, rest)) = hops.split_first() else {
        return Ok(stream);
    };

    for hop in rest {
        debug!("chain: {} -> {}", previous.endpoint, hop.endpoint);
        handshake(&mut stream, hop.endpoint, &previous.user_id).await?;
        previous = hop;
    }

    debug!("chain: {} -> {}", previous.endpoint, destination);
    handshake(&mut stream, destination, &previous.user_id).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_sends_request_and_accepts_grant() {
        let (mut client, mut proxy) = duplex(64);
        let target: SocketAddr = "10.0.0.1:443".parse().unwrap();

        let server = tokio::spawn(async move {
            let mut request = [0u8; 12];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[0, 90, 0, 0, 0, 0, 0, 0]).await.unwrap();
            request
        });

        handshake(&mut client, target, "bob").await.unwrap();
        assert_eq!(
            server.await.unwrap(),
            [4, 1, 0x01, 0xbb, 10, 0, 0, 1, b'b', b'o', b'b', 0]
        );
    }

    #[tokio::test]
    async fn handshake_reports_rejection() {
        let (mut client, mut proxy) = duplex(64);
        let target: SocketAddr = "10.0.0.1:443".parse().unwrap();

        tokio::spawn(async move {
            let mut request = [0u8; 9];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[0, 91, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let err = handshake(&mut client, target, "").await.unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 91, .. }));
    }

    #[tokio::test]
    async fn handshake_checks_reply_version() {
        let (mut client, mut proxy) = duplex(64);
        let target: SocketAddr = "10.0.0.1:443".parse().unwrap();

        tokio::spawn(async move {
            let mut request = [0u8; 9];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[4, 90, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let err = handshake(&mut client, target, "").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(protocol::ProtocolError::InvalidReplyVersion(4))
        ));
    }

    #[tokio::test]
    async fn handshake_refuses_ipv6_targets() {
        let (mut client, _proxy) = duplex(64);
        let target: SocketAddr = "[::1]:80".parse().unwrap();

        let err = handshake(&mut client, target, "").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddress(_)));
    }
}
