use std::io;
use std::net::SocketAddr;

use crate::protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("SOCKS4 supports IPv4 only, got {0}")]
    UnsupportedAddress(SocketAddr),
    #[error("request for {target} rejected with status {status}")]
    Rejected { target: SocketAddr, status: u8 },
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
