//! Byte-stream primitives over a shared `&TcpStream`.
//!
//! Every helper takes the stream by shared reference, which lets the two relay
//! pumps of a session read one socket while writing the other without splitting
//! them. A peer that closes mid-message surfaces as [`Error::PeerClosed`], any
//! other failure as [`Error::Io`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Opens a TCP connection, giving up after `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::ConnectTimeout(addr)),
    }
}

/// Reads whatever is available, up to `buf.len()` bytes. `Ok(0)` means EOF.
pub async fn read_some(stream: &TcpStream, buf: &mut [u8]) -> Result<usize> {
    loop {
        stream.readable().await?;

        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }
}

/// Fills `buf` completely.
pub async fn read_exact(stream: &TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        match read_some(stream, &mut buf[offset..]).await? {
            0 => return Err(Error::PeerClosed),
            n => offset += n,
        }
    }
    Ok(())
}

/// Reads one byte at a time until `delimiter` or until `buf` is full.
///
/// Returns the number of bytes before the delimiter, which is consumed but not
/// stored, or `None` when `buf.len()` bytes went by without one. Nothing past
/// the delimiter is pulled off the socket.
pub async fn read_until(
    stream: &TcpStream,
    delimiter: u8,
    buf: &mut [u8],
) -> Result<Option<usize>> {
    for offset in 0..buf.len() {
        read_exact(stream, &mut buf[offset..offset + 1]).await?;
        if buf[offset] == delimiter {
            return Ok(Some(offset));
        }
    }
    Ok(None)
}

/// Writes all of `buf`.
pub async fn write_all(stream: &TcpStream, buf: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        stream.writable().await?;

        match stream.try_write(&buf[offset..]) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => {
                offset += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn read_until_stops_at_delimiter() {
        let (mut writer, reader) = pair().await;
        writer.write_all(b"alice\0payload").await.unwrap();

        let mut buf = [0u8; 16];
        let n = read_until(&reader, 0, &mut buf).await.unwrap();
        assert_eq!(n, Some(5));
        assert_eq!(&buf[..5], b"alice");

        let mut rest = [0u8; 7];
        read_exact(&reader, &mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn read_until_gives_up_at_limit() {
        let (mut writer, reader) = pair().await;
        writer.write_all(b"abcdef").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(read_until(&reader, 0, &mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_exact_reports_peer_close() {
        let (mut writer, reader) = pair().await;
        writer.write_all(b"abc").await.unwrap();
        drop(writer);

        let mut buf = [0u8; 8];
        assert!(matches!(
            read_exact(&reader, &mut buf).await,
            Err(Error::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn connect_refused_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
