// Socket-level helpers shared by the client and server sides.

use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::Error;

/// Write an entire buffer without flushing.
pub async fn write_all<S>(stream: &mut S, bytes: &[u8]) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    stream.write_all(bytes).await.map_err(Error::SocketWrite)
}

/// Write an entire buffer and flush it to the peer.
pub async fn write_all_flush<S>(stream: &mut S, bytes: &[u8]) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    stream.write_all(bytes).await.map_err(Error::SocketWrite)?;
    stream.flush().await.map_err(Error::SocketFlush)
}

/// Read a password response from the client.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let code = stream.read_u8().await.map_err(Error::SocketRead)?;
    if code != b'p' {
        return Err(Error::ProtocolSync(format!(
            "expected a password message (p), received '{}'",
            code as char
        )));
    }

    let len = stream.read_i32().await.map_err(Error::SocketRead)?;
    if !(4..=8 * 1024).contains(&len) {
        return Err(Error::ProtocolSync(format!(
            "password message has unreasonable length {len}"
        )));
    }

    let mut password = vec![0u8; (len - 4) as usize];
    stream
        .read_exact(&mut password)
        .await
        .map_err(Error::SocketRead)?;

    Ok(password)
}

/// Tune an accepted or dialed TCP socket for the request/response traffic we
/// carry. Failures are not fatal, the connection works without the options.
pub fn configure_tcp_socket(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!("Can't set TCP_NODELAY: {err:?}");
    }
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(err) = sock_ref.set_keepalive(true) {
        warn!("Can't set SO_KEEPALIVE: {err:?}");
    }
}
