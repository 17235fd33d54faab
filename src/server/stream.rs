use std::mem::MaybeUninit;

use pin_project_lite::pin_project;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::errors::Error;
use crate::messages::configure_tcp_socket;

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        Tcp {
            #[pin]
            stream: TcpStream,
        },
        Unix {
            #[pin]
            stream: UnixStream,
        },
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_flush(cx),
            StreamInnerProj::Unix { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Unix { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl StreamInner {
    /// Half-open probe for an idle pooled connection. The socket is
    /// non-blocking, so a peek either returns queued bytes, would-block
    /// (healthy and quiet), or reports the peer gone.
    pub fn is_closed(&self) -> bool {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1];
        let res = match self {
            StreamInner::Tcp { stream } => SockRef::from(stream).peek(&mut buf),
            StreamInner::Unix { stream } => SockRef::from(stream).peek(&mut buf),
        };
        match res {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

/// Dial the upstream for a route. Hosts starting with `/` are treated as
/// PostgreSQL unix socket directories.
pub(crate) async fn connect_stream(host: &str, port: u16) -> Result<StreamInner, Error> {
    if host.starts_with('/') {
        let path = format!("{host}/.s.PGSQL.{port}");
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|err| Error::SocketConnect(path, err))?;
        Ok(StreamInner::Unix { stream })
    } else {
        let address = format!("{host}:{port}");
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|err| Error::SocketConnect(address, err))?;
        configure_tcp_socket(&stream);
        Ok(StreamInner::Tcp { stream })
    }
}
