//! Errors.

use std::io;

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read from socket")]
    SocketRead(#[source] io::Error),
    #[error("failed to write to socket")]
    SocketWrite(#[source] io::Error),
    #[error("failed to flush socket")]
    SocketFlush(#[source] io::Error),
    #[error("failed to connect to {0}")]
    SocketConnect(String, #[source] io::Error),
    #[error("client sent an invalid startup packet")]
    ClientBadStartup,
    #[error("protocol desync: {0}")]
    ProtocolSync(String),
    #[error("startup of server connection to {server} failed: {message}")]
    ServerStartup { server: String, message: String },
    #[error("authentication on server {server} failed: {message}")]
    ServerAuth { server: String, message: String },
    #[error("password authentication failed for user {0:?}")]
    ClientAuth(String),
    #[error("TLS negotiation failed")]
    Tls(#[from] native_tls::Error),
    #[error("invalid configuration: {0}")]
    BadConfig(String),
    #[error("route for {0:?} is not found")]
    NoRoute(String),
    #[error("route connection limit reached")]
    RouteLimit,
    #[error("client routing failed")]
    RouteFailed,
    #[error("timed out waiting for a pooled server connection")]
    PoolWaitTimeout,
    #[error("server pool is shut down")]
    PoolClosed,
    #[error("server connection is not established")]
    ServerNotConnected,
}

impl Error {
    /// True for errors raised by a peer disappearing rather than by a bug on
    /// our side. Used to pick the log level on disconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::SocketRead(_) | Error::SocketWrite(_) | Error::SocketFlush(_)
        )
    }
}
