// Per-session state. One of these is created per accepted client.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::mpsc::Receiver;

use crate::config::get_config;
use crate::errors::Error;
use crate::messages::{error_message, PacketReader};
use crate::router::{Lease, Route, Router};
use crate::server::ServerParameters;

use super::startup::StartupRecord;

/// Unique id of a client session, rendered with a `c` prefix. Stable for
/// the session lifetime; its two halves double as the cancel key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub a: u32,
    pub b: u32,
}

impl ClientId {
    pub fn generate() -> ClientId {
        ClientId {
            a: rand::random(),
            b: rand::random(),
        }
    }

    /// The capability pair advertised in BackendKeyData. Fresh for every
    /// accepted session, never reused across server assignments.
    pub fn cancel_key(&self) -> (i32, i32) {
        (self.a as i32, self.b as i32)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{:08x}{:08x}", self.a, self.b)
    }
}

impl std::str::FromStr for ClientId {
    type Err = ();

    fn from_str(s: &str) -> Result<ClientId, ()> {
        let hex = s.strip_prefix('c').ok_or(())?;
        if hex.len() != 16 {
            return Err(());
        }
        let a = u32::from_str_radix(&hex[..8], 16).map_err(|_| ())?;
        let b = u32::from_str_radix(&hex[8..], 16).map_err(|_| ())?;
        Ok(ClientId { a, b })
    }
}

/// The one word the per-session notification channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Kill,
}

/// Terminal result of a session. Exactly one of these reaches the cleanup
/// dispatcher per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Session ended normally.
    Ok,
    /// An administrative kill arrived on the control channel.
    Kill,
    /// The client sent Terminate.
    Terminate,
    /// The router could not lease a server.
    AttachFailed,
    /// The upstream connect or its handshake failed.
    ServerConnectFailed,
    /// Deploy replies could not be consumed.
    ServerConfigureFailed,
    /// Read from the server socket failed.
    ServerReadFailed,
    /// Write to the server socket failed.
    ServerWriteFailed,
    /// Read from the client socket failed.
    ClientReadFailed,
    /// Write to the client socket failed.
    ClientWriteFailed,
    /// The client could not be configured during setup.
    ClientConfigureFailed,
}

/// The client state, generic over the transport (plain TCP or TLS).
pub struct Client<S> {
    /// Buffered client socket; reads go through the packet reader.
    pub(crate) io: BufStream<S>,

    pub(crate) chunks: PacketReader,

    pub(crate) addr: SocketAddr,

    pub(crate) id: ClientId,

    /// (key_pid, key) issued in BackendKeyData.
    pub(crate) key: (i32, i32),

    /// The parsed greeting.
    pub(crate) startup: StartupRecord,

    /// The session's running parameter state: startup parameters plus every
    /// ParameterStatus observed from servers.
    pub(crate) params: ServerParameters,

    /// Receiving end of the notification channel.
    pub(crate) control: Receiver<ControlOp>,
    pub(crate) control_closed: bool,

    pub(crate) router: Arc<Router>,

    /// Set after routing, dropped by cleanup.
    pub(crate) route: Option<Arc<Route>>,

    /// Exclusive server lease, present only while attached.
    pub(crate) server: Option<Lease>,

    pub(crate) accepted_at: quanta::Instant,

    /// Bytes written to the client since the last flush.
    pending_to_client: usize,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    pub(crate) fn new(
        stream: S,
        addr: SocketAddr,
        id: ClientId,
        startup: StartupRecord,
        control: Receiver<ControlOp>,
        router: Arc<Router>,
    ) -> Client<S> {
        Client {
            io: BufStream::new(stream),
            chunks: PacketReader::new(),
            addr,
            id,
            key: id.cancel_key(),
            startup,
            params: ServerParameters::new(),
            control,
            control_closed: false,
            router,
            route: None,
            server: None,
            accepted_at: quanta::Instant::now(),
            pending_to_client: 0,
        }
    }

    pub(crate) fn route(&self) -> &Arc<Route> {
        self.route.as_ref().expect("session is routed")
    }

    /// Error text in the canonical `pg_usher: <id>: <text>` form.
    pub(crate) fn error_text(&self, text: &str) -> String {
        format!("pg_usher: {}: {}", self.id, text)
    }

    /// Emit an error frame with the session-id prefix and flush it.
    pub(crate) async fn send_error(&mut self, code: &str, text: &str) -> Result<(), Error> {
        let frame = error_message(&self.error_text(text), code);
        self.io.write_all(&frame).await.map_err(Error::SocketWrite)?;
        self.io.flush().await.map_err(Error::SocketFlush)
    }

    /// Forward raw bytes to the client, flushing at message boundaries and
    /// at the configured batching threshold.
    pub(crate) async fn write_client(&mut self, data: &[u8], at_boundary: bool) -> Result<(), Error> {
        self.io.write_all(data).await.map_err(Error::SocketWrite)?;
        self.pending_to_client += data.len();
        let threshold = get_config().general.packet_write_queue;
        if at_boundary || self.pending_to_client >= threshold {
            self.io.flush().await.map_err(Error::SocketFlush)?;
            self.pending_to_client = 0;
        }
        Ok(())
    }

    /// Write a pre-built frame batch and flush it.
    pub(crate) async fn write_batch(&mut self, batch: &BytesMut) -> Result<(), Error> {
        self.io.write_all(batch).await.map_err(Error::SocketWrite)?;
        self.io.flush().await.map_err(Error::SocketFlush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_renders_and_parses() {
        let id = ClientId {
            a: 0x00000001,
            b: 0xdeadbeef,
        };
        let rendered = id.to_string();
        assert_eq!(rendered, "c00000001deadbeef");
        assert_eq!(rendered.parse::<ClientId>(), Ok(id));

        assert!("x00000001deadbeef".parse::<ClientId>().is_err());
        assert!("c123".parse::<ClientId>().is_err());
    }

    #[test]
    fn cancel_key_mirrors_the_id() {
        let id = ClientId {
            a: 0x80000000,
            b: 0x00000007,
        };
        let (pid, key) = id.cancel_key();
        assert_eq!(pid, 0x80000000u32 as i32);
        assert_eq!(key, 7);
    }
}
