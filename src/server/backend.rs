// Upstream server connection and its protocol state.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::time::timeout;

use crate::client::ClientId;
use crate::config::get_config;
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{
    md5_hash_password, password_message, simple_query, startup_message, write_all_flush, Chunk,
    PacketReader, PgErrorMsg,
};
use crate::router::Route;

use super::parameters::ServerParameters;
use super::stream::{connect_stream, StreamInner};

/// How long `reset` waits for outstanding replies before giving the
/// connection up as unsalvageable.
const RESET_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique id of a server connection, rendered with an `s` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub a: u32,
    pub b: u32,
}

impl ServerId {
    pub fn generate() -> ServerId {
        ServerId {
            a: rand::random(),
            b: rand::random(),
        }
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{:08x}{:08x}", self.a, self.b)
    }
}

/// What the relay got from the server socket on one readiness turn.
pub(crate) enum ServerTurn {
    /// A whole message consumed while deploy replies are being discarded.
    Deploy(BytesMut),
    /// A chunk to forward to the client.
    Chunk(Chunk),
}

/// One upstream connection. Owned by a route pool, leased to at most one
/// session at a time.
#[derive(Debug)]
pub struct Server {
    pub(crate) id: ServerId,

    /// None until the first attach connects this slot.
    pub(crate) stream: Option<BufStream<StreamInner>>,

    pub(crate) chunks: PacketReader,

    /// Parameters the server reported, kept current so a deploy can diff
    /// against them.
    pub(crate) params: ServerParameters,

    /// Backend key of the upstream connection, used for upstream cancels.
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,

    /// Is the server inside a transaction block.
    pub(crate) is_transaction: bool,

    /// Is the server in copy-in or copy-out mode.
    pub(crate) is_copy: bool,

    /// ReadyForQuery replies still to be discarded after a deploy write.
    pub(crate) deploy_sync: u32,

    /// ReadyForQuery replies outstanding for synchronous commands.
    pub(crate) sync_requests: u32,

    /// Last session that configured this connection. A warm reuse by the
    /// same session skips the deploy.
    pub(crate) last_client_id: Option<ClientId>,

    /// Complete ErrorResponse frame from a failed startup, forwarded to the
    /// client verbatim when the route allows it.
    pub(crate) error_connect: Option<BytesMut>,

    /// Running query timer, armed on every first-chunk forward.
    pub(crate) query_started: Option<quanta::Instant>,

    /// Bytes written since the last flush, for batched forwarding.
    pending_bytes: usize,

    connected_at: Option<chrono::NaiveDateTime>,
}

impl Server {
    /// A pool slot without an upstream connection yet.
    pub fn vacant() -> Server {
        Server {
            id: ServerId::generate(),
            stream: None,
            chunks: PacketReader::new(),
            params: ServerParameters::new(),
            process_id: 0,
            secret_key: 0,
            is_transaction: false,
            is_copy: false,
            deploy_sync: 0,
            sync_requests: 0,
            last_client_id: None,
            error_connect: None,
            query_started: None,
            pending_bytes: 0,
            connected_at: None,
        }
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Half-open probe; only meaningful for an idle connection.
    pub fn is_closed(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.get_ref().is_closed(),
            None => true,
        }
    }

    /// Pretend to be a client and connect to the route's upstream server.
    /// Performs the startup handshake and leaves the connection ready for
    /// query. The first successful startup seeds the route parameter cache.
    pub async fn connect(&mut self, route: &Route) -> Result<(), Error> {
        let config = get_config();
        let server_display = format!("{}:{}", route.server_host, route.server_port);

        let mut stream = match timeout(
            config.general.connect_timeout(),
            connect_stream(&route.server_host, route.server_port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(Error::ServerStartup {
                    server: server_display,
                    message: "connect timed out".into(),
                })
            }
        };

        let (username, password) = route.user.server_credentials();

        write_all_flush(
            &mut stream,
            &startup_message(username, &route.server_database, &route.application_name),
        )
        .await?;

        let mut params = ServerParameters::new();
        let mut process_id: i32 = 0;
        let mut secret_key: i32 = 0;

        loop {
            let code = stream.read_u8().await.map_err(Error::SocketRead)?;
            let len = stream.read_i32().await.map_err(Error::SocketRead)?;
            if !(4..=64 * 1024).contains(&len) {
                return Err(Error::ServerStartup {
                    server: server_display,
                    message: format!("message '{}' with length {} during startup", code as char, len),
                });
            }

            match code {
                AUTHENTICATION => {
                    let auth_code = stream.read_i32().await.map_err(Error::SocketRead)?;
                    match auth_code {
                        AUTHENTICATION_SUCCESSFUL => (),

                        AUTHENTICATION_CLEAR_PASSWORD => {
                            let Some(password) = password else {
                                return Err(Error::ServerAuth {
                                    server: server_display,
                                    message: "server wants a password, but none is configured"
                                        .into(),
                                });
                            };
                            let mut response = password.as_bytes().to_vec();
                            response.push(0);
                            write_all_flush(&mut stream, &password_message(&response)).await?;
                        }

                        MD5_ENCRYPTED_PASSWORD => {
                            let Some(password) = password else {
                                return Err(Error::ServerAuth {
                                    server: server_display,
                                    message: "server wants md5 auth, but no password is configured"
                                        .into(),
                                });
                            };
                            let mut salt = [0u8; 4];
                            stream
                                .read_exact(&mut salt)
                                .await
                                .map_err(Error::SocketRead)?;
                            let hash = md5_hash_password(username, password, &salt);
                            write_all_flush(&mut stream, &password_message(&hash)).await?;
                        }

                        _ => {
                            return Err(Error::ServerAuth {
                                server: server_display,
                                message: format!("unsupported authentication code {auth_code}"),
                            });
                        }
                    }
                }

                ERROR_RESPONSE => {
                    let mut body = vec![0u8; (len - 4) as usize];
                    stream
                        .read_exact(&mut body)
                        .await
                        .map_err(Error::SocketRead)?;

                    // Keep the complete frame so a route with forwarding
                    // enabled can relay it untouched.
                    let mut frame = BytesMut::with_capacity(body.len() + 5);
                    frame.put_u8(ERROR_RESPONSE);
                    frame.put_i32(len);
                    frame.put_slice(&body);

                    let message = match PgErrorMsg::parse(&body) {
                        Ok(parsed) => {
                            error!(
                                "Server {server_display} refused startup: {} {}: {}",
                                parsed.severity, parsed.code, parsed.message
                            );
                            parsed.message
                        }
                        Err(_) => "unreadable error response".to_string(),
                    };

                    self.error_connect = Some(frame);
                    return Err(Error::ServerStartup {
                        server: server_display,
                        message,
                    });
                }

                NOTICE_RESPONSE => {
                    let mut body = vec![0u8; (len - 4) as usize];
                    stream
                        .read_exact(&mut body)
                        .await
                        .map_err(Error::SocketRead)?;
                    if let Ok(parsed) = PgErrorMsg::parse(&body) {
                        info!(
                            "Server {server_display} startup notice: {} {}: {}",
                            parsed.severity, parsed.code, parsed.message
                        );
                    }
                }

                PARAMETER_STATUS => {
                    let mut body = vec![0u8; (len - 4) as usize];
                    stream
                        .read_exact(&mut body)
                        .await
                        .map_err(Error::SocketRead)?;
                    let mut split = body.split(|b| *b == 0);
                    let key = split.next().unwrap_or_default();
                    let value = split.next().unwrap_or_default();
                    params.set_param(
                        String::from_utf8_lossy(key).to_string(),
                        String::from_utf8_lossy(value).to_string(),
                        true,
                    );
                }

                BACKEND_KEY_DATA => {
                    process_id = stream.read_i32().await.map_err(Error::SocketRead)?;
                    secret_key = stream.read_i32().await.map_err(Error::SocketRead)?;
                }

                READY_FOR_QUERY => {
                    let mut state = [0u8; 1];
                    stream
                        .read_exact(&mut state)
                        .await
                        .map_err(Error::SocketRead)?;

                    self.stream = Some(BufStream::new(stream));
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                    self.is_transaction = false;
                    self.is_copy = false;
                    self.deploy_sync = 0;
                    self.sync_requests = 0;
                    self.last_client_id = None;
                    self.error_connect = None;
                    self.connected_at = Some(chrono::offset::Utc::now().naive_utc());

                    // First successful startup on a route fixes the
                    // advertised parameter set for every later session.
                    route.seed_params(&params);
                    self.params = params;

                    debug!(
                        "Server {} connected to {server_display} as backend [{}]",
                        self.id, self.process_id
                    );
                    return Ok(());
                }

                _ => {
                    return Err(Error::ProtocolSync(format!(
                        "unexpected message '{}' during server startup",
                        code as char
                    )));
                }
            }
        }
    }

    /// Forward one chunk, flushing at message boundaries and at the
    /// configured batching threshold.
    pub(crate) async fn forward(
        &mut self,
        data: &[u8],
        at_boundary: bool,
        flush_threshold: usize,
    ) -> Result<(), Error> {
        let Some(io) = self.stream.as_mut() else {
            return Err(Error::ServerNotConnected);
        };
        io.write_all(data).await.map_err(Error::SocketWrite)?;
        self.pending_bytes += data.len();
        if at_boundary || self.pending_bytes >= flush_threshold {
            io.flush().await.map_err(Error::SocketFlush)?;
            self.pending_bytes = 0;
        }
        Ok(())
    }

    /// One readiness turn of the relay: while deploy replies are pending,
    /// whole messages are consumed for the deploy-ack path; afterwards the
    /// socket is drained chunk-wise.
    pub(crate) async fn relay_read(&mut self) -> Result<ServerTurn, Error> {
        let Some(io) = self.stream.as_mut() else {
            return Err(Error::ServerNotConnected);
        };
        if self.deploy_sync > 0 {
            let message = self.chunks.read_message(io).await?;
            Ok(ServerTurn::Deploy(message))
        } else {
            let chunk = self.chunks.read_chunk(io).await?;
            Ok(ServerTurn::Chunk(chunk))
        }
    }

    /// Account for `count` synchronous commands whose ReadyForQuery replies
    /// are still outstanding.
    pub(crate) fn sync_request(&mut self, count: u32) {
        self.sync_requests += count;
    }

    /// Apply a ReadyForQuery state byte.
    pub(crate) fn ready(&mut self, state: u8) -> Result<(), Error> {
        match state {
            b'I' => self.is_transaction = false,
            b'T' | b'E' => self.is_transaction = true,
            _ => {
                return Err(Error::ProtocolSync(format!(
                    "unknown transaction state '{}' from server {}",
                    state as char, self.id
                )));
            }
        }
        self.sync_requests = self.sync_requests.saturating_sub(1);
        Ok(())
    }

    /// Feed one reply to the deploy-ack consumer. Every message is
    /// discarded; a ReadyForQuery also decrements the deploy counter.
    pub(crate) fn deploy_consume(&mut self, message: &BytesMut) -> Result<(), Error> {
        match message.first().copied() {
            Some(READY_FOR_QUERY) => {
                let state = *message.get(5).ok_or_else(|| {
                    Error::ProtocolSync("truncated ReadyForQuery in deploy reply".into())
                })?;
                self.ready(state)?;
                self.deploy_sync = self.deploy_sync.saturating_sub(1);
            }
            Some(ERROR_RESPONSE) => {
                if let Ok(parsed) = PgErrorMsg::parse_frame(message) {
                    warn!(
                        "Server {} rejected a deploy statement: {} {}: {}",
                        self.id, parsed.severity, parsed.code, parsed.message
                    );
                }
            }
            Some(_) => (),
            None => {
                return Err(Error::ProtocolSync("empty deploy reply".into()));
            }
        }
        Ok(())
    }

    /// Reconfigure this connection to match the session's parameters. Writes
    /// one SET per differing tracked parameter and returns how many
    /// ReadyForQuery replies that will elicit.
    pub(crate) async fn deploy(&mut self, desired: &ServerParameters) -> Result<u32, Error> {
        let diff = self.params.diff_tracked(desired);
        if diff.is_empty() {
            return Ok(0);
        }

        let mut batch = BytesMut::new();
        for (key, value) in &diff {
            batch.put(simple_query(&format!("SET {key} TO '{value}'")));
            // Track what the server will hold once the SETs apply; the
            // replies themselves are discarded, not parsed.
            self.params.set_param(key.clone(), value.clone(), false);
        }

        let count = diff.len() as u32;
        debug!("Server {}: deploying {count} parameter(s)", self.id);

        let Some(io) = self.stream.as_mut() else {
            return Err(Error::ServerNotConnected);
        };
        write_all_flush(io, &batch).await?;
        Ok(count)
    }

    /// Bring the connection back to a reusable state.
    ///
    /// `Ok(true)` means clean and poolable, `Ok(false)` means the connection
    /// must be discarded, `Err` means the cleanup itself failed on the wire.
    pub(crate) async fn reset(&mut self, pool_mode: crate::config::PoolMode) -> Result<bool, Error> {
        if self.is_copy {
            return Ok(false);
        }

        if self.sync_requests > 0 || self.deploy_sync > 0 {
            match timeout(RESET_DRAIN_TIMEOUT, self.drain_replies()).await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    warn!(
                        "Server {}: gave up draining {} outstanding replies",
                        self.id, self.sync_requests
                    );
                    return Ok(false);
                }
            }
        }

        if self.is_transaction {
            warn!("Server {} returned in a transaction, rolling back", self.id);
            self.execute("ROLLBACK").await?;
        }

        if pool_mode == crate::config::PoolMode::Session {
            // A session-pooled connection may carry arbitrary session state
            // from its previous owner.
            self.execute("DISCARD ALL").await?;
        }

        Ok(!self.is_transaction && !self.is_copy)
    }

    /// Run one statement and discard its results.
    pub(crate) async fn execute(&mut self, query: &str) -> Result<(), Error> {
        self.sync_request(1);
        let message = simple_query(query);
        let Some(io) = self.stream.as_mut() else {
            return Err(Error::ServerNotConnected);
        };
        write_all_flush(io, &message).await?;

        loop {
            let Some(io) = self.stream.as_mut() else {
                return Err(Error::ServerNotConnected);
            };
            let reply = self.chunks.read_message(io).await?;
            if reply[0] == READY_FOR_QUERY {
                let state = *reply.get(5).ok_or_else(|| {
                    Error::ProtocolSync("truncated ReadyForQuery".into())
                })?;
                self.ready(state)?;
                return Ok(());
            }
        }
    }

    /// Discard replies until no synchronous command is outstanding.
    async fn drain_replies(&mut self) -> Result<(), Error> {
        while self.sync_requests > 0 || self.deploy_sync > 0 {
            let Some(io) = self.stream.as_mut() else {
                return Err(Error::ServerNotConnected);
            };
            let message = self.chunks.read_message(io).await?;
            if self.deploy_sync > 0 {
                self.deploy_consume(&message)?;
            } else if message[0] == READY_FOR_QUERY {
                let state = *message.get(5).ok_or_else(|| {
                    Error::ProtocolSync("truncated ReadyForQuery".into())
                })?;
                self.ready(state)?;
            }
        }
        Ok(())
    }

    pub(crate) fn query_begin(&mut self) {
        self.query_started = Some(quanta::Instant::now());
    }

    /// Stop the query timer, returning the elapsed time in microseconds.
    pub(crate) fn query_end(&mut self) -> Option<u64> {
        self.query_started
            .take()
            .map(|started| started.elapsed().as_micros() as u64)
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.id, self.process_id)
    }
}

impl Drop for Server {
    /// Best-effort Terminate so the backend does not linger until its own
    /// timeout. The socket is non-blocking, so the write may be lost.
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let bytes: [u8; 5] = [b'X', 0, 0, 0, 4];
            let _ = match stream.get_mut() {
                StreamInner::Tcp { stream } => stream.try_write(&bytes),
                StreamInner::Unix { stream } => stream.try_write(&bytes),
            };
            if let Some(connected_at) = self.connected_at {
                let duration = chrono::offset::Utc::now().naive_utc() - connected_at;
                info!(
                    "Server connection {} closed, lifetime: {}",
                    self,
                    crate::format_duration(&duration)
                );
            }
        }
    }
}
