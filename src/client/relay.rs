// The remote-route relay: a readiness-driven multiplexer over the control
// channel, the client socket and, while attached, the server socket.
//
// Messages travel in chunks and are forwarded verbatim; only the first
// chunk of a message is inspected. Every state transition derived from a
// frame is applied before the frame itself is forwarded, so the peer never
// observes a frame whose implied state has not been applied yet.

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{get_config, PoolMode};
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{parse_parameter_status, parse_text, query_text, Chunk, PgErrorMsg};
use crate::server::ServerTurn;

use super::core::{Client, ControlOp, SessionOutcome};

enum RelayTurn {
    Control(Option<ControlOp>),
    Client(Result<Chunk, Error>),
    Server(Result<ServerTurn, Error>),
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    /// Relay until a terminal outcome. The server endpoint joins the poll
    /// set once a client chunk forced an attach and leaves it again on a
    /// transaction-boundary detach.
    pub(crate) async fn relay(&mut self) -> SessionOutcome {
        loop {
            let have_server = self.server.is_some();
            let control_open = !self.control_closed;
            let server_slot = &mut self.server;

            let turn = tokio::select! {
                biased;

                op = self.control.recv(), if control_open => RelayTurn::Control(op),

                res = self.chunks.read_chunk(&mut self.io) => RelayTurn::Client(res),

                res = async {
                    match server_slot.as_mut() {
                        Some(lease) => lease.server.relay_read().await,
                        None => std::future::pending().await,
                    }
                }, if have_server => RelayTurn::Server(res),
            };

            let outcome = match turn {
                RelayTurn::Control(op) => self.on_control(op),
                RelayTurn::Client(res) => self.on_client_turn(res).await,
                RelayTurn::Server(res) => self.on_server_turn(res).await,
            };

            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    fn on_control(&mut self, op: Option<ControlOp>) -> Option<SessionOutcome> {
        match op {
            Some(ControlOp::Kill) => Some(SessionOutcome::Kill),
            None => {
                self.control_closed = true;
                None
            }
        }
    }

    /// One chunk from the client. Attaches a server on demand, inspects the
    /// first chunk of each message, forwards everything verbatim.
    async fn on_client_turn(&mut self, res: Result<Chunk, Error>) -> Option<SessionOutcome> {
        let chunk = match res {
            Ok(chunk) => chunk,
            Err(_) => return Some(SessionOutcome::ClientReadFailed),
        };

        self.route().stats.recv_client(chunk.data.len());

        let first_type = if chunk.first { chunk.data.first().copied() } else { None };

        // Terminate is consumed locally, before any attach.
        if first_type == Some(TERMINATE) {
            return Some(SessionOutcome::Terminate);
        }

        if self.server.is_none() {
            if let Err(outcome) = self.attach_and_deploy().await {
                return Some(outcome);
            }
        }

        let config = get_config();

        if let Some(message_type) = first_type {
            let id = self.id;
            let lease = self.server.as_mut().expect("server attached above");

            match message_type {
                COPY_DONE | COPY_FAIL => lease.server.is_copy = false,

                QUERY if config.general.log_query && chunk.complete => {
                    match query_text(&chunk.data) {
                        Some(sql) => info!("[{id}] {sql}"),
                        None => error!("[{id}] failed to parse query message"),
                    }
                }

                PARSE if config.general.log_query && chunk.complete => {
                    match parse_text(&chunk.data) {
                        Some((name, sql)) => {
                            let name = if name.is_empty() { "<unnamed>" } else { name };
                            info!("[{id}] prepare {name}: {sql}");
                        }
                        None => error!("[{id}] failed to parse prepare message"),
                    }
                }

                _ => (),
            }
        }

        let threshold = config.general.packet_write_queue;
        let lease = self.server.as_mut().expect("server attached above");
        if lease
            .server
            .forward(&chunk.data, chunk.complete, threshold)
            .await
            .is_err()
        {
            return Some(SessionOutcome::ServerWriteFailed);
        }

        if let Some(message_type) = first_type {
            if matches!(message_type, QUERY | FUNCTION_CALL | SYNC) {
                lease.server.sync_request(1);
            }
            lease.server.query_begin();
        }

        None
    }

    /// One turn from the server socket: either a swallowed deploy reply or a
    /// chunk to forward to the client.
    async fn on_server_turn(&mut self, res: Result<ServerTurn, Error>) -> Option<SessionOutcome> {
        let turn = match res {
            Ok(turn) => turn,
            Err(_) => return Some(SessionOutcome::ServerReadFailed),
        };

        let chunk = match turn {
            ServerTurn::Deploy(message) => {
                let lease = self.server.as_mut()?;
                match lease.server.deploy_consume(&message) {
                    Ok(()) => return None,
                    Err(_) => return Some(SessionOutcome::ServerConfigureFailed),
                }
            }
            ServerTurn::Chunk(chunk) => chunk,
        };

        self.route().stats.recv_server(chunk.data.len());

        if chunk.first {
            if let Some(outcome) = self.on_server_frame(&chunk).await {
                return Some(outcome);
            }
        }

        if self.write_client(&chunk.data, chunk.complete).await.is_err() {
            return Some(SessionOutcome::ClientWriteFailed);
        }

        None
    }

    /// First-chunk inspection of a server message. Runs before the chunk is
    /// forwarded; this ordering is what keeps transaction pooling sound.
    async fn on_server_frame(&mut self, chunk: &Chunk) -> Option<SessionOutcome> {
        let id = self.id;

        match chunk.data.first().copied() {
            Some(ERROR_RESPONSE) => {
                if chunk.complete {
                    if let Ok(parsed) = PgErrorMsg::parse_frame(&chunk.data) {
                        debug!(
                            "[{id}] server error: {} {}: {}",
                            parsed.severity, parsed.code, parsed.message
                        );
                    }
                }
            }

            Some(PARAMETER_STATUS) => {
                if !chunk.complete {
                    return Some(SessionOutcome::ServerReadFailed);
                }
                match parse_parameter_status(&chunk.data) {
                    Ok((name, value)) => {
                        debug!("[{id}] {name} = {value}");
                        // The session map reflects the change before the
                        // client can observe the frame.
                        self.params.set_param(name, value, false);
                    }
                    Err(_) => return Some(SessionOutcome::ServerReadFailed),
                }
            }

            Some(COPY_IN_RESPONSE) | Some(COPY_OUT_RESPONSE) => {
                let lease = self.server.as_mut()?;
                lease.server.is_copy = true;
            }

            Some(COPY_DONE) => {
                let lease = self.server.as_mut()?;
                lease.server.is_copy = false;
            }

            Some(READY_FOR_QUERY) => {
                let route = self.route().clone();
                let lease = self.server.as_mut()?;

                // A ready-for-query in the middle of a copy stream is a
                // protocol violation; discard the connection.
                if lease.server.is_copy {
                    error!("[{id}] ReadyForQuery while copy is in progress");
                    return Some(SessionOutcome::ServerReadFailed);
                }

                let Some(state) = chunk.data.get(5).copied() else {
                    return Some(SessionOutcome::ServerReadFailed);
                };
                if lease.server.ready(state).is_err() {
                    return Some(SessionOutcome::ServerReadFailed);
                }

                if let Some(micros) = lease.server.query_end() {
                    route.stats.query(micros);
                    if get_config().general.log_query {
                        debug!("[{id}] query time: {micros} microseconds");
                    }
                }

                // Transaction pooling: at an idle boundary the server goes
                // back to the pool before the frame reaches the client.
                if route.pool_mode == PoolMode::Transaction && !lease.server.is_transaction {
                    let mut lease = self.server.take().expect("lease checked above");
                    match lease.server.reset(route.pool_mode).await {
                        Ok(true) => self.router.detach(&route, self.key, lease),
                        Ok(false) => self.router.close(self.key, lease),
                        Err(_) => {
                            self.router.close(self.key, lease);
                            return Some(SessionOutcome::ServerWriteFailed);
                        }
                    }
                }
            }

            _ => (),
        }

        None
    }
}
