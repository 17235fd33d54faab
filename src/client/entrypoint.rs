// Client entrypoint: greeting, optional TLS upgrade, cancel detection,
// routing, authentication, then the storage-specific session runner.

use std::sync::Arc;

use log::{error, info};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::auth;
use crate::config::{get_config, StorageType};
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{configure_tcp_socket, error_message};
use crate::router::{Router, RouteRefusal};
use crate::server;

use super::core::{Client, ClientId};
use super::startup::{answer_ssl_request, get_startup, StartupPacket, StartupRecord};

/// Drive one accepted connection from greeting to close.
pub async fn client_entrypoint(
    stream: TcpStream,
    router: Arc<Router>,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
) -> Result<(), Error> {
    let addr = stream.peer_addr().map_err(Error::SocketRead)?;
    configure_tcp_socket(&stream);

    let id = ClientId::generate();
    let mut stream = stream;

    match read_startup_or_report(&mut stream, id).await? {
        // The client asked for TLS first.
        StartupPacket::Ssl => match tls_acceptor {
            Some(acceptor) => {
                answer_ssl_request(&mut stream, true).await?;
                let mut stream = acceptor.accept(stream).await.map_err(Error::Tls)?;

                // The real startup or cancel follows the handshake.
                match read_startup_or_report(&mut stream, id).await? {
                    StartupPacket::Startup(record) => {
                        run_session(stream, addr, id, record, router).await
                    }
                    StartupPacket::Cancel {
                        process_id,
                        secret_key,
                    } => handle_cancel(&router, id, process_id, secret_key).await,
                    StartupPacket::Ssl => {
                        Err(Error::ProtocolSync("duplicate SSL request".into()))
                    }
                }
            }
            None => {
                // We cannot offer TLS; the client may continue in plain text.
                answer_ssl_request(&mut stream, false).await?;

                match read_startup_or_report(&mut stream, id).await? {
                    StartupPacket::Startup(record) => {
                        run_session(stream, addr, id, record, router).await
                    }
                    StartupPacket::Cancel {
                        process_id,
                        secret_key,
                    } => handle_cancel(&router, id, process_id, secret_key).await,
                    StartupPacket::Ssl => {
                        Err(Error::ProtocolSync("duplicate SSL request".into()))
                    }
                }
            }
        },

        StartupPacket::Startup(record) => run_session(stream, addr, id, record, router).await,

        StartupPacket::Cancel {
            process_id,
            secret_key,
        } => handle_cancel(&router, id, process_id, secret_key).await,
    }
}

/// Read a greeting frame; a parse failure is reported to the client as a
/// protocol violation before the connection closes.
async fn read_startup_or_report<S>(stream: &mut S, id: ClientId) -> Result<StartupPacket, Error>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    match get_startup(stream).await {
        Ok(packet) => Ok(packet),
        Err(err) => {
            error!("[{id}] incorrect startup packet: {err}");
            let frame = error_message(
                &format!("pg_usher: {id}: bad startup packet"),
                PROTOCOL_VIOLATION,
            );
            let _ = stream.write_all(&frame).await;
            let _ = stream.flush().await;
            Err(err)
        }
    }
}

/// Admission overflow: complete the greeting far enough for the client to
/// display an error, then refuse.
pub async fn client_entrypoint_too_many(mut stream: TcpStream) -> Result<(), Error> {
    match get_startup(&mut stream).await? {
        StartupPacket::Ssl => {
            // No point negotiating TLS for a connection we are refusing.
            answer_ssl_request(&mut stream, false).await?;
            let _ = get_startup(&mut stream).await;
        }
        StartupPacket::Startup(_) | StartupPacket::Cancel { .. } => (),
    }

    let frame = error_message("sorry, too many clients already", TOO_MANY_CONNECTIONS);
    stream.write_all(&frame).await.map_err(Error::SocketWrite)?;
    stream.flush().await.map_err(Error::SocketFlush)
}

/// A cancel-request connection: resolve the target session's current server
/// and fire the upstream cancel, then close.
async fn handle_cancel(
    router: &Router,
    id: ClientId,
    process_id: i32,
    secret_key: i32,
) -> Result<(), Error> {
    info!("[{id}] cancel request");
    match router.cancel((process_id, secret_key)) {
        Some(target) => server::cancel::cancel(&target).await,
        // Unknown or stale key: nothing to cancel, close quietly.
        None => Ok(()),
    }
}

/// Route, authenticate, set up and run one session, then clean up.
async fn run_session<S>(
    stream: S,
    addr: std::net::SocketAddr,
    id: ClientId,
    startup: StartupRecord,
    router: Arc<Router>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let (kill_tx, kill_rx) = mpsc::channel(1);
    let mut client = Client::new(stream, addr, id, startup, kill_rx, router.clone());

    if config.general.log_session {
        info!(
            "[{id}] new client connection {addr} (application_name: {})",
            client.startup.application_name()
        );
    }

    let route = match router.route(&client.startup.database, &client.startup.user) {
        Ok(route) => route,
        Err(refusal) => return refuse(&mut client, refusal).await,
    };
    client.route = Some(route.clone());
    router.register_kill(id, kill_tx);

    if config.general.log_session {
        info!(
            "[{id}] route '{}.{}' to '{}.{}'",
            client.startup.database,
            client.startup.user,
            route.server_database,
            route.user.server_credentials().0,
        );
    }

    if let Err(err) = auth::frontend(&mut client, &route).await {
        client.unroute();
        return Err(err);
    }

    let outcome = match route.storage {
        StorageType::Local => match client.setup_console().await {
            Ok(()) => client.run_local().await,
            Err(outcome) => outcome,
        },
        StorageType::Remote => match client.setup_remote().await {
            Ok(()) => client.relay().await,
            Err(outcome) => outcome,
        },
    };

    client.cleanup(outcome).await;
    Ok(())
}

/// Report a routing refusal to the client and fail the session.
async fn refuse<S>(client: &mut Client<S>, refusal: RouteRefusal) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    let id = client.id;
    match refusal {
        RouteRefusal::NotFound { database, user } => {
            let target = format!("{database}.{user}");
            error!("[{id}] route for '{target}' is not found, closing");
            let _ = client
                .send_error(UNDEFINED_DATABASE, &format!("route for '{target}' is not found"))
                .await;
            Err(Error::NoRoute(target))
        }
        RouteRefusal::Limit => {
            error!("[{id}] route connection limit reached, closing");
            let _ = client
                .send_error(TOO_MANY_CONNECTIONS, "too many connections")
                .await;
            Err(Error::RouteLimit)
        }
        RouteRefusal::Internal => {
            error!("[{id}] routing failed, closing");
            let _ = client.send_error(SYSTEM_ERROR, "client routing failed").await;
            Err(Error::RouteFailed)
        }
    }
}
