use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpSocket;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::client::{client_entrypoint, client_entrypoint_too_many};
use crate::config::{get_config, Config};
use crate::format_duration;
use crate::router::Router;

use super::tls::init_tls;

/// Clients currently connected to the pooler.
pub static CURRENT_CLIENT_COUNT: AtomicI64 = AtomicI64::new(0);

pub fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("worker-pg-usher")
        .build()?;

    runtime.block_on(async move {
        let addr = format!("{}:{}", config.general.host, config.general.port)
            .to_socket_addrs()?
            .next()
            .ok_or("listen address did not resolve")?;

        let listen_socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        listen_socket.set_reuseaddr(true)?;
        listen_socket.set_nodelay(true)?;
        listen_socket.bind(addr)?;
        let listener = listen_socket.listen(config.general.max_connections.min(1024) as u32)?;

        info!("Running on {addr}");
        config.show();

        let router = Arc::new(Router::from_config(&config));
        let tls_acceptor = init_tls(&config);

        let mut term_signal = unix_signal(SignalKind::terminate())?;
        let mut interrupt_signal = unix_signal(SignalKind::interrupt())?;

        info!("Waiting for clients");
        loop {
            tokio::select! {
                _ = interrupt_signal.recv() => {
                    info!("Got SIGINT, asking sessions to stop");
                    router.kill_all();
                    break;
                },

                _ = term_signal.recv() => {
                    info!("Got SIGTERM, closing");
                    break;
                },

                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!("accept error: {err:?}");
                            continue;
                        }
                    };

                    let router = router.clone();
                    let tls_acceptor = tls_acceptor.clone();
                    let config = get_config();
                    let log_session = config.general.log_session;
                    let max_connections = config.general.max_connections;

                    tokio::task::spawn(async move {
                        let current = CURRENT_CLIENT_COUNT.fetch_add(1, Ordering::SeqCst);

                        if current as u64 >= max_connections {
                            warn!("Client {peer:?}: too many clients already");
                            if let Err(err) = client_entrypoint_too_many(socket).await {
                                debug!("Client {peer:?}: refused with error: {err}");
                            }
                            CURRENT_CLIENT_COUNT.fetch_add(-1, Ordering::SeqCst);
                            return;
                        }

                        let start = chrono::offset::Utc::now().naive_utc();

                        match client_entrypoint(socket, router, tls_acceptor).await {
                            Ok(()) => {
                                let duration = chrono::offset::Utc::now().naive_utc() - start;
                                if log_session {
                                    info!(
                                        "Client {peer:?} disconnected, session duration: {}",
                                        format_duration(&duration)
                                    );
                                } else {
                                    debug!(
                                        "Client {peer:?} disconnected, session duration: {}",
                                        format_duration(&duration)
                                    );
                                }
                            }
                            Err(err) => {
                                let duration = chrono::offset::Utc::now().naive_utc() - start;
                                if err.is_disconnect() {
                                    debug!(
                                        "Client {peer:?} dropped the connection, duration: {}",
                                        format_duration(&duration)
                                    );
                                } else {
                                    warn!(
                                        "Client {peer:?} disconnected with error {err}, duration: {}",
                                        format_duration(&duration)
                                    );
                                }
                            }
                        };

                        CURRENT_CLIENT_COUNT.fetch_add(-1, Ordering::SeqCst);
                    });
                },
            }
        }

        info!("Shutting down...");
        Ok(())
    })
}
