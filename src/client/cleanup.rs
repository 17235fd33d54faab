// Terminal-outcome dispatch: one client-visible error at most, one router
// release path, exactly once per session.

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::get_config;
use crate::messages::constants::CONNECTION_FAILURE;

use super::core::{Client, SessionOutcome};

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    /// Map the terminal outcome to client error reporting and the matching
    /// router release. Every path ends in an unroute, so the session's
    /// route reference and registry entries are dropped exactly once.
    pub(crate) async fn cleanup(&mut self, outcome: SessionOutcome) {
        let log_session = get_config().general.log_session;

        match outcome {
            SessionOutcome::AttachFailed => {
                let _ = self
                    .send_error(CONNECTION_FAILURE, "failed to get remote server connection")
                    .await;
                self.unroute();
            }

            SessionOutcome::Ok | SessionOutcome::Kill | SessionOutcome::Terminate => {
                if log_session {
                    info!("[{}] client {} disconnected", self.id, self.addr);
                }
                self.release_server_and_unroute().await;
            }

            SessionOutcome::ClientReadFailed | SessionOutcome::ClientWriteFailed => {
                // The client is gone; reuse the server link if possible.
                if log_session {
                    info!(
                        "[{}] client {} disconnected (read/write error)",
                        self.id, self.addr
                    );
                }
                self.release_server_and_unroute().await;
            }

            SessionOutcome::ClientConfigureFailed => {
                let text = format!("client {} configuration error", self.id);
                let _ = self.send_error(CONNECTION_FAILURE, &text).await;
                // The server was never touched, keep it.
                self.detach_and_unroute();
            }

            SessionOutcome::ServerConnectFailed => {
                self.report_connect_failure().await;
                self.close_and_unroute();
            }

            SessionOutcome::ServerConfigureFailed => {
                let text = self.server_error_text("failed to configure remote server");
                warn!("[{}] server disconnected (server configure error)", self.id);
                let _ = self.send_error(CONNECTION_FAILURE, &text).await;
                self.close_and_unroute();
            }

            SessionOutcome::ServerReadFailed | SessionOutcome::ServerWriteFailed => {
                let text = self.server_error_text("remote server read/write error");
                warn!("[{}] server disconnected (read/write error)", self.id);
                let _ = self.send_error(CONNECTION_FAILURE, &text).await;
                self.close_and_unroute();
            }
        }
    }

    /// Graceful paths: reset the server and either pool it or destroy it.
    async fn release_server_and_unroute(&mut self) {
        let Some(mut lease) = self.server.take() else {
            self.unroute();
            return;
        };
        let route = self.route().clone();

        match lease.server.reset(route.pool_mode).await {
            Ok(true) => self.router.detach(&route, self.key, lease),
            Ok(false) | Err(_) => self.router.close(self.key, lease),
        }
        self.unroute();
    }

    /// Forward a stored backend startup error verbatim when the route allows
    /// it; otherwise wrap it in a generic connection failure.
    async fn report_connect_failure(&mut self) {
        let forward = self
            .route
            .as_ref()
            .map(|route| route.client_fwd_error)
            .unwrap_or(false);

        let stored = self
            .server
            .as_mut()
            .and_then(|lease| lease.server.error_connect.take());

        match stored {
            Some(frame) if forward => {
                let _ = self.io.write_all(&frame).await;
                let _ = self.io.flush().await;
            }
            _ => {
                let text = self.server_error_text("failed to connect to remote server");
                let _ = self.send_error(CONNECTION_FAILURE, &text).await;
            }
        }
    }

    fn server_error_text(&self, prefix: &str) -> String {
        match &self.server {
            Some(lease) => format!("{prefix} {}", lease.server.id),
            None => prefix.to_string(),
        }
    }

    fn detach_and_unroute(&mut self) {
        if let Some(lease) = self.server.take() {
            let route = self.route().clone();
            self.router.detach(&route, self.key, lease);
        }
        self.unroute();
    }

    fn close_and_unroute(&mut self) {
        if let Some(lease) = self.server.take() {
            self.router.close(self.key, lease);
        }
        self.unroute();
    }

    pub(crate) fn unroute(&mut self) {
        if let Some(route) = self.route.take() {
            debug!("[{}] unrouted from {}", self.id, route.name);
            self.router.unroute(self.id, self.key, &route);
        }
    }
}
