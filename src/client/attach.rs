// Attach/deploy coordination: lease a server, make sure it is live and
// connected, and configure it for this session.

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::router::CancelTarget;

use super::core::{Client, SessionOutcome};

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    /// Lease a server from the route pool and make sure it has a live
    /// upstream connection. A pooled socket that died since its last release
    /// is closed and the attach silently retried; the replacement slot gets
    /// a freshly connected socket or surfaces the connect failure.
    pub(crate) async fn attach(&mut self, context: &str) -> Result<(), SessionOutcome> {
        let route = self.route().clone();

        loop {
            let mut lease = match self.router.attach(&route).await {
                Ok(lease) => lease,
                Err(_) => return Err(SessionOutcome::AttachFailed),
            };

            if lease.server.has_stream() {
                if lease.server.is_closed() {
                    info!(
                        "[{}] {context}: server {} disconnected, close connection and retry attach",
                        self.id, lease.server.id
                    );
                    self.router.close(self.key, lease);
                    continue;
                }
            } else if let Err(err) = lease.server.connect(&route).await {
                info!(
                    "[{}] {context}: connecting server {} failed: {err}",
                    self.id, lease.server.id
                );
                // Cleanup needs the lease: it closes the connection and may
                // forward the stored startup error.
                self.server = Some(lease);
                return Err(SessionOutcome::ServerConnectFailed);
            }

            self.router.register_cancel(
                self.key,
                CancelTarget {
                    host: route.server_host.clone(),
                    port: route.server_port,
                    process_id: lease.server.process_id,
                    secret_key: lease.server.secret_key,
                },
            );

            debug!("[{}] {context}: attached to {}", self.id, lease.server.id);
            self.server = Some(lease);
            return Ok(());
        }
    }

    /// Attach and reconfigure the server for this session. A warm reuse by
    /// the same session skips the deploy entirely.
    pub(crate) async fn attach_and_deploy(&mut self) -> Result<(), SessionOutcome> {
        self.attach("main").await?;

        let id = self.id;
        let lease = self.server.as_mut().expect("attach set the lease");

        if lease.server.last_client_id == Some(id) {
            debug!(
                "[{id}] previously owned, no need to reconfigure {}",
                lease.server.id
            );
            lease.server.deploy_sync = 0;
        } else {
            let count = match lease.server.deploy(&self.params).await {
                Ok(count) => count,
                Err(_) => return Err(SessionOutcome::ServerWriteFailed),
            };
            lease.server.deploy_sync = count;
            lease.server.last_client_id = Some(id);
        }

        let pending = lease.server.deploy_sync;
        lease.server.sync_request(pending);
        Ok(())
    }
}
