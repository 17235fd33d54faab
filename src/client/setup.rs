// Post-auth setup: advertise parameters, issue the backend key, and leave
// the client ready for query.

use bytes::{BufMut, BytesMut};
use log::info;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{get_config, VERSION};
use crate::messages::{backend_key_data, parameter_status, ready_for_query};

use super::core::{Client, SessionOutcome};

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    /// Remote-route setup. Parameters come from the route cache; an empty
    /// cache is warmed by one throwaway attach whose backend startup
    /// populates it.
    pub(crate) async fn setup_remote(&mut self) -> Result<(), SessionOutcome> {
        let route = self.route().clone();

        let cached = loop {
            let snapshot = route.params_snapshot();
            if !snapshot.is_empty() {
                break snapshot;
            }

            self.attach("setup").await?;
            let lease = self.server.take().expect("attach set the lease");
            self.router.close(self.key, lease);
        };

        let mut batch = BytesMut::new();

        // Route-advertised set first, then the client's own startup
        // parameters so client values win.
        for (key, value) in cached.iter() {
            batch.put(parameter_status(key, value));
        }
        for (key, value) in &self.startup.params {
            batch.put(parameter_status(key, value));
        }

        self.params.set_from_hashmap(&self.startup.params, true);

        let (key_pid, key) = self.key;
        batch.put(backend_key_data(key_pid, key));
        batch.put(ready_for_query(false));

        if self.write_batch(&batch).await.is_err() {
            return Err(SessionOutcome::ClientWriteFailed);
        }

        if get_config().general.log_session {
            info!(
                "[{}] login time: {} microseconds",
                self.id,
                self.accepted_at.elapsed().as_micros()
            );
        }

        Ok(())
    }

    /// Console-route setup: a fixed parameter set and ready-for-query.
    pub(crate) async fn setup_console(&mut self) -> Result<(), SessionOutcome> {
        let mut batch = BytesMut::new();
        batch.put(parameter_status("server_version", VERSION));
        batch.put(parameter_status("server_encoding", "UTF-8"));
        batch.put(parameter_status("client_encoding", "UTF-8"));
        batch.put(parameter_status("DateStyle", "ISO"));
        batch.put(parameter_status("TimeZone", "GMT"));
        batch.put(ready_for_query(false));

        match self.write_batch(&batch).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SessionOutcome::ClientWriteFailed),
        }
    }
}
