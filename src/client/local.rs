// The console path for routes backed by local storage. Requests are small,
// so whole messages are read at a time; replies arrive as a frame batch on
// a single-shot channel.

use bytes::BytesMut;
use log::error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::console;
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{error_message, ready_for_query};

use super::core::{Client, SessionOutcome};

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    pub(crate) async fn run_local(&mut self) -> SessionOutcome {
        loop {
            let message = match self.chunks.read_message(&mut self.io).await {
                Ok(message) => message,
                Err(_) => return SessionOutcome::ClientReadFailed,
            };

            match message.first().copied() {
                Some(TERMINATE) => return SessionOutcome::Ok,

                Some(QUERY) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if console::request(&self.router, self.id, reply_tx, &message).is_err() {
                        return SessionOutcome::ClientWriteFailed;
                    }
                    let batch = match reply_rx.await {
                        Ok(batch) => batch,
                        Err(_) => return SessionOutcome::ClientWriteFailed,
                    };
                    if self.write_batch(&batch).await.is_err() {
                        return SessionOutcome::ClientWriteFailed;
                    }
                }

                Some(other) => {
                    error!("[{}] unsupported console request '{}'", self.id, other as char);
                    if self
                        .unsupported_request(other as char)
                        .await
                        .is_err()
                    {
                        return SessionOutcome::ClientWriteFailed;
                    }
                }

                None => return SessionOutcome::ClientReadFailed,
            }
        }
    }

    async fn unsupported_request(&mut self, request: char) -> Result<(), Error> {
        let text = self.error_text(&format!("unsupported request '{request}'"));
        let mut batch: BytesMut = error_message(&text, FEATURE_NOT_SUPPORTED);
        batch.extend_from_slice(&ready_for_query(false));
        self.io.write_all(&batch).await.map_err(Error::SocketWrite)?;
        self.io.flush().await.map_err(Error::SocketFlush)
    }
}
