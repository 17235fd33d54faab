// Greeting-frame handling: startup, SSL upgrade, cancel detection.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use log::error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::Error;
use crate::messages::constants::*;

/// The parsed greeting parameters of one session.
#[derive(Debug, Clone)]
pub(crate) struct StartupRecord {
    pub user: String,
    pub database: String,
    pub params: HashMap<String, String>,
}

impl StartupRecord {
    pub fn application_name(&self) -> &str {
        self.params
            .get("application_name")
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// First message of a connection.
pub(crate) enum StartupPacket {
    Ssl,
    Startup(StartupRecord),
    Cancel { process_id: i32, secret_key: i32 },
}

/// Read one version-less greeting frame. GSSAPI encryption requests are
/// declined in place and the next frame is read instead.
pub(crate) async fn get_startup<S>(stream: &mut S) -> Result<StartupPacket, Error>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    loop {
        let len = match stream.read_i32().await {
            Ok(len) => len,
            Err(_) => return Err(Error::ClientBadStartup),
        };

        // Minimum is 8 bytes (length + code); reject absurd lengths before
        // allocating.
        if !(8..=8 * 1024).contains(&len) {
            return Err(Error::ClientBadStartup);
        }

        let mut startup = vec![0u8; (len - 4) as usize];
        if stream.read_exact(&mut startup).await.is_err() {
            return Err(Error::ClientBadStartup);
        }

        let mut bytes = BytesMut::from(&startup[..]);
        let code = bytes.get_i32();

        match code {
            SSL_REQUEST_CODE => return Ok(StartupPacket::Ssl),

            CANCEL_REQUEST_CODE => {
                if bytes.remaining() < 8 {
                    return Err(Error::ClientBadStartup);
                }
                return Ok(StartupPacket::Cancel {
                    process_id: bytes.get_i32(),
                    secret_key: bytes.get_i32(),
                });
            }

            PROTOCOL_VERSION_NUMBER => {
                let params = crate::messages::parse_startup_params(bytes)?;
                let Some(user) = params.get("user").cloned() else {
                    return Err(Error::ClientBadStartup);
                };
                let database = params.get("database").cloned().unwrap_or_else(|| user.clone());
                return Ok(StartupPacket::Startup(StartupRecord {
                    user,
                    database,
                    params,
                }));
            }

            GSSENC_REQUEST_CODE => {
                // Decline and let the client continue with its next
                // preference (SSL or plain startup).
                stream.write_all(b"N").await.map_err(Error::SocketWrite)?;
                stream.flush().await.map_err(Error::SocketFlush)?;
            }

            _ => {
                error!("Unexpected startup code: {code}");
                return Err(Error::ProtocolSync(format!(
                    "unexpected startup code {code}"
                )));
            }
        }
    }
}

/// Answer an SSLRequest: `S` when an acceptor is configured, `N` otherwise.
pub(crate) async fn answer_ssl_request(
    stream: &mut TcpStream,
    accept: bool,
) -> Result<(), Error> {
    let answer: &[u8] = if accept { b"S" } else { b"N" };
    stream.write_all(answer).await.map_err(Error::SocketWrite)?;
    stream.flush().await.map_err(Error::SocketFlush)
}
