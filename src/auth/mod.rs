//! Client-facing authentication, driven by the per-route user settings.

use log::warn;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::Client;
use crate::config::AuthMethod;
use crate::errors::Error;
use crate::messages::constants::INVALID_PASSWORD;
use crate::messages::{
    authentication_ok, error_message, md5_challenge, md5_hash_password, plain_password_challenge,
    read_password,
};
use crate::router::Route;

/// Complete the client's authentication on its socket. On success the
/// AuthenticationOk frame has been written (unflushed frames follow in
/// setup); on failure the client has received the canonical error frame.
pub(crate) async fn frontend<S>(client: &mut Client<S>, route: &Route) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    let user = &route.user;

    match user.auth {
        AuthMethod::Trust => (),

        AuthMethod::Clear => {
            client.write_batch(&plain_password_challenge()).await?;
            let received = read_password(&mut client.io).await?;

            let expected = user.password.as_deref().unwrap_or_default();
            if !password_matches(&received, expected.as_bytes()) {
                return reject(client, &user.username).await;
            }
        }

        AuthMethod::Md5 => {
            let salt: [u8; 4] = rand::random();
            client.write_batch(&md5_challenge(&salt)).await?;
            let received = read_password(&mut client.io).await?;

            let password = user.password.as_deref().unwrap_or_default();
            let expected = md5_hash_password(&user.username, password, &salt);
            if received != expected {
                return reject(client, &user.username).await;
            }
        }
    }

    client.write_batch(&authentication_ok()).await?;
    Ok(())
}

/// Compare a received password (possibly nul-terminated) with the expected
/// bytes.
fn password_matches(received: &[u8], expected: &[u8]) -> bool {
    let received = match received.split_last() {
        Some((0, head)) => head,
        _ => received,
    };
    received == expected
}

async fn reject<S>(client: &mut Client<S>, username: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + std::marker::Unpin,
{
    warn!("[{}] invalid password for {username:?}", client.id);
    let frame = error_message(
        &format!("password authentication failed for user \"{username}\""),
        INVALID_PASSWORD,
    );
    let _ = client.write_batch(&frame).await;
    Err(Error::ClientAuth(username.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_comparison_ignores_the_terminator() {
        assert!(password_matches(b"hunter2\0", b"hunter2"));
        assert!(password_matches(b"hunter2", b"hunter2"));
        assert!(!password_matches(b"hunter3\0", b"hunter2"));
        assert!(!password_matches(b"", b"hunter2"));
    }

    #[test]
    fn md5_response_includes_terminator() {
        let salt = [1, 2, 3, 4];
        let expected = md5_hash_password("app", "pw", &salt);
        // The client sends the same bytes back, trailing nul included.
        assert_eq!(*expected.last().unwrap(), 0);
    }
}
