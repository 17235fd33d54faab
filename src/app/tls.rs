use log::error;
use native_tls::Identity;

use crate::config::Config;

/// Build the client-facing TLS acceptor when certificates are configured.
pub fn init_tls(config: &Config) -> Option<tokio_native_tls::TlsAcceptor> {
    let (Some(cert_file), Some(key_file)) = (
        config.general.tls_cert_file.as_ref(),
        config.general.tls_private_key.as_ref(),
    ) else {
        return None;
    };

    let cert = match std::fs::read(cert_file) {
        Ok(cert) => cert,
        Err(err) => {
            error!("Could not read {cert_file:?}: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };
    let key = match std::fs::read(key_file) {
        Ok(key) => key,
        Err(err) => {
            error!("Could not read {key_file:?}: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    let identity = match Identity::from_pkcs8(&cert, &key) {
        Ok(identity) => identity,
        Err(err) => {
            error!("Invalid TLS certificate or key: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    match native_tls::TlsAcceptor::new(identity) {
        Ok(acceptor) => Some(tokio_native_tls::TlsAcceptor::from(acceptor)),
        Err(err) => {
            error!("Could not build TLS acceptor: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    }
}
