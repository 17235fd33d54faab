//! Configuration loading and the globally available config snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::info;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

mod general;
mod pool;
mod user;

#[cfg(test)]
mod tests;

pub use general::General;
pub use pool::{Pool, PoolMode, StorageType};
pub use user::{AuthMethod, User};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    /// Routes, keyed by the database name clients connect to.
    #[serde(default)]
    pub pools: HashMap<String, Pool>,
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.pools.is_empty() {
            return Err(Error::BadConfig("no pools configured".into()));
        }
        for (name, pool) in &self.pools {
            pool.validate(name)?;
        }
        if self.general.tls_cert_file.is_some() != self.general.tls_private_key.is_some() {
            return Err(Error::BadConfig(
                "tls_cert_file and tls_private_key must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Log the effective settings, gated by `log_config`.
    pub fn show(&self) {
        if !self.general.log_config {
            return;
        }
        info!("listen: {}:{}", self.general.host, self.general.port);
        info!("worker_threads: {}", self.general.worker_threads);
        info!("max_connections: {}", self.general.max_connections);
        info!("packet_write_queue: {}", self.general.packet_write_queue);
        info!("tls: {}", self.general.tls_enabled());
        for (name, pool) in &self.pools {
            info!(
                "pool {name:?}: mode={} storage={} server={}:{} pool_size={} users={}",
                pool.pool_mode,
                pool.storage_type,
                pool.server_host,
                pool.server_port,
                pool.pool_size,
                pool.users.len(),
            );
        }
    }
}

/// Parse a config from TOML text.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let config: Config = toml::from_str(contents)
        .map_err(|err| Error::BadConfig(format!("TOML parse error: {err}")))?;
    config.validate()?;
    Ok(config)
}

/// Load and validate a config file.
pub fn load(path: &str) -> Result<Config, Error> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| Error::BadConfig(format!("could not read {path:?}: {err}")))?;
    parse(&contents)
}

/// Install the config snapshot that `get_config` hands out.
pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

/// Get the current config snapshot.
pub fn get_config() -> Arc<Config> {
    CONFIG.load_full()
}
