//! Per-pool (route) configuration.

use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

use super::User;

/// How a server connection is shared between clients of a route.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// The server is held for the whole client session.
    Session,
    /// The server is returned to the pool at every transaction boundary.
    Transaction,
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMode::Session => write!(f, "session"),
            PoolMode::Transaction => write!(f, "transaction"),
        }
    }
}

/// What backs a route: a remote PostgreSQL server or the built-in console.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Remote,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Local => write!(f, "local"),
            StorageType::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pool {
    #[serde(default = "Pool::default_pool_mode")]
    pub pool_mode: PoolMode,

    #[serde(default = "Pool::default_storage_type")]
    pub storage_type: StorageType,

    /// Forward a stored server connect error to the client verbatim instead
    /// of wrapping it in a generic connection failure.
    #[serde(default)]
    pub client_fwd_error: bool,

    #[serde(default = "Pool::default_server_host")]
    pub server_host: String,

    #[serde(default = "Pool::default_server_port")]
    pub server_port: u16,

    /// The real name of the database on the server. If it is not specified,
    /// the pool name is used.
    pub server_database: Option<String>,

    /// Maximum number of server connections kept for this route.
    #[serde(default = "Pool::default_pool_size")]
    pub pool_size: u32,

    /// Maximum number of clients routed here at once. Zero means unlimited.
    #[serde(default)]
    pub max_client_conn: usize,

    pub application_name: Option<String>,

    #[serde(default = "Pool::default_users")]
    pub users: Vec<User>,
}

impl Pool {
    pub fn default_pool_mode() -> PoolMode {
        PoolMode::Transaction
    }

    pub fn default_storage_type() -> StorageType {
        StorageType::Remote
    }

    pub fn default_server_host() -> String {
        String::from("127.0.0.1")
    }

    pub fn default_server_port() -> u16 {
        5432
    }

    pub fn default_pool_size() -> u32 {
        10
    }

    pub fn default_users() -> Vec<User> {
        Vec::new()
    }

    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if self.users.is_empty() {
            return Err(Error::BadConfig(format!(
                "pool {name:?} has no users configured"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if !seen.insert(&user.username) {
                return Err(Error::BadConfig(format!(
                    "duplicate username {:?} in pool {name:?}",
                    user.username
                )));
            }
            user.validate(name)?;
        }
        if self.pool_size == 0 && self.storage_type == StorageType::Remote {
            return Err(Error::BadConfig(format!(
                "pool {name:?} has pool_size = 0"
            )));
        }
        Ok(())
    }
}

impl Default for Pool {
    fn default() -> Pool {
        Pool {
            pool_mode: Self::default_pool_mode(),
            storage_type: Self::default_storage_type(),
            client_fwd_error: false,
            server_host: Self::default_server_host(),
            server_port: Self::default_server_port(),
            server_database: None,
            pool_size: Self::default_pool_size(),
            max_client_conn: 0,
            application_name: None,
            users: Vec::new(),
        }
    }
}
