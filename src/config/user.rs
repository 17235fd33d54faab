//! Per-user configuration within a pool.

use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

/// How a client proves who it is.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Accept anyone claiming this username.
    Trust,
    /// Plaintext password exchange.
    Clear,
    /// Salted md5 challenge.
    Md5,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Trust => write!(f, "trust"),
            AuthMethod::Clear => write!(f, "clear"),
            AuthMethod::Md5 => write!(f, "md5"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,

    #[serde(default = "User::default_auth")]
    pub auth: AuthMethod,

    /// Password clients authenticate with.
    pub password: Option<String>,

    /// Username used towards the server when it differs from `username`.
    pub server_username: Option<String>,

    /// Password used towards the server. Falls back to `password`.
    pub server_password: Option<String>,
}

impl User {
    pub fn default_auth() -> AuthMethod {
        AuthMethod::Md5
    }

    /// The credentials presented to the upstream server.
    pub fn server_credentials(&self) -> (&str, Option<&str>) {
        let username = self.server_username.as_deref().unwrap_or(&self.username);
        let password = self.server_password.as_deref().or(self.password.as_deref());
        (username, password)
    }

    pub fn validate(&self, pool: &str) -> Result<(), Error> {
        if self.username.is_empty() {
            return Err(Error::BadConfig(format!(
                "pool {pool:?} has a user with an empty username"
            )));
        }
        if self.auth != AuthMethod::Trust && self.password.is_none() {
            return Err(Error::BadConfig(format!(
                "user {:?} in pool {pool:?} uses {} auth but has no password",
                self.username, self.auth
            )));
        }
        Ok(())
    }
}

impl Default for User {
    fn default() -> User {
        User {
            username: String::default(),
            auth: Self::default_auth(),
            password: None,
            server_username: None,
            server_password: None,
        }
    }
}
