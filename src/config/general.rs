//! General (process-wide) settings.

use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    /// Number of runtime worker threads.
    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    /// Process-wide cap on accepted clients.
    #[serde(default = "General::default_max_connections")]
    pub max_connections: u64,

    /// Byte threshold for flush batching when relaying chunked messages.
    #[serde(default = "General::default_packet_write_queue")]
    pub packet_write_queue: usize,

    /// Maximum time to allow for establishing a new server connection.
    #[serde(default = "General::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a session may wait for a pooled server before giving up.
    #[serde(default = "General::default_query_wait_timeout_ms")]
    pub query_wait_timeout_ms: u64,

    /// Log one line per session on connect/disconnect with timings.
    #[serde(default = "General::default_true")]
    pub log_session: bool,

    /// Log the text of every forwarded query and its duration.
    #[serde(default)]
    pub log_query: bool,

    /// Dump the effective configuration at startup.
    #[serde(default)]
    pub log_config: bool,

    /// Force debug-level logging regardless of the command line.
    #[serde(default)]
    pub log_debug: bool,

    /// PEM certificate; together with the key it enables client TLS.
    pub tls_cert_file: Option<String>,

    /// PEM private key.
    pub tls_private_key: Option<String>,
}

impl General {
    pub fn default_host() -> String {
        String::from("0.0.0.0")
    }

    pub fn default_port() -> u16 {
        6432
    }

    pub fn default_worker_threads() -> usize {
        num_cpus::get()
    }

    pub fn default_max_connections() -> u64 {
        1000
    }

    pub fn default_packet_write_queue() -> usize {
        8192
    }

    pub fn default_connect_timeout_ms() -> u64 {
        5000
    }

    pub fn default_query_wait_timeout_ms() -> u64 {
        10_000
    }

    fn default_true() -> bool {
        true
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.query_wait_timeout_ms)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file.is_some() && self.tls_private_key.is_some()
    }
}

impl Default for General {
    fn default() -> General {
        General {
            host: Self::default_host(),
            port: Self::default_port(),
            worker_threads: Self::default_worker_threads(),
            max_connections: Self::default_max_connections(),
            packet_write_queue: Self::default_packet_write_queue(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            query_wait_timeout_ms: Self::default_query_wait_timeout_ms(),
            log_session: true,
            log_query: false,
            log_config: false,
            log_debug: false,
            tls_cert_file: None,
            tls_private_key: None,
        }
    }
}
