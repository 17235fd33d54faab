//! Per-route traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RouteStats {
    /// Bytes received from clients of this route.
    recv_client: AtomicU64,

    /// Bytes received from servers of this route.
    recv_server: AtomicU64,

    /// Completed queries.
    queries: AtomicU64,

    /// Total query time in microseconds.
    query_time_us: AtomicU64,
}

impl RouteStats {
    pub fn recv_client(&self, bytes: usize) {
        self.recv_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn recv_server(&self, bytes: usize) {
        self.recv_server.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn query(&self, micros: u64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn total_recv_client(&self) -> u64 {
        self.recv_client.load(Ordering::Relaxed)
    }

    pub fn total_recv_server(&self) -> u64 {
        self.recv_server.load(Ordering::Relaxed)
    }

    pub fn total_queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn total_query_time_us(&self) -> u64 {
        self.query_time_us.load(Ordering::Relaxed)
    }
}
