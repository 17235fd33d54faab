//! Route ownership and server leasing.
//!
//! The router owns every route and every pooled server connection. Sessions
//! hold a borrowed `Arc<Route>` and, while attached, an exclusive [`Lease`]
//! on one server. All lease transitions go through the router so that a
//! server is never shared and the cancel registry always describes the
//! current (session, server) pairing.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::Sender;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::client::{ClientId, ControlOp};
use crate::config::{Config, PoolMode, StorageType};
use crate::errors::Error;
use crate::server::{Server, ServerParameters};
use crate::stats::RouteStats;

/// Where to send an upstream cancel for a running session.
#[derive(Debug, Clone)]
pub struct CancelTarget {
    pub host: String,
    pub port: u16,
    pub process_id: i32,
    pub secret_key: i32,
}

/// Why a session could not be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteRefusal {
    NotFound { database: String, user: String },
    Limit,
    Internal,
}

/// The pooling equivalence class for a (database, user) pair.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub database: String,
    pub username: String,

    pub pool_mode: PoolMode,
    pub storage: StorageType,
    pub client_fwd_error: bool,

    pub server_host: String,
    pub server_port: u16,
    pub server_database: String,
    pub application_name: String,
    pub user: crate::config::User,

    pub pool_size: usize,
    max_client_conn: usize,

    /// Advertised parameter set, fixed by the first successful backend
    /// startup. The lock is held only long enough to copy.
    params: Mutex<ServerParameters>,

    /// Idle servers ready for reuse.
    idle: Mutex<Vec<Server>>,

    /// Bounds concurrent leases to `pool_size`.
    slots: Arc<Semaphore>,

    clients: AtomicUsize,

    pub stats: RouteStats,
}

impl Route {
    /// Copy of the cached advertised parameter set.
    pub fn params_snapshot(&self) -> ServerParameters {
        self.params.lock().clone()
    }

    /// Populate the parameter cache if this is the first backend startup.
    pub fn seed_params(&self, params: &ServerParameters) {
        let mut guard = self.params.lock();
        if guard.is_empty() {
            *guard = params.clone();
        }
    }

    pub fn idle_servers(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn leased_servers(&self) -> usize {
        self.pool_size - self.slots.available_permits()
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Put a server into the idle pool.
    pub(crate) fn checkin(&self, server: Server) {
        self.idle.lock().push(server);
    }
}

/// An exclusive lease on one pooled server connection.
#[derive(Debug)]
pub struct Lease {
    pub server: Server,
    _permit: OwnedSemaphorePermit,
}

impl Deref for Lease {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Server {
        &mut self.server
    }
}

#[derive(Hash, Debug, Clone, PartialEq, Eq)]
struct RouteKey {
    database: String,
    user: String,
}

pub struct Router {
    routes: HashMap<RouteKey, Arc<Route>>,

    /// (key_pid, key) advertised to a client -> upstream cancel target,
    /// valid for the lifetime of the current lease.
    cancel_map: DashMap<(i32, i32), CancelTarget>,

    /// Session id -> control channel, for console kills and shutdown.
    kill_map: DashMap<ClientId, Sender<ControlOp>>,
}

impl Router {
    pub fn from_config(config: &Config) -> Router {
        let mut routes = HashMap::new();

        for (pool_name, pool) in &config.pools {
            for user in &pool.users {
                let key = RouteKey {
                    database: pool_name.clone(),
                    user: user.username.clone(),
                };
                let route = Route {
                    name: format!("{}.{}", pool_name, user.username),
                    database: pool_name.clone(),
                    username: user.username.clone(),
                    pool_mode: pool.pool_mode,
                    storage: pool.storage_type,
                    client_fwd_error: pool.client_fwd_error,
                    server_host: pool.server_host.clone(),
                    server_port: pool.server_port,
                    server_database: pool
                        .server_database
                        .clone()
                        .unwrap_or_else(|| pool_name.clone()),
                    application_name: pool
                        .application_name
                        .clone()
                        .unwrap_or_else(|| "pg_usher".to_string()),
                    user: user.clone(),
                    pool_size: pool.pool_size as usize,
                    max_client_conn: pool.max_client_conn,
                    params: Mutex::new(ServerParameters::new()),
                    idle: Mutex::new(Vec::new()),
                    slots: Arc::new(Semaphore::new(pool.pool_size as usize)),
                    clients: AtomicUsize::new(0),
                    stats: RouteStats::default(),
                };
                routes.insert(key, Arc::new(route));
            }
        }

        Router {
            routes,
            cancel_map: DashMap::new(),
            kill_map: DashMap::new(),
        }
    }

    /// Assign a session to its route. Idempotent per session: called once,
    /// before authentication.
    pub fn route(&self, database: &str, user: &str) -> Result<Arc<Route>, RouteRefusal> {
        let key = RouteKey {
            database: database.to_string(),
            user: user.to_string(),
        };
        let Some(route) = self.routes.get(&key) else {
            return Err(RouteRefusal::NotFound {
                database: database.to_string(),
                user: user.to_string(),
            });
        };

        let clients = route.clients.fetch_add(1, Ordering::SeqCst) + 1;
        if route.max_client_conn > 0 && clients > route.max_client_conn {
            route.clients.fetch_sub(1, Ordering::SeqCst);
            return Err(RouteRefusal::Limit);
        }

        Ok(route.clone())
    }

    /// Drop the session's route reference and its registry entries.
    pub fn unroute(&self, id: ClientId, key: (i32, i32), route: &Route) {
        route.clients.fetch_sub(1, Ordering::SeqCst);
        self.cancel_map.remove(&key);
        self.kill_map.remove(&id);
    }

    /// Lease a server from the route pool, waiting if every slot is in use.
    /// The returned server may not have an upstream socket yet.
    pub async fn attach(&self, route: &Arc<Route>) -> Result<Lease, Error> {
        let wait = crate::config::get_config().general.query_wait_timeout();
        let permit = match timeout(wait, route.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                warn!("Route {}: no server became available", route.name);
                return Err(Error::PoolWaitTimeout);
            }
        };

        let server = route.idle.lock().pop().unwrap_or_else(Server::vacant);
        Ok(Lease {
            server,
            _permit: permit,
        })
    }

    /// Return a leased server to its route pool. The server must be
    /// reusable.
    pub fn detach(&self, route: &Route, key: (i32, i32), lease: Lease) {
        self.cancel_map.remove(&key);
        debug!("Route {}: server {} back in pool", route.name, lease.server.id);
        route.checkin(lease.server);
        // The permit drops here, freeing the slot.
    }

    /// Destroy a leased server, freeing its slot.
    pub fn close(&self, key: (i32, i32), lease: Lease) {
        self.cancel_map.remove(&key);
        drop(lease);
    }

    /// Make the session's key cancel the given upstream backend, for the
    /// duration of the current lease.
    pub fn register_cancel(&self, key: (i32, i32), target: CancelTarget) {
        self.cancel_map.insert(key, target);
    }

    /// Look up the session a cancel-request connection points at.
    pub fn cancel(&self, key: (i32, i32)) -> Option<CancelTarget> {
        self.cancel_map.get(&key).map(|entry| entry.value().clone())
    }

    pub fn register_kill(&self, id: ClientId, sender: Sender<ControlOp>) {
        self.kill_map.insert(id, sender);
    }

    /// Inject KILL into one session. Returns false when the id is unknown.
    pub fn kill(&self, id: ClientId) -> bool {
        match self.kill_map.get(&id) {
            Some(sender) => {
                let _ = sender.try_send(ControlOp::Kill);
                true
            }
            None => false,
        }
    }

    /// Inject KILL into every registered session (shutdown).
    pub fn kill_all(&self) {
        for entry in self.kill_map.iter() {
            let _ = entry.value().try_send(ControlOp::Kill);
        }
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.kill_map.iter().map(|entry| *entry.key()).collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }
}
