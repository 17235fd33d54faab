//! The local console: answers simple queries on routes backed by local
//! storage. Replies are produced as one frame batch and handed back through
//! a single-shot channel.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::{debug, error};
use tokio::sync::oneshot;

use crate::client::ClientId;
use crate::config::VERSION;
use crate::errors::Error;
use crate::messages::constants::FEATURE_NOT_SUPPORTED;
use crate::messages::{
    command_complete, data_row, error_message, query_text, ready_for_query, row_description,
};
use crate::router::Router;

/// Answer one console query. The reply batch is delivered through `reply`;
/// an `Err` means the request could not be parsed at all.
pub fn request(
    router: &Arc<Router>,
    client_id: ClientId,
    reply: oneshot::Sender<BytesMut>,
    message: &BytesMut,
) -> Result<(), Error> {
    let Some(sql) = query_text(message) else {
        return Err(Error::ProtocolSync("unreadable console query".into()));
    };

    debug!("[{client_id}] console: {sql}");

    let query = sql.trim().trim_end_matches(';').trim();
    let parts: Vec<&str> = query.split_whitespace().collect();

    let batch = match parts.first().map(|part| part.to_ascii_uppercase()) {
        Some(ref command) if command == "SHOW" => show(router, &parts),
        Some(ref command) if command == "KILL" => kill(router, client_id, &parts),
        _ => unsupported(client_id, query),
    };

    let _ = reply.send(batch);
    Ok(())
}

fn show(router: &Arc<Router>, parts: &[&str]) -> BytesMut {
    let subcommand = parts.get(1).map(|part| part.to_ascii_uppercase());

    match subcommand.as_deref() {
        Some("VERSION") => {
            let mut batch = row_description(&["version"]);
            batch.put(data_row(&[format!("pg_usher {VERSION}")]));
            batch.put(command_complete("SHOW"));
            batch.put(ready_for_query(false));
            batch
        }

        Some("POOLS") => {
            let mut batch = row_description(&[
                "database", "user", "pool_mode", "storage", "idle", "leased", "clients",
            ]);
            for route in router.routes() {
                batch.put(data_row(&[
                    route.database.clone(),
                    route.username.clone(),
                    route.pool_mode.to_string(),
                    route.storage.to_string(),
                    route.idle_servers().to_string(),
                    route.leased_servers().to_string(),
                    route.client_count().to_string(),
                ]));
            }
            batch.put(command_complete("SHOW"));
            batch.put(ready_for_query(false));
            batch
        }

        Some("CLIENTS") => {
            let mut batch = row_description(&["client"]);
            for id in router.client_ids() {
                batch.put(data_row(&[id.to_string()]));
            }
            batch.put(command_complete("SHOW"));
            batch.put(ready_for_query(false));
            batch
        }

        Some("STATS") => {
            let mut batch = row_description(&[
                "database",
                "user",
                "queries",
                "query_time_us",
                "recv_client",
                "recv_server",
            ]);
            for route in router.routes() {
                batch.put(data_row(&[
                    route.database.clone(),
                    route.username.clone(),
                    route.stats.total_queries().to_string(),
                    route.stats.total_query_time_us().to_string(),
                    route.stats.total_recv_client().to_string(),
                    route.stats.total_recv_server().to_string(),
                ]));
            }
            batch.put(command_complete("SHOW"));
            batch.put(ready_for_query(false));
            batch
        }

        _ => {
            error!("unsupported console SHOW subcommand: {parts:?}");
            let mut batch = error_message(
                "unsupported SHOW command, try VERSION, POOLS, CLIENTS or STATS",
                FEATURE_NOT_SUPPORTED,
            );
            batch.put(ready_for_query(false));
            batch
        }
    }
}

fn kill(router: &Arc<Router>, client_id: ClientId, parts: &[&str]) -> BytesMut {
    let target = parts.get(1).and_then(|part| part.parse::<ClientId>().ok());

    match target {
        Some(target) if router.kill(target) => {
            let mut batch = command_complete("KILL");
            batch.put(ready_for_query(false));
            batch
        }
        _ => {
            let text = format!("pg_usher: {client_id}: no such client");
            let mut batch = error_message(&text, FEATURE_NOT_SUPPORTED);
            batch.put(ready_for_query(false));
            batch
        }
    }
}

fn unsupported(client_id: ClientId, query: &str) -> BytesMut {
    error!("[{client_id}] unsupported console command: {query}");
    let text = format!("pg_usher: {client_id}: unsupported command");
    let mut batch = error_message(&text, FEATURE_NOT_SUPPORTED);
    batch.put(ready_for_query(false));
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::messages::simple_query;

    fn console_router() -> Arc<Router> {
        let cfg = config::parse(
            r#"
[pools.console]
storage_type = "local"
pool_mode = "session"
users = [ { username = "admin", auth = "trust" } ]
"#,
        )
        .unwrap();
        config::set_config(cfg.clone());
        Arc::new(Router::from_config(&cfg))
    }

    fn run(router: &Arc<Router>, sql: &str) -> BytesMut {
        let (tx, mut rx) = oneshot::channel();
        request(router, ClientId::generate(), tx, &simple_query(sql)).unwrap();
        rx.try_recv().unwrap()
    }

    #[test]
    fn show_version_is_a_one_row_result() {
        let router = console_router();
        let batch = run(&router, "SHOW VERSION;");

        // RowDescription first, ReadyForQuery(idle) last.
        assert_eq!(batch[0], b'T');
        assert!(String::from_utf8_lossy(&batch).contains("pg_usher"));
        assert_eq!(batch[batch.len() - 6], b'Z');
        assert_eq!(batch[batch.len() - 1], b'I');
    }

    #[test]
    fn show_pools_lists_routes() {
        let router = console_router();
        let batch = run(&router, "show pools");
        let body = String::from_utf8_lossy(&batch);
        assert!(body.contains("console"));
        assert!(body.contains("admin"));
        assert!(body.contains("session"));
    }

    #[test]
    fn show_stats_reports_route_counters() {
        let router = console_router();
        let route = router.route("console", "admin").unwrap();
        route.stats.recv_client(4096);
        route.stats.query(1234);

        let batch = run(&router, "SHOW STATS");
        let body = String::from_utf8_lossy(&batch);
        assert!(body.contains("1234"));
        assert!(body.contains("4096"));
    }

    #[test]
    fn unknown_commands_get_an_error_and_fresh_ready() {
        let router = console_router();
        let batch = run(&router, "DROP TABLE users");
        assert_eq!(batch[0], b'E');
        assert_eq!(batch[batch.len() - 6], b'Z');
    }

    #[test]
    fn kill_reaches_a_registered_session() {
        let router = console_router();
        let victim = ClientId::generate();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        router.register_kill(victim, tx);

        let batch = run(&router, &format!("KILL {victim}"));
        assert_eq!(batch[0], b'C');
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::client::ControlOp::Kill
        );

        let batch = run(&router, "KILL c0000000000000000");
        assert_eq!(batch[0], b'E');
    }
}
