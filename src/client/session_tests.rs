//! End-to-end session tests: a duplex pipe plays the client, a loopback
//! TCP socket plays the upstream server.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config;
use crate::messages::{
    command_complete, data_row, parameter_status, ready_for_query, row_description, simple_query,
};
use crate::router::Router;
use crate::server::{Server, ServerParameters, StreamInner};

use super::core::{Client, ClientId, ControlOp, SessionOutcome};
use super::startup::StartupRecord;

const TERMINATE_FRAME: [u8; 5] = [b'X', 0, 0, 0, 4];

fn test_config(pool_mode: &str, extra: &str) -> config::Config {
    config::parse(&format!(
        r#"
[general]
log_session = false
query_wait_timeout_ms = 2000

[pools.shop]
pool_mode = "{pool_mode}"
pool_size = 1
{extra}
users = [ {{ username = "app", auth = "trust" }} ]
"#
    ))
    .unwrap()
}

fn startup_record() -> StartupRecord {
    let mut params = std::collections::HashMap::new();
    params.insert("user".to_string(), "app".to_string());
    params.insert("database".to_string(), "shop".to_string());
    StartupRecord {
        user: "app".to_string(),
        database: "shop".to_string(),
        params,
    }
}

/// A connected Server plus the upstream end of its socket.
async fn connected_server() -> (Server, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pooled_side = TcpStream::connect(addr).await.unwrap();
    let (upstream_side, _) = listener.accept().await.unwrap();

    let mut server = Server::vacant();
    server.stream = Some(BufStream::new(StreamInner::Tcp {
        stream: pooled_side,
    }));
    server.process_id = 77;
    server.secret_key = 88;
    (server, upstream_side)
}

struct Session {
    router: Arc<Router>,
    client: Client<DuplexStream>,
    /// The simulated psql end of the connection.
    psql: DuplexStream,
    kill_tx: mpsc::Sender<ControlOp>,
}

fn build_session(cfg: config::Config) -> Session {
    config::set_config(cfg.clone());
    let router = Arc::new(Router::from_config(&cfg));

    let (psql, pooler_side) = tokio::io::duplex(1024 * 1024);
    let id = ClientId::generate();
    let (kill_tx, kill_rx) = mpsc::channel(1);

    let addr = "127.0.0.1:1".parse().unwrap();
    let mut client = Client::new(pooler_side, addr, id, startup_record(), kill_rx, router.clone());

    let route = router.route("shop", "app").unwrap();
    client.route = Some(route);
    router.register_kill(id, kill_tx.clone());

    Session {
        router,
        client,
        psql,
        kill_tx,
    }
}

async fn read_exactly(stream: &mut (impl AsyncReadExt + Unpin), len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn transaction_pool_forwards_and_detaches_at_idle() {
    let mut session = build_session(test_config("transaction", ""));
    let (server, mut upstream) = connected_server().await;
    let route = session.client.route().clone();
    route.checkin(server);

    let mut client = session.client;
    let relay = tokio::spawn(async move {
        let outcome = client.relay().await;
        (client, outcome)
    });

    // Simple query goes out and must arrive upstream byte-for-byte.
    let query = simple_query("SELECT 1");
    session.psql.write_all(&query).await.unwrap();
    let got = read_exactly(&mut upstream, query.len()).await;
    assert_eq!(got, query[..]);

    // The whole result set comes back verbatim.
    let mut reply = BytesMut::new();
    reply.put(row_description(&["?column?"]));
    reply.put(data_row(&["1".to_string()]));
    reply.put(command_complete("SELECT 1"));
    reply.put(ready_for_query(false));
    upstream.write_all(&reply).await.unwrap();

    let got = read_exactly(&mut session.psql, reply.len()).await;
    assert_eq!(got, reply[..]);

    // Transaction pooling: the idle boundary returned the server to the
    // pool before the client saw ReadyForQuery.
    assert_eq!(route.idle_servers(), 1);
    assert_eq!(route.leased_servers(), 0);

    // Terminate ends the session without touching the pool again.
    session.psql.write_all(&TERMINATE_FRAME).await.unwrap();
    let (mut client, outcome) = relay.await.unwrap();
    assert_eq!(outcome, SessionOutcome::Terminate);

    client.cleanup(outcome).await;
    assert_eq!(route.client_count(), 0);
    assert_eq!(route.idle_servers(), 1);
}

#[tokio::test]
async fn deploy_replies_are_swallowed_before_the_query_response() {
    let mut session = build_session(test_config("transaction", ""));
    let (server, mut upstream) = connected_server().await;
    let route = session.client.route().clone();
    route.checkin(server);

    // The session carries a tracked parameter the pooled server has not
    // seen, forcing a one-statement deploy at attach time.
    session
        .client
        .params
        .set_param("application_name".into(), "psql".into(), true);

    let mut client = session.client;
    let relay = tokio::spawn(async move {
        let outcome = client.relay().await;
        (client, outcome)
    });

    let query = simple_query("SELECT 2");
    session.psql.write_all(&query).await.unwrap();

    // Upstream sees the deploy first, then the query.
    let deploy = simple_query("SET application_name TO 'psql'");
    let got = read_exactly(&mut upstream, deploy.len() + query.len()).await;
    assert_eq!(&got[..deploy.len()], &deploy[..]);
    assert_eq!(&got[deploy.len()..], &query[..]);

    // Replies to the deploy: status change, completion, ready. All of it
    // must be discarded, never forwarded.
    let mut deploy_reply = BytesMut::new();
    deploy_reply.put(parameter_status("application_name", "psql"));
    deploy_reply.put(command_complete("SET"));
    deploy_reply.put(ready_for_query(false));
    upstream.write_all(&deploy_reply).await.unwrap();

    // The query response follows and is the first thing the client sees.
    let mut reply = BytesMut::new();
    reply.put(command_complete("SELECT 2"));
    reply.put(ready_for_query(false));
    upstream.write_all(&reply).await.unwrap();

    let got = read_exactly(&mut session.psql, reply.len()).await;
    assert_eq!(got, reply[..]);

    // The deploy sync completed and the idle boundary detached the server.
    assert_eq!(route.idle_servers(), 1);

    session.psql.write_all(&TERMINATE_FRAME).await.unwrap();
    let (_, outcome) = relay.await.unwrap();
    assert_eq!(outcome, SessionOutcome::Terminate);
}

#[tokio::test]
async fn warm_reuse_by_the_same_session_skips_the_deploy() {
    let mut session = build_session(test_config("transaction", ""));
    let (mut server, mut upstream) = connected_server().await;
    let route = session.client.route().clone();

    // The pooled server was last configured by this very session.
    server.last_client_id = Some(session.client.id);
    let mut desired = ServerParameters::new();
    desired.set_param("application_name".into(), "psql".into(), true);
    server.params = desired;
    route.checkin(server);

    session
        .client
        .params
        .set_param("application_name".into(), "psql".into(), true);

    let mut client = session.client;
    let relay = tokio::spawn(async move {
        let outcome = client.relay().await;
        (client, outcome)
    });

    let query = simple_query("SELECT 3");
    session.psql.write_all(&query).await.unwrap();

    // No SET precedes the query.
    let got = read_exactly(&mut upstream, query.len()).await;
    assert_eq!(got, query[..]);

    let mut reply = BytesMut::new();
    reply.put(command_complete("SELECT 3"));
    reply.put(ready_for_query(false));
    upstream.write_all(&reply).await.unwrap();
    let _ = read_exactly(&mut session.psql, reply.len()).await;

    session.psql.write_all(&TERMINATE_FRAME).await.unwrap();
    let (_, outcome) = relay.await.unwrap();
    assert_eq!(outcome, SessionOutcome::Terminate);
}

#[tokio::test]
async fn parameter_status_updates_the_session_map_before_forwarding() {
    let mut session = build_session(test_config("session", ""));
    let (server, mut upstream) = connected_server().await;
    let route = session.client.route().clone();
    route.checkin(server);

    let mut client = session.client;
    let relay = tokio::spawn(async move {
        let outcome = client.relay().await;
        (client, outcome)
    });

    let query = simple_query("SET TimeZone TO 'UTC'");
    session.psql.write_all(&query).await.unwrap();
    let _ = read_exactly(&mut upstream, query.len()).await;

    let mut reply = BytesMut::new();
    reply.put(parameter_status("TimeZone", "UTC"));
    reply.put(command_complete("SET"));
    reply.put(ready_for_query(false));
    upstream.write_all(&reply).await.unwrap();
    let got = read_exactly(&mut session.psql, reply.len()).await;
    assert_eq!(got, reply[..]);

    session.psql.write_all(&TERMINATE_FRAME).await.unwrap();
    let (client, outcome) = relay.await.unwrap();
    assert_eq!(outcome, SessionOutcome::Terminate);

    // The relay recorded the change on its way through.
    assert_eq!(client.params.get("TimeZone").map(String::as_str), Some("UTC"));

    // Session pooling kept the server attached for the whole session.
    assert_eq!(route.idle_servers(), 0);
    assert_eq!(route.leased_servers(), 1);
}

#[tokio::test]
async fn kill_word_interrupts_an_idle_session() {
    let session = build_session(test_config("transaction", ""));
    let mut client = session.client;

    let relay = tokio::spawn(async move { client.relay().await });

    // The session is parked in its poll; the control word wakes it.
    session.kill_tx.send(ControlOp::Kill).await.unwrap();

    let outcome = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Kill);
}

#[tokio::test]
async fn session_pool_resets_and_pools_the_server_on_disconnect() {
    let mut session = build_session(test_config("session", ""));
    let (server, mut upstream) = connected_server().await;
    let route = session.client.route().clone();
    route.checkin(server);

    let mut client = session.client;
    let relay = tokio::spawn(async move {
        let outcome = client.relay().await;
        client.cleanup(outcome).await;
        client
    });

    let query = simple_query("SELECT 4");
    session.psql.write_all(&query).await.unwrap();
    let _ = read_exactly(&mut upstream, query.len()).await;

    let mut reply = BytesMut::new();
    reply.put(command_complete("SELECT 4"));
    reply.put(ready_for_query(false));
    upstream.write_all(&reply).await.unwrap();
    let _ = read_exactly(&mut session.psql, reply.len()).await;

    session.psql.write_all(&TERMINATE_FRAME).await.unwrap();

    // Cleanup resets the session-pooled connection before pooling it.
    let discard = simple_query("DISCARD ALL");
    let got = read_exactly(&mut upstream, discard.len()).await;
    assert_eq!(got, discard[..]);

    let mut reset_reply = BytesMut::new();
    reset_reply.put(command_complete("DISCARD ALL"));
    reset_reply.put(ready_for_query(false));
    upstream.write_all(&reset_reply).await.unwrap();

    let client = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    assert!(client.server.is_none());
    assert_eq!(route.idle_servers(), 1);
    assert_eq!(route.client_count(), 0);
}

#[tokio::test]
async fn attach_failure_reports_a_connection_failure() {
    let cfg = test_config("transaction", "");
    let mut session = build_session(cfg);
    let route = session.client.route().clone();

    // Occupy the only slot so the session cannot attach.
    let blocker = session.router.attach(&route).await.unwrap();

    session.client.cleanup(SessionOutcome::AttachFailed).await;

    // 08006 with the canonical text reaches the client.
    let mut header = [0u8; 5];
    timeout(Duration::from_secs(5), session.psql.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header[0], b'E');
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize - 4;
    let body = read_exactly(&mut session.psql, len).await;
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("08006"));
    assert!(text.contains("failed to get remote server connection"));
    assert!(text.contains("pg_usher: c"));

    assert_eq!(route.client_count(), 0);
    drop(blocker);
}

#[tokio::test]
async fn configure_failure_keeps_the_server_without_reset() {
    let mut session = build_session(test_config("transaction", ""));
    let (server, _upstream) = connected_server().await;
    let route = session.client.route().clone();
    route.checkin(server);

    // The session dies during setup while holding an untouched server.
    let lease = session.router.attach(&route).await.unwrap();
    session.client.server = Some(lease);

    session
        .client
        .cleanup(SessionOutcome::ClientConfigureFailed)
        .await;

    // The server goes straight back to the pool, no reset traffic.
    assert_eq!(route.idle_servers(), 1);
    assert_eq!(route.client_count(), 0);

    let mut header = [0u8; 5];
    timeout(Duration::from_secs(5), session.psql.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header[0], b'E');
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize - 4;
    let body = read_exactly(&mut session.psql, len).await;
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("configuration error"));
}

#[tokio::test]
async fn stored_connect_error_is_forwarded_verbatim() {
    // A mock upstream that refuses startup with a FATAL error.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let refusal = crate::messages::error_message("database \"shop\" is on fire", "58000");
    let refusal_for_mock = refusal.clone();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut scratch = [0u8; 1024];
        let _ = socket.read(&mut scratch).await;
        socket.write_all(&refusal_for_mock).await.unwrap();
        socket.flush().await.unwrap();
        // Hold the socket open long enough for the frame to be consumed.
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let cfg = test_config(
        "transaction",
        &format!("client_fwd_error = true\nserver_host = \"127.0.0.1\"\nserver_port = {port}\n"),
    );
    let mut session = build_session(cfg);
    let route = session.client.route().clone();

    let outcome = session.client.attach("main").await.unwrap_err();
    assert_eq!(outcome, SessionOutcome::ServerConnectFailed);
    session.client.cleanup(outcome).await;

    // The client receives the upstream's error frame untouched.
    let got = read_exactly(&mut session.psql, refusal.len()).await;
    assert_eq!(got, refusal[..]);

    assert_eq!(route.client_count(), 0);
    assert_eq!(route.idle_servers(), 0);
}

#[tokio::test]
async fn large_queries_are_relayed_in_chunks() {
    let mut session = build_session(test_config("transaction", ""));
    let (server, mut upstream) = connected_server().await;
    let route = session.client.route().clone();
    route.checkin(server);

    let mut client = session.client;
    let relay = tokio::spawn(async move {
        let outcome = client.relay().await;
        (client, outcome)
    });

    // 64KiB of SQL: several chunks on the way through, one message upstream.
    let sql = format!("SELECT '{}'", "x".repeat(64 * 1024));
    let query = simple_query(&sql);
    session.psql.write_all(&query).await.unwrap();

    let got = read_exactly(&mut upstream, query.len()).await;
    assert_eq!(got, query[..]);

    let mut reply = BytesMut::new();
    reply.put(command_complete("SELECT 1"));
    reply.put(ready_for_query(false));
    upstream.write_all(&reply).await.unwrap();
    let _ = read_exactly(&mut session.psql, reply.len()).await;

    session.psql.write_all(&TERMINATE_FRAME).await.unwrap();
    let (_, outcome) = relay.await.unwrap();
    assert_eq!(outcome, SessionOutcome::Terminate);
}
