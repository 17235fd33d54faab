use super::*;

const MINIMAL: &str = r#"
[general]
port = 6433

[pools.shop]
server_host = "10.0.0.1"
users = [
    { username = "app", auth = "md5", password = "hunter2" },
]
"#;

#[test]
fn minimal_config_parses_with_defaults() {
    let config = parse(MINIMAL).unwrap();

    assert_eq!(config.general.port, 6433);
    assert_eq!(config.general.host, "0.0.0.0");
    assert_eq!(config.general.packet_write_queue, 8192);
    assert!(config.general.log_session);
    assert!(!config.general.tls_enabled());

    let pool = config.pools.get("shop").unwrap();
    assert_eq!(pool.pool_mode, PoolMode::Transaction);
    assert_eq!(pool.storage_type, StorageType::Remote);
    assert_eq!(pool.server_host, "10.0.0.1");
    assert_eq!(pool.server_port, 5432);
    assert!(!pool.client_fwd_error);
    assert_eq!(pool.users[0].auth, AuthMethod::Md5);
}

#[test]
fn session_mode_and_local_storage_parse() {
    let config = parse(
        r#"
[pools.console]
pool_mode = "session"
storage_type = "local"
users = [ { username = "admin", auth = "trust" } ]
"#,
    )
    .unwrap();

    let pool = config.pools.get("console").unwrap();
    assert_eq!(pool.pool_mode, PoolMode::Session);
    assert_eq!(pool.storage_type, StorageType::Local);
}

#[test]
fn empty_config_is_rejected() {
    assert!(parse("").is_err());
}

#[test]
fn missing_password_with_md5_is_rejected() {
    let err = parse(
        r#"
[pools.shop]
users = [ { username = "app", auth = "md5" } ]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("no password"));
}

#[test]
fn duplicate_users_are_rejected() {
    let err = parse(
        r#"
[pools.shop]
users = [
    { username = "app", auth = "trust" },
    { username = "app", auth = "trust" },
]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn lone_tls_cert_is_rejected() {
    let err = parse(
        r#"
[general]
tls_cert_file = "server.pem"

[pools.shop]
users = [ { username = "app", auth = "trust" } ]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("tls"));
}

#[test]
fn server_credentials_fall_back() {
    let user = User {
        username: "app".into(),
        auth: AuthMethod::Md5,
        password: Some("pw".into()),
        server_username: None,
        server_password: None,
    };
    assert_eq!(user.server_credentials(), ("app", Some("pw")));

    let mapped = User {
        server_username: Some("svc".into()),
        server_password: Some("spw".into()),
        ..user
    };
    assert_eq!(mapped.server_credentials(), ("svc", Some("spw")));
}
