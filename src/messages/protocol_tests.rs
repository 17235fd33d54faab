//! Tests for protocol message handling.

use bytes::{BufMut, BytesMut};

use super::protocol::*;

#[test]
fn error_message_layout() {
    let msg = error_message("pg_usher: c00000001deadbeef: boom", "08006");

    assert_eq!(msg[0], b'E');
    let len = i32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize;
    assert_eq!(len + 1, msg.len());

    let parsed = PgErrorMsg::parse_frame(&msg).unwrap();
    assert_eq!(parsed.severity, "ERROR");
    assert_eq!(parsed.code, "08006");
    assert_eq!(parsed.message, "pg_usher: c00000001deadbeef: boom");
}

#[test]
fn ready_for_query_states() {
    assert_eq!(&ready_for_query(false)[..], &[b'Z', 0, 0, 0, 5, b'I']);
    assert_eq!(&ready_for_query(true)[..], &[b'Z', 0, 0, 0, 5, b'T']);
}

#[test]
fn backend_key_data_layout() {
    let msg = backend_key_data(0x01020304, 0x0a0b0c0d);
    assert_eq!(
        &msg[..],
        &[b'K', 0, 0, 0, 12, 1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d]
    );
}

#[test]
fn parameter_status_round_trips() {
    let msg = parameter_status("client_encoding", "UTF8");
    let (name, value) = parse_parameter_status(&msg).unwrap();
    assert_eq!(name, "client_encoding");
    assert_eq!(value, "UTF8");
}

#[test]
fn parse_startup_requires_pairs() {
    let mut bytes = BytesMut::new();
    bytes.put_slice(b"user\0alice\0database\0shop\0");
    let params = parse_startup_params(bytes).unwrap();
    assert_eq!(params.get("user").map(String::as_str), Some("alice"));
    assert_eq!(params.get("database").map(String::as_str), Some("shop"));

    let mut odd = BytesMut::new();
    odd.put_slice(b"user\0");
    assert!(parse_startup_params(odd).is_err());
}

#[test]
fn query_text_strips_terminator() {
    let msg = simple_query("SELECT 1;");
    assert_eq!(query_text(&msg), Some("SELECT 1;"));
}

#[test]
fn parse_text_extracts_name_and_query() {
    // P message: name "st1", query "SELECT $1", zero parameter types.
    let mut body = BytesMut::new();
    body.put_slice(b"st1\0SELECT $1\0");
    body.put_i16(0);
    let mut msg = BytesMut::new();
    msg.put_u8(b'P');
    msg.put_i32(4 + body.len() as i32);
    msg.put(body);

    assert_eq!(parse_text(&msg), Some(("st1", "SELECT $1")));
}

#[test]
fn md5_hash_matches_postgres_format() {
    let salt = [0x01, 0x02, 0x03, 0x04];
    let hash = md5_hash_password("alice", "secret", &salt);
    assert!(hash.starts_with(b"md5"));
    assert_eq!(*hash.last().unwrap(), 0);
    // 3 prefix chars + 32 hex digits + nul
    assert_eq!(hash.len(), 36);
    // Deterministic
    assert_eq!(hash, md5_hash_password("alice", "secret", &salt));
    assert_ne!(hash, md5_hash_password("alice", "other", &salt));
}

#[test]
fn pg_error_msg_parses_optional_fields() {
    let mut fields = BytesMut::new();
    fields.put_slice(b"SFATAL\0C3D000\0Mdatabase \"x\" does not exist\0Hcheck the name\0");
    fields.put_u8(0);

    let parsed = PgErrorMsg::parse(&fields).unwrap();
    assert_eq!(parsed.severity, "FATAL");
    assert_eq!(parsed.code, "3D000");
    assert_eq!(parsed.hint.as_deref(), Some("check the name"));
    assert!(parsed.detail.is_none());
}

#[test]
fn row_description_and_data_row_agree_on_columns() {
    let desc = row_description(&["database", "user"]);
    assert_eq!(desc[0], b'T');
    let count = i16::from_be_bytes([desc[5], desc[6]]);
    assert_eq!(count, 2);

    let row = data_row(&["shop".to_string(), "alice".to_string()]);
    assert_eq!(row[0], b'D');
    let count = i16::from_be_bytes([row[5], row[6]]);
    assert_eq!(count, 2);
}
