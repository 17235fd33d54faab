// Builders and parsers for individual protocol messages. Helpers here are
// pure; the socket module does the actual I/O.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};

use crate::errors::Error;

/// Create an ErrorResponse frame with severity ERROR and the given SQLSTATE.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    let mut error = BytesMut::new();

    // Error level
    error.put_u8(b'S');
    error.put_slice(&b"ERROR\0"[..]);

    // Error level (non-translatable)
    error.put_u8(b'V');
    error.put_slice(&b"ERROR\0"[..]);

    // SQLSTATE code.
    error.put_u8(b'C');
    error.put_slice(format!("{code}\0").as_bytes());

    // The short error message.
    error.put_u8(b'M');
    error.put_slice(format!("{message}\0").as_bytes());

    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Create a ReadyForQuery message.
pub fn ready_for_query(in_transaction: bool) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    if in_transaction {
        bytes.put_u8(b'T');
    } else {
        bytes.put_u8(b'I');
    }
    bytes
}

/// Create a ParameterStatus message.
pub fn parameter_status(key: &str, value: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    bytes.put_slice(key.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(value.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a BackendKeyData message carrying the cancellation key.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Create an AuthenticationOk message.
pub fn authentication_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(0);
    bytes
}

/// Create an AuthenticationCleartextPassword challenge.
pub fn plain_password_challenge() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(3);
    bytes
}

/// Create an AuthenticationMD5Password challenge with the given salt.
pub fn md5_challenge(salt: &[u8; 4]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'R');
    bytes.put_i32(12);
    bytes.put_i32(5);
    bytes.put_slice(&salt[..]);
    bytes
}

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a CommandComplete message.
pub fn command_complete(command: &str) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'C');
    res.put_i32(command.len() as i32 + 4 + 1);
    res.put_slice(command.as_bytes());
    res.put_u8(0);
    res
}

/// Create a RowDescription message. All columns are reported as text.
pub fn row_description(columns: &[&str]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut row_desc = BytesMut::new();

    row_desc.put_i16(columns.len() as i16);

    for name in columns {
        // Column name
        row_desc.put_slice(format!("{name}\0").as_bytes());

        // Doesn't belong to any table
        row_desc.put_i32(0);
        row_desc.put_i16(0);

        // Text oid, variable size, no modifier, text format
        row_desc.put_i32(25);
        row_desc.put_i16(-1);
        row_desc.put_i32(-1);
        row_desc.put_i16(0);
    }

    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);
    res
}

/// Create a DataRow message.
pub fn data_row(row: &[String]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    data_row.put_i16(row.len() as i16);

    for value in row {
        data_row.put_i32(value.len() as i32);
        data_row.put_slice(value.as_bytes());
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);
    res
}

/// Build the StartupMessage we send to an upstream server.
pub fn startup_message(user: &str, database: &str, application_name: &str) -> BytesMut {
    let mut bytes = BytesMut::new();

    // Protocol version
    bytes.put_i32(super::constants::PROTOCOL_VERSION_NUMBER);

    bytes.put(&b"user\0"[..]);
    bytes.put_slice(user.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"application_name\0"[..]);
    bytes.put_slice(application_name.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"database\0"[..]);
    bytes.put_slice(database.as_bytes());
    bytes.put_u8(0);
    bytes.put_u8(0); // Null terminator

    let len = bytes.len() as i32 + 4i32;
    let mut startup = BytesMut::with_capacity(len as usize);
    startup.put_i32(len);
    startup.put(bytes);
    startup
}

/// Parse the parameters of a startup packet as a key/value map.
pub fn parse_startup_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut result = HashMap::new();
    let mut buf = Vec::new();
    let mut tmp = String::new();

    while bytes.has_remaining() {
        let mut c = bytes.get_u8();

        // Null-terminated C-strings.
        while c != 0 {
            tmp.push(c as char);
            if !bytes.has_remaining() {
                return Err(Error::ClientBadStartup);
            }
            c = bytes.get_u8();
        }

        if !tmp.is_empty() {
            buf.push(tmp.clone());
            tmp.clear();
        }
    }

    // Expect pairs of name and value, and at least the mandatory user.
    if buf.len() % 2 != 0 || buf.len() < 2 {
        return Err(Error::ClientBadStartup);
    }

    let mut i = 0;
    while i < buf.len() {
        let name = buf[i].clone();
        let value = buf[i + 1].clone();
        let _ = result.insert(name, value);
        i += 2;
    }

    Ok(result)
}

/// Extract the SQL text of a complete simple query message, for logging.
pub fn query_text(message: &[u8]) -> Option<&str> {
    if message.len() < 6 {
        return None;
    }
    let payload = &message[5..];
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).ok()
}

/// Extract (statement name, SQL text) of a complete Parse message, for logging.
pub fn parse_text(message: &[u8]) -> Option<(&str, &str)> {
    if message.len() < 7 {
        return None;
    }
    let payload = &message[5..];
    let name_end = payload.iter().position(|b| *b == 0)?;
    let name = std::str::from_utf8(&payload[..name_end]).ok()?;
    let rest = &payload[name_end + 1..];
    let query_end = rest.iter().position(|b| *b == 0)?;
    let query = std::str::from_utf8(&rest[..query_end]).ok()?;
    Some((name, query))
}

/// Parse a complete ParameterStatus message into its (name, value) pair.
pub fn parse_parameter_status(message: &[u8]) -> Result<(String, String), Error> {
    if message.len() < 7 {
        return Err(Error::ProtocolSync(
            "ParameterStatus message is too short".into(),
        ));
    }
    let payload = &message[5..];
    let name_end = payload
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSync("ParameterStatus name is not nul-terminated".into()))?;
    let rest = &payload[name_end + 1..];
    let value_end = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSync("ParameterStatus value is not nul-terminated".into()))?;
    let name = String::from_utf8_lossy(&payload[..name_end]).to_string();
    let value = String::from_utf8_lossy(&rest[..value_end]).to_string();
    Ok((name, value))
}

/// Fields of an ErrorResponse / NoticeResponse message.
#[derive(Debug, Default, Clone)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl PgErrorMsg {
    /// Parse the field list of an ErrorResponse. `fields` is the message
    /// payload without the type byte and length.
    pub fn parse(fields: &[u8]) -> Result<PgErrorMsg, Error> {
        let mut msg = PgErrorMsg::default();
        let mut cursor = fields;

        loop {
            let Some((&field_type, rest)) = cursor.split_first() else {
                break;
            };
            if field_type == 0 {
                break;
            }
            let end = rest.iter().position(|b| *b == 0).ok_or_else(|| {
                Error::ProtocolSync("error field is not nul-terminated".into())
            })?;
            let value = String::from_utf8_lossy(&rest[..end]).to_string();
            match field_type {
                b'S' => msg.severity = value,
                b'C' => msg.code = value,
                b'M' => msg.message = value,
                b'D' => msg.detail = Some(value),
                b'H' => msg.hint = Some(value),
                _ => (),
            }
            cursor = &rest[end + 1..];
        }

        if msg.message.is_empty() {
            return Err(Error::ProtocolSync("error message has no M field".into()));
        }
        Ok(msg)
    }

    /// Parse a complete ErrorResponse frame including the header.
    pub fn parse_frame(frame: &[u8]) -> Result<PgErrorMsg, Error> {
        if frame.len() < 5 {
            return Err(Error::ProtocolSync("error frame is too short".into()));
        }
        Self::parse(&frame[5..])
    }
}

/// Create md5 password hash given a salt.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());

    let output = md5.finalize_reset();

    // Second pass
    md5_hash_second_pass(&format!("{output:x}"), salt)
}

pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize())
        .chars()
        .map(|x| x as u8)
        .collect::<Vec<u8>>();
    password.push(0);

    password
}

/// Build the password response frame for server-side authentication.
pub fn password_message(password: &[u8]) -> BytesMut {
    let mut message = BytesMut::with_capacity(password.len() + 5);
    message.put_u8(b'p');
    message.put_i32(password.len() as i32 + 4);
    message.put_slice(password);
    message
}
