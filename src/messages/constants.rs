//! Wire protocol constants.

/// Protocol version 3.0.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;
/// Magic code of the version-less SSLRequest frame.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Magic code of the version-less CancelRequest frame.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
/// Magic code of the version-less GSSENCRequest frame.
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

// Frontend (client -> server) message type codes.
pub const QUERY: u8 = b'Q';
pub const PARSE: u8 = b'P';
pub const SYNC: u8 = b'S';
pub const FUNCTION_CALL: u8 = b'F';
pub const TERMINATE: u8 = b'X';
pub const COPY_FAIL: u8 = b'f';
pub const PASSWORD_MESSAGE: u8 = b'p';

// Both directions.
pub const COPY_DONE: u8 = b'c';
pub const COPY_DATA: u8 = b'd';

// Backend (server -> client) message type codes.
pub const AUTHENTICATION: u8 = b'R';
pub const BACKEND_KEY_DATA: u8 = b'K';
pub const PARAMETER_STATUS: u8 = b'S';
pub const READY_FOR_QUERY: u8 = b'Z';
pub const ERROR_RESPONSE: u8 = b'E';
pub const NOTICE_RESPONSE: u8 = b'N';
pub const COPY_IN_RESPONSE: u8 = b'G';
pub const COPY_OUT_RESPONSE: u8 = b'H';
pub const ROW_DESCRIPTION: u8 = b'T';
pub const DATA_ROW: u8 = b'D';
pub const COMMAND_COMPLETE: u8 = b'C';

// Authentication request codes carried in 'R' messages.
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;

// SQLSTATE codes used in error frames we originate.
pub const PROTOCOL_VIOLATION: &str = "08P01";
pub const CONNECTION_FAILURE: &str = "08006";
pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
pub const UNDEFINED_DATABASE: &str = "3D000";
pub const TOO_MANY_CONNECTIONS: &str = "53300";
pub const SYSTEM_ERROR: &str = "XX000";
pub const INVALID_PASSWORD: &str = "28P01";
