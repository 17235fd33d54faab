// Helper functions to build, parse and move protocol messages.

pub mod chunk;
pub mod constants;
pub mod protocol;
pub mod socket;

pub use chunk::{Chunk, PacketReader, CHUNK_BUFFER_SIZE};
pub use protocol::{
    authentication_ok, backend_key_data, command_complete, data_row, error_message,
    md5_challenge, md5_hash_password, md5_hash_second_pass, parameter_status,
    parse_parameter_status, parse_startup_params, parse_text, password_message,
    plain_password_challenge, query_text, ready_for_query, row_description, simple_query,
    startup_message, PgErrorMsg,
};
pub use socket::{configure_tcp_socket, read_password, write_all, write_all_flush};

pub use constants::*;

#[cfg(test)]
mod protocol_tests;
