mod attach;
mod cleanup;
mod core;
mod entrypoint;
mod local;
mod relay;
mod setup;
mod startup;

pub use self::core::{Client, ClientId, ControlOp, SessionOutcome};
pub use self::entrypoint::{client_entrypoint, client_entrypoint_too_many};

#[cfg(test)]
mod session_tests;
