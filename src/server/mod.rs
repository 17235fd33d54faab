//! `crate::server` module (upstream PostgreSQL connection handling).

mod backend;
pub(crate) mod cancel;
pub(crate) mod parameters;
pub(crate) mod stream;

pub use backend::{Server, ServerId};
pub(crate) use backend::ServerTurn;
pub use parameters::ServerParameters;
pub use stream::StreamInner;
