use tracing_subscriber::EnvFilter;

use crate::config::{Config, VERSION};

use super::args::{Args, LogFormat};

pub fn init_logging(args: &Args, config: &Config) {
    // log_debug in the config wins over the command line.
    let level = if config.general.log_debug {
        tracing::Level::DEBUG
    } else {
        args.log_level
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let trace_sub = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);

    match args.log_format {
        LogFormat::Structured => trace_sub.json().init(),
        LogFormat::Debug => trace_sub.pretty().init(),
        _ => trace_sub.init(),
    };

    log::info!("Welcome to pg_usher! (Version {VERSION})");
}
