use pg_usher::{app, config};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::args::parse();

    let config = match config::load(&args.config_file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    if args.test_config {
        println!("Config {} is ok", args.config_file);
        std::process::exit(exitcode::OK);
    }

    app::logger::init_logging(&args, &config);
    config::set_config(config.clone());

    if let Err(err) = app::server::run_server(config) {
        log::error!("Server error: {err}");
        std::process::exit(exitcode::OSERR);
    }
}
