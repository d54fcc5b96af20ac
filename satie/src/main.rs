use satie::{logging, Config, Server};

fn main() {
    let cfg = Config::from_env();

    let _log_guard = match logging::init(&cfg) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("satie: {}", e);
            std::process::exit(1);
        }
    };

    let server = match Server::new(cfg) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("satie: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.install_signal_handler() {
        eprintln!("satie: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server.run() {
        tracing::error!(error = %e, "server terminated");
        eprintln!("satie: {}", e);
        std::process::exit(1);
    }
}
