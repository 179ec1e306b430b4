//! # emberd
//!
//! Static-file HTTP/1.1 server. One epoll dispatcher thread, a fixed
//! worker pool for parsing and response building.
//!
//! ## Usage
//!
//!     cargo run -p emberd --release -- [--port 9000] [--mode 1] [--root ./resource]
//!
//! Every flag has an `EMBER_*` environment equivalent; flags win.
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s -H 'Connection: keep-alive' http://127.0.0.1:9000/

use std::process::ExitCode;
use std::sync::OnceLock;

use ember_core::{log_error, Logger};
use ember_server::{Server, ServerConfig, ShutdownHandle};

static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

const USAGE: &str = "\
usage: emberd [options]

  -p, --port N          TCP port (default 9000)
      --host ADDR       IPv4 address to bind (default 0.0.0.0)
  -r, --root DIR        document root (default ./resource)
  -m, --mode MODE       trigger mode: 0 LT/LT, 1 ET/ET, 2 LT/ET, 3 ET/LT
  -w, --workers N       worker threads (default: CPU count)
      --timeout-ms N    idle connection timeout, 0 disables (default 30000)
      --max-conns N     connection limit (default 65536)
      --log-dir DIR     write rolling log files under DIR
      --log-level LVL   off|error|warn|info|debug|trace (default info)
      --sync-log        write log lines synchronously
      --no-linger       do not set SO_LINGER
      --no-reuseaddr    do not set SO_REUSEADDR
  -h, --help            show this help
";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let config = match ServerConfig::from_env().apply_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("emberd: {}\n\n{}", e, USAGE);
            return ExitCode::FAILURE;
        }
    };

    let logger = match Logger::from_config(&config.log) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("emberd: cannot open log: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::bind(config, logger.clone()) {
        Ok(server) => server,
        Err(e) => {
            log_error!(logger, "startup failed: {}", e);
            logger.flush();
            eprintln!("emberd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _ = SHUTDOWN.set(server.shutdown_handle());
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown as usize);
        libc::signal(libc::SIGTERM, handle_shutdown as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    eprintln!("emberd: listening on http://{}/", server.local_addr());

    let result = server.run();
    drop(server);
    logger.flush();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("emberd: {}", e);
            ExitCode::FAILURE
        }
    }
}

extern "C" fn handle_shutdown(_sig: libc::c_int) {
    if let Some(handle) = SHUTDOWN.get() {
        handle.trigger();
    }
}
