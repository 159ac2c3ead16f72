//! Uptime server.
//!
//! Listens on a TCP port and serves each connection in its own worker
//! process. The same binary doubles as the worker when started with the
//! hidden `--worker` flag.

use clap::Parser;
use remote_uptime::config::{CliArgs, Config, WorkerConfig};
use remote_uptime::logging;
use remote_uptime::server::Server;
use remote_uptime::worker;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    if let Some(settings) = cli.worker.as_deref() {
        let config = WorkerConfig::from_settings(settings)?;
        let _logger = logging::init(cli.log_level.unwrap_or_default());
        if let Err(e) = worker::run_process_worker(config) {
            error!(pid = std::process::id(), error = %e, "Worker failed");
            std::process::exit(1);
        }
        return Ok(());
    }

    // Load configuration
    let config = Config::from_cli(cli)?;

    // Initialize logging
    let logger = logging::init(config.log_level);

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        isolation = ?config.isolation,
        harden = config.worker.harden,
        read_timeout_ms = config.worker.read_timeout_ms,
        log_level = %logger.level(),
        "Starting uptime server"
    );

    let server = Server::bind(&config, logger)?;
    server.run()
}
