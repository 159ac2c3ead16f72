//! Uptime client: asks a server for its uptime and prints the reply.

use clap::Parser;
use remote_uptime::client;
use remote_uptime::logging::{self, LogLevel};
use std::io::Write;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(version = "0.1.0")]
#[command(about = "Requests system uptime from a remote-uptime server", long_about = None)]
struct ClientArgs {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Server address
    host: String,

    /// Server port
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    logging::init_stderr(if args.debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    let reply = client::request_sys_info((args.host.as_str(), args.port))?;
    info!(host = %args.host, port = args.port, bytes = reply.len(), "Reply received");

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&reply)?;
    stdout.flush()?;
    Ok(())
}
