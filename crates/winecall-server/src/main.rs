//! winecall-server - executes DLL routines inside a Wine prefix on behalf of
//! a native winecall session.

use anyhow::{Context, Result};
use clap::Parser;
use winecall_abi::Arch;
use winecall_logging::{init_logging, LoggingOptions};
use winecall_rpc::ConnectionInfo;
use winecall_server::ffi::FfiBackend;
use winecall_server::{install_log_hook, ForeignServer};

#[derive(Parser, Debug)]
#[command(
    name = "winecall-server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Foreign-side server of a winecall session"
)]
struct Args {
    /// Session identifier
    #[arg(long)]
    id: String,

    /// Address of both loopback listeners
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Native listener for callbacks and log lines
    #[arg(long)]
    port_in: u16,

    /// Port to serve routine requests on
    #[arg(long)]
    port_out: u16,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let lines = install_log_hook(&args.id);
    let _logging = init_logging(LoggingOptions {
        level: Some(args.log_level.clone()),
        stderr: false,
    });

    let connection = ConnectionInfo {
        session_id: args.id,
        ip: args.host,
        port_in: args.port_in,
        port_out: args.port_out,
        log_level: args.log_level,
    };
    let arch = Arch::host();
    let mut server = ForeignServer::start(&connection, arch, Box::new(FfiBackend::new(arch)))
        .with_context(|| format!("failed to start session {}", connection.session_id))?;
    server
        .forward_logs(lines)
        .context("failed to start log forwarding")?;

    server.wait();
    log::debug!("session {} finished", connection.session_id);
    Ok(())
}
