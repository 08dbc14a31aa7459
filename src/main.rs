//! masm-dap: Debug Adapter Protocol server for 32-bit MASM assembly programs.
//!
//! Serves a single IDE client over stdio (default) or a TCP socket and drives
//! the target through the native debugging engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::warn;

use masm_dap::ui::supervisor::{Supervisor, Transport};
use masm_dap::ui::EngineFactory;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen for the DAP client on a TCP address instead of serving stdio.
    #[clap(long)]
    listen: Option<SocketAddr>,

    /// Log file for adapter diagnostics and protocol traces.
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    trace_dap: bool,
}

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    masm_dap::log::LOGGER.switch(logger, filter);

    let args = Args::parse();

    if let Some(path) = &args.log_file {
        if let Err(e) = masm_dap::log::LOGGER.attach_diagnostics_file(path) {
            warn!(target: "dap", "cannot open log file {}: {e}", path.display());
        }
    }

    let trace_file = if args.trace_dap {
        if args.log_file.is_none() {
            warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
        }
        args.log_file
    } else {
        None
    };

    let transport = match args.listen {
        Some(addr) => Transport::Tcp(addr),
        None => Transport::Stdio,
    };

    Supervisor::run(transport, engine_factory(), trace_file)
}

#[cfg(windows)]
fn engine_factory() -> EngineFactory {
    use masm_dap::engine::DebugEngine;
    use masm_dap::engine::dbgeng::DbgEng;

    Arc::new(|| {
        let engine = DbgEng::create()?;
        Ok(Arc::new(engine) as Arc<dyn DebugEngine>)
    })
}

#[cfg(not(windows))]
fn engine_factory() -> EngineFactory {
    Arc::new(|| anyhow::bail!("the DbgEng engine backend is only available on Windows"))
}
