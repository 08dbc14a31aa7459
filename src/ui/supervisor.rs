use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;

use anyhow::Context;
use log::info;

use super::EngineFactory;
use super::dap::server::DapServer;
use super::dap::spy::{SpyReader, SpySink, SpyWriter};
use super::dap::DapApplication;

/// How the adapter reaches its client.
pub enum Transport {
    /// Reader and writer bound to the process's standard streams.
    Stdio,
    /// TCP server accepting a single client.
    Tcp(SocketAddr),
}

/// Owns one debug session per client: binds the transport, runs the DAP
/// application over it, and returns when the client disconnects.
pub struct Supervisor;

impl Supervisor {
    pub fn run(
        transport: Transport,
        engine_factory: EngineFactory,
        trace_file: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        match transport {
            Transport::Tcp(addr) => {
                let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
                info!(target: "dap", "listening on {addr}");

                let (stream, peer) = listener.accept().context("accept DAP client")?;
                info!(target: "dap", "DAP client connected: {peer}");
                stream.set_nodelay(true)?;

                let reader = stream.try_clone().context("clone client stream")?;
                Self::serve(reader, stream, engine_factory, trace_file)
            }
            Transport::Stdio => Self::serve(io::stdin(), io::stdout(), engine_factory, trace_file),
        }
    }

    fn serve<R, W>(
        reader: R,
        writer: W,
        engine_factory: EngineFactory,
        trace_file: Option<PathBuf>,
    ) -> anyhow::Result<()>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        match trace_file {
            Some(path) => {
                let sink = SpySink::open(&path)
                    .with_context(|| format!("open trace file {}", path.display()))?;
                let server = DapServer::new(
                    BufReader::new(SpyReader::new(reader, sink.clone())),
                    BufWriter::new(SpyWriter::new(writer, sink)),
                );
                DapApplication::new(server, engine_factory).run()
            }
            None => {
                let server = DapServer::new(BufReader::new(reader), BufWriter::new(writer));
                DapApplication::new(server, engine_factory).run()
            }
        }
    }
}
