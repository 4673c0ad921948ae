//! Bridges the message channel of a `spyder-lsp` client and a language
//! server speaking Content-Length framed JSON-RPC over TCP or stdio.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use serde_json::json;
use spyder_lsp::DEFAULT_HOST;
use spyder_lsp::DEFAULT_PORT;
use spyder_lsp::jsonrpc::Message;
use spyder_lsp::jsonrpc::read_message;
use spyder_lsp::jsonrpc::write_message;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const LOOPBACK: &str = "127.0.0.1";
const SERVER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_CONNECT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "spyder-lsp-transport", version)]
struct Args {
    /// Workspace root of the client.
    #[arg(long)]
    folder: PathBuf,

    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    transport_debug: u8,

    #[arg(long, default_value = DEFAULT_HOST)]
    server_host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    server_port: u16,

    /// Port the host writes messages to.
    #[arg(long)]
    zmq_in_port: u16,

    /// Port the host reads messages from.
    #[arg(long)]
    zmq_out_port: u16,

    /// Spawn the server from the trailing arguments and talk over its stdio.
    #[arg(long, conflicts_with = "external_server")]
    stdio_server: bool,

    #[arg(long)]
    external_server: bool,

    #[arg(long, requires = "stdio_server")]
    server_log_file: Option<PathBuf>,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    server_argv: Vec<String>,
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

struct ServerConnection {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
}

impl ServerConnection {
    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.transport_debug);
    run(args).await
}

fn init_tracing(debug_level: u8) {
    let default = match debug_level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let from_host = TcpStream::connect((LOOPBACK, args.zmq_in_port))
        .await
        .with_context(|| format!("cannot connect to host port {}", args.zmq_in_port))?;
    let mut to_host = TcpStream::connect((LOOPBACK, args.zmq_out_port))
        .await
        .with_context(|| format!("cannot connect to host port {}", args.zmq_out_port))?;
    info!(folder = %args.folder.display(), "connected to host");

    let server = if args.stdio_server {
        spawn_stdio_server(&args)?
    } else {
        if args.external_server {
            debug!("using an external server");
        }
        connect_tcp_server(&args.server_host, args.server_port).await?
    };

    let ready = Message::notification("server_ready", json!({"pid": server.pid()}));
    write_message(&mut to_host, &ready)
        .await
        .context("cannot notify host")?;

    let ServerConnection {
        reader,
        writer,
        child,
    } = server;
    let outcome = tokio::select! {
        res = forward("host", BufReader::new(from_host), writer) => res,
        res = forward("server", BufReader::new(reader), to_host) => res,
    };

    if let Some(mut child) = child {
        if let Err(err) = child.kill().await {
            debug!("server already gone: {err}");
        }
    }
    info!("transport exiting");
    outcome
}

fn spawn_stdio_server(args: &Args) -> Result<ServerConnection> {
    let Some((program, server_args)) = args.server_argv.split_first() else {
        bail!("--stdio-server needs the server command line");
    };
    let stderr = match &args.server_log_file {
        Some(path) => Stdio::from(
            std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => Stdio::null(),
    };

    info!(program = %program, "spawning stdio server");
    let mut child = Command::new(program)
        .args(server_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("cannot spawn {program}"))?;
    let stdin = child.stdin.take().context("server stdin unavailable")?;
    let stdout = child.stdout.take().context("server stdout unavailable")?;
    Ok(ServerConnection {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        child: Some(child),
    })
}

/// Connects to a server that may still be starting up.
async fn connect_tcp_server(host: &str, port: u16) -> Result<ServerConnection> {
    let started = Instant::now();
    let stream = loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => break stream,
            Err(err) if started.elapsed() < SERVER_CONNECT_TIMEOUT => {
                debug!("server at {host}:{port} not ready: {err}");
                tokio::time::sleep(SERVER_CONNECT_INTERVAL).await;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("cannot connect to server at {host}:{port}"));
            }
        }
    };
    info!("connected to server at {host}:{port}");
    let (reader, writer) = stream.into_split();
    Ok(ServerConnection {
        reader: Box::new(reader),
        writer: Box::new(writer),
        child: None,
    })
}

/// Copies framed messages until `reader` closes.
async fn forward<R, W>(from: &'static str, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(err) if err.is_recoverable() => {
                warn!(from, "skipping malformed message: {err}");
                continue;
            }
            Err(err) => {
                debug!(from, "stream closed: {err}");
                return Ok(());
            }
        };
        debug!(from, method = ?msg.method, id = ?msg.id, "forwarding");
        write_message(&mut writer, &msg)
            .await
            .with_context(|| format!("cannot forward message from {from}"))?;
    }
}
