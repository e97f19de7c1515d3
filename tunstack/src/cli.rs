//! Parses the command line arguments and starts the tunnel.
//!
//! Basic usage with logging on:
//!
//! ```cargo run -p tunstack -- --server 127.0.0.1:9000 --log```

use crate::tunnel::{run, TunnelError, TunnelOptions};
use clap::Parser;
use std::{
    fs::{create_dir_all, OpenOptions},
    io,
    net::SocketAddrV4,
    sync::Arc,
};
use tokio::net::TcpStream;
use tracing_subscriber::FmtSubscriber;
use tunstack_core::config::DEFAULT_LINK_OVERHEAD;

/// Stores the different command line arguments.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address of the tunnel server
    #[arg(short, long)]
    server: String,
    /// Write JSON logs to ./logs instead of plain logs to stderr
    #[arg(short, long)]
    log: bool,
    /// Bytes of the advertised MTU taken by the tunnel's framing
    #[arg(long, default_value_t = DEFAULT_LINK_OVERHEAD)]
    link_overhead: u16,
    /// Hold received TCP payloads until a segment with PSH arrives
    #[arg(long)]
    buffer_until_push: bool,
    /// Fetch `/` over HTTP from this address once the tunnel is up
    #[arg(long)]
    fetch: Option<SocketAddrV4>,
}

/// Parses the arguments, connects to the tunnel server and runs until the
/// tunnel closes or the process is interrupted.
pub async fn initialize_from_arguments() -> Result<(), TunnelError> {
    let args = Args::parse();
    if args.log {
        initialize_logging()?;
    } else {
        initialize_stderr_logging();
    }

    let stream = TcpStream::connect(&args.server).await?;
    stream.set_nodelay(true)?;
    tracing::info!("Connected to tunnel server {}", args.server);
    let (reader, writer) = stream.into_split();
    let options = TunnelOptions {
        link_overhead: args.link_overhead,
        buffer_until_push: args.buffer_until_push,
        fetch: args.fetch,
    };

    tokio::select! {
        result = run(reader, writer, options) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    }
}

/// Sends every event to a JSON log file under `./logs`. Only should be
/// called once.
fn initialize_logging() -> io::Result<()> {
    let main_path = "./logs";
    create_dir_all(main_path)?;
    let file_path = format!(
        "{}/debug-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(Arc::new(file))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

fn initialize_stderr_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_writer(io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Could not install logger: {e}");
    }
}
