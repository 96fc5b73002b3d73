//! smux CLI - echo server and client over a multiplexed TCP connection
//!
//! Useful for exercising many concurrent streams over a single connection.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use smux_session::{Config, Session, Stream, StreamError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// smux - Multiplex many streams over one TCP connection
#[derive(Parser, Debug)]
#[command(name = "smux")]
#[command(about = "smux - Multiplex many streams over one TCP connection")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Session tuning shared by every subcommand
#[derive(Args, Debug)]
struct SessionArgs {
    /// Maximum payload bytes per data frame
    #[arg(long, global = true, env = "SMUX_MAX_FRAME_SIZE", default_value = "4096")]
    max_frame_size: usize,

    /// Seconds between keepalive frames
    #[arg(long, global = true, env = "SMUX_KEEPALIVE_INTERVAL", default_value = "10")]
    keepalive_interval: u64,

    /// Seconds of silence before the session is dropped
    #[arg(long, global = true, env = "SMUX_KEEPALIVE_TIMEOUT", default_value = "30")]
    keepalive_timeout: u64,
}

impl SessionArgs {
    fn to_config(&self) -> Result<Config> {
        let config = Config {
            max_frame_size: self.max_frame_size,
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout),
            ..Default::default()
        };
        config.verify().context("Invalid session configuration")?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept multiplexed connections and echo every stream back
    #[command(long_about = r#"
Listen for TCP connections. Each connection carries a multiplexed session;
every stream opened by the client is echoed back until the client closes it.

EXAMPLES:
  smux serve --listen 127.0.0.1:7000

ENVIRONMENT VARIABLES:
  SMUX_LISTEN              Address to listen on
  SMUX_MAX_FRAME_SIZE      Maximum payload bytes per frame
    "#)]
    Serve {
        /// Address to listen on (e.g., 0.0.0.0:7000)
        #[arg(long, env = "SMUX_LISTEN")]
        listen: String,
    },

    /// Open streams to an echo server and verify the replies
    #[command(long_about = r#"
Connect to an echo server, open several streams concurrently over the same
TCP connection, send a message on each and check it comes back intact.

EXAMPLES:
  smux connect --server 127.0.0.1:7000 --streams 8 --message "hello"
  smux connect --server 127.0.0.1:7000 --max-frame-size 16 --message "split into frames"
    "#)]
    Connect {
        /// Echo server address (e.g., 127.0.0.1:7000)
        #[arg(long, env = "SMUX_SERVER")]
        server: String,

        /// Number of concurrent streams to open
        #[arg(long, default_value = "4")]
        streams: usize,

        /// Message written on every stream
        #[arg(long, default_value = "hello over smux")]
        message: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Accept TCP connections and serve each as a multiplexed session
async fn serve(listen: &str, config: Config) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await.context("Failed to accept")?;
        socket.set_nodelay(true)?;
        info!("Accepted connection from {}", peer);

        let session = Session::server(socket, config.clone())?;
        tokio::spawn(async move {
            loop {
                match session.accept_stream().await {
                    Ok(stream) => {
                        tokio::spawn(echo(stream));
                    }
                    Err(e) => {
                        info!("Session with {} ended: {}", peer, e);
                        break;
                    }
                }
            }
        });
    }
}

/// Echo everything read on `stream` until the peer resets it
async fn echo(stream: Stream) {
    let id = stream.id();
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0usize;

    loop {
        match stream.read(&mut buf).await {
            Ok(n) => {
                if let Err(e) = stream.write(&buf[..n]).await {
                    warn!("Stream {} write failed: {}", id, e);
                    break;
                }
                total += n;
            }
            Err(StreamError::EndOfStream) => break,
            Err(e) => {
                debug!("Stream {} read ended: {}", id, e);
                break;
            }
        }
    }

    debug!("Stream {} echoed {} bytes", id, total);
    let _ = stream.close().await;
}

/// Send `message` on one stream and wait for the echo
async fn round_trip(stream: Stream, message: Arc<Vec<u8>>) -> Result<Duration> {
    let started = tokio::time::Instant::now();
    stream.write(&message).await?;

    let mut echoed = Vec::with_capacity(message.len());
    let mut buf = vec![0u8; message.len().max(1)];
    while echoed.len() < message.len() {
        let n = stream.read(&mut buf).await?;
        echoed.extend_from_slice(&buf[..n]);
    }
    let elapsed = started.elapsed();
    stream.close().await?;

    anyhow::ensure!(
        echoed == *message,
        "Stream {} echoed different bytes",
        stream.id()
    );
    Ok(elapsed)
}

/// Open `streams` streams and check each one echoes `message`
async fn connect(server: &str, config: Config, streams: usize, message: String) -> Result<()> {
    let socket = TcpStream::connect(server)
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;
    socket.set_nodelay(true)?;
    info!("Connected to {}", server);

    let session = Session::client(socket, config)?;
    let message = Arc::new(message.into_bytes());

    let mut tasks = Vec::with_capacity(streams);
    for _ in 0..streams {
        let stream = session.open_stream().await?;
        let id = stream.id();
        tasks.push((id, tokio::spawn(round_trip(stream, message.clone()))));
    }

    let mut failures = 0;
    for (id, task) in tasks {
        match task.await? {
            Ok(elapsed) => info!("Stream {} echoed {} bytes in {:?}", id, message.len(), elapsed),
            Err(e) => {
                error!("Stream {} failed: {:#}", id, e);
                failures += 1;
            }
        }
    }

    session.close().await?;
    anyhow::ensure!(failures == 0, "{} of {} streams failed", failures, streams);
    info!("All {} streams verified", streams);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config = cli.session.to_config()?;

    match cli.command {
        Commands::Serve { listen } => {
            info!("smux echo server starting...");

            // Setup Ctrl+C handler
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                    Ok(())
                }
                result = serve(&listen, config) => result,
            }
        }
        Commands::Connect {
            server,
            streams,
            message,
        } => connect(&server, config, streams, message).await,
    }
}
