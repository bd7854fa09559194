//! tcpbus - TCP fan-out server and client
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default port, logging every payload
//! tcpbus serve
//!
//! # Serve on a custom port and echo payloads back to their sender
//! tcpbus serve --port 7000 --echo
//!
//! # Load settings from a TOML file
//! TCPBUS_CONFIG=/etc/tcpbus.toml tcpbus serve
//!
//! # Connect, send stdin lines, print what the server sends
//! tcpbus connect 127.0.0.1 7000
//!
//! # Enable debug logging
//! RUST_LOG=tcpbus_core=debug tcpbus serve
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: `serve` stops accepting and shuts the server down

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tcpbus_core::{ClientConfig, ErrorKind, Observer, ServerConfig, TcpClient, TcpServer};

/// Environment variable naming a default config file for `serve`
const CONFIG_ENV: &str = "TCPBUS_CONFIG";

/// tcpbus - TCP fan-out server and client
#[derive(Parser, Debug)]
#[command(name = "tcpbus", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server and log every payload it receives
    Serve(ServeArgs),
    /// Connect to a server; stdin lines are sent, payloads are printed
    Connect {
        /// Server IP address
        ip: String,
        /// Server port
        port: u16,
        /// Seconds to wait for the connection (0 = no bound)
        #[arg(long)]
        connect_timeout: Option<u32>,
    },
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// TOML config file (defaults to $TCPBUS_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    backlog: Option<u32>,

    /// Do not evict dead connections in the background
    #[arg(long)]
    no_reap: bool,

    /// Seconds to wait per accept before retrying (0 = block)
    #[arg(long)]
    accept_timeout: Option<u32>,

    /// Send every payload back to the address it came from
    #[arg(long)]
    echo: bool,

    /// Print the connection list as JSON after each accept
    #[arg(long)]
    json: bool,
}

impl ServeArgs {
    /// Resolves the effective config: flags > config file > defaults.
    fn resolve(&self) -> Result<ServerConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => ServerConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if self.no_reap {
            config.auto_reap = false;
        }
        if let Some(secs) = self.accept_timeout {
            config.accept_timeout_secs = secs;
        }

        config.validate().context("Invalid server configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Serve(serve) => {
            let config = serve.resolve()?;
            run_server(config, serve.echo, serve.json)
        }
        Command::Connect {
            ip,
            port,
            connect_timeout,
        } => {
            let mut config = ClientConfig::default();
            if let Some(secs) = connect_timeout {
                config.connect_timeout_secs = secs;
            }
            run_client(config, ip, port)
        }
    }
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tcpbus=info".parse()?)
                .add_directive("tcpbus_core=info".parse()?),
        )
        .init();
    Ok(())
}

/// Runs the server until a shutdown signal arrives.
#[tokio::main]
async fn run_server(config: ServerConfig, echo: bool, json: bool) -> Result<()> {
    init_logging()?;

    info!(version = env!("CARGO_PKG_VERSION"), "tcpbus server starting");

    let server = Arc::new(TcpServer::new(config.clone()));
    server
        .start(config.port, config.backlog, config.auto_reap)
        .await
        .context("Failed to start server")?;

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    // Observer callbacks must not call back into the server, so echoes
    // go through a channel drained by a separate task.
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();

    server.subscribe(Observer::new().on_message(move |address, payload| {
        info!(
            address,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(payload).trim_end(),
            "Received"
        );
        if echo {
            let _ = echo_tx.send((address.to_string(), payload.to_vec()));
        }
    }));

    let echo_server = Arc::clone(&server);
    let echo_task = tokio::spawn(async move {
        while let Some((address, payload)) = echo_rx.recv().await {
            if let Err(e) = echo_server.send_to(&address, &payload).await {
                warn!(address = %address, error = %e, "Echo failed");
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,

            result = server.accept_connection(config.accept_timeout_secs) => match result {
                Ok(connection) => {
                    info!(peer = %connection.peer(), live = server.live_count(), "Client connected");
                    print_connections(&server, json).await?;
                }
                Err(e) if e.kind() == ErrorKind::Accept => {
                    debug!(error = %e, "Accept did not complete, retrying");
                }
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    break;
                }
            },
        }
    }

    let result = server.shutdown().await;
    echo_task.abort();
    result.context("Server shutdown failed")?;

    info!("tcpbus server stopped");
    Ok(())
}

/// Prints the registry, one connection per line or as a JSON array.
async fn print_connections(server: &TcpServer, json: bool) -> Result<()> {
    let connections = server.connections().await;

    if json {
        println!("{}", serde_json::to_string(&connections)?);
        return Ok(());
    }

    if connections.is_empty() {
        println!("no connected clients");
    }
    for info in &connections {
        println!(
            "{:<15} {:<21} {:<12} {}",
            info.address,
            info.peer,
            format!("{:?}", info.state).to_lowercase(),
            info.connected_at.to_rfc3339()
        );
    }
    Ok(())
}

enum ClientEvent {
    Payload(Vec<u8>),
    Closed(String),
}

/// Connects, forwards stdin lines and prints payloads until either side ends.
#[tokio::main]
async fn run_client(config: ClientConfig, ip: String, port: u16) -> Result<()> {
    init_logging()?;

    let client = TcpClient::new(config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let disc_tx = tx.clone();

    client.subscribe(
        Observer::new()
            .on_message(move |_, payload| {
                let _ = tx.send(ClientEvent::Payload(payload.to_vec()));
            })
            .on_disconnect(move |_, reason| {
                let _ = disc_tx.send(ClientEvent::Closed(reason.to_string()));
            }),
    );

    client
        .connect_to(&ip, port)
        .await
        .with_context(|| format!("Failed to connect to {ip}:{port}"))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(mut line) => {
                    line.push('\n');
                    client.send_msg(line.as_bytes()).await.context("Send failed")?;
                }
                None => break,
            },

            event = rx.recv() => match event {
                Some(ClientEvent::Payload(payload)) => {
                    stdout.write_all(&payload).await?;
                    stdout.flush().await?;
                }
                Some(ClientEvent::Closed(reason)) => {
                    info!(reason = %reason, "Server closed the connection");
                    break;
                }
                None => break,
            },
        }
    }

    client.close().await.context("Failed to close connection")?;
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "tcpbus", "serve", "--port", "7000", "--backlog", "3", "--no-reap",
        ]);
        let Command::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        let config = serve.resolve().unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.backlog, 3);
        assert!(!config.auto_reap);
    }

    #[test]
    fn test_zero_backlog_flag_rejected() {
        let args = Args::parse_from(["tcpbus", "serve", "--backlog", "0"]);
        let Command::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        assert!(serve.resolve().is_err());
    }

    #[test]
    fn test_connect_args() {
        let args = Args::parse_from(["tcpbus", "connect", "10.0.0.5", "65123"]);
        match args.command {
            Command::Connect { ip, port, connect_timeout } => {
                assert_eq!(ip, "10.0.0.5");
                assert_eq!(port, 65123);
                assert_eq!(connect_timeout, None);
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }
}
