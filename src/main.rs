//! Operator console for instruments driven by `mi-protocol`.
//!
//! Connects to one instrument described by a TOML profile, discovers its mode,
//! and runs a single operation.
//!
//! # Usage
//!
//! ```bash
//! mi-console --config config/sbe43.example.toml status
//! mi-console --config config/sbe43.example.toml --tcp 10.0.0.5:4001 autosample start
//! mi-console --config config/sbe43.example.toml set sampleinterval 10
//! mi-console --config config/sbe43.example.toml direct
//! ```
//!
//! `RUST_LOG` overrides the `[logging]` level.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mi_core::logging;
use mi_core::observability::{ChannelSink, DriverEvent};
use mi_core::serial::{Connector, DynStream, TcpConnector};
use mi_protocol::{InstrumentProtocol, ProtocolBuilder, ProtocolConfig, ProtocolState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mi-console")]
#[command(about = "Talk to a line-oriented instrument over TCP or serial", long_about = None)]
struct Cli {
    /// Instrument profile (TOML)
    #[arg(long, short)]
    config: PathBuf,

    /// TCP endpoint, overrides `[connection] tcp`
    #[arg(long, conflicts_with = "serial")]
    tcp: Option<String>,

    /// Serial port, overrides `[connection] serial`
    #[arg(long)]
    serial: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the instrument is idle or streaming
    Discover,

    /// Run the status commands
    Status,

    /// Take one sample
    Sample,

    /// Request a fresh sample frame
    Latest,

    /// Read parameters
    Get,

    /// Assign a parameter
    Set {
        /// Parameter name
        name: String,
        /// Value
        value: String,
    },

    /// Start or stop streaming
    #[command(subcommand)]
    Autosample(AutosampleCommands),

    /// Run the self tests
    Test,

    /// Print published frames and events
    Monitor {
        /// Seconds to listen
        #[arg(long, default_value = "30")]
        seconds: u64,
    },

    /// Interactive passthrough; `~.` on its own line leaves
    Direct,
}

#[derive(Subcommand)]
enum AutosampleCommands {
    /// Enter autosample
    Start,
    /// Leave autosample
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ProtocolConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.logging)?;
    info!(instrument = %config.instrument.id, "Console started");

    let stream = open_stream(&cli, &config).await?;
    let (sink, mut frames, mut events) = ChannelSink::new();
    let protocol = ProtocolBuilder::new(config)
        .with_channel_sink(sink)
        .connect(stream)
        .await?;

    let state = protocol.discover().await.context("discovering instrument state")?;
    println!("Instrument is in {state}");

    let outcome = run(&cli.command, &protocol, state, &mut frames, &mut events).await;
    protocol.shutdown().await;
    outcome
}

async fn open_stream(cli: &Cli, config: &ProtocolConfig) -> Result<DynStream> {
    if cli.serial.is_none() {
        if let Some(address) = cli.tcp.as_ref().or(config.connection.tcp.as_ref()) {
            return Ok(TcpConnector::new(address.clone()).connect().await?);
        }
    }
    match cli.serial.as_ref().or(config.connection.serial.as_ref()) {
        Some(port) => open_serial(port, config.connection.baud).await,
        None => bail!("no connection configured: pass --tcp or --serial, or set [connection]"),
    }
}

#[cfg(feature = "serial")]
async fn open_serial(port: &str, baud: u32) -> Result<DynStream> {
    Ok(mi_core::serial::open_serial_async(port, baud).await?)
}

#[cfg(not(feature = "serial"))]
async fn open_serial(port: &str, _baud: u32) -> Result<DynStream> {
    bail!("serial port {port} requested but mi-console was built without the `serial` feature")
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

async fn run(
    command: &Commands,
    protocol: &InstrumentProtocol,
    state: ProtocolState,
    frames: &mut tokio::sync::mpsc::UnboundedReceiver<mi_core::Frame>,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<DriverEvent>,
) -> Result<()> {
    match command {
        Commands::Discover => {}
        Commands::Status => print_lines(&protocol.acquire_status().await?),
        Commands::Sample => print_lines(&protocol.acquire_sample().await?),
        Commands::Latest => println!("{}", protocol.latest_sample().await?.text().trim_end()),
        Commands::Get => print_lines(&protocol.get().await?),
        Commands::Set { name, value } => print_lines(&protocol.set(name, value).await?),
        Commands::Autosample(AutosampleCommands::Start) => {
            if state == ProtocolState::Autosample {
                println!("Already streaming");
            } else {
                print_lines(&protocol.start_autosample().await?);
            }
        }
        Commands::Autosample(AutosampleCommands::Stop) => {
            if state == ProtocolState::Command {
                println!("Already idle");
            } else {
                print_lines(&protocol.stop_autosample().await?);
            }
        }
        Commands::Test => print_lines(&protocol.run_test().await?),
        Commands::Monitor { seconds } => monitor(Duration::from_secs(*seconds), frames, events).await,
        Commands::Direct => direct(protocol, events).await?,
    }
    Ok(())
}

async fn monitor(
    window: Duration,
    frames: &mut tokio::sync::mpsc::UnboundedReceiver<mi_core::Frame>,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<DriverEvent>,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            Some(frame) = frames.recv() => {
                println!("{} [{}] {}", frame.timestamp.to_rfc3339(), frame.label, frame.text().trim_end());
            }
            Some(event) = events.recv() => println!("event: {event:?}"),
            else => break,
        }
    }
}

async fn direct(
    protocol: &InstrumentProtocol,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<DriverEvent>,
) -> Result<()> {
    protocol.start_direct().await?;
    println!("Direct access; `~.` to leave");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let newline = protocol.context().config().instrument.newline.clone();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if line.trim() == "~." {
                    break;
                }
                protocol.execute_direct(Bytes::from(format!("{line}{newline}"))).await?;
            }
            Some(event) = events.recv() => match event {
                DriverEvent::DirectAccessData(data) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                DriverEvent::ConnectionLost { reason } => {
                    warn!(reason = %reason, "Connection lost during direct access");
                    break;
                }
                _ => {}
            },
        }
    }

    protocol.stop_direct().await?;
    println!();
    println!("Left direct access");
    Ok(())
}
