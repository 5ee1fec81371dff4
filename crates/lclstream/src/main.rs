//! lclstream - frame streaming service and CLI
//!
//! Subcommands:
//! - `lclstream serve` - Run the HTTP control plane
//! - `lclstream push ...` - Stream one run (also the worker process)
//! - `lclstream pull --listen|--dial ADDR` - Receive and report throughput
//! - `lclstream send-file FILE -a ADDR` - Push a file as raw chunks
//! - `lclstream config` - Print the effective configuration

use anyhow::Result;
use clap::{Parser, Subcommand};
use lclconf::{CodecKind, StreamConfig};
use lclproto::Role;
use lclstream::commands::{self, PushArgs};
use lclstream::source::DEFAULT_CHUNK_SIZE;
use lclstream::{serve, telemetry, AccessMode, RetrievalMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lclstream")]
#[command(about = "Stream detector frames over ZMQ")]
#[command(version)]
struct Cli {
    /// Config file, replacing ./lclstream.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transfer control plane
    Serve {
        /// HTTP port to bind (overrides bind.http_port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stream one run to a destination
    Push {
        /// Experiment identifier
        #[arg(short = 'e', long)]
        experiment: String,

        /// Run number
        #[arg(short = 'r', long)]
        run: u32,

        /// Detector name
        #[arg(short = 'd', long)]
        detector: String,

        /// Retrieval mode: raw, calib, image
        #[arg(short = 'm', long, default_value = "calib")]
        mode: RetrievalMode,

        /// Access mode: idx or smd
        #[arg(short = 'c', long = "access-mode", alias = "access_mode")]
        access_mode: AccessMode,

        /// Destination address (tcp://, ipc:// or inproc://)
        #[arg(short = 'a', long)]
        addr: String,

        /// Connections to dial; 0 listens instead
        #[arg(long)]
        ndial: Option<u32>,

        /// Worker rank, added to the destination port
        #[arg(long, default_value = "0")]
        rank: u16,

        /// Frames per message
        #[arg(long)]
        batch_size: Option<usize>,

        /// Message encoding: container or compressed
        #[arg(long)]
        codec: Option<CodecKind>,
    },

    /// Receive messages until every peer is done
    Pull {
        /// Address to listen at
        #[arg(short, long, conflicts_with = "dial", required_unless_present = "dial")]
        listen: Option<String>,

        /// Address to dial
        #[arg(short, long)]
        dial: Option<String>,

        /// Receive timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Save each message as a numbered file in this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Decode messages and count frames
        #[arg(long)]
        decode: bool,
    },

    /// Push a file as raw chunks
    SendFile {
        file: PathBuf,

        /// Destination address
        #[arg(short = 'a', long)]
        addr: String,

        /// Connections to dial; 0 listens instead
        #[arg(long)]
        ndial: Option<u32>,

        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, sources) = StreamConfig::load_with_sources_from(cli.config.as_deref())?;
    let log_level = Some(config.telemetry.log_level.clone());

    // For serve with an endpoint, use full OTEL; otherwise plain logging
    let use_otel =
        matches!(cli.command, Commands::Serve { .. }) && config.telemetry.otlp_enabled();
    if use_otel {
        telemetry::init(&config.telemetry.otlp_endpoint, log_level.as_deref())?;
    } else {
        telemetry::init_fmt(log_level.as_deref());
    }

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.bind.http_port = port;
            }
            serve::run(config).await?;
        }
        Commands::Push {
            experiment,
            run,
            detector,
            mode,
            access_mode,
            addr,
            ndial,
            rank,
            batch_size,
            codec,
        } => {
            commands::push(
                config,
                PushArgs {
                    experiment,
                    run,
                    detector,
                    mode,
                    access_mode,
                    addr,
                    ndial,
                    rank,
                    batch_size,
                    codec,
                },
            )
            .await?;
        }
        Commands::Pull {
            listen,
            dial,
            timeout,
            save_dir,
            decode,
        } => {
            let (role, address) = match (listen, dial) {
                (Some(address), _) => (Role::Listen, address),
                (None, Some(address)) => (Role::Dial(1), address),
                (None, None) => anyhow::bail!("Need an address: --listen or --dial"),
            };
            commands::pull(&config, role, &address, timeout, save_dir, decode).await?;
        }
        Commands::SendFile {
            file,
            addr,
            ndial,
            chunk_size,
        } => {
            commands::send_file(&config, &file, &addr, ndial, chunk_size).await?;
        }
        Commands::Config => {
            commands::print_config(&config, &sources);
        }
    }

    Ok(())
}
