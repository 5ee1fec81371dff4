//! One-shot CLI commands: push, pull, send-file, config.

use crate::models::{AccessMode, DataRequest, RetrievalMode};
use crate::pipeline::{RateStats, TransferPipeline, WorkerPool};
use crate::source::FileChunks;
use crate::telemetry;
use crate::worker::TRACEPARENT_ENV;
use anyhow::{Context, Result};
use lclconf::{CodecKind, ConfigSources, StreamConfig};
use lclproto::{ChannelConfig, PullChannel, PushChannel, Role};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Progress is printed every this many received messages.
const PULL_REPORT_EVERY: u64 = 10;

/// Arguments of the `push` command.
#[derive(Debug, Clone)]
pub struct PushArgs {
    pub experiment: String,
    pub run: u32,
    pub detector: String,
    pub mode: RetrievalMode,
    pub access_mode: AccessMode,
    pub addr: String,
    pub ndial: Option<u32>,
    pub rank: u16,
    pub batch_size: Option<usize>,
    pub codec: Option<CodecKind>,
}

/// Token canceled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, stopping");
            trigger.cancel();
        }
    });
    cancel
}

/// Stream one run in this process. Also the subprocess worker entry point.
pub async fn push(mut config: StreamConfig, args: PushArgs) -> Result<()> {
    if let Some(ndial) = args.ndial {
        config.transport.ndial = ndial;
    }
    if let Some(batch_size) = args.batch_size {
        config.pipeline.batch_size = batch_size;
    }
    if let Some(codec) = args.codec {
        config.pipeline.codec = codec;
    }
    config.validate()?;

    let request = DataRequest {
        experiment: args.experiment,
        run: args.run,
        access_mode: args.access_mode,
        detector_name: args.detector,
        retrieval_mode: args.mode,
        destination_address: args.addr,
    };
    request.validate()?;

    let span = tracing::info_span!("push", push.rank = args.rank);
    let parent = std::env::var(TRACEPARENT_ENV).ok();
    if let Some(context) = telemetry::parse_traceparent(parent.as_deref()) {
        span.set_parent(context);
    }

    let pool = WorkerPool::new(config.workers.max_workers);
    let pipeline = TransferPipeline::new(request, &config, pool).with_rank(args.rank)?;
    let address = pipeline.address().to_string();

    let stats = pipeline
        .run(cancel_on_ctrl_c())
        .instrument(span)
        .await
        .with_context(|| format!("Streaming to {} failed", address))?;

    println!("Sent {}", stats);
    Ok(())
}

fn report(stats: &RateStats) {
    println!(
        "At {}, {:.2} seconds: {:.2} MB/sec.",
        stats.count,
        stats.cumulative_wait,
        stats.mb_per_sec()
    );
}

/// Receive until every peer is done, printing running statistics.
pub async fn pull(
    config: &StreamConfig,
    role: Role,
    address: &str,
    timeout_ms: Option<u64>,
    save_dir: Option<PathBuf>,
    decode: bool,
) -> Result<()> {
    let mut channel_config = ChannelConfig::from(&config.transport);
    if let Some(ms) = timeout_ms {
        channel_config = channel_config.with_recv_timeout(Duration::from_millis(ms));
    }
    if let Some(dir) = &save_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let mut pull = PullChannel::open(address, role, &channel_config)
        .await
        .with_context(|| format!("Failed to open {}", address))?;
    println!("Receiving on {} ({})", address, role.as_str());

    let mut stats = RateStats::start();
    let mut frames = 0usize;
    let mut undecodable = 0usize;
    let stop = cancel_on_ctrl_c();

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = pull.recv() => next,
        };
        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) if e.is_timeout() => {
                debug!("no message yet, {} peers connected", pull.peers().connected());
                continue;
            }
            Err(e) => return Err(e).context("Receive failed"),
        };

        stats = stats.fold(message.len());

        if decode {
            match lclproto::decode(&message) {
                Ok(decoded) => frames += decoded.frames.len(),
                Err(e) => {
                    undecodable += 1;
                    warn!("message {} did not decode: {}", stats.count, e);
                }
            }
        }
        if let Some(dir) = &save_dir {
            save_message(dir, stats.count, &message).await?;
        }
        if stats.count % PULL_REPORT_EVERY == 1 {
            report(&stats);
        }
    }

    println!(
        "Received {} messages in {:.2} seconds: {:.2} MB/sec.",
        stats.count,
        stats.cumulative_wait,
        stats.mb_per_sec()
    );
    if decode {
        println!("Decoded {} frames, {} messages failed to decode", frames, undecodable);
    }
    Ok(())
}

async fn save_message(dir: &Path, index: u64, message: &[u8]) -> Result<()> {
    let path = dir.join(format!("{:06}.msg", index));
    tokio::fs::write(&path, message)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Push a file as raw chunks.
pub async fn send_file(
    config: &StreamConfig,
    path: &Path,
    address: &str,
    ndial: Option<u32>,
    chunk_size: usize,
) -> Result<()> {
    let mut chunks = FileChunks::open(path, chunk_size)?;
    let role = Role::from_ndial(ndial.unwrap_or(config.transport.ndial));
    let mut push = PushChannel::open(address, role, &ChannelConfig::from(&config.transport))
        .await
        .with_context(|| format!("Failed to open {}", address))?;

    let pool = WorkerPool::new(1);
    let stop = cancel_on_ctrl_c();
    let mut stats = RateStats::start();

    loop {
        let (rest, next) = pool
            .run(move || {
                let next = chunks.next();
                (chunks, next)
            })
            .await?;
        chunks = rest;
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        let size = chunk.len();

        tokio::select! {
            _ = stop.cancelled() => anyhow::bail!("Interrupted after {} chunks", stats.count),
            sent = push.send(chunk) => sent?,
        }
        stats = stats.fold(size);
    }

    push.close().await?;
    println!("Sent {} from {}", stats, path.display());
    Ok(())
}

/// Print the effective configuration and where it came from.
pub fn print_config(config: &StreamConfig, sources: &ConfigSources) {
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env: {}", var);
    }
    print!("{}", config.to_toml());
}
