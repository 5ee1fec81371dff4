//! Source → batcher → codec → push channel, as one streaming job.
//!
//! Frame fetching, batching and encoding are blocking work and run on the
//! [`WorkerPool`]. Encoded messages reach the async send loop through a small
//! bounded queue, so a slow receiver stalls the encoder instead of piling up
//! memory. The send loop is the only place [`RateStats`] is folded.

use crate::error::PipelineError;
use crate::models::DataRequest;
use crate::source::{FrameIter, FrameSource, LazySource, SourceDescriptor};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lclconf::{PipelineConfig, SourceConfig, StreamConfig};
use lclproto::{with_port_offset, ChannelConfig, FrameBatcher, MessageCodec, PushChannel, Role};
use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Encoded messages buffered between the encoder and the send loop.
const ENCODED_QUEUE: usize = 2;

/// Running throughput statistics.
///
/// `cumulative_wait` is the wall time between consecutive folds, so it
/// includes time spent blocked on a full send buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    pub count: u64,
    pub total_bytes: u64,
    /// Seconds.
    pub cumulative_wait: f64,
    pub last_update: DateTime<Utc>,
}

impl RateStats {
    pub fn start() -> Self {
        Self::start_at(Utc::now())
    }

    pub fn start_at(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            total_bytes: 0,
            cumulative_wait: 0.0,
            last_update: now,
        }
    }

    /// Account for one message of `size` bytes sent now.
    pub fn fold(self, size: usize) -> Self {
        self.fold_at(size, Utc::now())
    }

    pub fn fold_at(self, size: usize, now: DateTime<Utc>) -> Self {
        let elapsed = (now - self.last_update)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            count: self.count + 1,
            total_bytes: self.total_bytes + size as u64,
            cumulative_wait: self.cumulative_wait + elapsed,
            last_update: now,
        }
    }

    pub fn mb_per_sec(&self) -> f64 {
        if self.cumulative_wait > 0.0 {
            self.total_bytes as f64 / self.cumulative_wait / 1e6
        } else {
            0.0
        }
    }

    pub fn messages_per_sec(&self) -> f64 {
        if self.cumulative_wait > 0.0 {
            self.count as f64 / self.cumulative_wait
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for RateStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} messages, {:.1} MB in {:.2}s ({:.2} MB/s, {:.1} msg/s)",
            self.count,
            self.total_bytes as f64 / 1e6,
            self.cumulative_wait,
            self.mb_per_sec(),
            self.messages_per_sec()
        )
    }
}

/// Bounded pool for blocking work, shared by every pipeline in a process.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a permit is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Pool(e.to_string()))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| PipelineError::Pool(e.to_string()))
    }
}

/// Counters exported through the global meter.
struct PipelineMetrics {
    messages: Counter<u64>,
    bytes: Counter<u64>,
    attributes: [KeyValue; 1],
}

impl PipelineMetrics {
    fn new(codec: &MessageCodec) -> Self {
        let meter = global::meter("lclstream");
        Self {
            messages: meter
                .u64_counter("lclstream.messages_sent")
                .with_description("Messages pushed to destinations")
                .build(),
            bytes: meter
                .u64_counter("lclstream.bytes_sent")
                .with_description("Encoded bytes pushed to destinations")
                .build(),
            attributes: [KeyValue::new("codec", codec.kind().as_str())],
        }
    }

    fn record(&self, size: usize) {
        self.messages.add(1, &self.attributes);
        self.bytes.add(size as u64, &self.attributes);
    }
}

type BatchIter = FrameBatcher<FrameIter>;

/// One streaming run for a request.
pub struct TransferPipeline {
    request: DataRequest,
    address: String,
    role: Role,
    channel: ChannelConfig,
    pipeline: PipelineConfig,
    source: SourceConfig,
    pool: WorkerPool,
}

impl TransferPipeline {
    pub fn new(request: DataRequest, config: &StreamConfig, pool: WorkerPool) -> Self {
        Self {
            address: request.destination_address.clone(),
            request,
            role: Role::from_ndial(config.transport.ndial),
            channel: ChannelConfig::from(&config.transport),
            pipeline: config.pipeline.clone(),
            source: config.source.clone(),
            pool,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Target the `rank`-th port above the requested address.
    pub fn with_rank(mut self, rank: u16) -> Result<Self, PipelineError> {
        self.address = with_port_offset(&self.request.destination_address, rank)?;
        Ok(self)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stream every frame, then flush and close the channel.
    ///
    /// The source is opened before the channel, so an unsupported retrieval
    /// mode fails without ever connecting.
    pub async fn run(self, cancel: CancellationToken) -> Result<RateStats, PipelineError> {
        let codec = MessageCodec::from_config(&self.pipeline);
        let per_message = codec.frames_per_message(self.pipeline.batch_size);
        let mode = self.request.retrieval_mode;

        let source = Arc::new(LazySource::new(
            SourceDescriptor::from_request(&self.request),
            self.source.clone(),
        ));
        let opened = Arc::clone(&source);
        let frames = self.pool.run(move || opened.frames(mode)).await??;
        let batches: BatchIter = FrameBatcher::new(frames, per_message, self.pipeline.emit_partial)?;
        let expected = source.try_len()?;
        debug!(
            "source {} open, {} frames per message, expecting {:?} frames",
            source.descriptor().source_id(),
            per_message,
            expected
        );

        if cancel.is_cancelled() {
            return Err(PipelineError::Canceled);
        }
        let mut push = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Canceled),
            opened = PushChannel::open(&self.address, self.role, &self.channel) => opened?,
        };
        info!(
            "streaming {} to {} ({}, {})",
            source.descriptor().source_id(),
            self.address,
            self.role.as_str(),
            codec.kind().as_str()
        );

        let (tx, rx) = mpsc::channel(ENCODED_QUEUE);
        let producer = encode_batches(batches, codec, self.pool.clone(), tx, cancel.clone());
        let consumer = send_messages(
            &mut push,
            rx,
            PipelineMetrics::new(&codec),
            self.pipeline.log_every,
            cancel.clone(),
        );
        let ((), sent) = tokio::join!(producer, consumer);
        let stats = sent?;

        push.close().await?;
        info!("finished {}: {}", self.address, stats);
        Ok(stats)
    }
}

/// Pull batches on the pool and encode them, in order.
async fn encode_batches(
    mut batches: BatchIter,
    codec: MessageCodec,
    pool: WorkerPool,
    tx: mpsc::Sender<Result<Bytes, PipelineError>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let job = pool
            .run(move || {
                let next = batches.next().map(|batch| {
                    let batch = batch?;
                    Ok::<_, PipelineError>(codec.encode(&batch)?)
                });
                (batches, next)
            })
            .await;

        let (rest, next) = match job {
            Ok(pair) => pair,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        batches = rest;
        let Some(item) = next else {
            return;
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

/// Send encoded messages in order, folding statistics as they go.
async fn send_messages(
    push: &mut PushChannel,
    mut rx: mpsc::Receiver<Result<Bytes, PipelineError>>,
    metrics: PipelineMetrics,
    log_every: u64,
    cancel: CancellationToken,
) -> Result<RateStats, PipelineError> {
    let mut stats = RateStats::start();

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Canceled),
            next = rx.recv() => match next {
                Some(message) => message?,
                None => break,
            },
        };

        let size = message.len();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Canceled),
            sent = push.send(message) => sent?,
        }

        stats = stats.fold(size);
        metrics.record(size);
        if log_every > 0 && stats.count % log_every == 0 {
            info!(
                "{}: sent {} messages, {:.2} MB/s",
                push.address(),
                stats.count,
                stats.mb_per_sec()
            );
        }
    }

    if stats.count == 0 {
        warn!("{}: source produced no messages", push.address());
    }
    Ok(stats)
}
