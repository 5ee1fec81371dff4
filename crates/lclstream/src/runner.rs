//! Runs a transfer in this process or as a worker process, per access mode.

use crate::error::PipelineError;
use crate::models::{AccessMode, DataRequest};
use crate::pipeline::{RateStats, TransferPipeline, WorkerPool};
use crate::transfer::TransferRunner;
use crate::worker::WorkerCommand;
use async_trait::async_trait;
use lclconf::{ExecutionMode, StreamConfig};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Production runner. Each transfer gets a snapshot of the config taken
/// when the runner was built; in-process pipelines share one worker pool.
pub struct PipelineRunner {
    config: StreamConfig,
    pool: WorkerPool,
}

impl PipelineRunner {
    pub fn new(config: StreamConfig) -> Self {
        let pool = WorkerPool::new(config.workers.max_workers);
        Self { config, pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn mode_for(&self, access_mode: AccessMode) -> ExecutionMode {
        match access_mode {
            AccessMode::Indexed => self.config.execution.indexed,
            AccessMode::Sequential => self.config.execution.sequential,
        }
    }
}

#[async_trait]
impl TransferRunner for PipelineRunner {
    async fn run(
        &self,
        request: DataRequest,
        cancel: CancellationToken,
    ) -> Result<Option<RateStats>, PipelineError> {
        let mode = self.mode_for(request.access_mode);
        debug!("running {} transfer {}", mode.as_str(), request.access_mode);
        match mode {
            ExecutionMode::InProcess => {
                let pipeline = TransferPipeline::new(request, &self.config, self.pool.clone());
                pipeline.run(cancel).await.map(Some)
            }
            ExecutionMode::Subprocess => {
                WorkerCommand::for_request(&request, &self.config)
                    .run(cancel)
                    .await?;
                Ok(None)
            }
        }
    }
}
