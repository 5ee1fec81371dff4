use crate::source::SourceError;
use lclproto::{BatchError, ChannelError, CodecError};
use thiserror::Error;

/// Why a pipeline run ended early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{0}")]
    Batch(String),

    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error("Failed to launch worker {program}: {source}")]
    WorkerSpawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Worker exited with code {0}")]
    WorkerFailed(i32),

    #[error("Worker pool task failed: {0}")]
    Pool(String),

    #[error("Transfer canceled")]
    Canceled,
}

impl PipelineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, PipelineError::Canceled)
    }
}

impl From<BatchError<SourceError>> for PipelineError {
    fn from(err: BatchError<SourceError>) -> Self {
        match err {
            BatchError::Source(e) => PipelineError::Source(e),
            BatchError::ZeroBatchSize => PipelineError::Config(err.to_string()),
            mismatch @ BatchError::ShapeMismatch { .. } => {
                PipelineError::Batch(mismatch.to_string())
            }
        }
    }
}
