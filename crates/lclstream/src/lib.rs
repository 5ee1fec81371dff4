//! lclstream - stream detector frames to remote consumers over ZMQ.
//!
//! A transfer request names a run, a detector and a destination. The
//! [`transfer::TransferManager`] tracks each request through its lifecycle
//! while a [`pipeline::TransferPipeline`] (or a worker process running the
//! `push` command) reads frames, batches and encodes them, and pushes the
//! messages under backpressure.
//!
//! - [`models`]: `DataRequest` and its enums
//! - [`source`]: frame sources and the file-chunk reader
//! - [`pipeline`]: the streaming job, worker pool and rate statistics
//! - [`worker`]: subprocess transfers
//! - [`runner`]: picks in-process or subprocess execution
//! - [`transfer`]: transfer state machine and registry
//! - [`web`]: HTTP control plane

pub mod commands;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod runner;
pub mod serve;
pub mod source;
pub mod telemetry;
pub mod transfer;
pub mod web;
pub mod worker;

pub use error::PipelineError;
pub use models::{AccessMode, DataRequest, RetrievalMode, ValidationError};
pub use pipeline::{RateStats, TransferPipeline, WorkerPool};
pub use runner::PipelineRunner;
pub use source::{FileChunks, FrameSource, LazySource, SourceDescriptor, SourceError, SyntheticSource};
pub use transfer::{TransferInfo, TransferManager, TransferRunner, TransferState};
