//! Transfer registry and lifecycle.
//!
//! Each transfer owns one run task and a cancellation token. Its status lives
//! in a `watch` channel so the control plane can read it without locking the
//! registry and callers can wait for the task to finish.
//!
//! States only move forward:
//!
//! ```text
//! initial ──▶ active ──▶ completed
//!    │              ├──▶ canceled
//!    │              └──▶ failed
//!    └──▶ canceled
//! ```
//!
//! A transfer canceled before its task starts never runs.

use crate::error::PipelineError;
use crate::models::{DataRequest, ValidationError};
use crate::pipeline::RateStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Initial,
    Active,
    Completed,
    Canceled,
    Failed,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Initial => "initial",
            TransferState::Active => "active",
            TransferState::Completed => "completed",
            TransferState::Canceled => "canceled",
            TransferState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Canceled | TransferState::Failed
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_advance_to(&self, next: TransferState) -> bool {
        match self {
            TransferState::Initial => {
                matches!(next, TransferState::Active | TransferState::Canceled)
            }
            TransferState::Active => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a transfer, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub state: TransferState,
    /// Final statistics; absent for subprocess runs and unfinished transfers.
    pub stats: Option<RateStats>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the run task has returned, even after a cancel.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferStatus {
    fn new() -> Self {
        Self {
            state: TransferState::Initial,
            stats: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    fn advance(&mut self, next: TransferState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferInfo {
    pub id: u64,
    pub request: DataRequest,
    #[serde(flatten)]
    pub status: TransferStatus,
}

/// Number of registered transfers in each state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferCounts {
    pub total: usize,
    pub initial: usize,
    pub active: usize,
    pub completed: usize,
    pub canceled: usize,
    pub failed: usize,
}

/// Executes the streaming work behind a transfer.
#[async_trait]
pub trait TransferRunner: Send + Sync + 'static {
    async fn run(
        &self,
        request: DataRequest,
        cancel: CancellationToken,
    ) -> Result<Option<RateStats>, PipelineError>;
}

/// One tracked request.
pub struct Transfer {
    id: u64,
    request: DataRequest,
    status: Arc<watch::Sender<TransferStatus>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Transfer {
    pub fn new(id: u64, request: DataRequest) -> Self {
        let (status, _) = watch::channel(TransferStatus::new());
        Self {
            id,
            request,
            status: Arc::new(status),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &DataRequest {
        &self.request
    }

    pub fn state(&self) -> TransferState {
        self.status.borrow().state
    }

    pub fn info(&self) -> TransferInfo {
        TransferInfo {
            id: self.id,
            request: self.request.clone(),
            status: self.status.borrow().clone(),
        }
    }

    /// Spawn the run task. False if it was started before or already ended.
    pub fn start(&mut self, runner: Arc<dyn TransferRunner>) -> bool {
        if self.handle.is_some() {
            return false;
        }
        if !self
            .status
            .send_if_modified(|s| s.advance(TransferState::Active))
        {
            return false;
        }

        let id = self.id;
        let request = self.request.clone();
        let status = Arc::clone(&self.status);
        let cancel = self.cancel.clone();
        let span = tracing::info_span!(
            "transfer",
            transfer.id = id,
            transfer.address = %request.destination_address
        );

        let task = async move {
            let outcome = runner.run(request, cancel).await;
            status.send_modify(|s| {
                match outcome {
                    Ok(stats) => {
                        s.stats = stats;
                        s.advance(TransferState::Completed);
                    }
                    Err(e) if e.is_canceled() => {
                        s.advance(TransferState::Canceled);
                    }
                    Err(e) => {
                        if s.advance(TransferState::Failed) {
                            s.error = Some(e.to_string());
                        }
                    }
                }
                s.finished_at = Some(Utc::now());
            });

            let status = status.borrow().clone();
            match status.state {
                TransferState::Failed => tracing::error!(
                    transfer.id = id,
                    transfer.state = %status.state,
                    transfer.error = status.error.as_deref().unwrap_or(""),
                    "Transfer failed"
                ),
                state => tracing::info!(
                    transfer.id = id,
                    transfer.state = %state,
                    transfer.messages = status.stats.as_ref().map(|s| s.count),
                    "Transfer finished"
                ),
            }
        };

        self.handle = Some(tokio::spawn(task.instrument(span)));
        tracing::info!(transfer.id = id, "Transfer started");
        true
    }

    /// Request cancellation. False if the transfer had already ended.
    ///
    /// The state reads `canceled` immediately; the run task stops at its
    /// next cancellation check.
    pub fn cancel(&self) -> bool {
        let canceled = self
            .status
            .send_if_modified(|s| s.advance(TransferState::Canceled));
        self.cancel.cancel();
        if canceled {
            tracing::warn!(transfer.id = self.id, "Transfer canceled");
        }
        canceled
    }

    fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }
}

/// All transfers of this process, keyed by id.
pub struct TransferManager {
    next_id: AtomicU64,
    transfers: Mutex<BTreeMap<u64, Transfer>>,
    runner: Arc<dyn TransferRunner>,
}

impl TransferManager {
    pub fn new(runner: Arc<dyn TransferRunner>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            transfers: Mutex::new(BTreeMap::new()),
            runner,
        }
    }

    /// Validate, register and start a transfer. Returns its id at once.
    pub fn create(&self, request: DataRequest) -> Result<u64, ValidationError> {
        request.validate()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut transfer = Transfer::new(id, request);
        tracing::info!(
            transfer.id = id,
            transfer.source = %format!(
                "exp={}:run={}:{}",
                transfer.request().experiment,
                transfer.request().run,
                transfer.request().access_mode
            ),
            transfer.detector = %transfer.request().detector_name,
            "Transfer created"
        );
        transfer.start(Arc::clone(&self.runner));

        self.transfers.lock().unwrap().insert(id, transfer);
        Ok(id)
    }

    /// Requests in ascending id order.
    pub fn list(&self) -> Vec<DataRequest> {
        let transfers = self.transfers.lock().unwrap();
        transfers.values().map(|t| t.request().clone()).collect()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.transfers.lock().unwrap().keys().copied().collect()
    }

    /// Current state, or `None` for an unknown id.
    pub fn get(&self, id: u64) -> Option<TransferState> {
        self.transfers.lock().unwrap().get(&id).map(|t| t.state())
    }

    pub fn info(&self, id: u64) -> Option<TransferInfo> {
        self.transfers.lock().unwrap().get(&id).map(|t| t.info())
    }

    /// Cancel without removing. `None` for an unknown id.
    pub fn cancel(&self, id: u64) -> Option<bool> {
        self.transfers.lock().unwrap().get(&id).map(|t| t.cancel())
    }

    /// Remove a transfer and cancel it if still running.
    ///
    /// True whenever the id existed, whatever state it was in.
    pub fn delete(&self, id: u64) -> bool {
        let removed = self.transfers.lock().unwrap().remove(&id);
        match removed {
            Some(transfer) => {
                transfer.cancel();
                tracing::info!(transfer.id = id, "Transfer deleted");
                true
            }
            None => false,
        }
    }

    /// Wait for the run task to return. `None` for an unknown id.
    pub async fn wait(&self, id: u64) -> Option<TransferState> {
        let mut rx = self.transfers.lock().unwrap().get(&id)?.subscribe();
        if let Ok(status) = rx.wait_for(|s| s.finished_at.is_some()).await {
            return Some(status.state);
        }
        // The task is gone without reporting; the last published state stands
        let state = rx.borrow().state;
        Some(state)
    }

    pub fn counts(&self) -> TransferCounts {
        let transfers = self.transfers.lock().unwrap();
        let mut counts = TransferCounts::default();
        for transfer in transfers.values() {
            counts.total += 1;
            match transfer.state() {
                TransferState::Initial => counts.initial += 1,
                TransferState::Active => counts.active += 1,
                TransferState::Completed => counts.completed += 1,
                TransferState::Canceled => counts.canceled += 1,
                TransferState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Cancel every transfer and wait for their tasks.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut transfers = self.transfers.lock().unwrap();
            transfers
                .values_mut()
                .filter_map(|t| {
                    t.cancel();
                    t.handle.take()
                })
                .collect()
        };
        tracing::info!("Waiting for {} transfer tasks", handles.len());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Transfer task ended abnormally: {}", e);
            }
        }
    }
}
