//! Runs a per-message stage over a batch, serially or concurrently, and
//! reassembles the results in input order.

use crate::message::{Batch, Message, MessageError};
use futures::FutureExt;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// How messages of one batch are dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One message at a time, in input order.
    #[default]
    Serial,
    /// Every message concurrently, joined before output.
    Parallel,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Serial => write!(f, "serial"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("batch processing was cancelled")]
    Cancelled,
}

/// Per-message work unit. Implementations never fail: errors are recorded on the
/// returned message.
#[async_trait::async_trait]
pub trait MessageStage: Send + Sync {
    async fn process(&self, message: Message) -> Message;
}

pub struct BatchDispatcher<S> {
    stage: Arc<S>,
    mode: ExecutionMode,
}

impl<S> Clone for BatchDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            stage: Arc::clone(&self.stage),
            mode: self.mode,
        }
    }
}

impl<S: MessageStage + 'static> BatchDispatcher<S> {
    pub fn new(stage: Arc<S>, mode: ExecutionMode) -> Self {
        Self { stage, mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Process `batch`, returning exactly one output message per input message at
    /// the same index.
    pub async fn dispatch(&self, batch: Batch) -> Batch {
        match self.run(batch, std::future::pending::<Infallible>()).await {
            Ok(output) => output,
            Err(never) => match never {},
        }
    }

    /// Like [`dispatch`](Self::dispatch), but abandons in-flight work when `cancel`
    /// fires. A cancelled batch yields no output.
    pub async fn dispatch_with_cancel(
        &self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<Batch, DispatchError> {
        let cancelled = async {
            cancel.cancelled().await;
            DispatchError::Cancelled
        };
        self.run(batch, cancelled).await
    }

    async fn run<E>(&self, batch: Batch, cancelled: impl Future<Output = E>) -> Result<Batch, E> {
        if batch.is_empty() {
            return Ok(batch);
        }
        match self.mode {
            ExecutionMode::Serial => self.dispatch_serial(batch, cancelled).await,
            ExecutionMode::Parallel => self.dispatch_parallel(batch, cancelled).await,
        }
    }

    async fn dispatch_serial<E>(
        &self,
        batch: Batch,
        cancelled: impl Future<Output = E>,
    ) -> Result<Batch, E> {
        tokio::pin!(cancelled);
        let mut output = Vec::with_capacity(batch.len());
        for message in batch {
            let processed = tokio::select! {
                biased;
                reason = &mut cancelled => return Err(reason),
                processed = self.stage.process(message) => processed,
            };
            output.push(processed);
        }
        Ok(output)
    }

    async fn dispatch_parallel<E>(
        &self,
        batch: Batch,
        cancelled: impl Future<Output = E>,
    ) -> Result<Batch, E> {
        tokio::pin!(cancelled);
        let len = batch.len();
        let fallbacks = batch.clone();
        let mut slots: Vec<Option<Message>> = (0..len).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, message) in batch.into_iter().enumerate() {
            let stage = Arc::clone(&self.stage);
            tasks.spawn(async move {
                let processed = AssertUnwindSafe(stage.process(message))
                    .catch_unwind()
                    .await
                    .ok();
                (index, processed)
            });
        }
        debug!(in_flight = len, "dispatched parallel batch");

        loop {
            tokio::select! {
                biased;
                reason = &mut cancelled => {
                    tasks.abort_all();
                    return Err(reason);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, Some(processed)))) => slots[index] = Some(processed),
                    Some(Ok((index, None))) => error!(index, "message task panicked"),
                    Some(Err(join_err)) => {
                        error!(error = %join_err, "message task did not complete")
                    }
                    None => break,
                },
            }
        }

        Ok(slots
            .into_iter()
            .zip(fallbacks)
            .map(|(slot, fallback)| {
                slot.unwrap_or_else(|| {
                    let mut failed = fallback;
                    failed.set_error(MessageError::Aborted(
                        "message task did not complete".into(),
                    ));
                    failed
                })
            })
            .collect())
    }
}
