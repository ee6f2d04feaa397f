//! Single-node worker pool that accepts Coordinator invocations via a queue
//! and executes them with bounded parallelism.
//!
//! Grounded on `sharepoint-ingest/src/job.rs`'s `JobPersistence` (an
//! `mpsc::unbounded_channel` drained by a background `tokio::spawn` loop)
//! and `main.rs`'s `spawn_job_worker`/`Arc<Semaphore>` pairing.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::warn;

use crate::coordinator::{Coordinator, CoordinatorOptions, CoordinatorResult, JobCommand};
use crate::error::AppError;

struct Invocation {
    job_id: String,
    options: CoordinatorOptions,
    cancel_rx: watch::Receiver<JobCommand>,
    reply: tokio::sync::oneshot::Sender<Result<CoordinatorResult, AppError>>,
}

/// A single-node worker pool, or an in-process synchronous executor for
/// tests — both behind the same `TaskRunner` interface.
pub enum TaskRunner {
    Spawned {
        sender: mpsc::UnboundedSender<Invocation>,
    },
    Immediate {
        coordinator: Arc<Coordinator>,
    },
}

impl TaskRunner {
    /// Spawns `pool_size` workers draining an unbounded queue, each gated by
    /// a semaphore of the same size so at most `pool_size` jobs run
    /// concurrently.
    pub fn spawn(coordinator: Arc<Coordinator>, pool_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Invocation>();
        let semaphore = Arc::new(Semaphore::new(pool_size.max(1)));

        tokio::spawn(async move {
            while let Some(invocation) = receiver.recv().await {
                let coordinator = coordinator.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let result = coordinator
                        .run(&invocation.job_id, invocation.options, invocation.cancel_rx)
                        .await;
                    if invocation.reply.send(result).is_err() {
                        warn!(job_id = %invocation.job_id, "task runner reply channel dropped before result was delivered");
                    }
                });
            }
        });

        Self::Spawned { sender }
    }

    /// Runs the Coordinator synchronously on the calling task — the
    /// in-process executor for tests.
    pub fn immediate(coordinator: Arc<Coordinator>) -> Self {
        Self::Immediate { coordinator }
    }

    pub async fn submit(
        &self,
        job_id: impl Into<String>,
        options: CoordinatorOptions,
        cancel_rx: watch::Receiver<JobCommand>,
    ) -> Result<CoordinatorResult, AppError> {
        let job_id = job_id.into();
        match self {
            TaskRunner::Immediate { coordinator } => coordinator.run(&job_id, options, cancel_rx).await,
            TaskRunner::Spawned { sender } => {
                let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
                sender
                    .send(Invocation {
                        job_id: job_id.clone(),
                        options,
                        cancel_rx,
                        reply: reply_tx,
                    })
                    .map_err(|_| AppError::ServiceUnavailable("task runner queue closed".into()))?;
                reply_rx
                    .await
                    .map_err(|_| AppError::ServiceUnavailable("task runner worker dropped without replying".into()))?
            }
        }
    }
}
