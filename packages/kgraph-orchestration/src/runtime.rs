//! Pipeline runtime
//!
//! Runs batches on tokio tasks, at most `runtime.workers` at a time:
//!
//! ```text
//! dispatch(batch) ──permit──▶ BatchController::run
//!                                  │ AwaitingEmbeddings
//!                                  ▼
//!                           EmbeddingMonitor ──notifier──▶ listen ──▶ dispatch(batch)
//! ```
//!
//! A batch already held by another unit of work is skipped; the holder
//! carries it forward.

use kgraph_store::{BatchStatus, Stage};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::controller::{BatchController, RunOutcome};
use crate::error::{PipelineError, Result};

const ACTOR: &str = "runtime";

pub struct PipelineRuntime {
    controller: Arc<BatchController>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl PipelineRuntime {
    pub fn new(controller: Arc<BatchController>, workers: usize) -> Self {
        Self {
            controller,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn controller(&self) -> &Arc<BatchController> {
        &self.controller
    }

    /// Run the batch on the worker pool. `Ok(None)` if the runtime shut down
    /// or another unit of work holds the batch.
    pub fn dispatch(&self, batch_id: Uuid) -> JoinHandle<Result<Option<RunOutcome>>> {
        let controller = Arc::clone(&self.controller);
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(None),
                },
            };

            let ctx = RunContext::new(batch_id, ACTOR);
            match controller.run(&ctx).await {
                Ok(outcome) => {
                    info!(batch_id = %batch_id, ?outcome, "batch run finished");
                    Ok(Some(outcome))
                }
                Err(PipelineError::BatchBusy(_)) => {
                    debug!(batch_id = %batch_id, "batch busy; dispatch skipped");
                    Ok(None)
                }
                Err(e) => {
                    error!(
                        batch_id = %batch_id,
                        error = %e,
                        category = %e.category(),
                        "batch run failed"
                    );
                    Err(e)
                }
            }
        })
    }

    /// Re-dispatch batches whose embeddings completed
    pub fn listen(self: &Arc<Self>, mut completions: mpsc::UnboundedReceiver<Uuid>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => {
                        debug!("completion listener stopped");
                        break;
                    }
                    next = completions.recv() => match next {
                        Some(batch_id) => {
                            debug!(batch_id = %batch_id, "embeddings completed; dispatching");
                            runtime.dispatch(batch_id);
                        }
                        None => break,
                    },
                }
            }
        })
    }

    /// Startup recovery: watch outstanding embedding jobs, release claims an
    /// interrupted run left behind and dispatch every runnable batch.
    /// Returns the number of batches dispatched.
    pub async fn recover(&self) -> Result<usize> {
        let mut dispatched = 0;
        for batch in self.controller.list_batches().await? {
            if let Some(monitor) = self.controller.monitor() {
                let watched = monitor.watch_batch(batch.id).await?;
                if watched > 0 {
                    info!(batch_id = %batch.id, jobs = watched, "embedding watches restored");
                }
            }

            if batch.paused {
                continue;
            }
            let next = match batch.status.next_stage() {
                Some(Stage::Intake) | None => continue,
                Some(stage) => stage,
            };
            if batch.status == BatchStatus::GraphAssemblyCompleted
                && self.has_outstanding_jobs(batch.id).await?
            {
                continue;
            }

            if let Some(item_stage) = next.item_stage() {
                let ctx = RunContext::new(batch.id, ACTOR);
                match self.controller.reset_stale_claims(&ctx, item_stage).await {
                    Ok(_) => {}
                    Err(e) => warn!(batch_id = %batch.id, error = %e, "stale claim reset failed"),
                }
            }
            self.dispatch(batch.id);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn has_outstanding_jobs(&self, batch_id: Uuid) -> Result<bool> {
        Ok(self
            .controller
            .store()
            .list_jobs(batch_id)
            .await?
            .iter()
            .any(|job| !job.status.is_terminal()))
    }

    /// Stop the listener, pending dispatches and the monitor's watch loops
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(monitor) = self.controller.monitor() {
            monitor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::BatchLocks;
    use kgraph_store::InMemoryItemStore;

    #[tokio::test]
    async fn test_dispatch_runs_batch() {
        let controller = Arc::new(BatchController::new(
            Arc::new(InMemoryItemStore::new()),
            BatchLocks::new(),
        ));
        let batch = controller.create_batch("dispatch").await.unwrap();
        let runtime = PipelineRuntime::new(Arc::clone(&controller), 2);

        let outcome = runtime.dispatch(batch.id).await.unwrap().unwrap();
        assert_eq!(outcome, Some(RunOutcome::AwaitingIntake));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_does_nothing() {
        let controller = Arc::new(BatchController::new(
            Arc::new(InMemoryItemStore::new()),
            BatchLocks::new(),
        ));
        let batch = controller.create_batch("stopped").await.unwrap();
        let runtime = PipelineRuntime::new(controller, 1);
        runtime.shutdown();

        let outcome = runtime.dispatch(batch.id).await.unwrap().unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_recover_skips_unstarted_batches() {
        let controller = Arc::new(BatchController::new(
            Arc::new(InMemoryItemStore::new()),
            BatchLocks::new(),
        ));
        controller.create_batch("created").await.unwrap();
        let runtime = PipelineRuntime::new(controller, 1);
        assert_eq!(runtime.recover().await.unwrap(), 0);
    }
}
