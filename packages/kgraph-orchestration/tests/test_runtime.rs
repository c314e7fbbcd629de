//! Pipeline runtime: dispatch, completion re-dispatch, startup recovery

mod common;

use common::{Doc, FakeEmbeddingProvider, Harness};
use kgraph_orchestration::{PipelineRuntime, RunOutcome};
use kgraph_store::{BatchStatus, ItemStage, ItemState, ItemStore, ItemTransition};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn docs(prefix: &str, n: usize) -> Vec<Doc> {
    (0..n)
        .map(|i| {
            Doc::new(&format!("{} {}", prefix, i)).entity("Idea", &format!("{} idea {}", prefix, i))
        })
        .collect()
}

/// Poll the batch status until `done` holds, or give up after 5s
async fn wait_for<F>(harness: &Harness, batch_id: Uuid, done: F)
where
    F: Fn(&BatchStatus, &[ItemState]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = harness.batch_row(batch_id).await.status;
        let states = harness.states(batch_id).await;
        if done(&status, &states) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch stuck at {} with items {:?}",
            status,
            states
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_completed_embeddings_redispatch_the_batch() {
    let mut config = common::test_config();
    config.embedding.validating_delay_secs = 0;
    let mut harness = Harness::build(config, FakeEmbeddingProvider::auto_completing());
    let runtime = Arc::new(PipelineRuntime::new(Arc::clone(&harness.controller), 2));
    let listener = runtime.listen(harness.take_completions());

    let ctx = harness.batch(&docs("runtime", 3)).await;
    let outcome = runtime.dispatch(ctx.batch_id).await.unwrap().unwrap();
    assert_eq!(outcome, Some(RunOutcome::AwaitingEmbeddings { jobs: 1 }));

    wait_for(&harness, ctx.batch_id, |status, _| {
        *status == BatchStatus::NavigatorCompleted
    })
    .await;

    let report = harness
        .controller
        .get_batch_status(ctx.batch_id)
        .await
        .unwrap();
    assert_eq!(report.outstanding_jobs, 0);
    assert_eq!(report.counts["embedding"]["embedded"], 3);

    runtime.shutdown();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_recover_dispatches_runnable_batches_and_releases_stale_claims() {
    let harness = Harness::new();

    let crashed = harness.batch(&docs("crashed", 3)).await;
    let stale = harness.items(crashed.batch_id).await.remove(1);
    let claim = ItemTransition::claim(&stale.state, ItemStage::Triage, "crashed").unwrap();
    assert!(harness
        .store
        .transition_item(stale.id, claim, None)
        .await
        .unwrap());

    let paused = harness.batch(&docs("paused", 2)).await;
    harness.controller.pause(paused.batch_id).await.unwrap();
    let fresh = harness.controller.create_batch("fresh").await.unwrap();

    let runtime = PipelineRuntime::new(Arc::clone(&harness.controller), 1);
    assert_eq!(runtime.recover().await.unwrap(), 1);

    // every item, the once-stale one included, ends up with the embedding job
    wait_for(&harness, crashed.batch_id, |_, states| {
        states
            .iter()
            .all(|s| s.is_in_progress_at(ItemStage::Embedding))
    })
    .await;
    assert_eq!(harness.jobs(crashed.batch_id).await.len(), 1);

    let paused_row = harness.batch_row(paused.batch_id).await;
    assert_eq!(paused_row.status, BatchStatus::IntakeCompleted);
    assert!(paused_row.paused);
    assert_eq!(
        harness.batch_row(fresh.id).await.status,
        BatchStatus::Created
    );

    runtime.shutdown();
}

#[tokio::test]
async fn test_busy_batch_is_skipped() {
    let harness = Harness::new();
    let ctx = harness.batch(&docs("busy", 1)).await;
    let runtime = PipelineRuntime::new(Arc::clone(&harness.controller), 1);

    let held = harness.monitor.locks().acquire(ctx.batch_id).await;
    let outcome = runtime.dispatch(ctx.batch_id).await.unwrap().unwrap();
    assert_eq!(outcome, None);
    drop(held);

    assert_eq!(
        harness.batch_row(ctx.batch_id).await.status,
        BatchStatus::IntakeCompleted
    );
}
