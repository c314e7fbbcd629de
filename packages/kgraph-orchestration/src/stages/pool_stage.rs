use async_trait::async_trait;
use kgraph_store::{BatchStatus, Item, ItemStage};
use std::sync::Arc;

use crate::collaborators::{EntityExtractor, EntityFact};
use crate::context::RunContext;
use crate::error::Result;
use crate::graph::NodeLabel;
use crate::pipeline::{DeferredItem, ItemOutcome, ItemStageHandler, StageSummary, StageVerdict};

/// Pool classification (stage 4): typed entities from the fixed pool
/// vocabulary. An entity in an unknown pool fails the item.
pub struct PoolStage {
    extractor: Arc<dyn EntityExtractor>,
}

impl PoolStage {
    pub fn new(extractor: Arc<dyn EntityExtractor>) -> Self {
        Self { extractor }
    }
}

/// Pool names normalised to their label spelling; empty names dropped
fn normalize_entities(entities: Vec<EntityFact>) -> std::result::Result<Vec<EntityFact>, String> {
    let mut out = Vec::with_capacity(entities.len());
    for entity in entities {
        if entity.name.trim().is_empty() {
            continue;
        }
        let label = NodeLabel::pool(&entity.pool)
            .map_err(|_| format!("unknown pool '{}' for entity '{}'", entity.pool, entity.name))?;
        out.push(EntityFact {
            pool: label.as_str().to_string(),
            name: entity.name,
        });
    }
    Ok(out)
}

#[async_trait]
impl ItemStageHandler for PoolStage {
    fn stage(&self) -> ItemStage {
        ItemStage::Pool
    }

    async fn process(&self, ctx: &RunContext, item: &Item) -> Result<ItemOutcome> {
        let entities = match self.extractor.extract(&item.content, ctx).await {
            Ok(entities) => entities,
            Err(e) => return Ok(ItemOutcome::failed(format!("entity extraction failed: {}", e))),
        };
        match normalize_entities(entities) {
            Ok(entities) => Ok(ItemOutcome::success(
                serde_json::json!({ "entities": entities }),
            )),
            Err(reason) => Ok(ItemOutcome::failed(reason)),
        }
    }

    async fn finish(
        &self,
        _ctx: &RunContext,
        _summary: &StageSummary,
        _deferred: &[DeferredItem],
    ) -> Result<StageVerdict> {
        Ok(StageVerdict::completed(BatchStatus::PoolsCompleted))
    }
}
