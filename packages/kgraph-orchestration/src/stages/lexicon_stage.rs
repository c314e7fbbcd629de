use async_trait::async_trait;
use kgraph_store::{BatchStatus, Item, ItemStage};
use std::sync::Arc;

use crate::collaborators::LexiconExtractor;
use crate::context::RunContext;
use crate::error::Result;
use crate::pipeline::{DeferredItem, ItemOutcome, ItemStageHandler, StageSummary, StageVerdict};

/// Lexicon extraction (stage 3): terms and their definitions
pub struct LexiconStage {
    extractor: Arc<dyn LexiconExtractor>,
}

impl LexiconStage {
    pub fn new(extractor: Arc<dyn LexiconExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl ItemStageHandler for LexiconStage {
    fn stage(&self) -> ItemStage {
        ItemStage::Lexicon
    }

    async fn process(&self, ctx: &RunContext, item: &Item) -> Result<ItemOutcome> {
        match self.extractor.extract(&item.content, ctx).await {
            Ok(terms) => {
                let terms: Vec<_> = terms
                    .into_iter()
                    .filter(|t| !t.term.trim().is_empty())
                    .collect();
                Ok(ItemOutcome::success(serde_json::json!({ "terms": terms })))
            }
            Err(e) => Ok(ItemOutcome::failed(format!("lexicon extraction failed: {}", e))),
        }
    }

    async fn finish(
        &self,
        _ctx: &RunContext,
        _summary: &StageSummary,
        _deferred: &[DeferredItem],
    ) -> Result<StageVerdict> {
        Ok(StageVerdict::completed(BatchStatus::LexiconCompleted))
    }
}
