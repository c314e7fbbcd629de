use async_trait::async_trait;
use kgraph_store::{
    graph_namespace, BatchStatus, Item, ItemStage, ItemStore, LogLevel, RightsRecord,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::{EntityFact, LexiconTerm, RelationExtractor, RelationFact};
use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::graph::{
    AssemblyInput, EndpointSpec, EntitySpec, GraphAssemblyEngine, NodeLabel, RelationSpec,
};
use crate::pipeline::{DeferredItem, ItemOutcome, ItemStageHandler, StageSummary, StageVerdict};

/// Relation extraction and graph assembly (stage 5)
///
/// Relations are extracted per item; the items stay claimed until the
/// assembly engine has written the whole batch. A failed assembly releases
/// them so a resume retries the stage.
pub struct GraphStage {
    store: Arc<dyn ItemStore>,
    extractor: Arc<dyn RelationExtractor>,
    engine: Arc<GraphAssemblyEngine>,
}

impl GraphStage {
    pub fn new(
        store: Arc<dyn ItemStore>,
        extractor: Arc<dyn RelationExtractor>,
        engine: Arc<GraphAssemblyEngine>,
    ) -> Self {
        Self {
            store,
            extractor,
            engine,
        }
    }

    async fn build_input(
        &self,
        batch_id: Uuid,
        deferred: &[DeferredItem],
    ) -> Result<AssemblyInput> {
        let mut rights = RightsResolver::new(self.store.as_ref(), batch_id);
        let mut input = AssemblyInput::default();

        for entry in deferred {
            let item = &entry.item;
            let rights_id = rights.resolve(item).await?;

            let entities: Vec<EntityFact> = facts_list(item, ItemStage::Pool, "entities");
            for entity in entities {
                match NodeLabel::pool(&entity.pool) {
                    Ok(label) => input.entities.push(EntitySpec {
                        label,
                        name: entity.name,
                        rights_id: rights_id.clone(),
                        source_item: item.id,
                    }),
                    Err(e) => warn!(item_id = %item.id, error = %e, "entity skipped"),
                }
            }

            let terms: Vec<LexiconTerm> = facts_list(item, ItemStage::Lexicon, "terms");
            input.entities.extend(terms.into_iter().map(|term| EntitySpec {
                label: NodeLabel::Term,
                name: term.term,
                rights_id: rights_id.clone(),
                source_item: item.id,
            }));

            let relations: Vec<RelationFact> = entry
                .facts
                .as_ref()
                .and_then(|facts| facts.get("relations"))
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_default();
            input
                .relations
                .extend(relations.into_iter().map(|relation| RelationSpec {
                    source: EndpointSpec {
                        pool: relation.source.pool,
                        name: relation.source.name,
                    },
                    verb: relation.verb,
                    target: EndpointSpec {
                        pool: relation.target.pool,
                        name: relation.target.name,
                    },
                    rights_id: rights_id.clone(),
                    source_item: item.id,
                }));
        }

        Ok(input)
    }
}

/// Typed list stored under `facts[stage][key]`; empty when absent
fn facts_list<T: serde::de::DeserializeOwned>(item: &Item, stage: ItemStage, key: &str) -> Vec<T> {
    item.facts_for(stage)
        .and_then(|facts| facts.get(key))
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

/// Record of the most frequent contributor; ties go to the smallest
/// contributor, then the smallest record id
pub fn fallback_rights(records: &[RightsRecord]) -> Option<&RightsRecord> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.contributor.as_str()).or_default() += 1;
    }
    // BTreeMap iterates contributors in ascending order, so the first max wins ties
    let mut best: Option<(&str, usize)> = None;
    for (contributor, count) in counts {
        if best.map_or(true, |(_, n)| count > n) {
            best = Some((contributor, count));
        }
    }
    let (contributor, _) = best?;
    records
        .iter()
        .filter(|r| r.contributor == contributor)
        .min_by(|a, b| a.id.cmp(&b.id))
}

/// Resolves each item to exactly one rights record id
struct RightsResolver<'a> {
    store: &'a dyn ItemStore,
    batch_id: Uuid,
    fallback: Option<Option<String>>,
}

impl<'a> RightsResolver<'a> {
    fn new(store: &'a dyn ItemStore, batch_id: Uuid) -> Self {
        Self {
            store,
            batch_id,
            fallback: None,
        }
    }

    async fn resolve(&mut self, item: &Item) -> Result<String> {
        if let Some(rights_id) = &item.rights_id {
            return Ok(rights_id.clone());
        }

        if self.fallback.is_none() {
            let records = self.store.list_rights(self.batch_id).await?;
            let chosen = fallback_rights(&records).map(|r| r.id.clone());
            debug!(batch_id = %self.batch_id, fallback = ?chosen, "batch fallback rights resolved");
            self.fallback = Some(chosen);
        }

        self.fallback.clone().flatten().ok_or_else(|| {
            PipelineError::invariant(format!(
                "item {} has no rights record and batch {} has no fallback",
                item.id, self.batch_id
            ))
        })
    }
}

#[async_trait]
impl ItemStageHandler for GraphStage {
    fn stage(&self) -> ItemStage {
        ItemStage::Graph
    }

    async fn process(&self, ctx: &RunContext, item: &Item) -> Result<ItemOutcome> {
        match self.extractor.extract(&item.content, ctx).await {
            Ok(relations) => Ok(ItemOutcome::deferred(Some(
                serde_json::json!({ "relations": relations }),
            ))),
            Err(e) => Ok(ItemOutcome::failed(format!("relation extraction failed: {}", e))),
        }
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        _summary: &StageSummary,
        deferred: &[DeferredItem],
    ) -> Result<StageVerdict> {
        if deferred.is_empty() {
            return Ok(StageVerdict::completed(BatchStatus::GraphAssemblyCompleted)
                .log(LogLevel::Info, "no items to assemble; graph unchanged"));
        }

        let input = self.build_input(ctx.batch_id, deferred).await?;
        let report = self
            .engine
            .assemble(&graph_namespace(ctx.batch_id), &input)
            .await?;

        let mut verdict = StageVerdict::completed(BatchStatus::GraphAssemblyCompleted)
            .with_stats(report.to_stats());
        for rejection in &report.rejections {
            verdict = verdict.log(LogLevel::Warn, rejection.clone());
        }
        if let Some(warning) = report.warning {
            verdict = verdict.log(LogLevel::Warn, warning.message.clone());
            verdict.warnings.push(warning);
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, contributor: &str) -> RightsRecord {
        RightsRecord {
            id: id.to_string(),
            batch_id: Uuid::nil(),
            contributor: contributor.to_string(),
            license: "cc-by".to_string(),
            confidence: 0.9,
            source_item: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_fallback_picks_most_frequent_contributor() {
        let records = vec![
            record("r3", "ana"),
            record("r1", "bo"),
            record("r2", "bo"),
        ];
        assert_eq!(fallback_rights(&records).unwrap().id, "r1");
    }

    #[test]
    fn test_fallback_ties_break_by_contributor_then_id() {
        let records = vec![
            record("r9", "bo"),
            record("r5", "ana"),
            record("r2", "ana"),
            record("r1", "bo"),
        ];
        assert_eq!(fallback_rights(&records).unwrap().id, "r2");
    }

    #[test]
    fn test_no_records_no_fallback() {
        assert!(fallback_rights(&[]).is_none());
    }
}
