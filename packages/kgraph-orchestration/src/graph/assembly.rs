//! Graph assembly for one batch
//!
//! Four strictly sequential sessions against the batch namespace:
//!
//! ```text
//! SchemaPending ──schema tx──▶ DataPending ──data tx──▶ DedupPending
//!     ──dedup/orphan tx──▶ Verified ──read tx──▶ Done
//!                  (any failure) ──▶ AssemblyFailed
//! ```
//!
//! Schema objects and data rows never share a transaction. A failed phase
//! rolls back only its own transaction; earlier commits stay.

use kgraph_store::{QualityWarning, QualityWarningKind, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{
    EdgeWrite, GraphDriver, GraphError, GraphNode, GraphOp, GraphTransaction, NodeKey, OpResult,
    TxKind,
};
use super::vocabulary::{canonical_name, normalize_name, NodeLabel, Verb};
use crate::config::GraphConfig;
use crate::error::{PipelineError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AssemblyState {
    SchemaPending,
    DataPending,
    DedupPending,
    Verified,
    Done,
    AssemblyFailed { phase: String, reason: String },
}

impl AssemblyState {
    pub fn state_name(&self) -> &'static str {
        match self {
            AssemblyState::SchemaPending => "schema_pending",
            AssemblyState::DataPending => "data_pending",
            AssemblyState::DedupPending => "dedup_pending",
            AssemblyState::Verified => "verified",
            AssemblyState::Done => "done",
            AssemblyState::AssemblyFailed { .. } => "assembly_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssemblyState::Done | AssemblyState::AssemblyFailed { .. }
        )
    }
}

impl std::fmt::Display for AssemblyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state_name())
    }
}

/// Assembly state machine for transitions
#[derive(Debug)]
pub struct AssemblyStateMachine {
    state: AssemblyState,
}

impl Default for AssemblyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AssemblyStateMachine {
    pub fn new() -> Self {
        Self {
            state: AssemblyState::SchemaPending,
        }
    }

    pub fn state(&self) -> &AssemblyState {
        &self.state
    }

    /// Transition: SCHEMA_PENDING → DATA_PENDING
    pub fn schema_applied(&mut self) -> Result<()> {
        self.step(AssemblyState::SchemaPending, AssemblyState::DataPending)
    }

    /// Transition: DATA_PENDING → DEDUP_PENDING
    pub fn data_loaded(&mut self) -> Result<()> {
        self.step(AssemblyState::DataPending, AssemblyState::DedupPending)
    }

    /// Transition: DEDUP_PENDING → VERIFIED
    pub fn deduplicated(&mut self) -> Result<()> {
        self.step(AssemblyState::DedupPending, AssemblyState::Verified)
    }

    /// Transition: VERIFIED → DONE
    pub fn finish(&mut self) -> Result<()> {
        self.step(AssemblyState::Verified, AssemblyState::Done)
    }

    /// Transition: any non-terminal state → ASSEMBLY_FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(PipelineError::transition(
                self.state.state_name(),
                "assembly_failed",
            ));
        }
        self.state = AssemblyState::AssemblyFailed {
            phase: self.state.state_name().to_string(),
            reason: reason.into(),
        };
        Ok(())
    }

    fn step(&mut self, from: AssemblyState, to: AssemblyState) -> Result<()> {
        if self.state != from {
            return Err(PipelineError::transition(
                self.state.state_name(),
                to.state_name(),
            ));
        }
        self.state = to;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Input / report
// ═══════════════════════════════════════════════════════════════════════════

/// Typed entity with its resolved rights pointer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub label: NodeLabel,
    pub name: String,
    pub rights_id: String,
    pub source_item: Uuid,
}

/// Relation endpoint as extracted: pool name is still unparsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub pool: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub source: EndpointSpec,
    pub verb: String,
    pub target: EndpointSpec,
    pub rights_id: String,
    pub source_item: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyInput {
    pub entities: Vec<EntitySpec>,
    pub relations: Vec<RelationSpec>,
}

impl AssemblyInput {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyReport {
    /// Nodes created by the data phase (merges onto existing nodes excluded)
    pub nodes_written: usize,
    /// Edges created by the data phase, structural included
    pub edges_written: usize,
    pub edges_rejected: usize,
    pub nodes_merged: usize,
    pub orphans_removed: usize,
    /// Entity nodes after verification
    pub node_count: usize,
    /// Non-structural edges after verification
    pub domain_edge_count: usize,
    pub warning: Option<QualityWarning>,
    /// One line per dropped relation
    pub rejections: Vec<String>,
}

impl AssemblyReport {
    pub fn to_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "nodes_written": self.nodes_written,
            "edges_written": self.edges_written,
            "edges_rejected": self.edges_rejected,
            "nodes_merged": self.nodes_merged,
            "orphans_removed": self.orphans_removed,
            "node_count": self.node_count,
            "domain_edge_count": self.domain_edge_count,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

pub struct GraphAssemblyEngine {
    driver: Arc<dyn GraphDriver>,
    config: GraphConfig,
}

impl GraphAssemblyEngine {
    pub fn new(driver: Arc<dyn GraphDriver>, config: GraphConfig) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> &Arc<dyn GraphDriver> {
        &self.driver
    }

    /// Run all phases against `namespace`
    pub async fn assemble(&self, namespace: &str, input: &AssemblyInput) -> Result<AssemblyReport> {
        let mut machine = AssemblyStateMachine::new();
        match self.run_phases(namespace, input, &mut machine).await {
            Ok(report) => Ok(report),
            Err(e) => {
                machine.fail(e.to_string())?;
                warn!(
                    namespace,
                    state = %machine.state(),
                    error = %e,
                    "graph assembly failed"
                );
                Err(PipelineError::Graph(e))
            }
        }
    }

    async fn run_phases(
        &self,
        namespace: &str,
        input: &AssemblyInput,
        machine: &mut AssemblyStateMachine,
    ) -> std::result::Result<AssemblyReport, GraphError> {
        let mut report = AssemblyReport::default();

        let mut tx = self.driver.begin(namespace, TxKind::Schema).await?;
        let outcome = apply_schema(tx.as_mut()).await;
        close(tx, outcome).await?;
        advance(machine.schema_applied())?;
        debug!(namespace, "schema phase committed");

        let mut tx = self.driver.begin(namespace, TxKind::Data).await?;
        let outcome = load_data(tx.as_mut(), input, &mut report).await;
        close(tx, outcome).await?;
        advance(machine.data_loaded())?;
        debug!(
            namespace,
            nodes = report.nodes_written,
            edges = report.edges_written,
            rejected = report.edges_rejected,
            "data phase committed"
        );
        for rejection in &report.rejections {
            warn!(namespace, "{}", rejection);
        }

        let mut tx = self.driver.begin(namespace, TxKind::Data).await?;
        let outcome = self.deduplicate(tx.as_mut(), &mut report).await;
        close(tx, outcome).await?;
        advance(machine.deduplicated())?;
        debug!(
            namespace,
            merged = report.nodes_merged,
            orphans = report.orphans_removed,
            "dedup phase committed"
        );

        let mut tx = self.driver.begin(namespace, TxKind::Read).await?;
        let outcome = verify(tx.as_mut(), &mut report).await;
        close(tx, outcome).await?;

        if report.node_count >= self.config.min_nodes_for_density && report.domain_edge_count == 0 {
            let message = format!(
                "{} entity nodes but no domain relationships",
                report.node_count
            );
            warn!(namespace, node_count = report.node_count, "{}", message);
            report.warning = Some(QualityWarning::new(
                QualityWarningKind::LowRelationshipDensity,
                Stage::Graph,
                message,
            ));
        }
        advance(machine.finish())?;

        info!(
            namespace,
            node_count = report.node_count,
            domain_edges = report.domain_edge_count,
            merged = report.nodes_merged,
            orphans = report.orphans_removed,
            "graph assembly done"
        );
        Ok(report)
    }

    async fn deduplicate(
        &self,
        tx: &mut dyn GraphTransaction,
        report: &mut AssemblyReport,
    ) -> std::result::Result<(), GraphError> {
        let nodes = tx.run(GraphOp::ListNodes).await?.into_nodes();

        // nodes arrive in creation order, so the first of each group survives
        let mut groups: BTreeMap<(NodeLabel, String), Vec<GraphNode>> = BTreeMap::new();
        for node in nodes.into_iter().filter(|n| n.key.label.is_pool()) {
            groups
                .entry((node.key.label, normalize_name(&node.key.name)))
                .or_default()
                .push(node);
        }

        for group in groups.values().filter(|g| g.len() > 1) {
            let survivor = &group[0].key;
            for duplicate in &group[1..] {
                tx.run(GraphOp::MergeInto {
                    survivor: survivor.clone(),
                    duplicate: duplicate.key.clone(),
                })
                .await?;
                report.nodes_merged += 1;
            }
        }

        report.orphans_removed = tx
            .run(GraphOp::DeleteOrphans {
                keep: self.config.isolated_labels.clone(),
            })
            .await?
            .count();
        Ok(())
    }
}

fn advance(step: Result<()>) -> std::result::Result<(), GraphError> {
    step.map_err(|e| GraphError::Query(e.to_string()))
}

/// Commit on success, roll back on failure
async fn close<T>(
    tx: Box<dyn GraphTransaction>,
    outcome: std::result::Result<T, GraphError>,
) -> std::result::Result<T, GraphError> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

async fn apply_schema(tx: &mut dyn GraphTransaction) -> std::result::Result<(), GraphError> {
    for label in NodeLabel::ALL {
        tx.run(GraphOp::CreateConstraint { label }).await?;
        tx.run(GraphOp::CreateIndex { label }).await?;
    }
    Ok(())
}

#[derive(Default)]
struct NodeWrite {
    rights_ids: BTreeSet<String>,
    source_items: BTreeSet<Uuid>,
}

async fn load_data(
    tx: &mut dyn GraphTransaction,
    input: &AssemblyInput,
    report: &mut AssemblyReport,
) -> std::result::Result<(), GraphError> {
    // BTreeMap keyed by NodeKey gives label-then-name order
    let mut nodes: BTreeMap<NodeKey, NodeWrite> = BTreeMap::new();
    let mut governed: BTreeSet<(NodeKey, String)> = BTreeSet::new();

    for entity in &input.entities {
        let name = canonical_name(&entity.name);
        if name.is_empty() {
            continue;
        }
        let key = NodeKey::new(entity.label, name);
        let write = nodes.entry(key.clone()).or_default();
        write.rights_ids.insert(entity.rights_id.clone());
        write.source_items.insert(entity.source_item);

        let rights = nodes
            .entry(NodeKey::new(NodeLabel::Rights, entity.rights_id.clone()))
            .or_default();
        rights.source_items.insert(entity.source_item);

        governed.insert((key, entity.rights_id.clone()));
    }

    for (key, write) in nodes {
        let result = tx
            .run(GraphOp::MergeNode {
                key,
                rights_ids: write.rights_ids.into_iter().collect(),
                source_items: write.source_items.into_iter().collect(),
            })
            .await?;
        if result == (OpResult::Node { created: true }) {
            report.nodes_written += 1;
        }
    }

    for (key, rights_id) in governed {
        let result = tx
            .run(GraphOp::MergeEdge {
                from: key,
                verb: Verb::GovernedBy,
                to: NodeKey::new(NodeLabel::Rights, rights_id.clone()),
                rights_id: Some(rights_id),
            })
            .await?;
        if result == OpResult::Edge(EdgeWrite::Created) {
            report.edges_written += 1;
        }
    }

    // endpoints may spell a node differently from its entity; the first
    // node of each dedup group is also the one dedup keeps
    let mut spellings: BTreeMap<(NodeLabel, String), NodeKey> = BTreeMap::new();
    for node in tx.run(GraphOp::ListNodes).await?.into_nodes() {
        if node.key.label.is_pool() {
            spellings
                .entry((node.key.label, normalize_name(&node.key.name)))
                .or_insert(node.key);
        }
    }

    for relation in &input.relations {
        let (from, verb, to) = match resolve_relation(relation, &spellings) {
            Ok(parts) => parts,
            Err(e) => {
                report.edges_rejected += 1;
                report.rejections.push(format!(
                    "dropped relation from item {}: {}",
                    relation.source_item, e
                ));
                continue;
            }
        };

        let mut directions = vec![(from.clone(), to.clone())];
        if verb.is_bidirectional() {
            directions.push((to, from));
        }

        for (a, b) in directions {
            let result = tx
                .run(GraphOp::MergeEdge {
                    from: a.clone(),
                    verb,
                    to: b.clone(),
                    rights_id: Some(relation.rights_id.clone()),
                })
                .await?;
            match result {
                OpResult::Edge(EdgeWrite::Created) => report.edges_written += 1,
                OpResult::Edge(EdgeWrite::MissingEndpoint) => {
                    report.edges_rejected += 1;
                    report.rejections.push(format!(
                        "dropped {} -[{}]-> {} from item {}: endpoint not written",
                        a, verb, b, relation.source_item
                    ));
                    // the reverse direction has the same endpoints
                    break;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn resolve_relation(
    relation: &RelationSpec,
    spellings: &BTreeMap<(NodeLabel, String), NodeKey>,
) -> std::result::Result<(NodeKey, Verb, NodeKey), GraphError> {
    let verb = Verb::domain(&relation.verb)?;
    let from = resolve_endpoint(&relation.source, spellings)?;
    let to = resolve_endpoint(&relation.target, spellings)?;
    Ok((from, verb, to))
}

fn resolve_endpoint(
    endpoint: &EndpointSpec,
    spellings: &BTreeMap<(NodeLabel, String), NodeKey>,
) -> std::result::Result<NodeKey, GraphError> {
    let label = NodeLabel::pool(&endpoint.pool)?;
    Ok(spellings
        .get(&(label, normalize_name(&endpoint.name)))
        .cloned()
        .unwrap_or_else(|| NodeKey::new(label, canonical_name(&endpoint.name))))
}

async fn verify(
    tx: &mut dyn GraphTransaction,
    report: &mut AssemblyReport,
) -> std::result::Result<(), GraphError> {
    report.node_count = tx
        .run(GraphOp::CountNodes {
            labels: NodeLabel::POOLS.to_vec(),
        })
        .await?
        .count();
    report.domain_edge_count = tx
        .run(GraphOp::CountEdges {
            include_structural: false,
        })
        .await?
        .count();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memory::{Fault, MemoryGraphDriver};

    fn entity(label: NodeLabel, name: &str, rights: &str) -> EntitySpec {
        EntitySpec {
            label,
            name: name.to_string(),
            rights_id: rights.to_string(),
            source_item: Uuid::nil(),
        }
    }

    fn relation(source: (&str, &str), verb: &str, target: (&str, &str)) -> RelationSpec {
        RelationSpec {
            source: EndpointSpec {
                pool: source.0.to_string(),
                name: source.1.to_string(),
            },
            verb: verb.to_string(),
            target: EndpointSpec {
                pool: target.0.to_string(),
                name: target.1.to_string(),
            },
            rights_id: "r1".to_string(),
            source_item: Uuid::nil(),
        }
    }

    fn engine(driver: &MemoryGraphDriver) -> GraphAssemblyEngine {
        GraphAssemblyEngine::new(Arc::new(driver.clone()), GraphConfig::default())
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut machine = AssemblyStateMachine::new();
        machine.schema_applied().unwrap();
        machine.data_loaded().unwrap();
        machine.deduplicated().unwrap();
        machine.finish().unwrap();
        assert_eq!(machine.state(), &AssemblyState::Done);
        assert!(machine.fail("late").is_err());
    }

    #[test]
    fn test_state_machine_rejects_skipping() {
        let mut machine = AssemblyStateMachine::new();
        let err = machine.data_loaded().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));

        machine.schema_applied().unwrap();
        machine.fail("boom").unwrap();
        assert_eq!(
            machine.state(),
            &AssemblyState::AssemblyFailed {
                phase: "data_pending".to_string(),
                reason: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_assemble_writes_nodes_rights_and_edges() {
        let driver = MemoryGraphDriver::new();
        let input = AssemblyInput {
            entities: vec![
                entity(NodeLabel::Practice, "Weaving", "r1"),
                entity(NodeLabel::Place, "Oaxaca", "r1"),
            ],
            relations: vec![relation(
                ("Practice", "Weaving"),
                "located in",
                ("Place", "Oaxaca"),
            )],
        };

        let report = engine(&driver).assemble("batch_x", &input).await.unwrap();
        assert_eq!(report.nodes_written, 3);
        // two GOVERNED_BY plus one LOCATED_IN
        assert_eq!(report.edges_written, 3);
        assert_eq!(report.node_count, 2);
        assert_eq!(report.domain_edge_count, 1);
        assert!(report.warning.is_none());

        let graph = driver.snapshot("batch_x").unwrap();
        assert!(graph.has_constraint(NodeLabel::Rights));
        assert!(graph.has_index(NodeLabel::Term));
        assert!(graph
            .node(&NodeKey::new(NodeLabel::Rights, "r1"))
            .is_some());
    }

    #[tokio::test]
    async fn test_bidirectional_verb_writes_reverse_edge() {
        let driver = MemoryGraphDriver::new();
        let input = AssemblyInput {
            entities: vec![
                entity(NodeLabel::Idea, "Care", "r1"),
                entity(NodeLabel::Idea, "Repair", "r1"),
            ],
            relations: vec![relation(("Idea", "Care"), "RELATES_TO", ("Idea", "Repair"))],
        };
        let report = engine(&driver).assemble("ns", &input).await.unwrap();
        assert_eq!(report.domain_edge_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_verb_and_missing_endpoint_are_rejected() {
        let driver = MemoryGraphDriver::new();
        let input = AssemblyInput {
            entities: vec![entity(NodeLabel::Idea, "Care", "r1")],
            relations: vec![
                relation(("Idea", "Care"), "LOVES", ("Idea", "Care")),
                relation(("Idea", "Care"), "INFORMS", ("Practice", "Ghost")),
                relation(("Concept", "Care"), "INFORMS", ("Idea", "Care")),
            ],
        };
        let report = engine(&driver).assemble("ns", &input).await.unwrap();
        assert_eq!(report.edges_rejected, 3);
        assert_eq!(report.rejections.len(), 3);
        assert_eq!(report.domain_edge_count, 0);
    }

    #[tokio::test]
    async fn test_endpoint_spelling_resolves_to_the_written_node() {
        let driver = MemoryGraphDriver::new();
        let input = AssemblyInput {
            entities: vec![
                entity(NodeLabel::Practice, "Deep Listening", "r1"),
                entity(NodeLabel::Person, "Ana", "r1"),
            ],
            relations: vec![relation(
                ("Person", "ana"),
                "PRACTICES",
                ("Practice", "deep listening!"),
            )],
        };

        let report = engine(&driver).assemble("ns", &input).await.unwrap();
        assert_eq!(report.edges_rejected, 0);
        assert_eq!(report.domain_edge_count, 1);

        let graph = driver.snapshot("ns").unwrap();
        let edge = graph
            .edges()
            .into_iter()
            .find(|e| e.verb == Verb::Practices)
            .unwrap();
        assert_eq!(edge.from, NodeKey::new(NodeLabel::Person, "Ana"));
        assert_eq!(edge.to, NodeKey::new(NodeLabel::Practice, "Deep Listening"));
    }

    #[tokio::test]
    async fn test_dedup_keeps_earliest_node() {
        let driver = MemoryGraphDriver::new();
        // "Deep Listening" sorts before "deep-listening", so it is created first
        let input = AssemblyInput {
            entities: vec![
                entity(NodeLabel::Practice, "deep-listening", "r2"),
                entity(NodeLabel::Practice, "Deep Listening", "r1"),
            ],
            relations: vec![],
        };
        let report = engine(&driver).assemble("ns", &input).await.unwrap();
        assert_eq!(report.nodes_merged, 1);

        let graph = driver.snapshot("ns").unwrap();
        let survivor = graph
            .node(&NodeKey::new(NodeLabel::Practice, "Deep Listening"))
            .unwrap();
        assert_eq!(survivor.rights_ids.len(), 2);
        assert!(graph
            .node(&NodeKey::new(NodeLabel::Practice, "deep-listening"))
            .is_none());
    }

    #[tokio::test]
    async fn test_low_density_warning() {
        let driver = MemoryGraphDriver::new();
        let entities = (0..6)
            .map(|i| entity(NodeLabel::Idea, &format!("idea {}", i), "r1"))
            .collect();
        let input = AssemblyInput {
            entities,
            relations: vec![],
        };
        let report = engine(&driver).assemble("ns", &input).await.unwrap();
        let warning = report.warning.unwrap();
        assert_eq!(warning.kind, QualityWarningKind::LowRelationshipDensity);
        // GOVERNED_BY edges keep the entities from being orphaned
        assert_eq!(report.orphans_removed, 0);
    }

    #[tokio::test]
    async fn test_data_fault_leaves_schema_committed() {
        let driver = MemoryGraphDriver::new();
        driver.inject(Fault::FailOp {
            kind: TxKind::Data,
            op_index: 0,
        });
        let input = AssemblyInput {
            entities: vec![entity(NodeLabel::Idea, "Care", "r1")],
            relations: vec![],
        };
        let err = engine(&driver).assemble("ns", &input).await.unwrap_err();
        assert!(matches!(err, PipelineError::Graph(_)));

        let graph = driver.snapshot("ns").unwrap();
        assert!(graph.has_constraint(NodeLabel::Idea));
        assert_eq!(graph.node_count(), 0);
    }
}
