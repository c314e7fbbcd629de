//! Graph store port
//!
//! A driver hands out transactions of one kind. Schema operations
//! (constraints, indexes) and data operations (nodes, edges) never share a
//! transaction: a transaction rejects ops of the other kind with
//! `GraphError::MixedTransaction`. Ops are typed and render to Cypher for
//! logging and for Bolt-backed drivers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

use super::vocabulary::{NodeLabel, Verb};

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("{op} operation not allowed in a {kind} transaction")]
    MixedTransaction { kind: TxKind, op: OpKind },

    #[error("Namespace {namespace} already has an open {kind} transaction")]
    SessionConflict { namespace: String, kind: TxKind },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unknown node label: {0}")]
    UnknownLabel(String),

    #[error("Unknown verb: {0}")]
    UnknownVerb(String),
}

impl GraphError {
    /// Connectivity problems; worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GraphError::Unavailable(_) | GraphError::SessionConflict { .. }
        )
    }
}

/// Transaction kind, fixed at `begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Schema,
    Data,
    Read,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Schema => "schema",
            TxKind::Data => "data",
            TxKind::Read => "read",
        }
    }

    /// Data transactions may read what they write; schema transactions touch
    /// no data rows at all.
    pub fn permits(&self, op: OpKind) -> bool {
        matches!(
            (self, op),
            (TxKind::Schema, OpKind::Schema)
                | (TxKind::Data, OpKind::Data)
                | (TxKind::Data, OpKind::Read)
                | (TxKind::Read, OpKind::Read)
        )
    }
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Schema,
    Data,
    Read,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpKind::Schema => "schema",
            OpKind::Data => "data",
            OpKind::Read => "read",
        };
        write!(f, "{}", s)
    }
}

/// Node identity within a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub label: NodeLabel,
    pub name: String,
}

impl NodeKey {
    pub fn new(label: NodeLabel, name: impl Into<String>) -> Self {
        Self {
            label,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.label, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: NodeKey,
    /// Creation sequence within the namespace; lower is older
    pub seq: u64,
    pub rights_ids: BTreeSet<String>,
    pub source_items: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: NodeKey,
    pub verb: Verb,
    pub to: NodeKey,
    pub rights_ids: BTreeSet<String>,
}

/// Typed graph operation
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Schema
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// Uniqueness of `name` per label
    CreateConstraint { label: NodeLabel },
    CreateIndex { label: NodeLabel },

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Data
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// Create the node if absent; union rights/source properties either way
    MergeNode {
        key: NodeKey,
        rights_ids: Vec<String>,
        source_items: Vec<Uuid>,
    },
    /// Create the edge if both endpoints exist and the edge is absent
    MergeEdge {
        from: NodeKey,
        verb: Verb,
        to: NodeKey,
        rights_id: Option<String>,
    },
    /// Fold `duplicate` into `survivor`: edges redirected (duplicates
    /// collapse, self-loops dropped), properties unioned, duplicate deleted
    MergeInto { survivor: NodeKey, duplicate: NodeKey },
    /// Delete nodes without any edge, except the given labels
    DeleteOrphans { keep: Vec<NodeLabel> },

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Read
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    ListNodes,
    ListEdges,
    CountNodes { labels: Vec<NodeLabel> },
    CountEdges { include_structural: bool },
}

impl GraphOp {
    pub fn kind(&self) -> OpKind {
        match self {
            GraphOp::CreateConstraint { .. } | GraphOp::CreateIndex { .. } => OpKind::Schema,
            GraphOp::MergeNode { .. }
            | GraphOp::MergeEdge { .. }
            | GraphOp::MergeInto { .. }
            | GraphOp::DeleteOrphans { .. } => OpKind::Data,
            GraphOp::ListNodes
            | GraphOp::ListEdges
            | GraphOp::CountNodes { .. }
            | GraphOp::CountEdges { .. } => OpKind::Read,
        }
    }

    /// Cypher text of the operation
    pub fn cypher(&self) -> String {
        match self {
            GraphOp::CreateConstraint { label } => format!(
                "CREATE CONSTRAINT {}_name_unique IF NOT EXISTS FOR (n:{}) REQUIRE n.name IS UNIQUE",
                label.as_str().to_lowercase(),
                label
            ),
            GraphOp::CreateIndex { label } => format!(
                "CREATE INDEX {}_name_idx IF NOT EXISTS FOR (n:{}) ON (n.name)",
                label.as_str().to_lowercase(),
                label
            ),
            GraphOp::MergeNode {
                key,
                rights_ids,
                source_items,
            } => format!(
                "MERGE (n:{} {{name: {:?}}}) ON CREATE SET n.seq = $seq \
                 SET n.rights = coalesce(n.rights, []) + {:?}, n.sources = coalesce(n.sources, []) + {:?}",
                key.label,
                key.name,
                rights_ids,
                source_items
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
            ),
            GraphOp::MergeEdge {
                from,
                verb,
                to,
                rights_id,
            } => format!(
                "MATCH (a:{} {{name: {:?}}}), (b:{} {{name: {:?}}}) MERGE (a)-[r:{}]->(b) \
                 SET r.rights = coalesce(r.rights, []) + {:?}",
                from.label,
                from.name,
                to.label,
                to.name,
                verb,
                rights_id.as_deref().unwrap_or("")
            ),
            GraphOp::MergeInto {
                survivor,
                duplicate,
            } => format!(
                "MATCH (keep:{} {{name: {:?}}}), (dup:{} {{name: {:?}}}) \
                 CALL apoc.refactor.mergeNodes([keep, dup], {{properties: 'combine', mergeRels: true}}) \
                 YIELD node RETURN node",
                survivor.label, survivor.name, duplicate.label, duplicate.name
            ),
            GraphOp::DeleteOrphans { keep } => {
                let keep_clause: Vec<String> =
                    keep.iter().map(|label| format!("NOT n:{}", label)).collect();
                if keep_clause.is_empty() {
                    "MATCH (n) WHERE NOT (n)--() DELETE n".to_string()
                } else {
                    format!(
                        "MATCH (n) WHERE NOT (n)--() AND {} DELETE n",
                        keep_clause.join(" AND ")
                    )
                }
            }
            GraphOp::ListNodes => "MATCH (n) RETURN n ORDER BY n.seq".to_string(),
            GraphOp::ListEdges => "MATCH (a)-[r]->(b) RETURN a, r, b".to_string(),
            GraphOp::CountNodes { labels } => {
                let labels: Vec<&str> = labels.iter().map(NodeLabel::as_str).collect();
                format!(
                    "MATCH (n) WHERE any(l IN labels(n) WHERE l IN {:?}) RETURN count(n)",
                    labels
                )
            }
            GraphOp::CountEdges { include_structural } => {
                if *include_structural {
                    "MATCH ()-[r]->() RETURN count(r)".to_string()
                } else {
                    format!(
                        "MATCH ()-[r]->() WHERE type(r) <> '{}' RETURN count(r)",
                        Verb::GovernedBy
                    )
                }
            }
        }
    }
}

/// Result of a single op
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    /// Schema object created or already present
    Applied,
    Node { created: bool },
    Edge(EdgeWrite),
    Merged,
    Deleted(usize),
    Nodes(Vec<GraphNode>),
    Edges(Vec<GraphEdge>),
    Count(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWrite {
    Created,
    Existing,
    /// One endpoint does not exist; nothing written
    MissingEndpoint,
}

impl OpResult {
    pub fn count(&self) -> usize {
        match self {
            OpResult::Count(n) | OpResult::Deleted(n) => *n,
            _ => 0,
        }
    }

    pub fn into_nodes(self) -> Vec<GraphNode> {
        match self {
            OpResult::Nodes(nodes) => nodes,
            _ => Vec::new(),
        }
    }

    pub fn into_edges(self) -> Vec<GraphEdge> {
        match self {
            OpResult::Edges(edges) => edges,
            _ => Vec::new(),
        }
    }
}

/// An open transaction on one namespace
#[async_trait]
pub trait GraphTransaction: Send {
    fn kind(&self) -> TxKind;

    /// Execute one op. Ops of a kind the transaction does not permit fail
    /// with `MixedTransaction` and leave the transaction usable.
    async fn run(&mut self, op: GraphOp) -> Result<OpResult, GraphError>;

    async fn commit(self: Box<Self>) -> Result<(), GraphError>;

    async fn rollback(self: Box<Self>) -> Result<(), GraphError>;
}

#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// Health check
    async fn ping(&self) -> Result<(), GraphError>;

    /// Open a transaction of `kind` in its own session on `namespace`
    async fn begin(
        &self,
        namespace: &str,
        kind: TxKind,
    ) -> Result<Box<dyn GraphTransaction>, GraphError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_permissions() {
        assert!(TxKind::Schema.permits(OpKind::Schema));
        assert!(!TxKind::Schema.permits(OpKind::Data));
        assert!(!TxKind::Schema.permits(OpKind::Read));
        assert!(TxKind::Data.permits(OpKind::Read));
        assert!(!TxKind::Data.permits(OpKind::Schema));
        assert!(!TxKind::Read.permits(OpKind::Data));
    }

    #[test]
    fn test_op_kinds() {
        assert_eq!(
            GraphOp::CreateIndex {
                label: NodeLabel::Idea
            }
            .kind(),
            OpKind::Schema
        );
        assert_eq!(
            GraphOp::DeleteOrphans { keep: vec![] }.kind(),
            OpKind::Data
        );
        assert_eq!(GraphOp::ListEdges.kind(), OpKind::Read);
    }

    #[test]
    fn test_cypher_rendering() {
        let op = GraphOp::CreateConstraint {
            label: NodeLabel::Place,
        };
        assert_eq!(
            op.cypher(),
            "CREATE CONSTRAINT place_name_unique IF NOT EXISTS FOR (n:Place) REQUIRE n.name IS UNIQUE"
        );

        let op = GraphOp::MergeEdge {
            from: NodeKey::new(NodeLabel::Practice, "Weaving"),
            verb: Verb::LocatedIn,
            to: NodeKey::new(NodeLabel::Place, "Oaxaca"),
            rights_id: None,
        };
        let cypher = op.cypher();
        assert!(cypher.contains("(a:Practice {name: \"Weaving\"})"));
        assert!(cypher.contains("MERGE (a)-[r:LOCATED_IN]->(b)"));

        let op = GraphOp::DeleteOrphans {
            keep: vec![NodeLabel::Term],
        };
        assert_eq!(
            op.cypher(),
            "MATCH (n) WHERE NOT (n)--() AND NOT n:Term DELETE n"
        );
    }
}
