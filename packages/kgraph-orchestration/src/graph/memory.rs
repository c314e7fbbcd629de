//! In-process graph driver
//!
//! One petgraph `StableDiGraph` per namespace. A transaction works on a copy
//! taken at `begin`; `commit` swaps the copy in, `rollback` (or drop) throws
//! it away. Only one transaction may be open per namespace, so schema and
//! data sessions can never overlap.
//!
//! Faults can be injected for tests (`inject`): a failing `begin`, a failing
//! op at a given position, or a failing commit.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::driver::{
    EdgeWrite, GraphDriver, GraphEdge, GraphError, GraphNode, GraphOp, GraphTransaction, NodeKey,
    OpKind, OpResult, TxKind,
};
use super::vocabulary::{NodeLabel, Verb};

#[derive(Debug, Clone)]
struct EdgeData {
    verb: Verb,
    rights_ids: BTreeSet<String>,
}

/// Committed state of one namespace
#[derive(Debug, Clone, Default)]
pub struct NamespaceGraph {
    graph: StableDiGraph<GraphNode, EdgeData>,
    index: HashMap<NodeKey, NodeIndex>,
    next_seq: u64,
    constraints: BTreeSet<NodeLabel>,
    indexes: BTreeSet<NodeLabel>,
}

impl NamespaceGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.index.get(key).and_then(|idx| self.graph.node_weight(*idx))
    }

    pub fn has_constraint(&self, label: NodeLabel) -> bool {
        self.constraints.contains(&label)
    }

    pub fn has_index(&self, label: NodeLabel) -> bool {
        self.indexes.contains(&label)
    }

    /// Nodes in creation order
    pub fn nodes(&self) -> Vec<GraphNode> {
        let mut nodes: Vec<GraphNode> = self
            .graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    pub fn edges(&self) -> Vec<GraphEdge> {
        let mut edges: Vec<GraphEdge> = self
            .graph
            .edge_indices()
            .filter_map(|idx| {
                let (source, target) = self.graph.edge_endpoints(idx)?;
                let data = self.graph.edge_weight(idx)?;
                Some(GraphEdge {
                    from: self.graph[source].key.clone(),
                    verb: data.verb,
                    to: self.graph[target].key.clone(),
                    rights_ids: data.rights_ids.clone(),
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, a.verb, &a.to).cmp(&(&b.from, b.verb, &b.to)));
        edges
    }

    fn apply(&mut self, op: &GraphOp) -> Result<OpResult, GraphError> {
        match op {
            GraphOp::CreateConstraint { label } => {
                self.constraints.insert(*label);
                Ok(OpResult::Applied)
            }
            GraphOp::CreateIndex { label } => {
                self.indexes.insert(*label);
                Ok(OpResult::Applied)
            }
            GraphOp::MergeNode {
                key,
                rights_ids,
                source_items,
            } => Ok(OpResult::Node {
                created: self.merge_node(key, rights_ids, source_items),
            }),
            GraphOp::MergeEdge {
                from,
                verb,
                to,
                rights_id,
            } => Ok(OpResult::Edge(self.merge_edge(
                from,
                *verb,
                to,
                rights_id.as_deref(),
            ))),
            GraphOp::MergeInto {
                survivor,
                duplicate,
            } => {
                self.merge_into(survivor, duplicate)?;
                Ok(OpResult::Merged)
            }
            GraphOp::DeleteOrphans { keep } => Ok(OpResult::Deleted(self.delete_orphans(keep))),
            GraphOp::ListNodes => Ok(OpResult::Nodes(self.nodes())),
            GraphOp::ListEdges => Ok(OpResult::Edges(self.edges())),
            GraphOp::CountNodes { labels } => Ok(OpResult::Count(
                self.graph
                    .node_indices()
                    .filter(|idx| labels.contains(&self.graph[*idx].key.label))
                    .count(),
            )),
            GraphOp::CountEdges { include_structural } => Ok(OpResult::Count(
                self.graph
                    .edge_indices()
                    .filter_map(|idx| self.graph.edge_weight(idx))
                    .filter(|e| *include_structural || !e.verb.is_structural())
                    .count(),
            )),
        }
    }

    fn merge_node(&mut self, key: &NodeKey, rights_ids: &[String], sources: &[Uuid]) -> bool {
        if let Some(idx) = self.index.get(key) {
            let node = &mut self.graph[*idx];
            node.rights_ids.extend(rights_ids.iter().cloned());
            node.source_items.extend(sources.iter().copied());
            return false;
        }

        self.next_seq += 1;
        let node = GraphNode {
            key: key.clone(),
            seq: self.next_seq,
            rights_ids: rights_ids.iter().cloned().collect(),
            source_items: sources.iter().copied().collect(),
        };
        let idx = self.graph.add_node(node);
        self.index.insert(key.clone(), idx);
        true
    }

    fn link(
        &mut self,
        from: NodeIndex,
        verb: Verb,
        to: NodeIndex,
        rights_ids: BTreeSet<String>,
    ) -> EdgeWrite {
        let existing = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .find(|e| e.target() == to && e.weight().verb == verb)
            .map(|e| e.id());

        match existing {
            Some(edge) => {
                if let Some(data) = self.graph.edge_weight_mut(edge) {
                    data.rights_ids.extend(rights_ids);
                }
                EdgeWrite::Existing
            }
            None => {
                self.graph.add_edge(from, to, EdgeData { verb, rights_ids });
                EdgeWrite::Created
            }
        }
    }

    fn merge_edge(
        &mut self,
        from: &NodeKey,
        verb: Verb,
        to: &NodeKey,
        rights_id: Option<&str>,
    ) -> EdgeWrite {
        let (a, b) = match (self.index.get(from), self.index.get(to)) {
            (Some(a), Some(b)) => (*a, *b),
            _ => return EdgeWrite::MissingEndpoint,
        };
        self.link(a, verb, b, rights_id.map(str::to_string).into_iter().collect())
    }

    fn merge_into(&mut self, survivor: &NodeKey, duplicate: &NodeKey) -> Result<(), GraphError> {
        let keep = *self
            .index
            .get(survivor)
            .ok_or_else(|| GraphError::Query(format!("node not found: {}", survivor)))?;
        let dup = *self
            .index
            .get(duplicate)
            .ok_or_else(|| GraphError::Query(format!("node not found: {}", duplicate)))?;
        if keep == dup {
            return Ok(());
        }

        let outgoing: Vec<(NodeIndex, EdgeData)> = self
            .graph
            .edges_directed(dup, Direction::Outgoing)
            .map(|e| (e.target(), e.weight().clone()))
            .collect();
        let incoming: Vec<(NodeIndex, EdgeData)> = self
            .graph
            .edges_directed(dup, Direction::Incoming)
            .map(|e| (e.source(), e.weight().clone()))
            .collect();

        let removed = self.graph.remove_node(dup);
        self.index.remove(duplicate);

        if let Some(removed) = removed {
            let node = &mut self.graph[keep];
            node.rights_ids.extend(removed.rights_ids);
            node.source_items.extend(removed.source_items);
        }

        for (target, data) in outgoing {
            // self-loops from the merge are dropped
            if target == keep || target == dup {
                continue;
            }
            self.link(keep, data.verb, target, data.rights_ids);
        }
        for (source, data) in incoming {
            if source == keep || source == dup {
                continue;
            }
            self.link(source, data.verb, keep, data.rights_ids);
        }
        Ok(())
    }

    fn delete_orphans(&mut self, keep: &[NodeLabel]) -> usize {
        let orphans: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| {
                !keep.contains(&self.graph[*idx].key.label)
                    && self.graph.neighbors_undirected(*idx).next().is_none()
            })
            .collect();

        for idx in &orphans {
            if let Some(node) = self.graph.remove_node(*idx) {
                self.index.remove(&node.key);
            }
        }
        orphans.len()
    }
}

/// Injectable failure, consumed once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Next `begin` fails with `Unavailable`
    Unavailable,
    /// The op at `op_index` (0-based) of the next `kind` transaction fails
    FailOp { kind: TxKind, op_index: usize },
    /// The next commit of a `kind` transaction fails
    FailCommit { kind: TxKind },
}

#[derive(Default)]
struct Shared {
    namespaces: DashMap<String, NamespaceGraph>,
    active: DashMap<String, TxKind>,
    faults: Mutex<Vec<Fault>>,
    /// Committed write ops per namespace (cypher text)
    journal: DashMap<String, Vec<String>>,
}

#[derive(Clone, Default)]
pub struct MemoryGraphDriver {
    shared: Arc<Shared>,
}

impl MemoryGraphDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault) {
        self.shared.faults.lock().push(fault);
    }

    /// Committed state of a namespace
    pub fn snapshot(&self, namespace: &str) -> Option<NamespaceGraph> {
        self.shared.namespaces.get(namespace).map(|g| g.clone())
    }

    /// Committed schema/data ops of a namespace, in order
    pub fn journal(&self, namespace: &str) -> Vec<String> {
        self.shared
            .journal
            .get(namespace)
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    pub fn write_count(&self, namespace: &str) -> usize {
        self.shared
            .journal
            .get(namespace)
            .map(|ops| ops.len())
            .unwrap_or(0)
    }

    fn take_fault(&self, kind: TxKind) -> Result<(Option<usize>, bool), GraphError> {
        let mut faults = self.shared.faults.lock();
        if let Some(pos) = faults.iter().position(|f| *f == Fault::Unavailable) {
            faults.remove(pos);
            return Err(GraphError::Unavailable("injected: graph store unreachable".into()));
        }

        let mut fail_at = None;
        if let Some(pos) = faults
            .iter()
            .position(|f| matches!(f, Fault::FailOp { kind: k, .. } if *k == kind))
        {
            if let Fault::FailOp { op_index, .. } = faults.remove(pos) {
                fail_at = Some(op_index);
            }
        }

        let mut fail_commit = false;
        if let Some(pos) = faults
            .iter()
            .position(|f| matches!(f, Fault::FailCommit { kind: k } if *k == kind))
        {
            faults.remove(pos);
            fail_commit = true;
        }

        Ok((fail_at, fail_commit))
    }
}

#[async_trait]
impl GraphDriver for MemoryGraphDriver {
    async fn ping(&self) -> Result<(), GraphError> {
        Ok(())
    }

    async fn begin(
        &self,
        namespace: &str,
        kind: TxKind,
    ) -> Result<Box<dyn GraphTransaction>, GraphError> {
        let (fail_at, fail_commit) = self.take_fault(kind)?;

        match self.shared.active.entry(namespace.to_string()) {
            Entry::Occupied(open) => {
                return Err(GraphError::SessionConflict {
                    namespace: namespace.to_string(),
                    kind: *open.get(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(kind);
            }
        }

        let working = self
            .shared
            .namespaces
            .get(namespace)
            .map(|g| g.clone())
            .unwrap_or_default();

        debug!(namespace, kind = kind.as_str(), "graph transaction opened");
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            namespace: namespace.to_string(),
            kind,
            working,
            pending: Vec::new(),
            ops_run: 0,
            fail_at,
            fail_commit,
            open: true,
        }))
    }
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    namespace: String,
    kind: TxKind,
    working: NamespaceGraph,
    /// Write ops executed so far, journaled on commit
    pending: Vec<String>,
    ops_run: usize,
    fail_at: Option<usize>,
    fail_commit: bool,
    open: bool,
}

impl MemoryTransaction {
    fn close(&mut self) {
        if self.open {
            self.shared.active.remove(&self.namespace);
            self.open = false;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl GraphTransaction for MemoryTransaction {
    fn kind(&self) -> TxKind {
        self.kind
    }

    async fn run(&mut self, op: GraphOp) -> Result<OpResult, GraphError> {
        if !self.kind.permits(op.kind()) {
            return Err(GraphError::MixedTransaction {
                kind: self.kind,
                op: op.kind(),
            });
        }

        let position = self.ops_run;
        self.ops_run += 1;
        if self.fail_at == Some(position) {
            return Err(GraphError::Query(format!(
                "injected fault at op {} of {} transaction",
                position, self.kind
            )));
        }

        let result = self.working.apply(&op)?;
        if op.kind() != OpKind::Read {
            self.pending.push(op.cypher());
        }
        Ok(result)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), GraphError> {
        if self.fail_commit {
            self.close();
            return Err(GraphError::Query(format!(
                "injected commit failure in {} transaction",
                self.kind
            )));
        }

        if self.kind != TxKind::Read {
            let working = std::mem::take(&mut self.working);
            self.shared
                .namespaces
                .insert(self.namespace.clone(), working);
            let pending = std::mem::take(&mut self.pending);
            self.shared
                .journal
                .entry(self.namespace.clone())
                .or_default()
                .extend(pending);
        }
        debug!(namespace = %self.namespace, kind = self.kind.as_str(), "graph transaction committed");
        self.close();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), GraphError> {
        debug!(namespace = %self.namespace, kind = self.kind.as_str(), "graph transaction rolled back");
        self.close();
        Ok(())
    }
}
