//! Graph layer
//!
//! - `vocabulary`: node labels, verbs, name normalization
//! - `driver`: transaction-scoped graph store port
//! - `memory`: in-process petgraph driver
//! - `assembly`: schema / data / dedup / verify phases for one batch

pub mod assembly;
pub mod driver;
pub mod memory;
pub mod vocabulary;

pub use assembly::{
    AssemblyInput, AssemblyReport, AssemblyState, AssemblyStateMachine, EndpointSpec, EntitySpec,
    GraphAssemblyEngine, RelationSpec,
};
pub use driver::{
    EdgeWrite, GraphDriver, GraphEdge, GraphError, GraphNode, GraphOp, GraphTransaction, NodeKey,
    OpKind, OpResult, TxKind,
};
pub use memory::{Fault, MemoryGraphDriver, NamespaceGraph};
pub use vocabulary::{canonical_name, normalize_name, NodeLabel, Verb};
