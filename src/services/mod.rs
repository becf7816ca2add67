//! Business logic services.
//!
//! Services orchestrate the ontology, the id index and the graph store and
//! provide the high-level versioned operations.

mod graph;

pub use graph::VersionedGraph;
