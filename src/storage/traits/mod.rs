//! Storage backend traits.

mod graph;
mod index;

pub use graph::GraphStore;
pub use index::{EntityIndex, IdIndex, NAME_TAG};
