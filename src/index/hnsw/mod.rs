//! HNSW graph
//!
//! Layered proximity graph searched greedily from the top level down.

mod graph;

pub use graph::{HnswGraph, GRAPH_FORMAT_VERSION, GRAPH_MAGIC};
