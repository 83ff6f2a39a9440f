//! Entity tracking and relationship graphs

mod graph;
mod service;

pub use graph::{
    co_occurrences, normalize_weights, rank_centrality, CentralEntity, CoOccurrence, EntityGraph,
    GraphBuilder, GraphEdge, GraphNode, GraphQuery,
};
pub use service::EntityService;
