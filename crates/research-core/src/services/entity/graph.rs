use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::{EntityMention, EntityType, SourceRef, TrackedEntity};

/// Traversal and ranking knobs for one graph query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphQuery {
    pub depth: usize,
    pub min_shared_mentions: usize,
    pub same_chunk_only: bool,
    pub top_central: usize,
    pub contexts_per_edge: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    /// Hops from the focal entity.
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    /// Display weight in `[0, 1]`.
    pub weight: f64,
    /// Number of shared source items (or chunks).
    pub shared_count: usize,
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentralEntity {
    pub name: String,
    pub score: f64,
}

/// Relationship snapshot around one focal entity. Never cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityGraph {
    pub focal: Option<String>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub central_entities: Vec<CentralEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntityGraph {
    pub fn empty(focal: Option<String>) -> Self {
        Self {
            focal,
            ..Self::default()
        }
    }

    /// Empty graph carrying an error indicator for the view.
    pub fn failed(focal: Option<String>, error: impl Into<String>) -> Self {
        Self {
            focal,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<&GraphEdge> {
        self.edges
            .iter()
            .find(|e| (e.source == a && e.target == b) || (e.source == b && e.target == a))
    }
}

/// Co-occurrence of one entity with a neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoOccurrence {
    pub other: Uuid,
    pub shared_count: usize,
    pub contexts: Vec<String>,
}

/// Compare an entity's own mentions with the mentions found in the same
/// sources and count shared source items per neighbour.
pub fn co_occurrences(
    entity_id: Uuid,
    own: &[EntityMention],
    colocated: &[EntityMention],
    same_chunk_only: bool,
    contexts_per_edge: usize,
) -> Vec<CoOccurrence> {
    let mut own_by_source: HashMap<SourceRef, Vec<&EntityMention>> = HashMap::new();
    for mention in own.iter().filter(|m| m.entity_id == entity_id) {
        own_by_source.entry(mention.source).or_default().push(mention);
    }

    struct Acc {
        keys: BTreeSet<(SourceRef, Option<String>)>,
        contexts: Vec<String>,
    }
    let mut by_other: BTreeMap<Uuid, Acc> = BTreeMap::new();

    for mention in colocated.iter().filter(|m| m.entity_id != entity_id) {
        let Some(own_here) = own_by_source.get(&mention.source) else {
            continue;
        };

        let (key, own_context) = if same_chunk_only {
            match own_here.iter().find(|o| o.chunk_id == mention.chunk_id) {
                Some(o) => ((mention.source, Some(mention.chunk_id.clone())), &o.context),
                None => continue,
            }
        } else {
            ((mention.source, None), &own_here[0].context)
        };

        let acc = by_other.entry(mention.entity_id).or_insert_with(|| Acc {
            keys: BTreeSet::new(),
            contexts: Vec::new(),
        });
        acc.keys.insert(key);

        for snippet in [own_context, &mention.context] {
            if acc.contexts.len() < contexts_per_edge && !acc.contexts.contains(snippet) {
                acc.contexts.push(snippet.clone());
            }
        }
    }

    by_other
        .into_iter()
        .map(|(other, acc)| CoOccurrence {
            other,
            shared_count: acc.keys.len(),
            contexts: acc.contexts,
        })
        .collect()
}

/// Collects nodes and edges during traversal and produces the final graph.
pub struct GraphBuilder {
    query: GraphQuery,
    nodes: HashMap<Uuid, GraphNode>,
    /// Keyed by `(min(id), max(id))` so each undirected edge is stored once.
    edges: BTreeMap<(Uuid, Uuid), (usize, Vec<String>)>,
}

impl GraphBuilder {
    pub fn new(query: GraphQuery, focal: &TrackedEntity) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            focal.id,
            GraphNode {
                id: focal.id,
                name: focal.name.clone(),
                entity_type: focal.entity_type.clone(),
                depth: 0,
            },
        );
        Self {
            query,
            nodes,
            edges: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `false` if the entity was already a node.
    pub fn add_node(&mut self, entity: &TrackedEntity, depth: usize) -> bool {
        if self.nodes.contains_key(&entity.id) {
            return false;
        }
        self.nodes.insert(
            entity.id,
            GraphNode {
                id: entity.id,
                name: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
                depth,
            },
        );
        true
    }

    /// Record an edge if it meets the shared-mention threshold.
    pub fn add_edge(&mut self, a: Uuid, occurrence: &CoOccurrence) -> bool {
        if occurrence.shared_count < self.query.min_shared_mentions.max(1) {
            return false;
        }
        let key = if a < occurrence.other {
            (a, occurrence.other)
        } else {
            (occurrence.other, a)
        };
        self.edges
            .entry(key)
            .or_insert_with(|| (occurrence.shared_count, occurrence.contexts.clone()));
        true
    }

    pub fn finish(self) -> EntityGraph {
        let name_of = |id: &Uuid| self.nodes.get(id).map(|n| n.name.clone());

        let mut edges: Vec<GraphEdge> = self
            .edges
            .iter()
            .filter_map(|((a, b), (count, contexts))| {
                let (a, b) = (name_of(a)?, name_of(b)?);
                let (source, target) = if a <= b { (a, b) } else { (b, a) };
                Some(GraphEdge {
                    source,
                    target,
                    weight: *count as f64,
                    shared_count: *count,
                    contexts: contexts.clone(),
                })
            })
            .collect();
        edges.sort_by(|x, y| (&x.source, &x.target).cmp(&(&y.source, &y.target)));

        let central_entities = rank_centrality(&edges, self.query.top_central);
        normalize_weights(&mut edges);

        let focal = self
            .nodes
            .values()
            .find(|n| n.depth == 0)
            .map(|n| n.name.clone());

        let mut nodes: Vec<GraphNode> = self.nodes.into_values().collect();
        nodes.sort_by(|x, y| x.depth.cmp(&y.depth).then_with(|| x.name.cmp(&y.name)));

        EntityGraph {
            focal,
            nodes,
            edges,
            central_entities,
            error: None,
        }
    }
}

/// Rescale weights into `[0, 1]` with min-max. Equal weights all become 1.
pub fn normalize_weights(edges: &mut [GraphEdge]) {
    let Some(min) = edges.iter().map(|e| e.weight).reduce(f64::min) else {
        return;
    };
    let max = edges.iter().map(|e| e.weight).fold(min, f64::max);
    let range = max - min;

    for edge in edges.iter_mut() {
        edge.weight = if range <= f64::EPSILON {
            1.0
        } else {
            (edge.weight - min) / range
        };
    }
}

/// Weighted degree over the raw edge weights, scaled so the top node scores 1.
/// Ties break by name.
pub fn rank_centrality(edges: &[GraphEdge], top_n: usize) -> Vec<CentralEntity> {
    let mut degree: BTreeMap<&str, f64> = BTreeMap::new();
    for edge in edges {
        *degree.entry(edge.source.as_str()).or_default() += edge.weight;
        *degree.entry(edge.target.as_str()).or_default() += edge.weight;
    }

    let max = degree.values().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return Vec::new();
    }

    let mut ranked: Vec<CentralEntity> = degree
        .into_iter()
        .map(|(name, d)| CentralEntity {
            name: name.to_string(),
            score: d / max,
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(top_n);
    ranked
}
