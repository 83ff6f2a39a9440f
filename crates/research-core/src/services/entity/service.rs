use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::graph::{co_occurrences, EntityGraph, GraphBuilder, GraphQuery};
use crate::config::EntityConfig;
use crate::database::EntityStore;
use crate::document::TextChunker;
use crate::logging::{ActivityLog, ActivityLogger, ActivityType};
use crate::models::{EntityMention, EntityType, NewEntity, NewMention, SourceRef, TrackedEntity};
use crate::utils::error::{CoreError, CoreResult};

/// Upper bound on mentions loaded per entity while expanding the graph.
const MAX_MENTIONS_PER_EXPANSION: usize = 10_000;

/// Tracks named entities, records where they are mentioned and answers
/// relationship queries over those mentions.
#[derive(Clone)]
pub struct EntityService {
    store: Arc<dyn EntityStore>,
    logger: ActivityLogger,
    config: EntityConfig,
    chunker: TextChunker,
}

impl EntityService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        logger: ActivityLogger,
        config: EntityConfig,
    ) -> CoreResult<Self> {
        let chunker = TextChunker::new(config.chunk_size, config.chunk_overlap)?;
        Ok(Self {
            store,
            logger,
            config,
            chunker,
        })
    }

    /// Idempotent per user on the canonical name.
    pub async fn track_entity(
        &self,
        user_id: Uuid,
        name: &str,
        entity_type: EntityType,
        metadata: Option<Map<String, Value>>,
    ) -> CoreResult<TrackedEntity> {
        let mut new_entity = NewEntity::new(user_id, name, entity_type);
        if new_entity.name_lower.is_empty() {
            return Err(CoreError::Validation("entity name must not be empty".to_string()));
        }
        if let Some(metadata) = metadata {
            new_entity.metadata = metadata;
        }

        let (entity, created) = self.store.upsert_entity(new_entity).await?;

        if created {
            info!(entity = %entity.name_lower, "Tracking new {} entity", entity.entity_type);
            self.logger.log(
                ActivityLog::builder(ActivityType::EntityTracked)
                    .user(user_id)
                    .custom("entity", entity.name.clone())
                    .custom("entity_type", entity.entity_type.to_string())
                    .build(),
            );
        } else {
            debug!(entity = %entity.name_lower, "Entity already tracked");
        }

        Ok(entity)
    }

    pub async fn record_mention(
        &self,
        user_id: Uuid,
        entity_id: Uuid,
        source: SourceRef,
        chunk_id: &str,
        context: &str,
    ) -> CoreResult<EntityMention> {
        if chunk_id.trim().is_empty() {
            return Err(CoreError::Validation("chunk_id must not be empty".to_string()));
        }
        if self.store.get_entities(user_id, &[entity_id]).await?.is_empty() {
            return Err(CoreError::NotFound(format!("entity {}", entity_id)));
        }

        let mention = self
            .store
            .insert_mention(NewMention {
                entity_id,
                user_id,
                source,
                chunk_id: chunk_id.to_string(),
                context: context.to_string(),
            })
            .await?;

        debug!(entity_id = %entity_id, "Recorded mention in {}", source);
        Ok(mention)
    }

    /// Scan freshly ingested text for every tracked entity of the user and
    /// record one mention per entity per chunk.
    pub async fn scan_source(
        &self,
        user_id: Uuid,
        source: SourceRef,
        text: &str,
    ) -> CoreResult<Vec<EntityMention>> {
        let started = Instant::now();
        let entities = self.store.list_entities(user_id, usize::MAX).await?;
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let needles: Vec<(Uuid, Vec<char>)> = entities
            .iter()
            .map(|e| (e.id, e.name_lower.chars().map(fold_char).collect()))
            .filter(|(_, needle): &(Uuid, Vec<char>)| !needle.is_empty())
            .collect();

        let mut pending = Vec::new();
        for chunk in self.chunker.chunk(text) {
            let chars: Vec<char> = chunk.content.chars().collect();
            let folded: Vec<char> = chars.iter().copied().map(fold_char).collect();

            for (entity_id, needle) in &needles {
                let Some(start) = find_chars(&folded, needle) else {
                    continue;
                };
                let end = start + needle.len();
                let window = self.config.context_window_chars;
                let context: String = chars
                    [start.saturating_sub(window)..(end + window).min(chars.len())]
                    .iter()
                    .collect();

                pending.push(NewMention {
                    entity_id: *entity_id,
                    user_id,
                    source,
                    chunk_id: source.chunk_id(chunk.index),
                    context,
                });
            }
        }

        // One batch, so a failed scan can be retried without duplicates
        let recorded = self.store.insert_mentions(pending).await?;

        info!(
            "Found {} entity mentions in {} ({:?})",
            recorded.len(),
            source,
            started.elapsed()
        );
        self.logger.log(
            ActivityLog::builder(ActivityType::SourceScanned)
                .user(user_id)
                .duration_ms(started.elapsed().as_millis())
                .custom("source", source.to_string())
                .custom("mentions", recorded.len())
                .build(),
        );

        Ok(recorded)
    }

    /// Recent mentions of a tracked entity, newest first.
    pub async fn entity_mentions(
        &self,
        user_id: Uuid,
        name: &str,
        limit: usize,
        offset: usize,
    ) -> CoreResult<Vec<EntityMention>> {
        let entity = self
            .store
            .find_entity(user_id, &TrackedEntity::canonicalize(name))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entity '{}'", name)))?;

        self.store.mentions_for_entity(entity.id, limit, offset).await
    }

    /// Tracked entities of the user, newest first.
    pub async fn list_entities(&self, user_id: Uuid, limit: usize) -> CoreResult<Vec<TrackedEntity>> {
        self.store.list_entities(user_id, limit).await
    }

    /// Breadth-limited co-occurrence graph around `focal_name`.
    ///
    /// Depth is clamped to `1..=max_depth`. An untracked or unmentioned focal
    /// entity gives an empty graph.
    pub async fn build_relationship_graph(
        &self,
        user_id: Uuid,
        focal_name: &str,
        depth: usize,
        min_shared_mentions: usize,
    ) -> CoreResult<EntityGraph> {
        let started = Instant::now();
        let canonical = TrackedEntity::canonicalize(focal_name);
        if canonical.is_empty() {
            return Err(CoreError::Validation("focal entity name must not be empty".to_string()));
        }

        let Some(focal) = self.store.find_entity(user_id, &canonical).await? else {
            debug!(entity = %canonical, "Focal entity is not tracked");
            return Ok(EntityGraph::empty(Some(focal_name.trim().to_string())));
        };

        let query = GraphQuery {
            depth: depth.clamp(1, self.config.max_depth.max(1)),
            min_shared_mentions: min_shared_mentions.max(1),
            same_chunk_only: self.config.same_chunk_only,
            top_central: self.config.top_central,
            contexts_per_edge: self.config.contexts_per_edge,
        };

        let focal_mentions = self
            .store
            .mentions_for_entity(focal.id, MAX_MENTIONS_PER_EXPANSION, 0)
            .await?;
        if focal_mentions.is_empty() {
            return Ok(EntityGraph::empty(Some(focal.name)));
        }

        let mut builder = GraphBuilder::new(query, &focal);
        let mut frontier = vec![(focal.id, focal_mentions)];
        let mut expanded: HashSet<Uuid> = HashSet::new();

        // One extra pass links nodes of the last level to each other
        // without adding new nodes.
        for level in 1..=query.depth + 1 {
            let may_add = level <= query.depth;
            let mut discovered: Vec<Uuid> = Vec::new();

            for (entity_id, own) in &frontier {
                if !expanded.insert(*entity_id) {
                    continue;
                }

                let sources: Vec<SourceRef> = own
                    .iter()
                    .map(|m| m.source)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                let colocated = self.store.mentions_in_sources(user_id, &sources).await?;

                for occurrence in co_occurrences(
                    *entity_id,
                    own,
                    &colocated,
                    query.same_chunk_only,
                    query.contexts_per_edge,
                ) {
                    let known = builder.contains(&occurrence.other);
                    if !known && !may_add {
                        continue;
                    }
                    if builder.add_edge(*entity_id, &occurrence)
                        && !known
                        && !discovered.contains(&occurrence.other)
                    {
                        discovered.push(occurrence.other);
                    }
                }
            }

            if discovered.is_empty() && !may_add {
                break;
            }

            let entities = self.store.get_entities(user_id, &discovered).await?;
            for entity in &entities {
                builder.add_node(entity, level);
            }
            debug!(level, nodes = builder.node_count(), "Expanded graph level");

            // Next frontier: newly discovered nodes
            let mut next = Vec::with_capacity(entities.len());
            for entity in entities {
                let mentions = self
                    .store
                    .mentions_for_entity(entity.id, MAX_MENTIONS_PER_EXPANSION, 0)
                    .await?;
                next.push((entity.id, mentions));
            }
            frontier = next;

            if frontier.is_empty() {
                break;
            }
        }

        let graph = builder.finish();

        info!(
            entity = %focal.name_lower,
            depth = query.depth,
            "Built relationship graph: {} nodes, {} edges in {:?}",
            graph.nodes.len(),
            graph.edges.len(),
            started.elapsed()
        );
        self.logger.log(
            ActivityLog::builder(ActivityType::GraphBuilt)
                .user(user_id)
                .duration_ms(started.elapsed().as_millis())
                .custom("entity", focal.name.clone())
                .custom("nodes", graph.nodes.len())
                .custom("edges", graph.edges.len())
                .build(),
        );

        Ok(graph)
    }

    /// Same as [`Self::build_relationship_graph`] with default depth, but
    /// failures become an empty graph carrying the error message.
    pub async fn relationship_graph_view(
        &self,
        user_id: Uuid,
        focal_name: &str,
        depth: Option<usize>,
        min_shared_mentions: usize,
    ) -> EntityGraph {
        let depth = depth.unwrap_or(self.config.default_depth);

        match self
            .build_relationship_graph(user_id, focal_name, depth, min_shared_mentions)
            .await
        {
            Ok(graph) => graph,
            Err(e) => {
                warn!(entity = %focal_name, "Relationship graph failed: {}", e);
                self.logger.log(
                    ActivityLog::builder(ActivityType::GraphFailed)
                        .user(user_id)
                        .custom("entity", focal_name.to_string())
                        .error(&e)
                        .build(),
                );
                EntityGraph::failed(Some(focal_name.trim().to_string()), e.to_string())
            }
        }
    }
}

/// Per-char lowercase that keeps char offsets aligned with the source text.
fn fold_char(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}

fn find_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
