use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::utils::error::CoreError;

/// Entity category. Unknown tags are kept verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Person,
    Organization,
    Custom,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Custom => "CUSTOM",
            Self::Other(tag) => tag.as_str(),
        }
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        match value.trim().to_uppercase().as_str() {
            "PERSON" => Self::Person,
            "ORGANIZATION" | "ORG" => Self::Organization,
            "CUSTOM" | "" => Self::Custom,
            _ => Self::Other(value.trim().to_string()),
        }
    }
}

impl From<&str> for EntityType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub name_lower: String,
    pub entity_type: EntityType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TrackedEntity {
    /// Case-insensitive dedup key: trimmed, whitespace-collapsed, lowercased.
    pub fn canonicalize(name: &str) -> String {
        name.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub user_id: Uuid,
    pub name: String,
    pub name_lower: String,
    pub entity_type: EntityType,
    pub metadata: Map<String, Value>,
}

impl NewEntity {
    pub fn new(user_id: Uuid, name: &str, entity_type: EntityType) -> Self {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        Self {
            user_id,
            name_lower: TrackedEntity::canonicalize(&name),
            name,
            entity_type,
            metadata: Map::new(),
        }
    }
}

/// Where a mention was found. Exactly one source kind, by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Document(Uuid),
    NewsArticle(Uuid),
}

impl SourceRef {
    /// Builds a reference from the two nullable storage columns.
    pub fn from_parts(
        document_id: Option<Uuid>,
        news_article_id: Option<Uuid>,
    ) -> Result<Self, CoreError> {
        match (document_id, news_article_id) {
            (Some(doc), None) => Ok(Self::Document(doc)),
            (None, Some(article)) => Ok(Self::NewsArticle(article)),
            (Some(doc), Some(article)) => Err(CoreError::ConsistencyViolation(format!(
                "mention references both document {} and news article {}",
                doc, article
            ))),
            (None, None) => Err(CoreError::ConsistencyViolation(
                "mention references neither a document nor a news article".to_string(),
            )),
        }
    }

    /// Splits back into `(document_id, news_article_id)` columns.
    pub fn into_parts(self) -> (Option<Uuid>, Option<Uuid>) {
        match self {
            Self::Document(id) => (Some(id), None),
            Self::NewsArticle(id) => (None, Some(id)),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Document(id) | Self::NewsArticle(id) => *id,
        }
    }

    pub fn chunk_id(&self, index: usize) -> String {
        format!("{}_{}", self.id(), index)
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document(id) => write!(f, "document:{}", id),
            Self::NewsArticle(id) => write!(f, "news_article:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub user_id: Uuid,
    pub source: SourceRef,
    pub chunk_id: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMention {
    pub entity_id: Uuid,
    pub user_id: Uuid,
    pub source: SourceRef,
    pub chunk_id: String,
    pub context: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(TrackedEntity::canonicalize("  Jane   DOE "), "jane doe");
        assert_eq!(TrackedEntity::canonicalize("Acme Corp"), "acme corp");
    }

    #[test]
    fn test_entity_type_roundtrip_tags() {
        assert_eq!(EntityType::from("person"), EntityType::Person);
        assert_eq!(EntityType::from("ORG"), EntityType::Organization);
        assert_eq!(EntityType::from("LOCATION"), EntityType::Other("LOCATION".into()));
        let json = serde_json::to_value(EntityType::Organization).unwrap();
        assert_eq!(json, "ORGANIZATION");
    }

    #[test]
    fn test_source_ref_exclusivity() {
        let doc = Uuid::new_v4();
        let article = Uuid::new_v4();

        assert_eq!(SourceRef::from_parts(Some(doc), None).unwrap(), SourceRef::Document(doc));
        assert_eq!(
            SourceRef::from_parts(None, Some(article)).unwrap(),
            SourceRef::NewsArticle(article)
        );
        assert!(matches!(
            SourceRef::from_parts(Some(doc), Some(article)),
            Err(CoreError::ConsistencyViolation(_))
        ));
        assert!(matches!(
            SourceRef::from_parts(None, None),
            Err(CoreError::ConsistencyViolation(_))
        ));
        assert_eq!(SourceRef::Document(doc).into_parts(), (Some(doc), None));
    }

    #[test]
    fn test_source_ref_serde_shape() {
        let id = Uuid::nil();
        let json = serde_json::to_value(SourceRef::NewsArticle(id)).unwrap();
        assert_eq!(json["kind"], "news_article");
        assert_eq!(json["id"], id.to_string());
    }
}
