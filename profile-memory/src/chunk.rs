//! Chunk types and builders
//!
//! Core types for representing retrievable units of a tenant's knowledge.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MemoryError;

/// Metadata key addressing [`ChunkMetadata::doc_type`]
pub const TYPE_KEY: &str = "type";
/// Metadata key addressing [`ChunkMetadata::source`]
pub const SOURCE_KEY: &str = "source";
/// Extra metadata key the orchestrator stamps with the owner
pub const OWNER_KEY: &str = "owner_id";

/// Unique identifier for chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub Uuid);

impl ChunkId {
    /// Create a new random ChunkId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChunkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Tenant identifier
///
/// Non-empty and free of control characters, so it can be embedded in
/// storage keys unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Result<Self, MemoryError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MemoryError::validation("owner_id must not be empty"));
        }
        if id.chars().any(char::is_control) {
            return Err(MemoryError::validation(
                "owner_id must not contain control characters",
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerId {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(owner: OwnerId) -> Self {
        owner.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for OwnerId {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Logical document a chunk was cut from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Profile,
    Resume,
    CoverLetter,
    Custom,
}

impl DocumentType {
    pub const ALL: [DocumentType; 4] = [
        DocumentType::Profile,
        DocumentType::Resume,
        DocumentType::CoverLetter,
        DocumentType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Resume => "resume",
            Self::CoverLetter => "cover_letter",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                MemoryError::validation(format!(
                    "unknown document type '{s}' (expected profile, resume, cover_letter or custom)"
                ))
            })
    }
}

/// Scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Metadata attached to every chunk
///
/// `doc_type` and `source` are always present; `extra` carries free-form
/// keys that callers may filter on but that nothing here relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    /// Collaborator that produced the document (e.g. "resume_upload")
    pub source: String,
    #[serde(default)]
    pub extra: BTreeMap<String, MetadataValue>,
}

impl ChunkMetadata {
    pub fn new(doc_type: DocumentType, source: impl Into<String>) -> Self {
        Self {
            doc_type,
            source: source.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Add an extra key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up a key, resolving the reserved `type` and `source` keys
    pub fn get(&self, key: &str) -> Option<MetadataValue> {
        match key {
            TYPE_KEY => Some(MetadataValue::from(self.doc_type.as_str())),
            SOURCE_KEY => Some(MetadataValue::from(self.source.as_str())),
            _ => self.extra.get(key).cloned(),
        }
    }

    /// Owner stamped into the extra map, if any
    pub fn owner_id(&self) -> Option<&MetadataValue> {
        self.extra.get(OWNER_KEY)
    }
}

/// Equality filter over chunk metadata
///
/// Every entry must match. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    entries: BTreeMap<String, MetadataValue>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on document type
    pub fn for_type(doc_type: DocumentType) -> Self {
        Self::new().doc_type(doc_type)
    }

    pub fn doc_type(self, doc_type: DocumentType) -> Self {
        self.with(TYPE_KEY, doc_type.as_str())
    }

    pub fn source(self, source: impl Into<String>) -> Self {
        self.with(SOURCE_KEY, source.into())
    }

    /// Require `key == value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.entries.iter()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.entries.iter().all(|(key, expected)| match key.as_str() {
            TYPE_KEY => {
                matches!(expected, MetadataValue::String(s) if s == metadata.doc_type.as_str())
            }
            SOURCE_KEY => matches!(expected, MetadataValue::String(s) if *s == metadata.source),
            _ => metadata.extra.get(key) == Some(expected),
        })
    }
}

/// An atomic unit of retrievable text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier
    pub id: ChunkId,
    /// Tenant that owns this chunk
    pub owner_id: OwnerId,
    /// Chunk text
    pub content: String,
    /// Embedding vector; `None` only while the chunk is in flight
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a new builder for Chunk
    pub fn builder() -> ChunkBuilder {
        ChunkBuilder::new()
    }

    pub fn is_embedded(&self) -> bool {
        self.embedding.is_some()
    }

    pub fn doc_type(&self) -> DocumentType {
        self.metadata.doc_type
    }
}

/// Builder for Chunk with fluent API
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    id: Option<ChunkId>,
    owner_id: Option<OwnerId>,
    content: Option<String>,
    embedding: Option<Vec<f32>>,
    metadata: Option<ChunkMetadata>,
    created_at: Option<DateTime<Utc>>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk ID (auto-generated if not set)
    pub fn id(mut self, id: ChunkId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the creation time (defaults to now)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the Chunk
    pub fn build(self) -> Result<Chunk, ChunkBuilderError> {
        let owner_id = self.owner_id.ok_or(ChunkBuilderError::MissingOwner)?;
        let content = self.content.ok_or(ChunkBuilderError::MissingContent)?;
        if content.trim().is_empty() {
            return Err(ChunkBuilderError::EmptyContent);
        }
        let metadata = self.metadata.ok_or(ChunkBuilderError::MissingMetadata)?;

        Ok(Chunk {
            id: self.id.unwrap_or_default(),
            owner_id,
            content,
            embedding: self.embedding,
            metadata,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Errors that can occur when building a Chunk
#[derive(Debug, thiserror::Error)]
pub enum ChunkBuilderError {
    #[error("Missing required field: owner_id")]
    MissingOwner,
    #[error("Missing required field: content")]
    MissingContent,
    #[error("Chunk content must not be blank")]
    EmptyContent,
    #[error("Missing required field: metadata")]
    MissingMetadata,
}

impl From<ChunkBuilderError> for MemoryError {
    fn from(err: ChunkBuilderError) -> Self {
        MemoryError::Validation(err.to_string())
    }
}
