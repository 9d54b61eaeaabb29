//! Domain types shared by the lexical, vector and hybrid engines.

use serde::{Deserialize, Serialize};

pub type SpaceId = i64;
pub type ChunkId = u64;

/// A retrievable passage of one source document inside one space.
///
/// - `id`: unique within the space, allocated at ingestion and never reused
/// - `document_id`: BLAKE3 hex digest of the source document text
/// - `ordinal`: position of the chunk within its document
/// - `text`: the passage payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
}

/// A chunk paired with the vector produced for its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Indicates which engine produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceKind {
    Vector,
    Lexical,
}

/// The minimal surface returned by both sub-indexes.
///
/// `score` is engine-specific but higher is always better.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: ChunkId,
    pub score: f32,
    pub source: SourceKind,
}

/// Similarity metric a vector index is built for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Dot,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cosine" => Some(Metric::Cosine),
            "dot" => Some(Metric::Dot),
            _ => None,
        }
    }
}

/// Identity of the embedding function a vector index was built with.
/// Two schemas must be equal for vectors to be comparable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSchema {
    pub embedder_id: String,
    pub dim: usize,
    pub metric: Metric,
}

impl std::fmt::Display for VectorSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (d={}, {})", self.embedder_id, self.dim, self.metric.as_str())
    }
}

/// Orders hits by descending score, ties by ascending chunk id.
pub fn rank_order(a: &(ChunkId, f32), b: &(ChunkId, f32)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}
