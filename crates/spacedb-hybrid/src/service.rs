use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use spacedb_core::chunker::{Chunker, ChunkingConfig};
use spacedb_core::config::Settings;
use spacedb_core::error::{Error, Result, ResultExt};
use spacedb_core::traits::Embedder;
use spacedb_core::types::{ChunkId, SpaceId, VectorSchema};
use spacedb_embed::get_default_embedder;

use crate::manager::{SpaceIndexManager, SpaceState};
use crate::retriever::{FusionRetriever, RetrievalOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub chunks_added: usize,
}

/// A ranked passage returned by `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub space_id: SpaceId,
    pub generation: u64,
    pub documents: usize,
    pub chunks: u64,
    pub vector_schema: VectorSchema,
    pub tokenizer: String,
}

/// Entry point for the ingestion and query collaborators.
pub struct SpaceDb {
    manager: SpaceIndexManager,
    retriever: FusionRetriever,
    default_top_k: usize,
    default_timeout: Duration,
}

impl SpaceDb {
    pub fn new(settings: &Settings, embedder: Arc<dyn Embedder>) -> Result<Self> {
        settings.validate()?;
        let chunker = Chunker::new(ChunkingConfig {
            max_tokens: settings.chunking.max_tokens,
            overlap_tokens: settings.chunking.overlap_tokens,
        })?;
        let manager = SpaceIndexManager::new(settings.index.root_path(), embedder, chunker, settings.index.retain_generations);
        let retriever = FusionRetriever::new(RetrievalOptions { rrf_k: settings.retrieval.rrf_k, overfetch: settings.retrieval.overfetch });
        info!(root = %settings.index.root_path().display(), schema = %manager.embedder().schema(), "spacedb ready");
        Ok(Self {
            manager,
            retriever,
            default_top_k: settings.retrieval.top_k,
            default_timeout: Duration::from_millis(settings.retrieval.timeout_ms),
        })
    }

    /// Build with the embedder named by `settings.embedding`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let embedder = get_default_embedder(&settings.embedding).embedding("load embedder")?;
        Self::new(settings, embedder)
    }

    pub fn manager(&self) -> &SpaceIndexManager {
        &self.manager
    }

    #[instrument(skip(self, document_texts), fields(docs = document_texts.len()))]
    pub async fn ingest(&self, space_id: SpaceId, document_texts: &[String]) -> Result<IngestReport> {
        let chunks_added = self.manager.ensure_and_extend(space_id, document_texts).await?;
        Ok(IngestReport { chunks_added })
    }

    /// Hybrid query with the configured deadline. `top_k` defaults to
    /// `retrieval.top_k`.
    pub async fn query(&self, space_id: SpaceId, query_text: &str, top_k: Option<usize>) -> Result<Vec<QueryHit>> {
        self.query_with_timeout(space_id, query_text, top_k, self.default_timeout).await
    }

    /// Hybrid query that gives up with `Timeout` after `timeout`; nothing is
    /// returned from an abandoned query.
    #[instrument(skip(self))]
    pub async fn query_with_timeout(&self, space_id: SpaceId, query_text: &str, top_k: Option<usize>, timeout: Duration) -> Result<Vec<QueryHit>> {
        let top_k = top_k.unwrap_or(self.default_top_k);
        match tokio::time::timeout(timeout, self.run_query(space_id, query_text, top_k)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn run_query(&self, space_id: SpaceId, query_text: &str, top_k: usize) -> Result<Vec<QueryHit>> {
        let pair = self.manager.get_for_query(space_id).await?;
        if top_k == 0 || query_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedder = Arc::clone(self.manager.embedder());
        let text = query_text.to_string();
        let mut vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&[text]))
            .await
            .embedding("query embedding task")?
            .embedding("embed query")?;
        let query_embedding = vectors.pop().ok_or_else(|| Error::EmbeddingUnavailable("embedder returned no vector for the query".into()))?;

        let fused = self.retriever.retrieve(&pair, query_text, &query_embedding, top_k).await?;
        let ids: Vec<ChunkId> = fused.iter().map(|h| h.id).collect();
        let mut chunks = pair.vector.chunks(&ids).await?;
        fused
            .into_iter()
            .map(|hit| {
                let chunk = chunks.remove(&hit.id).ok_or_else(|| Error::StorageIO(format!("chunk {} missing from space {space_id}", hit.id)))?;
                Ok(QueryHit {
                    chunk_id: hit.id,
                    document_id: chunk.document_id,
                    ordinal: chunk.ordinal,
                    text: chunk.text,
                    score: hit.score,
                    lexical_rank: hit.lexical_rank,
                    vector_rank: hit.vector_rank,
                })
            })
            .collect()
    }

    pub fn state(&self, space_id: SpaceId) -> Result<SpaceState> {
        self.manager.state(space_id)
    }

    pub async fn stats(&self, space_id: SpaceId) -> Result<SpaceStats> {
        let pair = self.manager.get_for_query(space_id).await?;
        let m = &pair.manifest;
        Ok(SpaceStats {
            space_id,
            generation: pair.generation,
            documents: m.documents.len(),
            chunks: m.chunk_count,
            vector_schema: m.vector_schema.clone(),
            tokenizer: m.tokenizer.clone(),
        })
    }
}
