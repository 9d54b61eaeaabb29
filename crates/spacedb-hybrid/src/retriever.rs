use std::sync::Arc;

use tracing::{debug, instrument};

use spacedb_core::error::{Result, ResultExt};

use crate::fusion::{reciprocal_rank_fusion, FusedHit, RRF_K};
use crate::manager::IndexPair;

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub rrf_k: u32,
    /// Each sub-index is asked for `top_k * overfetch` candidates.
    pub overfetch: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self { rrf_k: RRF_K, overfetch: 2 }
    }
}

/// Queries both sub-indexes of a pair concurrently and fuses their rankings.
#[derive(Debug, Clone, Default)]
pub struct FusionRetriever {
    options: RetrievalOptions,
}

impl FusionRetriever {
    pub fn new(options: RetrievalOptions) -> Self {
        Self { options: RetrievalOptions { overfetch: options.overfetch.max(1), ..options } }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// Fused top `top_k` for a query. Either sub-index failing fails the
    /// whole retrieval.
    #[instrument(skip(self, pair, query_embedding), fields(space_id = pair.space_id, generation = pair.generation))]
    pub async fn retrieve(&self, pair: &IndexPair, query_text: &str, query_embedding: &[f32], top_k: usize) -> Result<Vec<FusedHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let candidates = top_k.saturating_mul(self.options.overfetch);

        let lexical = Arc::clone(&pair.lexical);
        let text = query_text.to_string();
        let lexical_search = async move {
            tokio::task::spawn_blocking(move || lexical.search(&text, candidates)).await.storage("lexical search task")?
        };
        let vector_search = pair.vector.search(query_embedding, candidates);
        let (lexical_hits, vector_hits) = tokio::try_join!(lexical_search, vector_search)?;
        debug!(lexical = lexical_hits.len(), vector = vector_hits.len(), "sub-index candidates");

        Ok(reciprocal_rank_fusion(&lexical_hits, &vector_hits, self.options.rrf_k, top_k))
    }
}
