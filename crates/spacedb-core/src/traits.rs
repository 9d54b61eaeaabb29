use crate::types::{Metric, VectorSchema};

/// The embedding function: text in, fixed-length vector out.
///
/// Implementations must return vectors of exactly `dim()` components and the
/// same vector for the same text. The engines never compute embeddings
/// themselves; one `Embedder` is injected into the space manager.
pub trait Embedder: Send + Sync {
    /// Stable identifier for the model and its preprocessing (e.g. `bge-m3:mean-l2`).
    fn embedder_id(&self) -> &str;
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn metric(&self) -> Metric {
        Metric::Cosine
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn schema(&self) -> VectorSchema {
        VectorSchema { embedder_id: self.embedder_id().to_string(), dim: self.dim(), metric: self.metric() }
    }
}
