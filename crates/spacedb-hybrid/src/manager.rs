use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use spacedb_core::chunker::Chunker;
use spacedb_core::error::{Error, Result, ResultExt};
use spacedb_core::traits::Embedder;
use spacedb_core::types::{Chunk, EmbeddedChunk, SpaceId};
use spacedb_text::tantivy_utils::TOKENIZER_VERSION;
use spacedb_text::LexicalIndex;
use spacedb_vector::VectorIndex;

use crate::storage::{lexical_dir, manifest_path, vector_dir, DocumentEntry, Manifest, SpaceLayout};

const EMBED_BATCH: usize = 32;

/// One published generation of a space: both sub-indexes plus the manifest
/// they were written with. Immutable once handed out.
pub struct IndexPair {
    pub space_id: SpaceId,
    pub generation: u64,
    pub manifest: Manifest,
    pub lexical: Arc<LexicalIndex>,
    pub vector: VectorIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceState {
    /// Nothing has been ingested into the space.
    Uninitialized,
    Indexed,
    /// A newer generation was published than the one held in memory; the
    /// next `get_for_query` reloads it.
    StaleReloadPending,
}

/// Owns the per-space index pairs. Ingestion into one space is serialised by
/// a lock keyed on the space id; queries never take it.
///
/// One manager should ingest into a given index root. Other managers on the
/// same root may query it. A second writer is not serialised with the first:
/// it claims its own generation directory and its publish fails with
/// `StorageIO` once the other has moved `CURRENT`.
pub struct SpaceIndexManager {
    layout: SpaceLayout,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    retain_generations: usize,
    locks: Mutex<HashMap<SpaceId, Arc<tokio::sync::Mutex<()>>>>,
    loaded: RwLock<HashMap<SpaceId, Arc<IndexPair>>>,
    in_use: Mutex<HashMap<SpaceId, InUse>>,
}

/// Generations `prune` must keep because a query may still read them.
#[derive(Default)]
struct InUse {
    // Pairs replaced in or evicted from the cache.
    retired: Vec<Weak<IndexPair>>,
    // Generations being opened by `get_for_query`.
    opening: Vec<u64>,
}

impl InUse {
    fn generations(&mut self) -> Vec<u64> {
        self.retired.retain(|w| w.strong_count() > 0);
        self.retired.iter().filter_map(Weak::upgrade).map(|p| p.generation).chain(self.opening.iter().copied()).collect()
    }

    fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.opening.is_empty()
    }
}

/// Registers a generation as being opened until dropped.
struct OpenPin<'a> {
    in_use: &'a Mutex<HashMap<SpaceId, InUse>>,
    space_id: SpaceId,
    generation: u64,
}

impl Drop for OpenPin<'_> {
    fn drop(&mut self) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = in_use.get_mut(&self.space_id) {
            if let Some(i) = entry.opening.iter().position(|g| *g == self.generation) {
                entry.opening.swap_remove(i);
            }
            entry.retired.retain(|w| w.strong_count() > 0);
            if entry.is_empty() {
                in_use.remove(&self.space_id);
            }
        }
    }
}

impl SpaceIndexManager {
    pub fn new(root: impl Into<PathBuf>, embedder: Arc<dyn Embedder>, chunker: Chunker, retain_generations: usize) -> Self {
        Self {
            layout: SpaceLayout::new(root),
            embedder,
            chunker,
            retain_generations: retain_generations.max(1),
            locks: Mutex::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            in_use: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &SpaceLayout {
        &self.layout
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn space_lock(&self, space_id: SpaceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(space_id).or_default().clone()
    }

    // Forget the lock of a space once no ingestion holds or awaits it.
    fn release_lock(&self, space_id: SpaceId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&space_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&space_id);
        }
    }

    /// Chunk, embed and append `documents` to the space, creating it on first
    /// use, and publish the result as a new generation. Documents already in
    /// the space (by content hash) are skipped. Returns the chunks added.
    ///
    /// On any error the previously published generation stays current.
    #[instrument(skip(self, documents), fields(docs = documents.len()))]
    pub async fn ensure_and_extend(&self, space_id: SpaceId, documents: &[String]) -> Result<usize> {
        let lock = self.space_lock(space_id);
        let result = {
            let _guard = lock.lock().await;
            self.extend_locked(space_id, documents).await
        };
        drop(lock);
        self.release_lock(space_id);
        result
    }

    async fn extend_locked(&self, space_id: SpaceId, documents: &[String]) -> Result<usize> {
        let schema = self.embedder.schema();
        let current = self.layout.current_generation(space_id)?;
        let mut manifest = match current {
            Some(generation) => Manifest::load(&manifest_path(&self.layout.generation_dir(space_id, generation)))?,
            None => Manifest::new(space_id, schema.clone(), TOKENIZER_VERSION),
        };
        if manifest.vector_schema != schema {
            return Err(Error::IndexSchemaMismatch(format!(
                "space {space_id} was indexed with {}, embedder is {schema}",
                manifest.vector_schema
            )));
        }

        let mut seen = HashSet::new();
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut new_documents = Vec::new();
        for text in documents {
            let document_id = blake3::hash(text.as_bytes()).to_hex().to_string();
            if manifest.contains(&document_id) || !seen.insert(document_id.clone()) {
                continue;
            }
            let passages = self.chunker.chunk(text);
            if passages.is_empty() {
                continue;
            }
            let ids = manifest.allocate(passages.len());
            new_documents.push((document_id.clone(), ids.clone().collect::<Vec<_>>()));
            chunks.extend(passages.into_iter().zip(ids).map(|(p, id)| Chunk {
                id,
                document_id: document_id.clone(),
                ordinal: p.ordinal,
                text: p.text,
            }));
        }
        if chunks.is_empty() {
            debug!(space_id, "nothing new to ingest");
            return Ok(0);
        }

        let vectors = self.embed_chunks(&chunks).await?;
        let embedded: Vec<EmbeddedChunk> = chunks.into_iter().zip(vectors).map(|(chunk, vector)| EmbeddedChunk { chunk, vector }).collect();
        let added = embedded.len();

        let (next, staged) = self.layout.stage(space_id, current)?;
        let now = Utc::now();
        for (document_id, chunk_ids) in new_documents {
            manifest.documents.insert(document_id, DocumentEntry { chunk_ids, ingested_at: now });
        }
        manifest.generation = next;
        manifest.chunk_count += added as u64;

        let pair = match self.build_generation(space_id, next, current.is_some(), manifest, &embedded).await {
            Ok(pair) => pair,
            Err(e) => {
                self.layout.discard(&staged);
                return Err(e);
            }
        };
        if let Err(e) = self.layout.publish(space_id, current, next) {
            self.layout.discard(&staged);
            return Err(e);
        }
        self.install(Arc::new(pair));
        info!(space_id, generation = next, chunks_added = added, "generation published");

        match self.prune(space_id) {
            Ok(removed) if !removed.is_empty() => debug!(space_id, ?removed, "pruned generations"),
            Ok(_) => {}
            Err(e) => warn!(space_id, error = %e, "failed to prune old generations"),
        }
        Ok(added)
    }

    // The in-use registry stays locked until the deletions are done.
    fn prune(&self, space_id: SpaceId) -> Result<Vec<u64>> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let protected = match in_use.get_mut(&space_id) {
            Some(entry) => {
                let generations = entry.generations();
                if entry.is_empty() {
                    in_use.remove(&space_id);
                }
                generations
            }
            None => Vec::new(),
        };
        self.layout.prune(space_id, self.retain_generations, &protected)
    }

    async fn build_generation(
        &self,
        space_id: SpaceId,
        generation: u64,
        seeded: bool,
        manifest: Manifest,
        embedded: &[EmbeddedChunk],
    ) -> Result<IndexPair> {
        let dir = self.layout.generation_dir(space_id, generation);
        let schema = self.embedder.schema();
        let (lexical, vector) = if seeded {
            (LexicalIndex::load(&lexical_dir(&dir))?, VectorIndex::load(&vector_dir(&dir), &schema).await?)
        } else {
            (LexicalIndex::create(&lexical_dir(&dir))?, VectorIndex::create(&vector_dir(&dir), schema).await?)
        };
        let chunks: Vec<Chunk> = embedded.iter().map(|e| e.chunk.clone()).collect();
        let lexical = Arc::new(lexical);
        let writer = Arc::clone(&lexical);
        tokio::task::spawn_blocking(move || {
            writer.add(&chunks)?;
            writer.save()
        })
        .await
        .storage("lexical ingest task")??;
        vector.add(embedded)?;
        vector.save().await?;
        manifest.save(&manifest_path(&dir))?;
        Ok(IndexPair { space_id, generation, manifest, lexical, vector })
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let dim = self.embedder.dim();
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedder = Arc::clone(&self.embedder);
            let out = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
                .await
                .embedding("embedding task")?
                .embedding("embed chunks")?;
            if out.len() != batch.len() {
                return Err(Error::EmbeddingUnavailable(format!("embedder returned {} vectors for {} texts", out.len(), batch.len())));
            }
            if let Some(v) = out.iter().find(|v| v.len() != dim) {
                return Err(Error::IndexSchemaMismatch(format!("embedder returned a {}-dimensional vector, declared {dim}", v.len())));
            }
            vectors.extend(out);
        }
        Ok(vectors)
    }

    /// The current index pair of a space, loading it from disk on first use
    /// or when a newer generation has been published.
    #[instrument(skip(self))]
    pub async fn get_for_query(&self, space_id: SpaceId) -> Result<Arc<IndexPair>> {
        loop {
            let current = self.layout.current_generation(space_id)?.ok_or(Error::SpaceNotIndexed(space_id))?;
            if let Some(pair) = self.loaded_pair(space_id) {
                if pair.generation >= current {
                    return Ok(pair);
                }
            }
            let _pin = self.pin(space_id, current);
            // A generation still named by CURRENT after pinning cannot be pruned.
            if self.layout.current_generation(space_id)? != Some(current) {
                debug!(space_id, generation = current, "generation superseded before load");
                continue;
            }
            match self.open_generation(space_id, current).await {
                Ok(pair) => {
                    debug!(space_id, generation = current, "space loaded");
                    return Ok(self.install(Arc::new(pair)));
                }
                Err(e) => {
                    // Another manager on this root may have published and pruned.
                    if self.layout.current_generation(space_id)? == Some(current) {
                        return Err(e);
                    }
                    debug!(space_id, generation = current, error = %e, "generation superseded during load");
                }
            }
        }
    }

    fn pin(&self, space_id: SpaceId, generation: u64) -> OpenPin<'_> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.entry(space_id).or_default().opening.push(generation);
        OpenPin { in_use: &self.in_use, space_id, generation }
    }

    async fn open_generation(&self, space_id: SpaceId, generation: u64) -> Result<IndexPair> {
        let dir = self.layout.generation_dir(space_id, generation);
        let manifest = Manifest::load(&manifest_path(&dir))?;
        let schema = self.embedder.schema();
        if manifest.vector_schema != schema {
            return Err(Error::IndexSchemaMismatch(format!(
                "space {space_id} was indexed with {}, embedder is {schema}",
                manifest.vector_schema
            )));
        }
        if manifest.tokenizer != TOKENIZER_VERSION {
            return Err(Error::IndexSchemaMismatch(format!(
                "space {space_id} was tokenized with {}, expected {TOKENIZER_VERSION}",
                manifest.tokenizer
            )));
        }
        let lexical_path = lexical_dir(&dir);
        let lexical = tokio::task::spawn_blocking(move || LexicalIndex::load(&lexical_path)).await.storage("lexical load task")??;
        let vector = VectorIndex::load(&vector_dir(&dir), &schema).await?;
        Ok(IndexPair { space_id, generation, manifest, lexical: Arc::new(lexical), vector })
    }

    fn loaded_pair(&self, space_id: SpaceId) -> Option<Arc<IndexPair>> {
        self.loaded.read().unwrap_or_else(|e| e.into_inner()).get(&space_id).cloned()
    }

    // Keeps whichever of the cached and offered pairs is newer.
    fn install(&self, pair: Arc<IndexPair>) -> Arc<IndexPair> {
        let mut loaded = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = loaded.get(&pair.space_id) {
            if existing.generation > pair.generation {
                return existing.clone();
            }
        }
        if let Some(previous) = loaded.insert(pair.space_id, pair.clone()) {
            self.retire(&previous);
        }
        pair
    }

    fn retire(&self, pair: &Arc<IndexPair>) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.entry(pair.space_id).or_default().retired.push(Arc::downgrade(pair));
    }

    pub fn state(&self, space_id: SpaceId) -> Result<SpaceState> {
        let Some(current) = self.layout.current_generation(space_id)? else {
            return Ok(SpaceState::Uninitialized);
        };
        Ok(match self.loaded_pair(space_id) {
            Some(pair) if pair.generation < current => SpaceState::StaleReloadPending,
            _ => SpaceState::Indexed,
        })
    }

    /// Drop the in-memory pair of a space. Returns whether one was loaded.
    pub fn evict(&self, space_id: SpaceId) -> bool {
        let removed = self.loaded.write().unwrap_or_else(|e| e.into_inner()).remove(&space_id);
        if let Some(pair) = &removed {
            self.retire(pair);
        }
        removed.is_some()
    }
}
