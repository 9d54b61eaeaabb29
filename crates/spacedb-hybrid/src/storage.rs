//! On-disk layout of a space and the generation protocol.
//!
//! ```text
//! <root>/space_<id>/
//!     CURRENT                 published generation number
//!     gen-000001/
//!         manifest.json
//!         lexical/            tantivy index + lexical.json
//!         vector/             lancedb database (chunks, meta)
//!     gen-000002/ ...
//! ```
//!
//! A generation directory is immutable once `CURRENT` names it. Ingestion
//! claims a generation numbered above every existing directory, seeds it with
//! a copy of the published one, mutates only the copy, then swaps `CURRENT`
//! with a single rename. Readers resolve `CURRENT` first and so see either the
//! old or the new generation, never a partially written one.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use spacedb_core::error::{Error, Result, ResultExt};
use spacedb_core::types::{ChunkId, SpaceId, VectorSchema};

const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_FILE: &str = "manifest.json";
const GENERATION_PREFIX: &str = "gen-";

#[derive(Debug, Clone)]
pub struct SpaceLayout {
    root: PathBuf,
}

impl SpaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn space_dir(&self, space_id: SpaceId) -> PathBuf {
        self.root.join(format!("space_{space_id}"))
    }

    pub fn generation_dir(&self, space_id: SpaceId, generation: u64) -> PathBuf {
        self.space_dir(space_id).join(format!("{GENERATION_PREFIX}{generation:06}"))
    }

    /// The published generation, or `None` if the space was never ingested.
    pub fn current_generation(&self, space_id: SpaceId) -> Result<Option<u64>> {
        let path = self.space_dir(space_id).join(CURRENT_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::StorageIO(format!("corrupt {}: {e}", path.display())))
    }

    /// Claim a new generation directory, numbered above every existing one
    /// and above `from`, and seed it with a copy of `from`. Directories left
    /// by interrupted or concurrent ingestions are skipped, never reused.
    pub fn stage(&self, space_id: SpaceId, from: Option<u64>) -> Result<(u64, PathBuf)> {
        std::fs::create_dir_all(self.space_dir(space_id))?;
        let mut next = self.generations(space_id)?.last().copied().max(from).map_or(1, |g| g + 1);
        let staged = loop {
            let dir = self.generation_dir(space_id, next);
            match std::fs::create_dir(&dir) {
                Ok(()) => break dir,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => next += 1,
                Err(e) => return Err(e.into()),
            }
        };
        if let Some(generation) = from {
            if let Err(e) = copy_tree(&self.generation_dir(space_id, generation), &staged) {
                self.discard(&staged);
                return Err(e);
            }
        }
        debug!(space_id, generation = next, "generation staged");
        Ok((next, staged))
    }

    /// Point `CURRENT` at `generation` with one rename, provided it still
    /// names `expected`. Fails with `StorageIO` if another writer moved it.
    pub fn publish(&self, space_id: SpaceId, expected: Option<u64>, generation: u64) -> Result<()> {
        let found = self.current_generation(space_id)?;
        if found != expected {
            return Err(Error::StorageIO(format!(
                "space {space_id} moved to generation {} while generation {generation} was staged",
                found.unwrap_or(0)
            )));
        }
        let space_dir = self.space_dir(space_id);
        let mut tmp = tempfile::NamedTempFile::new_in(&space_dir)?;
        writeln!(tmp, "{generation}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(space_dir.join(CURRENT_FILE)).map_err(|e| Error::StorageIO(format!("publish generation {generation}: {e}")))?;
        Ok(())
    }

    /// Best-effort removal of a staged generation that will not be published.
    pub fn discard(&self, staged: &Path) {
        if let Err(e) = std::fs::remove_dir_all(staged) {
            warn!(dir = %staged.display(), error = %e, "failed to discard staged generation");
        }
    }

    /// Delete all but the newest `keep` generations. The published one and
    /// any in `protected` are never deleted. Returns the generations removed.
    pub fn prune(&self, space_id: SpaceId, keep: usize, protected: &[u64]) -> Result<Vec<u64>> {
        let current = self.current_generation(space_id)?;
        let mut generations = self.generations(space_id)?;
        generations.sort_unstable_by(|a, b| b.cmp(a));
        let mut removed = Vec::new();
        for generation in generations.into_iter().skip(keep.max(1)) {
            if Some(generation) == current || protected.contains(&generation) {
                continue;
            }
            std::fs::remove_dir_all(self.generation_dir(space_id, generation))?;
            removed.push(generation);
        }
        Ok(removed)
    }

    pub fn generations(&self, space_id: SpaceId) -> Result<Vec<u64>> {
        let dir = self.space_dir(space_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let parsed = name.to_str().and_then(|n| n.strip_prefix(GENERATION_PREFIX)).and_then(|n| n.parse::<u64>().ok());
            if let Some(generation) = parsed {
                out.push(generation);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}

pub fn lexical_dir(generation_dir: &Path) -> PathBuf {
    generation_dir.join("lexical")
}

pub fn vector_dir(generation_dir: &Path) -> PathBuf {
    generation_dir.join("vector")
}

pub fn manifest_path(generation_dir: &Path) -> PathBuf {
    generation_dir.join(MANIFEST_FILE)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.storage("walk generation")?;
        let rel = entry.path().strip_prefix(from).storage("walk generation")?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if !is_lock_file(entry.path()) {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn is_lock_file(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(".tantivy-") && n.ends_with(".lock"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub chunk_ids: Vec<ChunkId>,
    pub ingested_at: DateTime<Utc>,
}

/// Per-generation record of what a space contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub space_id: SpaceId,
    pub generation: u64,
    pub next_chunk_id: ChunkId,
    pub chunk_count: u64,
    pub vector_schema: VectorSchema,
    pub tokenizer: String,
    /// Keyed by the BLAKE3 hex digest of the document text.
    pub documents: BTreeMap<String, DocumentEntry>,
}

impl Manifest {
    pub fn new(space_id: SpaceId, vector_schema: VectorSchema, tokenizer: &str) -> Self {
        Self {
            space_id,
            generation: 0,
            next_chunk_id: 1,
            chunk_count: 0,
            vector_schema,
            tokenizer: tokenizer.to_string(),
            documents: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Reserve `count` consecutive chunk ids.
    pub fn allocate(&mut self, count: usize) -> std::ops::Range<ChunkId> {
        let start = self.next_chunk_id;
        self.next_chunk_id += count as u64;
        start..self.next_chunk_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacedb_core::types::Metric;

    fn schema() -> VectorSchema {
        VectorSchema { embedder_id: "t".into(), dim: 4, metric: Metric::Cosine }
    }

    #[test]
    fn current_is_absent_until_published() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(tmp.path());
        assert_eq!(layout.current_generation(3).unwrap(), None);
        let (generation, _) = layout.stage(3, None).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(layout.current_generation(3).unwrap(), None);
        layout.publish(3, None, 1).unwrap();
        assert_eq!(layout.current_generation(3).unwrap(), Some(1));
    }

    #[test]
    fn staging_copies_previous_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(tmp.path());
        let (_, first) = layout.stage(1, None).unwrap();
        std::fs::create_dir_all(first.join("lexical")).unwrap();
        std::fs::write(first.join("lexical/segment"), b"postings").unwrap();
        std::fs::write(first.join("lexical/.tantivy-writer.lock"), b"").unwrap();
        layout.publish(1, None, 1).unwrap();

        let (generation, second) = layout.stage(1, Some(1)).unwrap();
        assert_eq!(generation, 2);
        assert_eq!(std::fs::read(second.join("lexical/segment")).unwrap(), b"postings");
        assert!(!second.join("lexical/.tantivy-writer.lock").exists());
        assert_eq!(layout.current_generation(1).unwrap(), Some(1));
    }

    #[test]
    fn prune_keeps_newest_and_published() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(tmp.path());
        for g in 1..=4 {
            assert_eq!(layout.stage(5, None).unwrap().0, g);
        }
        layout.publish(5, None, 3).unwrap();
        let removed = layout.prune(5, 1, &[1]).unwrap();
        assert_eq!(removed, vec![2]);
        assert_eq!(layout.generations(5).unwrap(), vec![1, 3, 4]);
    }

    #[test]
    fn stage_never_reuses_an_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(tmp.path());
        let (_, first) = layout.stage(2, None).unwrap();
        std::fs::write(first.join("manifest.json"), b"{}").unwrap();
        layout.publish(2, None, 1).unwrap();

        // Someone else is building generation 2.
        let (other, other_dir) = layout.stage(2, Some(1)).unwrap();
        std::fs::write(other_dir.join("marker"), b"theirs").unwrap();

        let (mine, mine_dir) = layout.stage(2, Some(1)).unwrap();
        assert_eq!((other, mine), (2, 3));
        assert_eq!(std::fs::read(other_dir.join("marker")).unwrap(), b"theirs");
        assert!(mine_dir.join("manifest.json").exists());
    }

    #[test]
    fn publish_fails_once_another_writer_moved_current() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(tmp.path());
        layout.stage(4, None).unwrap();
        layout.publish(4, None, 1).unwrap();
        let (a, _) = layout.stage(4, Some(1)).unwrap();
        let (b, _) = layout.stage(4, Some(1)).unwrap();

        layout.publish(4, Some(1), b).unwrap();
        let err = layout.publish(4, Some(1), a).unwrap_err();
        assert_eq!(err.kind(), spacedb_core::error::ErrorKind::StorageIO);
        assert_eq!(layout.current_generation(4).unwrap(), Some(b));
    }

    #[test]
    fn manifest_allocates_sequential_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new(1, schema(), "en-stem-v1");
        assert_eq!(manifest.allocate(3), 1..4);
        assert_eq!(manifest.allocate(2), 4..6);
        let path = tmp.path().join("manifest.json");
        manifest.save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), manifest);
    }
}
