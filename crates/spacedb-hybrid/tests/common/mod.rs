#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spacedb_core::config::Settings;
use spacedb_core::traits::Embedder;
use spacedb_hybrid::SpaceDb;

const CONCEPTS: &[&[&str]] = &[
    &["energy", "powerhouse", "produce", "produces", "power", "fuel", "atp"],
    &["cell", "cells", "mitochondria", "organelle"],
    &["plant", "plants", "photosynthesis", "chloroplasts", "sunlight"],
    &["protein", "proteins", "ribosomes", "amino"],
];
pub const DIM: usize = 8;

/// Maps a few vocabulary words onto shared axes so paraphrases land close
/// together; any other word adds a small weight to one of four noise axes.
pub struct ConceptEmbedder;

impl ConceptEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0f32; DIM];
        for raw in text.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if word.is_empty() {
                continue;
            }
            match CONCEPTS.iter().position(|c| c.contains(&word.as_str())) {
                Some(axis) => v[axis] += 1.0,
                None => {
                    let bucket = word.bytes().map(usize::from).sum::<usize>() % 4;
                    v[CONCEPTS.len() + bucket] += 0.1;
                }
            }
        }
        if v.iter().all(|x| *x == 0.0) {
            v[DIM - 1] = 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }
}

impl Embedder for ConceptEmbedder {
    fn embedder_id(&self) -> &str { "concept-v1" }
    fn dim(&self) -> usize { DIM }
    fn max_len(&self) -> usize { 512 }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Concept embedder that sleeps before answering.
pub struct SlowEmbedder(pub Duration);

impl Embedder for SlowEmbedder {
    fn embedder_id(&self) -> &str { "concept-v1" }
    fn dim(&self) -> usize { DIM }
    fn max_len(&self) -> usize { 512 }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        std::thread::sleep(self.0);
        ConceptEmbedder.embed_batch(texts)
    }
}

pub struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn embedder_id(&self) -> &str { "concept-v1" }
    fn dim(&self) -> usize { DIM }
    fn max_len(&self) -> usize { 512 }
    fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("model server unreachable")
    }
}

/// Claims the concept embedder's identity but returns short vectors.
pub struct TruncatingEmbedder;

impl Embedder for TruncatingEmbedder {
    fn embedder_id(&self) -> &str { "concept-v1" }
    fn dim(&self) -> usize { DIM }
    fn max_len(&self) -> usize { 512 }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0; DIM - 1]).collect())
    }
}

pub fn settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.index.root = root.to_string_lossy().into_owned();
    settings.chunking.max_tokens = 64;
    settings.chunking.overlap_tokens = 8;
    settings
}

pub fn open(root: &Path, embedder: Arc<dyn Embedder>) -> SpaceDb {
    spacedb_core::logging::init_logging("warn");
    SpaceDb::new(&settings(root), embedder).expect("spacedb")
}

pub fn concept_db(root: &Path) -> SpaceDb {
    open(root, Arc::new(ConceptEmbedder))
}

pub fn docs(texts: &[&str]) -> Vec<String> {
    texts.iter().map(|t| t.to_string()).collect()
}
