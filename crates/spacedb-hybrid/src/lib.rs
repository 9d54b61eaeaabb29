//! spacedb-hybrid
//!
//! Per-space hybrid retrieval: the space index manager keeps one lexical and
//! one vector index per space on disk, the fusion retriever combines their
//! rankings with reciprocal rank fusion, and `SpaceDb` exposes ingest/query.

pub mod fusion;
pub mod manager;
pub mod retriever;
pub mod service;
pub mod storage;

pub use fusion::{reciprocal_rank_fusion, FusedHit, RRF_K};
pub use manager::{IndexPair, SpaceIndexManager, SpaceState};
pub use retriever::{FusionRetriever, RetrievalOptions};
pub use service::{IngestReport, QueryHit, SpaceDb, SpaceStats};
pub use storage::{Manifest, SpaceLayout};
