//! spacedb-vector
//!
//! LanceDB-backed vector index for a single space: the `chunks` table holds
//! chunk rows with their embeddings, the `meta` table records which embedder
//! produced them.

pub mod index;
pub mod schema;
pub mod table;

pub use index::VectorIndex;
