//! spacedb-text
//!
//! Tantivy-backed BM25 index over the chunks of a single space. See `index`
//! for the lifecycle and `tantivy_utils` for the schema and analyzer chain.

pub mod index;
pub mod tantivy_utils;

pub use index::{LexicalIndex, LexicalSchema};
