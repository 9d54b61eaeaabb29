use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

pub const CHUNKS_TABLE: &str = "chunks";
pub const META_TABLE: &str = "meta";

/// Bump when the column layout of `chunks` changes.
pub const VECTOR_SCHEMA_VERSION: u32 = 1;

pub const CHUNK_ID_COLUMN: &str = "chunk_id";
pub const DOCUMENT_ID_COLUMN: &str = "document_id";
pub const ORDINAL_COLUMN: &str = "ordinal";
pub const TEXT_COLUMN: &str = "text";
pub const VECTOR_COLUMN: &str = "vector";
pub const DISTANCE_COLUMN: &str = "_distance";

pub fn build_chunks_schema(dim: usize) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new(CHUNK_ID_COLUMN, DataType::UInt64, false),
		Field::new(DOCUMENT_ID_COLUMN, DataType::Utf8, false),
		Field::new(ORDINAL_COLUMN, DataType::UInt32, false),
		Field::new(TEXT_COLUMN, DataType::Utf8, false),
		Field::new(VECTOR_COLUMN, DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32), true),
	]))
}

// Key/value rows describing how the vectors in `chunks` were produced.
pub fn build_meta_schema() -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("key", DataType::Utf8, false),
		Field::new("value", DataType::Utf8, false),
		Field::new("updated_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
	]))
}
