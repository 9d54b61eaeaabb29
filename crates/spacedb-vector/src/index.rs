use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use tracing::{debug, instrument};

use spacedb_core::error::{Error, Result, ResultExt};
use spacedb_core::types::{rank_order, Chunk, ChunkId, EmbeddedChunk, Metric, SearchHit, SourceKind, VectorSchema};

use crate::schema::{
	build_chunks_schema, CHUNKS_TABLE, CHUNK_ID_COLUMN, DISTANCE_COLUMN, DOCUMENT_ID_COLUMN, META_TABLE, ORDINAL_COLUMN, TEXT_COLUMN,
	VECTOR_COLUMN, VECTOR_SCHEMA_VERSION,
};
use crate::table::{ensure_table, get_meta, open_db, set_meta, table_exists};

const META_SCHEMA_VERSION: &str = "schema_version";
const META_EMBEDDER_ID: &str = "embedder_id";
const META_DIM: &str = "dim";
const META_METRIC: &str = "metric";

/// Exact nearest-neighbour index over the chunks of one space, backed by a
/// LanceDB database directory.
///
/// The index also stores each chunk's text so query results can be
/// hydrated without a second store. `add` only stages rows; `save` writes
/// them with an upsert keyed on `chunk_id`.
pub struct VectorIndex {
	dir: PathBuf,
	conn: Connection,
	table: Table,
	schema: VectorSchema,
	pending: Mutex<BTreeMap<ChunkId, EmbeddedChunk>>,
}

impl VectorIndex {
	pub async fn create(dir: &Path, schema: VectorSchema) -> Result<Self> {
		std::fs::create_dir_all(dir)?;
		let conn = open_db(&dir.to_string_lossy()).await?;
		ensure_table(&conn, CHUNKS_TABLE, build_chunks_schema(schema.dim)).await?;
		set_meta(&conn, META_TABLE, META_SCHEMA_VERSION, &VECTOR_SCHEMA_VERSION.to_string()).await?;
		set_meta(&conn, META_TABLE, META_EMBEDDER_ID, &schema.embedder_id).await?;
		set_meta(&conn, META_TABLE, META_DIM, &schema.dim.to_string()).await?;
		set_meta(&conn, META_TABLE, META_METRIC, schema.metric.as_str()).await?;
		let table = conn.open_table(CHUNKS_TABLE).execute().await.storage("open chunks table")?;
		debug!(dir = %dir.display(), %schema, "vector index created");
		Ok(Self { dir: dir.to_path_buf(), conn, table, schema, pending: Mutex::new(BTreeMap::new()) })
	}

	/// Open a persisted index. Fails with `IndexSchemaMismatch` when it was
	/// built by a different embedder, dimension or metric than `expected`.
	pub async fn load(dir: &Path, expected: &VectorSchema) -> Result<Self> {
		if !dir.is_dir() {
			return Err(Error::StorageIO(format!("vector index missing at {}", dir.display())));
		}
		let conn = open_db(&dir.to_string_lossy()).await?;
		let found = read_schema(&conn).await?;
		if found != *expected {
			return Err(Error::IndexSchemaMismatch(format!("vector index at {} was built with {found}, expected {expected}", dir.display())));
		}
		if !table_exists(&conn, CHUNKS_TABLE).await? {
			return Err(Error::StorageIO(format!("chunks table missing at {}", dir.display())));
		}
		let table = conn.open_table(CHUNKS_TABLE).execute().await.storage("open chunks table")?;
		Ok(Self { dir: dir.to_path_buf(), conn, table, schema: found, pending: Mutex::new(BTreeMap::new()) })
	}

	pub fn dir(&self) -> &Path { &self.dir }

	pub fn schema(&self) -> &VectorSchema { &self.schema }

	/// Stage embedded chunks for the next `save`. Re-adding an id replaces it.
	pub fn add(&self, items: &[EmbeddedChunk]) -> Result<()> {
		if let Some(bad) = items.iter().find(|e| e.vector.len() != self.schema.dim) {
			return Err(Error::IndexSchemaMismatch(format!(
				"chunk {} has a {}-dimensional vector, index expects {}",
				bad.chunk.id,
				bad.vector.len(),
				self.schema.dim
			)));
		}
		let mut pending = self.pending.lock().map_err(|_| Error::StorageIO("vector staging lock poisoned".into()))?;
		for item in items {
			pending.insert(item.chunk.id, item.clone());
		}
		Ok(())
	}

	/// Write staged rows to disk.
	pub async fn save(&self) -> Result<()> {
		let staged = {
			let mut pending = self.pending.lock().map_err(|_| Error::StorageIO("vector staging lock poisoned".into()))?;
			std::mem::take(&mut *pending)
		};
		if staged.is_empty() {
			return Ok(());
		}
		let rows = staged.len();
		let batch = self.to_record_batch(staged.into_values())?;
		let schema = batch.schema();
		let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
		let mut mi = self.table.merge_insert(&[CHUNK_ID_COLUMN]);
		mi.when_matched_update_all(None).when_not_matched_insert_all();
		mi.execute(reader).await.storage("write vector rows")?;
		debug!(rows, dir = %self.dir.display(), "vector rows saved");
		Ok(())
	}

	/// The `top_k` saved chunks closest to `query`, best first. Score is
	/// `1 - distance` under the index metric; ties order by ascending id.
	#[instrument(skip(self, query), fields(dir = %self.dir.display()))]
	pub async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
		if query.len() != self.schema.dim {
			return Err(Error::IndexSchemaMismatch(format!(
				"query vector has {} dimensions, index expects {}",
				query.len(),
				self.schema.dim
			)));
		}
		if top_k == 0 || self.len().await? == 0 {
			return Ok(Vec::new());
		}
		// Widen the window until the k-th result is not tied with the one
		// after it, so the id tie-break sees every tied candidate.
		let mut limit = top_k + 1;
		loop {
			let mut scored = self.nearest(query, limit).await?;
			scored.sort_by(rank_order);
			let exhausted = scored.len() < limit;
			if exhausted || scored[top_k - 1].1 != scored[limit - 1].1 {
				scored.truncate(top_k);
				return Ok(scored.into_iter().map(|(id, score)| SearchHit { id, score, source: SourceKind::Vector }).collect());
			}
			limit *= 2;
		}
	}

	/// Stored chunks for the given ids. Unknown ids are absent from the map.
	pub async fn chunks(&self, ids: &[ChunkId]) -> Result<HashMap<ChunkId, Chunk>> {
		let unique: BTreeSet<ChunkId> = ids.iter().copied().collect();
		if unique.is_empty() {
			return Ok(HashMap::new());
		}
		let list = unique.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
		let mut stream = self
			.table
			.query()
			.only_if(format!("{CHUNK_ID_COLUMN} IN ({list})"))
			.limit(unique.len())
			.execute()
			.await
			.storage("query chunks")?;
		let mut out = HashMap::with_capacity(unique.len());
		while let Some(batch) = stream.try_next().await.storage("read chunks")? {
			let ids = column::<UInt64Array>(&batch, CHUNK_ID_COLUMN)?;
			let docs = column::<StringArray>(&batch, DOCUMENT_ID_COLUMN)?;
			let ordinals = column::<UInt32Array>(&batch, ORDINAL_COLUMN)?;
			let texts = column::<StringArray>(&batch, TEXT_COLUMN)?;
			for i in 0..batch.num_rows() {
				let chunk = Chunk {
					id: ids.value(i),
					document_id: docs.value(i).to_string(),
					ordinal: ordinals.value(i) as usize,
					text: texts.value(i).to_string(),
				};
				out.insert(chunk.id, chunk);
			}
		}
		Ok(out)
	}

	/// Number of saved rows.
	pub async fn len(&self) -> Result<u64> {
		let rows = self.table.count_rows(None).await.storage("count vector rows")?;
		Ok(rows as u64)
	}

	pub async fn is_empty(&self) -> Result<bool> { Ok(self.len().await? == 0) }

	async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<(ChunkId, f32)>> {
		let mut stream = self
			.table
			.vector_search(query.to_vec())
			.storage("build vector query")?
			.column(VECTOR_COLUMN)
			.distance_type(distance_type(self.schema.metric))
			.bypass_vector_index()
			.limit(limit)
			.execute()
			.await
			.storage("vector search")?;
		let mut out = Vec::with_capacity(limit);
		while let Some(batch) = stream.try_next().await.storage("read vector results")? {
			let ids = column::<UInt64Array>(&batch, CHUNK_ID_COLUMN)?;
			let distances = column::<Float32Array>(&batch, DISTANCE_COLUMN)?;
			for i in 0..batch.num_rows() {
				out.push((ids.value(i), 1.0 - distances.value(i)));
			}
		}
		Ok(out)
	}

	fn to_record_batch(&self, rows: impl Iterator<Item = EmbeddedChunk>) -> Result<RecordBatch> {
		let mut ids = Vec::new();
		let mut doc_ids = Vec::new();
		let mut ordinals = Vec::new();
		let mut texts = Vec::new();
		let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::new();
		for EmbeddedChunk { chunk, vector } in rows {
			ids.push(chunk.id);
			doc_ids.push(chunk.document_id);
			ordinals.push(chunk.ordinal as u32);
			texts.push(chunk.text);
			vectors.push(Some(vector.into_iter().map(Some).collect()));
		}
		RecordBatch::try_new(
			build_chunks_schema(self.schema.dim),
			vec![
				Arc::new(UInt64Array::from(ids)),
				Arc::new(StringArray::from(doc_ids)),
				Arc::new(UInt32Array::from(ordinals)),
				Arc::new(StringArray::from(texts)),
				Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors, self.schema.dim as i32)),
			],
		)
		.storage("build vector batch")
	}
}

async fn read_schema(conn: &Connection) -> Result<VectorSchema> {
	let missing = |key: &str| Error::IndexSchemaMismatch(format!("vector index records no {key}"));
	let version = get_meta(conn, META_TABLE, META_SCHEMA_VERSION).await?.ok_or_else(|| missing(META_SCHEMA_VERSION))?;
	if version != VECTOR_SCHEMA_VERSION.to_string() {
		return Err(Error::IndexSchemaMismatch(format!("vector schema v{version}, expected v{VECTOR_SCHEMA_VERSION}")));
	}
	let embedder_id = get_meta(conn, META_TABLE, META_EMBEDDER_ID).await?.ok_or_else(|| missing(META_EMBEDDER_ID))?;
	let dim = get_meta(conn, META_TABLE, META_DIM)
		.await?
		.ok_or_else(|| missing(META_DIM))?
		.parse::<usize>()
		.map_err(|e| Error::IndexSchemaMismatch(format!("bad dim: {e}")))?;
	let metric = get_meta(conn, META_TABLE, META_METRIC).await?.ok_or_else(|| missing(META_METRIC))?;
	let metric = Metric::parse(&metric).ok_or_else(|| Error::IndexSchemaMismatch(format!("unknown metric {metric}")))?;
	Ok(VectorSchema { embedder_id, dim, metric })
}

fn distance_type(metric: Metric) -> DistanceType {
	match metric {
		Metric::Cosine => DistanceType::Cosine,
		Metric::Dot => DistanceType::Dot,
	}
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
	batch
		.column_by_name(name)
		.and_then(|c| c.as_any().downcast_ref::<T>())
		.ok_or_else(|| Error::StorageIO(format!("column {name} missing or mistyped")))
}
