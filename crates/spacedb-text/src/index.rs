use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::BooleanQuery;
use tantivy::schema::Field;
use tantivy::{doc, DocId, Index, IndexReader, IndexWriter, ReloadPolicy, Score, SegmentReader, Term};
use tracing::{debug, instrument};

use spacedb_core::error::{Error, Result, ResultExt};
use spacedb_core::types::{Chunk, ChunkId, SearchHit, SourceKind};

use crate::tantivy_utils::{
	analyze, build_schema, register_tokenizer, CHUNK_ID_FIELD, DOCUMENT_ID_FIELD, ORDINAL_FIELD, SCHEMA_VERSION, TEXT_FIELD,
	TOKENIZER_VERSION,
};

const SCHEMA_FILE: &str = "lexical.json";
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Self-description written next to the tantivy files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LexicalSchema {
	pub schema_version: u32,
	pub tokenizer: String,
}

impl LexicalSchema {
	pub fn current() -> Self {
		Self { schema_version: SCHEMA_VERSION, tokenizer: TOKENIZER_VERSION.to_string() }
	}
}

/// BM25 index over the chunks of one space, stored in a single directory.
///
/// `add` stages postings in a writer; `save` commits them and refreshes the
/// reader. Searches only ever see committed state.
pub struct LexicalIndex {
	dir: PathBuf,
	index: Index,
	reader: IndexReader,
	writer: Mutex<Option<IndexWriter>>,
	chunk_id_field: Field,
	document_id_field: Field,
	ordinal_field: Field,
	text_field: Field,
}

impl LexicalIndex {
	pub fn create(dir: &Path) -> Result<Self> {
		std::fs::create_dir_all(dir)?;
		let index = Index::create_in_dir(dir, build_schema()).storage("create lexical index")?;
		std::fs::write(dir.join(SCHEMA_FILE), serde_json::to_vec_pretty(&LexicalSchema::current())?)?;
		Self::from_index(dir, index)
	}

	/// Open a persisted index, refusing ones built with another tokenizer.
	pub fn load(dir: &Path) -> Result<Self> {
		let schema_path = dir.join(SCHEMA_FILE);
		let found: LexicalSchema = serde_json::from_slice(&std::fs::read(&schema_path)?)?;
		let expected = LexicalSchema::current();
		if found != expected {
			return Err(Error::IndexSchemaMismatch(format!(
				"lexical index at {} uses tokenizer {} (schema v{}), expected {} (schema v{})",
				dir.display(), found.tokenizer, found.schema_version, expected.tokenizer, expected.schema_version
			)));
		}
		let index = Index::open_in_dir(dir).storage("open lexical index")?;
		Self::from_index(dir, index)
	}

	fn from_index(dir: &Path, index: Index) -> Result<Self> {
		register_tokenizer(&index);
		let schema = index.schema();
		let chunk_id_field = schema.get_field(CHUNK_ID_FIELD).storage("lexical schema")?;
		let document_id_field = schema.get_field(DOCUMENT_ID_FIELD).storage("lexical schema")?;
		let ordinal_field = schema.get_field(ORDINAL_FIELD).storage("lexical schema")?;
		let text_field = schema.get_field(TEXT_FIELD).storage("lexical schema")?;
		let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into().storage("open lexical reader")?;
		Ok(Self { dir: dir.to_path_buf(), index, reader, writer: Mutex::new(None), chunk_id_field, document_id_field, ordinal_field, text_field })
	}

	pub fn dir(&self) -> &Path { &self.dir }

	/// Stage chunks. A chunk id that is already indexed is replaced rather
	/// than duplicated; within one call the last occurrence of an id wins.
	pub fn add(&self, chunks: &[Chunk]) -> Result<()> {
		if chunks.is_empty() { return Ok(()); }
		let unique: BTreeMap<ChunkId, &Chunk> = chunks.iter().map(|c| (c.id, c)).collect();
		let mut guard = self.lock_writer()?;
		let writer = self.ensure_writer(&mut guard)?;
		for c in unique.values() {
			writer.delete_term(Term::from_field_u64(self.chunk_id_field, c.id));
			let doc = doc!(
				self.chunk_id_field => c.id,
				self.document_id_field => c.document_id.clone(),
				self.ordinal_field => c.ordinal as u64,
				self.text_field => c.text.clone()
			);
			writer.add_document(doc).storage("stage lexical document")?;
		}
		debug!(staged = unique.len(), dir = %self.dir.display(), "lexical chunks staged");
		Ok(())
	}

	/// Commit staged chunks to disk and make them searchable.
	pub fn save(&self) -> Result<()> {
		let staged = self.lock_writer()?.take();
		if let Some(mut writer) = staged {
			writer.commit().storage("commit lexical index")?;
			writer.wait_merging_threads().storage("finish lexical merges")?;
		}
		self.reader.reload().storage("reload lexical reader")?;
		Ok(())
	}

	/// Top `top_k` chunks by BM25, ties broken by ascending chunk id.
	#[instrument(skip(self), fields(dir = %self.dir.display()))]
	pub fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
		if top_k == 0 { return Ok(Vec::new()); }
		let tokens: BTreeSet<String> = analyze(query_text).into_iter().collect();
		if tokens.is_empty() { return Ok(Vec::new()); }
		let terms: Vec<Term> = tokens.iter().map(|t| Term::from_field_text(self.text_field, t)).collect();
		let query = BooleanQuery::new_multiterms_query(terms);

		let collector = TopDocs::with_limit(top_k).tweak_score(|segment_reader: &SegmentReader| {
			let ids = segment_reader.fast_fields().u64(CHUNK_ID_FIELD).ok();
			move |doc: DocId, score: Score| {
				let id = ids.as_ref().and_then(|col| col.first(doc)).unwrap_or(ChunkId::MAX);
				(score, Reverse(id))
			}
		});
		let searcher = self.reader.searcher();
		let top = searcher.search(&query, &collector).storage("lexical search")?;
		Ok(top.into_iter().map(|((score, Reverse(id)), _)| SearchHit { id, score, source: SourceKind::Lexical }).collect())
	}

	/// Number of committed chunks.
	pub fn len(&self) -> u64 { self.reader.searcher().num_docs() }

	pub fn is_empty(&self) -> bool { self.len() == 0 }

	fn lock_writer(&self) -> Result<MutexGuard<'_, Option<IndexWriter>>> {
		self.writer.lock().map_err(|_| Error::StorageIO("lexical writer lock poisoned".into()))
	}

	fn ensure_writer<'a>(&self, slot: &'a mut Option<IndexWriter>) -> Result<&'a mut IndexWriter> {
		if slot.is_none() {
			*slot = Some(self.index.writer_with_num_threads(1, WRITER_HEAP_BYTES).storage("open lexical writer")?);
		}
		slot.as_mut().ok_or_else(|| Error::StorageIO("lexical writer unavailable".into()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn chunk(id: ChunkId, text: &str) -> Chunk {
		Chunk { id, document_id: "doc".into(), ordinal: id as usize, text: text.into() }
	}

	#[test]
	fn staged_chunks_are_invisible_until_saved() {
		let tmp = tempfile::tempdir().unwrap();
		let index = LexicalIndex::create(tmp.path()).unwrap();
		index.add(&[chunk(1, "woodstove chimney cleaning")]).unwrap();
		assert!(index.search("chimney", 5).unwrap().is_empty());
		index.save().unwrap();
		assert_eq!(index.search("chimney", 5).unwrap().len(), 1);
	}

	#[test]
	fn readding_an_id_overwrites() {
		let tmp = tempfile::tempdir().unwrap();
		let index = LexicalIndex::create(tmp.path()).unwrap();
		index.add(&[chunk(1, "rainwater cistern")]).unwrap();
		index.save().unwrap();
		index.add(&[chunk(1, "compost toilet")]).unwrap();
		index.save().unwrap();
		assert_eq!(index.len(), 1);
		assert!(index.search("cistern", 5).unwrap().is_empty());
		assert_eq!(index.search("compost", 5).unwrap()[0].id, 1);
	}

	#[test]
	fn equal_scores_order_by_chunk_id() {
		let tmp = tempfile::tempdir().unwrap();
		let index = LexicalIndex::create(tmp.path()).unwrap();
		index.add(&[chunk(30, "goat milk"), chunk(10, "goat milk"), chunk(20, "goat milk")]).unwrap();
		index.save().unwrap();
		let ids: Vec<ChunkId> = index.search("goat", 2).unwrap().iter().map(|h| h.id).collect();
		assert_eq!(ids, vec![10, 20]);
	}

	#[test]
	fn query_of_only_stop_words_matches_nothing() {
		let tmp = tempfile::tempdir().unwrap();
		let index = LexicalIndex::create(tmp.path()).unwrap();
		index.add(&[chunk(1, "the cellar")]).unwrap();
		index.save().unwrap();
		assert!(index.search("the of and", 5).unwrap().is_empty());
		assert!(index.search("cellar", 0).unwrap().is_empty());
	}
}
