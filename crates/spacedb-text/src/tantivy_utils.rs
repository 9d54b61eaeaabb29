use tantivy::schema::{IndexRecordOption, Schema, TextFieldIndexing, TextOptions, FAST, INDEXED, STORED, STRING};
use tantivy::tokenizer::{Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer, TokenStream};
use tantivy::Index;

pub const TOKENIZER_NAME: &str = "en_stem";
/// Bump whenever the analyzer chain below changes; persisted indexes built
/// with another version are rejected on load.
pub const TOKENIZER_VERSION: &str = "en-stem-v1";
pub const SCHEMA_VERSION: u32 = 1;

pub const CHUNK_ID_FIELD: &str = "chunk_id";
pub const DOCUMENT_ID_FIELD: &str = "document_id";
pub const ORDINAL_FIELD: &str = "ordinal";
pub const TEXT_FIELD: &str = "text";

pub fn build_schema() -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_u64_field(CHUNK_ID_FIELD, INDEXED | STORED | FAST);
	schema_builder.add_text_field(DOCUMENT_ID_FIELD, STRING | STORED);
	schema_builder.add_u64_field(ORDINAL_FIELD, STORED);
	let text_field_indexing = TextFieldIndexing::default().set_tokenizer(TOKENIZER_NAME).set_index_option(IndexRecordOption::WithFreqsAndPositions);
	let text_options = TextOptions::default().set_indexing_options(text_field_indexing).set_stored();
	schema_builder.add_text_field(TEXT_FIELD, text_options);
	schema_builder.build()
}

pub fn build_analyzer() -> TextAnalyzer {
	let stop_words = vec![
		"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
	];
	TextAnalyzer::builder(SimpleTokenizer::default())
		.filter(RemoveLongFilter::limit(40))
		.filter(LowerCaser)
		.filter(StopWordFilter::remove(stop_words.into_iter().map(|s| s.to_string())))
		.filter(Stemmer::new(Language::English))
		.build()
}

pub fn register_tokenizer(index: &Index) {
	index.tokenizers().register(TOKENIZER_NAME, build_analyzer());
}

/// Tokenize `text` exactly as the indexer does.
pub fn analyze(text: &str) -> Vec<String> {
	let mut analyzer = build_analyzer();
	let mut stream = analyzer.token_stream(text);
	let mut tokens = Vec::new();
	stream.process(&mut |token| tokens.push(token.text.clone()));
	tokens
}
