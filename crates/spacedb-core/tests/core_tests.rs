use spacedb_core::chunker::{Chunker, ChunkingConfig};
use spacedb_core::config::Config;

#[test]
fn chunk_single_small_document() {
    let chunker = Chunker::default();
    let chunks = chunker.chunk("Short text\n");

    assert_eq!(chunks.len(), 1, "one small paragraph becomes one chunk");
    assert_eq!(chunks[0].text, "Short text");
}

#[test]
fn chunks_cover_long_document_without_gaps() {
    let sentence = "Solar panels convert sunlight into electricity for the homestead battery bank. ";
    let text = sentence.repeat(200);
    let chunker = Chunker::new(ChunkingConfig { max_tokens: 64, overlap_tokens: 8 }).expect("chunker");
    let chunks = chunker.chunk(&text);

    assert!(chunks.len() > 1);
    // consecutive chunks either overlap or are separated by whitespace only
    for pair in chunks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(b.start <= a.end || text[a.end..b.start].trim().is_empty());
    }
    assert_eq!(chunks[0].start, 0);
    assert_eq!(chunks.last().unwrap().end, text.trim_end().len());
    for (i, c) in chunks.iter().enumerate() { assert_eq!(c.ordinal, i); }
}

#[test]
fn chunker_built_from_settings() {
    let settings = Config::from_toml_str("[chunking]\nmax_tokens = 16\noverlap_tokens = 4\n").settings().expect("settings");
    let chunker = Chunker::new(ChunkingConfig {
        max_tokens: settings.chunking.max_tokens,
        overlap_tokens: settings.chunking.overlap_tokens,
    })
    .expect("chunker");
    assert_eq!(chunker.config().max_tokens, 16);
}

#[test]
fn env_and_profile_files_layer_over_config_toml() {
    figment::Jail::expect_with(|jail| {
        jail.create_file("config.toml", "[retrieval]\ntop_k = 7\noverfetch = 4\n")?;
        jail.create_file("config.test.toml", "[retrieval]\noverfetch = 3\n")?;
        jail.set_env("RUST_ENV", "test");
        jail.set_env("APP_RETRIEVAL__TIMEOUT_MS", "250");
        let settings = Config::load().map_err(|e| e.to_string())?.settings().map_err(|e| e.to_string())?;
        assert_eq!(settings.retrieval.top_k, 7);
        assert_eq!(settings.retrieval.overfetch, 3);
        assert_eq!(settings.retrieval.timeout_ms, 250);
        Ok(())
    });
}

#[test]
fn production_refuses_hash_embeddings() {
    figment::Jail::expect_with(|jail| {
        jail.set_env("RUST_ENV", "prod");
        jail.set_env("APP_EMBEDDING__BACKEND", "hash");
        assert!(Config::load().is_err());
        Ok(())
    });
}
