mod common;

use spacedb_core::ErrorKind;
use spacedb_hybrid::SpaceState;

use common::{concept_db, docs};

const MITO: &str = "The mitochondria is the powerhouse of the cell.";
const PLANTS: &str = "Photosynthesis in plants happens inside chloroplasts using sunlight.";
const RIBO: &str = "Ribosomes assemble proteins from amino acids.";

#[tokio::test]
async fn mitochondria_answers_energy_question() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    let report = db.ingest(1, &docs(&[MITO, PLANTS, RIBO])).await.expect("ingest");
    assert_eq!(report.chunks_added, 3);

    let hits = db.query(1, "what produces energy in a cell", Some(3)).await.expect("query");
    assert_eq!(hits[0].text, MITO);
    assert_eq!(hits[0].lexical_rank, Some(1));
    assert_eq!(hits[0].vector_rank, Some(1));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn paraphrase_found_through_vectors_alone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    db.ingest(1, &docs(&[MITO, PLANTS, RIBO])).await.expect("ingest");

    // no query term occurs in any document
    let hits = db.query(1, "what produces energy", Some(1)).await.expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, MITO);
    assert_eq!(hits[0].lexical_rank, None);
    assert_eq!(hits[0].vector_rank, Some(1));
}

#[tokio::test]
async fn rare_proper_noun_surfaces_through_lexical_path() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    let rare = "Zyxwort hollow is where the old mill stood.";
    let texts = [
        MITO,
        PLANTS,
        RIBO,
        "Cells divide and every cell copies its organelle set.",
        "Sunlight gives plants the energy to grow.",
        "Amino acids fold into proteins inside cells.",
        rare,
        "Mitochondria produce ATP as fuel for the cell.",
        "Chloroplasts in plants capture sunlight.",
        "Protein synthesis needs power from mitochondria.",
    ];
    assert_eq!(db.ingest(4, &docs(&texts)).await.expect("ingest").chunks_added, 10);

    let hits = db.query(4, "Zyxwort history", Some(3)).await.expect("query");
    let found = hits.iter().find(|h| h.text == rare).expect("rare chunk in top 3");
    assert_eq!(found.lexical_rank, Some(1));
}

#[tokio::test]
async fn reingesting_a_document_adds_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    assert_eq!(db.ingest(1, &docs(&[MITO])).await.expect("ingest").chunks_added, 1);
    assert_eq!(db.ingest(1, &docs(&[MITO])).await.expect("ingest").chunks_added, 0);
    assert_eq!(db.ingest(1, &docs(&[MITO, RIBO, RIBO])).await.expect("ingest").chunks_added, 1);

    db.ingest(2, &docs(&[MITO, RIBO])).await.expect("ingest");

    let a = db.query(1, "cell proteins", Some(5)).await.expect("query");
    let b = db.query(2, "cell proteins", Some(5)).await.expect("query");
    let strip = |hits: &[spacedb_hybrid::QueryHit]| hits.iter().map(|h| (h.text.clone(), h.score)).collect::<Vec<_>>();
    assert_eq!(strip(&a), strip(&b));

    let stats = db.stats(1).await.expect("stats");
    assert_eq!((stats.documents, stats.chunks, stats.generation), (2, 2, 2));
}

#[tokio::test]
async fn spaces_do_not_see_each_other() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    db.ingest(1, &docs(&[MITO])).await.expect("ingest");
    db.ingest(2, &docs(&[PLANTS])).await.expect("ingest");

    let hits = db.query(2, "mitochondria cell", Some(5)).await.expect("query");
    assert!(hits.iter().all(|h| h.text == PLANTS));
}

#[tokio::test]
async fn unknown_space_is_not_indexed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    let err = db.query(99, "anything", None).await.expect_err("not indexed");
    assert_eq!(err.kind(), ErrorKind::SpaceNotIndexed);
    assert_eq!(db.stats(99).await.expect_err("not indexed").kind(), ErrorKind::SpaceNotIndexed);
    assert_eq!(db.state(99).expect("state"), SpaceState::Uninitialized);
}

#[tokio::test]
async fn empty_inputs_are_not_errors() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    assert_eq!(db.ingest(1, &[]).await.expect("ingest").chunks_added, 0);
    assert_eq!(db.ingest(1, &docs(&["   \n\n "])).await.expect("ingest").chunks_added, 0);
    assert_eq!(db.state(1).expect("state"), SpaceState::Uninitialized);

    db.ingest(1, &docs(&[MITO])).await.expect("ingest");
    assert!(db.query(1, "   ", None).await.expect("query").is_empty());
    assert!(db.query(1, "cell", Some(0)).await.expect("query").is_empty());
}

#[tokio::test]
async fn long_document_is_chunked_with_provenance() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = concept_db(tmp.path());
    let mut text = "Goats graze the upper pasture while the creek runs clear. ".repeat(40);
    text.push_str("The Zebulon generator produces power at night.");
    let added = db.ingest(1, &[text]).await.expect("ingest").chunks_added;
    assert!(added > 1);

    let hits = db.query(1, "Zebulon power", Some(1)).await.expect("query");
    assert_eq!(hits[0].ordinal, added - 1);
    assert!(hits[0].text.ends_with("power at night."));
    let stats = db.stats(1).await.expect("stats");
    assert_eq!(stats.chunks, added as u64);
    assert_eq!(stats.documents, 1);
}
