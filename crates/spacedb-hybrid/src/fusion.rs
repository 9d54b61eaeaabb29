// Reciprocal Rank Fusion (RRF)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use spacedb_core::types::{ChunkId, SearchHit};

/// Standard RRF smoothing constant (Cormack, Clarke and Buettcher, SIGIR 2009).
pub const RRF_K: u32 = 60;

/// One fused result with the 1-indexed ranks it held in each input list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedHit {
    pub id: ChunkId,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// Combine a lexical and a vector ranking.
///
/// RRF_score(d) = sum over rankers of 1 / (k + rank(d)), rank 1-indexed.
/// Only ranks matter, never the engine scores. Output is sorted by fused
/// score descending, ties by ascending chunk id, and truncated to `top_k`.
/// An id listed twice in one ranking counts once, at its best rank.
pub fn reciprocal_rank_fusion(lexical: &[SearchHit], vector: &[SearchHit], k: u32, top_k: usize) -> Vec<FusedHit> {
    let mut fused: HashMap<ChunkId, FusedHit> = HashMap::new();

    for (rank, hit) in lexical.iter().enumerate() {
        let entry = fused.entry(hit.id).or_insert_with(|| FusedHit { id: hit.id, score: 0.0, lexical_rank: None, vector_rank: None });
        if entry.lexical_rank.is_none() {
            entry.lexical_rank = Some(rank + 1);
            entry.score += contribution(k, rank + 1);
        }
    }
    for (rank, hit) in vector.iter().enumerate() {
        let entry = fused.entry(hit.id).or_insert_with(|| FusedHit { id: hit.id, score: 0.0, lexical_rank: None, vector_rank: None });
        if entry.vector_rank.is_none() {
            entry.vector_rank = Some(rank + 1);
            entry.score += contribution(k, rank + 1);
        }
    }

    let mut combined: Vec<FusedHit> = fused.into_values().collect();
    combined.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    combined.truncate(top_k);
    combined
}

fn contribution(k: u32, rank: usize) -> f64 {
    1.0 / (f64::from(k) + rank as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacedb_core::types::SourceKind;

    fn ranked(ids: &[ChunkId], source: SourceKind) -> Vec<SearchHit> {
        ids.iter().enumerate().map(|(i, &id)| SearchHit { id, score: 100.0 - i as f32, source }).collect()
    }

    #[test]
    fn fixed_example_order_and_arithmetic() {
        // ids: B=7, A=11, C=12, D=13
        let lexical = ranked(&[11, 7, 12], SourceKind::Lexical);
        let vector = ranked(&[7, 11, 13], SourceKind::Vector);
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K, 10);

        let ids: Vec<ChunkId> = fused.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![7, 11, 12, 13]);

        let both = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].score - both).abs() < 1e-12);
        assert_eq!(fused[0].score, fused[1].score, "A and B hold mirrored ranks");
        assert!((fused[2].score - 1.0 / 63.0).abs() < 1e-12);
        assert!((fused[3].score - 1.0 / 63.0).abs() < 1e-12);
        assert_eq!((fused[1].lexical_rank, fused[1].vector_rank), (Some(1), Some(2)));
        assert_eq!((fused[3].lexical_rank, fused[3].vector_rank), (None, Some(3)));
    }

    #[test]
    fn presence_in_both_lists_beats_single_top_rank() {
        let lexical = ranked(&[1, 2, 3], SourceKind::Lexical);
        let vector = ranked(&[4, 5, 3], SourceKind::Vector);
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K, 1);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].id, 3);
    }

    #[test]
    fn single_ranker_preserves_order() {
        let vector = ranked(&[9, 2, 5], SourceKind::Vector);
        let fused = reciprocal_rank_fusion(&[], &vector, RRF_K, 10);
        assert_eq!(fused.iter().map(|h| h.id).collect::<Vec<_>>(), vec![9, 2, 5]);
        assert!(fused.iter().all(|h| h.lexical_rank.is_none()));
    }

    #[test]
    fn empty_inputs_and_zero_top_k() {
        assert!(reciprocal_rank_fusion(&[], &[], RRF_K, 5).is_empty());
        let lexical = ranked(&[1], SourceKind::Lexical);
        assert!(reciprocal_rank_fusion(&lexical, &[], RRF_K, 0).is_empty());
    }

    #[test]
    fn duplicate_id_in_one_list_counts_once() {
        let lexical = ranked(&[4, 4], SourceKind::Lexical);
        let fused = reciprocal_rank_fusion(&lexical, &[], RRF_K, 5);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }
}
