//! Reciprocal Rank Fusion (RRF) for combining per-query result lists.

use std::collections::HashMap;

use tracing::debug;

use strata_core::Chunk;

/// RRF constant. K=60 is the original Cormack et al. (2009) default;
/// higher values dampen the influence of top-ranked items, which suits
/// multi-query expansion where individual lists are noisy paraphrase
/// retrievals rather than independent retrieval systems.
pub const RRF_K: f32 = 60.0;

/// One fused result: the chunk payload plus its fused score.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub chunk: Chunk,
    pub fused_score: f32,
}

/// Fuse multiple ranked lists using Reciprocal Rank Fusion.
///
/// For each chunk, `fused = Σ 1/(K + rank_i)` where `rank_i` is its
/// 1-based rank in list i (absent lists contribute nothing). Output is
/// sorted by fused score descending; ties break by the chunk's highest
/// original retrieval score across lists. The first occurrence of a chunk
/// provides its payload, except `score`, which keeps the maximum retrieval
/// score seen anywhere.
pub fn rrf_fuse(ranked_lists: Vec<Vec<Chunk>>) -> Vec<FusedHit> {
    let num_lists = ranked_lists.len();
    let mut fused_scores: HashMap<String, f32> = HashMap::new();
    let mut best_retrieval: HashMap<String, f32> = HashMap::new();
    let mut payloads: HashMap<String, Chunk> = HashMap::new();
    // Insertion order for a stable final sort
    let mut order: Vec<String> = Vec::new();

    for list in ranked_lists {
        for (rank_zero_based, chunk) in list.into_iter().enumerate() {
            let rank = rank_zero_based as f32 + 1.0;
            let key = chunk.chunk_id.clone();
            *fused_scores.entry(key.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank);

            let best = best_retrieval.entry(key.clone()).or_insert(f32::MIN);
            if chunk.score > *best {
                *best = chunk.score;
            }

            if !payloads.contains_key(&key) {
                order.push(key.clone());
                payloads.insert(key, chunk);
            }
        }
    }

    let mut results: Vec<FusedHit> = order
        .into_iter()
        .map(|key| {
            let fused_score = fused_scores[&key];
            let mut chunk = payloads.remove(&key).expect("payload recorded for key");
            chunk.score = best_retrieval[&key];
            FusedHit { chunk, fused_score }
        })
        .collect();

    results.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.chunk
                    .score
                    .partial_cmp(&a.chunk.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    debug!(
        input_lists = num_lists,
        rrf_k = RRF_K,
        result_count = results.len(),
        "RRF fusion complete"
    );

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, score: f32) -> Chunk {
        Chunk {
            vector_id: format!("v-{}", id),
            doc_id: "d1".to_string(),
            chunk_id: id.to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: format!("text of {}", id),
            score,
            embedding: None,
            source_url: None,
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(rrf_fuse(vec![]).is_empty());
        assert!(rrf_fuse(vec![vec![], vec![]]).is_empty());
    }

    #[test]
    fn test_single_list_preserves_order() {
        let fused = rrf_fuse(vec![vec![chunk("a", 0.9), chunk("b", 0.8), chunk("c", 0.7)]]);
        let ids: Vec<&str> = fused.iter().map(|h| h.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rank_one_everywhere_strictly_wins() {
        // "a" is rank 1 in every list; nothing can tie it.
        let lists = vec![
            vec![chunk("a", 0.5), chunk("b", 0.9)],
            vec![chunk("a", 0.4), chunk("c", 0.95)],
            vec![chunk("a", 0.3), chunk("b", 0.85)],
        ];
        let fused = rrf_fuse(lists);
        assert_eq!(fused[0].chunk.chunk_id, "a");
        assert!(fused[0].fused_score > fused[1].fused_score);
    }

    #[test]
    fn test_fused_score_formula() {
        // "a": rank 1 in one list -> 1/61; "b": rank 2 -> 1/62
        let fused = rrf_fuse(vec![vec![chunk("a", 0.9), chunk("b", 0.8)]]);
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-6);
        assert!((fused[1].fused_score - 1.0 / 62.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_list_accumulation() {
        // "b" appears in both lists (ranks 2 and 1), "a" and "c" once each.
        let lists = vec![
            vec![chunk("a", 0.9), chunk("b", 0.8)],
            vec![chunk("b", 0.95), chunk("c", 0.85)],
        ];
        let fused = rrf_fuse(lists);
        assert_eq!(fused[0].chunk.chunk_id, "b");
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].fused_score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_tie_broken_by_retrieval_score() {
        // "a" and "b" both rank 1 in one list each: equal fused scores.
        let lists = vec![vec![chunk("a", 0.6)], vec![chunk("b", 0.9)]];
        let fused = rrf_fuse(lists);
        assert_eq!(fused[0].chunk.chunk_id, "b");
        assert_eq!(fused[1].chunk.chunk_id, "a");
    }

    #[test]
    fn test_score_keeps_cross_list_maximum() {
        let lists = vec![
            vec![chunk("a", 0.4)],
            vec![chunk("a", 0.9)],
        ];
        let fused = rrf_fuse(lists);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].chunk.score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_disjoint_lists_all_present() {
        let lists = vec![
            vec![chunk("a", 0.9), chunk("b", 0.8)],
            vec![chunk("c", 0.95), chunk("d", 0.85)],
        ];
        let fused = rrf_fuse(lists);
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn test_output_sorted_descending() {
        let lists = vec![
            vec![chunk("a", 0.9), chunk("b", 0.8), chunk("c", 0.7)],
            vec![chunk("c", 0.95), chunk("a", 0.85)],
        ];
        let fused = rrf_fuse(lists);
        for pair in fused.windows(2) {
            assert!(pair[0].fused_score >= pair[1].fused_score);
        }
    }
}
