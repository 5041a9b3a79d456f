//! Near-duplicate chunk removal.
//!
//! Multi-query retrieval routinely surfaces the same passage under
//! different paraphrases, and ingestion overlap produces near-identical
//! chunks across documents. Greedy acceptance in descending score order
//! keeps the best representative of each duplicate cluster.

use std::collections::HashSet;

use tracing::{debug, info};

use strata_core::{cosine_similarity, Chunk};

/// Remove chunks whose similarity to an already-accepted chunk exceeds
/// `threshold`.
///
/// Iterates in descending retrieval score (ties: lower lexicographic
/// `chunk_id` first), so the higher-score chunk of any conflicting pair is
/// kept. Similarity is embedding cosine when both sides carry embeddings;
/// otherwise a character-trigram Jaccard proxy over the texts.
///
/// O(n²) pairwise comparison is acceptable: n is bounded by
/// `top_k × (1 + expansion variants)`.
pub fn dedup(chunks: Vec<Chunk>, threshold: f32) -> Vec<Chunk> {
    if chunks.len() <= 1 {
        return chunks;
    }
    let input_count = chunks.len();

    // Identical chunk ids are the same stored passage; keep one.
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut unique: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if seen_ids.insert(chunk.chunk_id.clone()) {
            unique.push(chunk);
        }
    }

    unique.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let mut accepted: Vec<Chunk> = Vec::with_capacity(unique.len());
    for candidate in unique {
        let duplicate_of = accepted
            .iter()
            .map(|kept| chunk_similarity(&candidate, kept))
            .enumerate()
            .find(|(_, sim)| *sim > threshold);
        match duplicate_of {
            Some((idx, sim)) => {
                debug!(
                    chunk_id = %candidate.chunk_id,
                    kept = %accepted[idx].chunk_id,
                    similarity = sim,
                    "near-duplicate dropped"
                );
            }
            None => accepted.push(candidate),
        }
    }

    info!(
        input_count,
        output_count = accepted.len(),
        removed = input_count - accepted.len(),
        "deduplication complete"
    );
    accepted
}

/// Embedding cosine when available on both chunks, else trigram Jaccard.
fn chunk_similarity(a: &Chunk, b: &Chunk) -> f32 {
    match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine_similarity(ea, eb),
        _ => trigram_similarity(&a.text, &b.text),
    }
}

/// Character trigram Jaccard similarity, a fast lexical proxy for
/// semantic similarity when embeddings are absent.
fn trigram_similarity(a: &str, b: &str) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let grams_a = trigrams(a);
    let grams_b = trigrams(b);
    if grams_a.is_empty() || grams_b.is_empty() {
        // Both shorter than one trigram: exact comparison is all we have.
        return if a == b { 1.0 } else { 0.0 };
    }
    let intersection = grams_a.intersection(&grams_b).count();
    let union = grams_a.union(&grams_b).count();
    intersection as f32 / union as f32
}

fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, score: f32, text: &str) -> Chunk {
        Chunk {
            vector_id: format!("v-{}", id),
            doc_id: "d1".to_string(),
            chunk_id: id.to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            score,
            embedding: None,
            source_url: None,
        }
    }

    fn chunk_with_embedding(id: &str, score: f32, embedding: Vec<f32>) -> Chunk {
        Chunk {
            embedding: Some(embedding),
            ..chunk(id, score, "distinct filler text for this chunk")
        }
    }

    #[test]
    fn test_empty_and_single_pass_through() {
        assert!(dedup(vec![], 0.95).is_empty());
        let out = dedup(vec![chunk("a", 0.9, "text")], 0.95);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_identical_chunk_ids_collapse() {
        let out = dedup(
            vec![chunk("a", 0.9, "same text"), chunk("a", 0.7, "same text")],
            0.95,
        );
        assert_eq!(out.len(), 1);
        assert!((out[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_near_duplicate_text_dropped_keeping_higher_score() {
        let text = "The retention period for customer records is seven years from contract end.";
        let near = "The retention period for customer records is seven years from contract end!";
        let out = dedup(vec![chunk("low", 0.6, near), chunk("high", 0.9, text)], 0.8);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chunk_id, "high");
    }

    #[test]
    fn test_distinct_texts_survive() {
        let out = dedup(
            vec![
                chunk("a", 0.9, "Customer records are retained seven years."),
                chunk("b", 0.8, "Expense reports must be filed within thirty days."),
            ],
            0.95,
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_embedding_cosine_preferred_over_text_proxy() {
        // Texts are different, embeddings identical: must dedup on cosine.
        let out = dedup(
            vec![
                chunk_with_embedding("a", 0.9, vec![1.0, 0.0, 0.0]),
                Chunk {
                    text: "completely different wording here".to_string(),
                    ..chunk_with_embedding("b", 0.8, vec![1.0, 0.0, 0.0])
                },
            ],
            0.95,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chunk_id, "a");
    }

    #[test]
    fn test_orthogonal_embeddings_survive() {
        let out = dedup(
            vec![
                chunk_with_embedding("a", 0.9, vec![1.0, 0.0, 0.0]),
                chunk_with_embedding("b", 0.8, vec![0.0, 1.0, 0.0]),
            ],
            0.95,
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_score_tie_breaks_by_lower_chunk_id() {
        let text_a = "Identical content appears in both of these retrieved chunks today.";
        let out = dedup(
            vec![chunk("zz", 0.8, text_a), chunk("aa", 0.8, text_a)],
            0.8,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chunk_id, "aa");
    }

    #[test]
    fn test_idempotence() {
        let chunks = vec![
            chunk("a", 0.9, "Customer records are retained seven years from contract end."),
            chunk("b", 0.85, "Customer records are retained seven years from contract end?"),
            chunk("c", 0.7, "Vendors must complete a security review before onboarding."),
        ];
        let once = dedup(chunks, 0.8);
        let twice = dedup(once.clone(), 0.8);
        let ids_once: Vec<&str> = once.iter().map(|c| c.chunk_id.as_str()).collect();
        let ids_twice: Vec<&str> = twice.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids_once, ids_twice);
    }

    #[test]
    fn test_output_sorted_by_score_descending() {
        let out = dedup(
            vec![
                chunk("a", 0.5, "First distinct passage about retention."),
                chunk("b", 0.9, "Second distinct passage about vendor onboarding."),
                chunk("c", 0.7, "Third distinct passage about expense policy."),
            ],
            0.95,
        );
        let scores: Vec<f32> = out.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn test_trigram_similarity_bounds() {
        assert_eq!(trigram_similarity("", "anything"), 0.0);
        assert!((trigram_similarity("abcdef", "abcdef") - 1.0).abs() < 1e-6);
        assert!(trigram_similarity("abcdef", "uvwxyz") < 0.01);
        assert_eq!(trigram_similarity("ab", "ab"), 1.0);
        assert_eq!(trigram_similarity("ab", "cd"), 0.0);
    }
}
