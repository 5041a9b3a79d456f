//! Token budget enforcement across compressed chunks.
//!
//! Greedy removal: while the total exceeds the budget, drop the lowest
//! BM25-scored remaining sentence across all chunks. Chunks that lose all
//! sentences are dropped entirely. Sentence order within surviving chunks
//! is preserved and the result never exceeds the budget.

use tracing::info;

use strata_core::{Chunk, CompressedContext};

use crate::compress::CompressedChunk;

/// Enforces the post-overhead context token budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBudgeter;

impl TokenBudgeter {
    pub fn new() -> Self {
        Self
    }

    /// Trim `chunks` to at most `budget` tokens.
    ///
    /// The caller passes the effective budget (prompt overhead already
    /// subtracted). Ties on score drop the sentence from the later chunk,
    /// later position, so the most-leading context survives; this keeps
    /// the operation deterministic.
    pub fn enforce(&self, mut chunks: Vec<CompressedChunk>, budget: usize) -> CompressedContext {
        let mut total: usize = chunks.iter().map(|c| c.total_tokens()).sum();
        let mut dropped: usize = chunks.iter().map(|c| c.dropped_sentences).sum();

        while total > budget {
            let Some((chunk_idx, sent_idx)) = lowest_scored_sentence(&chunks) else {
                break;
            };
            let removed = chunks[chunk_idx].sentences.remove(sent_idx);
            total -= removed.tokens;
            dropped += 1;
        }

        let ordered_chunks: Vec<Chunk> = chunks
            .iter()
            .filter(|c| !c.sentences.is_empty())
            .map(|c| Chunk {
                text: c.rebuild_text(),
                ..c.source.clone()
            })
            .collect();

        info!(
            output_chunks = ordered_chunks.len(),
            total_tokens = total,
            budget,
            dropped_sentences = dropped,
            "token budget enforced"
        );

        CompressedContext {
            ordered_chunks,
            dropped_sentence_count: dropped,
            total_tokens: total,
        }
    }
}

/// Position of the globally lowest-scored sentence; ties resolve to the
/// later chunk and later sentence.
fn lowest_scored_sentence(chunks: &[CompressedChunk]) -> Option<(usize, usize)> {
    let mut lowest: Option<(usize, usize, f32)> = None;
    for (ci, chunk) in chunks.iter().enumerate() {
        for (si, sentence) in chunk.sentences.iter().enumerate() {
            let replace = match lowest {
                None => true,
                Some((_, _, score)) => sentence.score <= score,
            };
            if replace {
                lowest = Some((ci, si, sentence.score));
            }
        }
    }
    lowest.map(|(ci, si, _)| (ci, si))
}
