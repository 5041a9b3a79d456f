//! BM25 sentence compression.
//!
//! Splits each chunk into sentences, scores them against the query with
//! per-chunk BM25 statistics, and keeps the top `sentences_per_chunk` in
//! their original order. The budgeter then trims across chunks.

use tracing::{debug, info};

use strata_core::{Chunk, Tokenizer};

use crate::bm25::{tokenize, Bm25};
use crate::sentence::split_sentences;

/// One sentence surviving compression, with its relevance score and the
/// bookkeeping the budgeter needs.
#[derive(Debug, Clone)]
pub struct ScoredSentence {
    pub text: String,
    pub score: f32,
    pub tokens: usize,
    /// Position within the source chunk; ordering key.
    pub index: usize,
}

/// A chunk reduced to its query-relevant sentences.
#[derive(Debug, Clone)]
pub struct CompressedChunk {
    pub source: Chunk,
    pub sentences: Vec<ScoredSentence>,
    pub dropped_sentences: usize,
}

impl CompressedChunk {
    pub fn total_tokens(&self) -> usize {
        self.sentences.iter().map(|s| s.tokens).sum()
    }

    /// Rebuild the chunk text from surviving sentences, original order.
    pub fn rebuild_text(&self) -> String {
        self.sentences
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Query-relevance sentence compressor.
pub struct Compressor {
    sentences_per_chunk: usize,
}

impl Compressor {
    pub fn new(sentences_per_chunk: usize) -> Self {
        Self {
            sentences_per_chunk: sentences_per_chunk.max(1),
        }
    }

    /// Compress each chunk to its top sentences by BM25 relevance to the
    /// query. Sentence order within a chunk is preserved. Deterministic:
    /// score ties keep the earlier sentence.
    pub fn compress(
        &self,
        query: &str,
        chunks: &[Chunk],
        tokenizer: &dyn Tokenizer,
    ) -> Vec<CompressedChunk> {
        let query_tokens = tokenize(query);
        let mut compressed = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let sentences = split_sentences(&chunk.text);
            if sentences.is_empty() {
                compressed.push(CompressedChunk {
                    source: chunk.clone(),
                    sentences: Vec::new(),
                    dropped_sentences: 0,
                });
                continue;
            }

            let docs: Vec<Vec<String>> = sentences.iter().map(|s| tokenize(s)).collect();
            let scores = Bm25::new(&docs).scores(&query_tokens);

            // Rank sentence indices by score descending, earlier index on tie.
            let mut ranked: Vec<usize> = (0..sentences.len()).collect();
            ranked.sort_by(|a, b| {
                scores[*b]
                    .partial_cmp(&scores[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(b))
            });
            let keep: Vec<usize> = {
                let mut top: Vec<usize> =
                    ranked.into_iter().take(self.sentences_per_chunk).collect();
                top.sort_unstable();
                top
            };

            debug!(
                chunk_id = %chunk.chunk_id,
                total = sentences.len(),
                kept = keep.len(),
                "bm25 sentence selection"
            );

            let dropped = sentences.len() - keep.len();
            let kept_sentences: Vec<ScoredSentence> = keep
                .into_iter()
                .map(|i| ScoredSentence {
                    tokens: tokenizer.count_tokens(&sentences[i]),
                    text: sentences[i].clone(),
                    score: scores[i],
                    index: i,
                })
                .collect();

            compressed.push(CompressedChunk {
                source: chunk.clone(),
                sentences: kept_sentences,
                dropped_sentences: dropped,
            });
        }

        info!(
            input_chunks = chunks.len(),
            output_chunks = compressed.len(),
            "bm25 compression complete"
        );
        compressed
    }
}
