//! BM25 (Okapi) scoring for query-relevance of sentences within a chunk.
//!
//! Each chunk is treated as its own small corpus: the sentences are the
//! documents and the statistics (document frequency, average length) are
//! computed per chunk, so sentence scores are comparable within a chunk.

use std::collections::HashMap;

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// Lowercased alphanumeric tokens. Mirrors the tokenization used for
/// retrieval-side lexical scoring so scores are consistent.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// BM25 index over one chunk's sentences.
pub struct Bm25 {
    doc_tokens: Vec<Vec<String>>,
    doc_freq: HashMap<String, usize>,
    avg_len: f32,
}

impl Bm25 {
    pub fn new(documents: &[Vec<String>]) -> Self {
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for doc in documents {
            let mut seen: Vec<&String> = Vec::new();
            for token in doc {
                if !seen.contains(&token) {
                    seen.push(token);
                    *doc_freq.entry(token.clone()).or_insert(0) += 1;
                }
            }
        }
        let avg_len = if documents.is_empty() {
            0.0
        } else {
            documents.iter().map(|d| d.len() as f32).sum::<f32>() / documents.len() as f32
        };
        Self {
            doc_tokens: documents.to_vec(),
            doc_freq,
            avg_len,
        }
    }

    /// Score every document against the query tokens.
    pub fn scores(&self, query_tokens: &[String]) -> Vec<f32> {
        let n = self.doc_tokens.len() as f32;
        self.doc_tokens
            .iter()
            .map(|doc| {
                if doc.is_empty() {
                    return 0.0;
                }
                let len_norm = 1.0 - B + B * (doc.len() as f32 / self.avg_len.max(1e-6));
                query_tokens
                    .iter()
                    .map(|term| {
                        let tf = doc.iter().filter(|t| *t == term).count() as f32;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = *self.doc_freq.get(term).unwrap_or(&0) as f32;
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        idf * (tf * (K1 + 1.0)) / (tf + K1 * len_norm)
                    })
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(texts: &[&str]) -> Vec<Vec<String>> {
        texts.iter().map(|t| tokenize(t)).collect()
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Seven-Year Retention, per §4.2!"),
            vec!["seven", "year", "retention", "per", "4", "2"]
        );
        assert!(tokenize("").is_empty());
        assert!(tokenize("---").is_empty());
    }

    #[test]
    fn test_matching_sentence_outranks_unrelated() {
        let documents = docs(&[
            "Customer records are retained for seven years.",
            "The cafeteria closes at three on Fridays.",
        ]);
        let bm25 = Bm25::new(&documents);
        let scores = bm25.scores(&tokenize("retention period for customer records"));
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_no_match_scores_zero() {
        let documents = docs(&["alpha beta gamma", "delta epsilon"]);
        let bm25 = Bm25::new(&documents);
        let scores = bm25.scores(&tokenize("unrelated query terms"));
        assert!(scores.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_rare_terms_weigh_more_than_common() {
        // "records" appears everywhere; "retention" in one document only.
        let documents = docs(&[
            "records retention schedule",
            "records archive room",
            "records backup copy",
        ]);
        let bm25 = Bm25::new(&documents);
        let rare = bm25.scores(&tokenize("retention"));
        let common = bm25.scores(&tokenize("records"));
        assert!(rare[0] > common[0]);
    }

    #[test]
    fn test_empty_corpus() {
        let bm25 = Bm25::new(&[]);
        assert!(bm25.scores(&tokenize("anything")).is_empty());
    }

    #[test]
    fn test_deterministic() {
        let documents = docs(&["seven year retention", "three day turnaround"]);
        let bm25 = Bm25::new(&documents);
        let q = tokenize("seven year retention");
        assert_eq!(bm25.scores(&q), bm25.scores(&q));
    }
}
