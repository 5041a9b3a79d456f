//! Semantic query routing.
//!
//! Routes are scored by max cosine similarity between the query embedding
//! and each route's pre-embedded example utterances. Max-sim rather than
//! mean-sim: an utterance set spans many phrasings and the query only
//! needs to match one of them well.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use strata_core::{
    cosine_similarity, EmbeddingService, Error, Result, RouteDecision, RouteKind, RoutingConfig,
    Vector,
};

struct RouteEntry {
    kind: RouteKind,
    utterances: Vec<String>,
    embeddings: Vec<Vector>,
}

/// Query router over config-declared utterance sets.
pub struct Router {
    threshold: f32,
    default_route: RouteKind,
    embedder: Arc<dyn EmbeddingService>,
    routes: Vec<RouteEntry>,
}

impl Router {
    /// Embed every utterance once and build the router. Fails fast on an
    /// unusable embedding backend so startup surfaces the problem.
    pub async fn build(
        config: &RoutingConfig,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Result<Self> {
        let mut routes = Vec::with_capacity(config.utterances.len());
        // BTreeMap iteration is already the deterministic tie-break order:
        // RouteKind orders by wire name.
        for (kind, utterances) in &config.utterances {
            let embeddings = embedder.embed_batch(utterances).await?;
            routes.push(RouteEntry {
                kind: *kind,
                utterances: utterances.clone(),
                embeddings,
            });
        }
        if routes.is_empty() {
            return Err(Error::Config("routing.utterances is empty".into()));
        }
        info!(
            num_routes = routes.len(),
            total_utterances = routes.iter().map(|r| r.utterances.len()).sum::<usize>(),
            "query router initialized"
        );
        Ok(Self {
            threshold: config.threshold,
            default_route: config.default_route,
            embedder,
            routes,
        })
    }

    /// Route a query. Deterministic for a fixed config and embedder: the
    /// best max-sim wins, strict inequality, so the alphabetically first
    /// route takes any exact tie.
    pub async fn route(&self, text: &str) -> Result<RouteDecision> {
        let query_vec = self.embedder.embed(text).await?;

        let mut scores: BTreeMap<String, f32> = BTreeMap::new();
        let mut best: Option<(RouteKind, f32, Option<String>)> = None;

        for entry in &self.routes {
            let mut max_sim = 0.0f32;
            let mut matched: Option<String> = None;
            for (utterance, embedding) in entry.utterances.iter().zip(entry.embeddings.iter()) {
                let sim = cosine_similarity(&query_vec, embedding).clamp(0.0, 1.0);
                if sim > max_sim {
                    max_sim = sim;
                    matched = Some(utterance.clone());
                }
            }
            scores.insert(entry.kind.as_str().to_string(), max_sim);
            let is_better = match &best {
                None => true,
                Some((_, best_sim, _)) => max_sim > *best_sim,
            };
            if is_better {
                best = Some((entry.kind, max_sim, matched));
            }
        }

        let (best_kind, confidence, matched_utterance) =
            best.expect("router holds at least one route");

        let route_kind = if confidence < self.threshold {
            debug!(
                best_route = %best_kind,
                confidence,
                threshold = self.threshold,
                fallback = %self.default_route,
                "route below threshold"
            );
            self.default_route
        } else {
            best_kind
        };

        info!(
            route = %route_kind,
            confidence,
            "query routed"
        );

        Ok(RouteDecision {
            route_kind,
            confidence,
            scores,
            matched_utterance,
        })
    }
}
