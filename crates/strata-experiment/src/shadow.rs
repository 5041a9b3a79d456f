//! Shadow mode: fire-and-forget candidate execution.
//!
//! After the primary request finalizes, a gated background task re-runs
//! only Generation + Grounding with the candidate model, reusing the
//! primary's compressed context. The shadow writes its own trace tagged
//! `variant="shadow"` and its own metrics; it shares no mutable state with
//! the primary and nothing it does can affect the primary response.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use rand::Rng;
use tracing::{info, warn};

use strata_core::{
    CompressedContext, GenerationRequest, GroundingScorer, GroundingVerdict, LlmClient,
    MetricSink, PipelineConfig, RequestContext, Result, SpanRecorder, SpanStatus, Trace,
    TraceSink,
};
use strata_observe::names;

/// Rolling latency window length for the circuit breaker.
const LATENCY_WINDOW: usize = 100;

/// Everything the shadow fork needs from the primary request.
#[derive(Debug, Clone)]
pub struct ShadowInput {
    pub primary_trace_id: String,
    pub query_text: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub tenant_id: String,
    pub context: CompressedContext,
    pub system_prompt: String,
    pub primary_latency_ms: u64,
}

/// Gated shadow executor. Process-local state only; multi-process budget
/// coordination is out of scope.
pub struct ShadowRunner {
    config: Arc<PipelineConfig>,
    llm: Arc<dyn LlmClient>,
    grounding: Arc<dyn GroundingScorer>,
    traces: Arc<dyn TraceSink>,
    metrics: Arc<dyn MetricSink>,
    /// Cumulative spend in micro-USD; atomic so forks never race the gate.
    spend_microusd: AtomicU64,
    inflight: AtomicUsize,
    dropped: AtomicU64,
    primary_latencies: Mutex<VecDeque<f64>>,
    shadow_latencies: Mutex<VecDeque<f64>>,
}

impl ShadowRunner {
    pub fn new(
        config: Arc<PipelineConfig>,
        llm: Arc<dyn LlmClient>,
        grounding: Arc<dyn GroundingScorer>,
        traces: Arc<dyn TraceSink>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            config,
            llm,
            grounding,
            traces,
            metrics,
            spend_microusd: AtomicU64::new(0),
            inflight: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            primary_latencies: Mutex::new(VecDeque::new()),
            shadow_latencies: Mutex::new(VecDeque::new()),
        }
    }

    pub fn budget_spent_usd(&self) -> f64 {
        self.spend_microusd.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    pub fn budget_remaining_usd(&self) -> f64 {
        (self.config.shadow.budget_usd - self.budget_spent_usd()).max(0.0)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Whether the rolling latency comparison currently trips the breaker.
    pub fn circuit_open(&self) -> bool {
        let primary = self.primary_latencies.lock().unwrap();
        let shadow = self.shadow_latencies.lock().unwrap();
        if primary.is_empty() || shadow.is_empty() {
            return false;
        }
        let mean_primary: f64 = primary.iter().sum::<f64>() / primary.len() as f64;
        let mean_shadow: f64 = shadow.iter().sum::<f64>() / shadow.len() as f64;
        mean_shadow > mean_primary * self.config.shadow.circuit_multiplier
    }

    fn record_latency(window: &Mutex<VecDeque<f64>>, latency_ms: f64) {
        let mut guard = window.lock().unwrap();
        guard.push_back(latency_ms);
        while guard.len() > LATENCY_WINDOW {
            guard.pop_front();
        }
    }

    /// Fork the shadow task if every gate passes, in order: enabled,
    /// sample rate, budget, circuit breaker, inflight cap. Returns the
    /// task handle so tests can await completion; the orchestrator drops
    /// it (fire-and-forget).
    pub fn maybe_fork(self: &Arc<Self>, input: ShadowInput) -> Option<tokio::task::JoinHandle<()>> {
        Self::record_latency(&self.primary_latencies, input.primary_latency_ms as f64);

        if !self.config.shadow.enabled {
            return None;
        }
        if rand::thread_rng().gen::<f64>() >= self.config.shadow.sample_rate {
            return None;
        }
        if self.budget_spent_usd() >= self.config.shadow.budget_usd {
            info!(reason = "budget_exhausted", "shadow fork skipped");
            return None;
        }
        if self.circuit_open() {
            info!(reason = "circuit_breaker_open", "shadow fork skipped");
            return None;
        }

        // Claim an inflight slot; drop the fork when the cap is reached.
        let claimed = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.config.shadow.max_inflight).then_some(current + 1)
            });
        if claimed.is_err() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            self.metrics.inc(names::SHADOW_DROPPED_TOTAL, &[], 1);
            info!(reason = "max_inflight", "shadow fork dropped");
            return None;
        }

        let runner = Arc::clone(self);
        Some(tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(runner.run_shadow(&input))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(trace_id = %input.primary_trace_id, error = %e, "shadow execution failed")
                }
                Err(_) => {
                    warn!(trace_id = %input.primary_trace_id, "shadow task panicked")
                }
            }
            runner.inflight.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    /// Generation + Grounding only, against the candidate model.
    async fn run_shadow(&self, input: &ShadowInput) -> Result<()> {
        let started = Instant::now();
        let ctx = RequestContext::new(
            strata_core::ids::new_trace_id(),
            self.config.config_hash(),
        );
        let mut trace = Trace::new(
            ctx.trace_id.clone(),
            input.user_id.clone(),
            input.session_id.clone(),
            self.config.pipeline_version.clone(),
            ctx.config_hash.clone(),
            "shadow",
        );

        let mut gen_span = SpanRecorder::start("generation", 0);
        gen_span.set("primary_trace_id", input.primary_trace_id.as_str());
        gen_span.set("model", self.config.shadow.candidate_model.as_str());
        let generation = self
            .llm
            .generate(
                GenerationRequest {
                    system: input.system_prompt.clone(),
                    context: input.context.as_prompt_context(),
                    question: input.query_text.clone(),
                    model_id: self.config.shadow.candidate_model.clone(),
                    max_tokens: self.config.generation.max_output_tokens,
                    temperature: self.config.generation.temperature,
                },
                &ctx,
            )
            .await;

        let generation = match generation {
            Ok(g) => {
                gen_span.set("tokens_in", g.tokens_in);
                gen_span.set("tokens_out", g.tokens_out);
                trace.push_span(gen_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                g
            }
            Err(e) => {
                gen_span.set("error", e.to_string());
                trace.push_span(gen_span.finish(ctx.elapsed_ms(), SpanStatus::Failed));
                trace.freeze(ctx.elapsed_ms(), 0.0);
                let _ = self.traces.save(&trace).await;
                return Err(e);
            }
        };

        let grounding_start = ctx.elapsed_ms();
        let mut grounding_span = SpanRecorder::start("grounding", grounding_start);
        match self
            .grounding
            .score(&input.context.ordered_chunks, &generation.answer_text)
            .await
        {
            Ok(scores) => {
                let verdict = GroundingVerdict::from_scores(
                    scores,
                    self.config.grounding.aggregation,
                    self.config.grounding.pass_threshold,
                    self.config.grounding.warn_threshold,
                );
                grounding_span.set("score", verdict.score as f64);
                grounding_span.set("level", verdict.level.to_string());
                trace.set_score("faithfulness", verdict.score as f64);
                trace.push_span(grounding_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));
            }
            Err(e) => {
                trace.push_span(grounding_span.finish_skipped(ctx.elapsed_ms(), &e.to_string()));
            }
        }

        let latency_ms = started.elapsed().as_millis() as f64;
        Self::record_latency(&self.shadow_latencies, latency_ms);

        let cost_micro = (generation.cost_usd * 1_000_000.0).round() as u64;
        self.spend_microusd.fetch_add(cost_micro, Ordering::SeqCst);
        self.metrics.inc(names::SHADOW_RUNS_TOTAL, &[], 1);
        self.metrics.set(
            names::SHADOW_BUDGET_REMAINING_USD,
            &[],
            self.budget_remaining_usd(),
        );

        trace.freeze(latency_ms as u64, generation.cost_usd);
        let _ = self.traces.save(&trace).await;

        info!(
            duration_ms = latency_ms,
            cost_usd = generation.cost_usd,
            budget_remaining = self.budget_remaining_usd(),
            "shadow completed"
        );
        Ok(())
    }
}
