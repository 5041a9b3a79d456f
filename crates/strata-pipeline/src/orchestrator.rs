//! The request orchestrator.
//!
//! Runs the twelve-stage graph for one request. Every stage either
//! completes with a span, is skipped with a span carrying a reason, or
//! fails into a terminal span; the trace is flushed exactly once and
//! metrics are recorded exactly once per request, on every exit path.
//! `handle` never returns an error: all failures map to a `Response` with
//! `blocked` or `fallback` set and a populated `trace_id`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::warn;

use strata_core::{
    ids, AuditActor, AuditActorType, AuditEvent, AuditEventType, AuditSink, CancellationSignal,
    Chunk, CompressedContext, Disposition, EmbeddingService, Error, GenerationRequest,
    GroundingLevel, GroundingScorer, GroundingVerdict, HeuristicTokenizer, LlmClient, MetricSink,
    MlGuard, PipelineConfig, Query, QueryExpander, QueryPlan, RequestContext, Reranker, Response,
    ResponseMetadata, Result, RouteDecision, RouteKind, SourceInfo, SpanRecorder, SpanStatus,
    Tokenizer, Trace, TraceSink, VectorStore,
};
use strata_experiment::{FeatureFlagResolver, ShadowInput, ShadowRunner, VariantRecorder};
use strata_inference::ModelTierPolicy;
use strata_observe::names;
use strata_safety::{InjectionDetector, PiiDetector};
use strata_search::{dedup, rrf_fuse, Compressor, TokenBudgeter};

use crate::router::Router;
use crate::schema::OutputSchemaValidator;

/// Flag governing the primary pipeline variant.
const PIPELINE_FLAG: &str = "pipeline_variant";

/// System prompt for grounded answering.
const SYSTEM_PROMPT: &str = "You are an assistant that answers strictly from the provided context. \
If the context does not contain the answer, say that you do not know.";

/// Route label used on responses blocked before routing ran.
const ROUTE_BLOCKED: &str = "BLOCKED";
const ROUTE_NONE: &str = "NONE";

/// Pipeline state machine; the terminal state is always `Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Opened,
    SafetyChecked,
    Routed,
    Escalated,
    DirectGeneration,
    RetrievalStarted,
    Retrieved,
    Compressed,
    Generated,
    Scored,
    Finalized,
}

impl PipelineState {
    fn name(&self) -> &'static str {
        match self {
            PipelineState::Opened => "opened",
            PipelineState::SafetyChecked => "safety_checked",
            PipelineState::Routed => "routed",
            PipelineState::Escalated => "escalated",
            PipelineState::DirectGeneration => "direct_generation",
            PipelineState::RetrievalStarted => "retrieval_started",
            PipelineState::Retrieved => "retrieved",
            PipelineState::Compressed => "compressed",
            PipelineState::Generated => "generated",
            PipelineState::Scored => "scored",
            PipelineState::Finalized => "finalized",
        }
    }
}

/// External collaborators, constructed by the composition root.
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingService>,
    pub store: Arc<dyn VectorStore>,
    pub reranker: Arc<dyn Reranker>,
    pub llm: Arc<dyn LlmClient>,
    pub grounding: Arc<dyn GroundingScorer>,
    pub expander: Option<Arc<dyn QueryExpander>>,
    pub guard: Option<Arc<dyn MlGuard>>,
    pub traces: Arc<dyn TraceSink>,
    pub audits: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricSink>,
}

/// What one run of the stage graph produced, before finalize.
struct StageOutcome {
    response: Response,
    status: &'static str,
    cost_usd: f64,
    last_state: PipelineState,
    shadow_context: Option<CompressedContext>,
}

/// The request orchestrator. One per process; safe for concurrent use.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    config_hash: String,
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<dyn VectorStore>,
    reranker: Arc<dyn Reranker>,
    llm: Arc<dyn LlmClient>,
    grounding: Arc<dyn GroundingScorer>,
    expander: Option<Arc<dyn QueryExpander>>,
    guard: Option<Arc<dyn MlGuard>>,
    injection: InjectionDetector,
    pii: PiiDetector,
    router: Router,
    schema: OutputSchemaValidator,
    tier_policy: ModelTierPolicy,
    compressor: Compressor,
    budgeter: TokenBudgeter,
    tokenizer: Arc<dyn Tokenizer>,
    flags: FeatureFlagResolver,
    recorder: VariantRecorder,
    shadow: Arc<ShadowRunner>,
    traces: Arc<dyn TraceSink>,
    audits: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricSink>,
    retrieval_requests: AtomicU64,
    retrieval_empty: AtomicU64,
}

impl Orchestrator {
    /// Build the orchestrator: embed routing utterances, wire the shadow
    /// runner, freeze the config hash.
    pub async fn new(config: Arc<PipelineConfig>, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        let router = Router::build(&config.routing, collab.embedder.clone()).await?;
        let shadow = Arc::new(ShadowRunner::new(
            config.clone(),
            collab.llm.clone(),
            collab.grounding.clone(),
            collab.traces.clone(),
            collab.metrics.clone(),
        ));
        let config_hash = config.config_hash();
        Ok(Self {
            compressor: Compressor::new(config.compression.sentences_per_chunk),
            budgeter: TokenBudgeter::new(),
            tokenizer: Arc::new(HeuristicTokenizer),
            injection: InjectionDetector::new(),
            pii: PiiDetector::new(),
            schema: OutputSchemaValidator::new(),
            tier_policy: ModelTierPolicy::new(),
            flags: FeatureFlagResolver::new(config.flags.clone()),
            recorder: VariantRecorder::new(collab.audits.clone(), collab.metrics.clone()),
            router,
            shadow,
            config_hash,
            embedder: collab.embedder,
            store: collab.store,
            reranker: collab.reranker,
            llm: collab.llm,
            grounding: collab.grounding,
            expander: collab.expander,
            guard: collab.guard,
            traces: collab.traces,
            audits: collab.audits,
            metrics: collab.metrics,
            config: config.clone(),
            retrieval_requests: AtomicU64::new(0),
            retrieval_empty: AtomicU64::new(0),
        })
    }

    /// Shadow runner handle, exposed for budget/circuit inspection.
    pub fn shadow_runner(&self) -> &Arc<ShadowRunner> {
        &self.shadow
    }

    /// Handle one request with no caller-supplied deadline.
    pub async fn handle(&self, query: Query) -> Response {
        self.handle_with(query, CancellationSignal::new(), None).await
    }

    /// Handle one request under an external cancellation signal and an
    /// optional timeout.
    pub async fn handle_with(
        &self,
        query: Query,
        cancellation: CancellationSignal,
        timeout: Option<Duration>,
    ) -> Response {
        // Stage 1: trace open. Mint the id, resolve the variant, bind both.
        let trace_id = ids::new_trace_id();
        let mut ctx = RequestContext::new(trace_id.clone(), self.config_hash.clone());
        ctx.cancellation = cancellation;
        if let Some(t) = timeout {
            ctx = ctx.with_timeout(t);
        }
        let variant = self
            .flags
            .resolve(PIPELINE_FLAG, &query.user_id, &query.tenant_id);
        ctx.variant = variant.clone();

        let mut trace = Trace::new(
            trace_id,
            query.user_id.clone(),
            query.session_id.clone(),
            self.config.pipeline_version.clone(),
            self.config_hash.clone(),
            variant.clone(),
        );

        if let Err(e) = self
            .recorder
            .record(PIPELINE_FLAG, &query.user_id, &query.tenant_id, &variant)
            .await
        {
            warn!(error = %e, "variant assignment audit failed");
        }

        let outcome = self.execute(&query, &ctx, &mut trace).await;
        let StageOutcome {
            mut response,
            status,
            cost_usd,
            last_state,
            shadow_context,
        } = outcome;

        // Stage 13: finalize. Totals, trace flush (exactly once), metrics,
        // then the shadow fork so the primary bytes are already decided.
        let latency_ms = ctx.elapsed_ms();
        response.metadata.latency_ms = latency_ms;

        let mut finalize = SpanRecorder::start("finalize", latency_ms);
        finalize.set("state", PipelineState::Finalized.name());
        finalize.set("from_state", last_state.name());
        finalize.set("status", status);
        trace.push_span(finalize.finish(latency_ms, SpanStatus::Ok));

        for span in &trace.spans {
            self.metrics.observe(
                names::REQUEST_DURATION_SECONDS,
                &[("stage", span.name.as_str())],
                span.duration_ms() as f64 / 1000.0,
            );
        }
        self.metrics.observe(
            names::REQUEST_DURATION_SECONDS,
            &[("stage", "total")],
            latency_ms as f64 / 1000.0,
        );
        self.metrics.inc(
            names::REQUESTS_TOTAL,
            &[
                ("route", response.metadata.route_used.as_str()),
                ("status", status),
            ],
            1,
        );

        trace.freeze(latency_ms, cost_usd);
        if let Err(e) = self.traces.save(&trace).await {
            warn!(trace_id = %trace.trace_id, error = %e, "trace sink failed; request unaffected");
        }

        if let Some(context) = shadow_context {
            let _ = self.shadow.maybe_fork(ShadowInput {
                primary_trace_id: trace.trace_id.clone(),
                query_text: query.text.clone(),
                user_id: query.user_id.clone(),
                session_id: query.session_id.clone(),
                tenant_id: query.tenant_id.clone(),
                context,
                system_prompt: SYSTEM_PROMPT.to_string(),
                primary_latency_ms: latency_ms,
            });
        }

        response
    }

    // =========================================================================
    // STAGE GRAPH
    // =========================================================================

    async fn execute(
        &self,
        query: &Query,
        ctx: &RequestContext,
        trace: &mut Trace,
    ) -> StageOutcome {
        let mut state = PipelineState::Opened;

        // Stage 2: input safety.
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "input_safety", ROUTE_NONE, state);
        }
        let mut safety = SpanRecorder::start("input_safety", ctx.elapsed_ms());

        if let Err(e) = query.validate() {
            safety.set("reason", "invalid_input");
            safety.set("error", e.to_string());
            trace.push_span(safety.finish(ctx.elapsed_ms(), SpanStatus::Failed));
            return StageOutcome {
                response: self.empty_response(ctx, ROUTE_NONE, true, false, None),
                status: "invalid_input",
                cost_usd: 0.0,
                last_state: state,
                shadow_context: None,
            };
        }

        if let Some(detection) = self.injection.detect(&query.text) {
            safety.set("blocked", true);
            safety.set("layer", "L1");
            safety.set("pattern_id", detection.pattern_id.as_str());
            safety.set("category", detection.category);
            trace.push_span(safety.finish(ctx.elapsed_ms(), SpanStatus::Ok));
            self.audit_safety_block(query, "L1", detection.category).await;
            self.metrics.inc(
                names::SAFETY_BLOCKED_TOTAL,
                &[("layer", "L1"), ("reason", detection.category)],
                1,
            );
            return StageOutcome {
                response: self.empty_response(ctx, ROUTE_BLOCKED, false, true, Some("injection")),
                status: "blocked",
                cost_usd: 0.0,
                last_state: state,
                shadow_context: None,
            };
        }

        // PII is surfaced, not fatal, unless policy says otherwise.
        let findings = self.pii.detect(&query.text);
        if !findings.is_empty() {
            let kinds = PiiDetector::kinds(&findings);
            for kind in &kinds {
                self.metrics.inc(names::PII_DETECTED_TOTAL, &[("type", *kind)], 1);
            }
            safety.set("pii_types", serde_json::json!(&kinds));
            if self.config.safety.block_on_pii {
                safety.set("blocked", true);
                safety.set("layer", "L1");
                trace.push_span(safety.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                self.audit_safety_block(query, "L1", "pii").await;
                self.metrics.inc(
                    names::SAFETY_BLOCKED_TOTAL,
                    &[("layer", "L1"), ("reason", "pii")],
                    1,
                );
                return StageOutcome {
                    response: self.empty_response(ctx, ROUTE_BLOCKED, false, true, Some("pii")),
                    status: "blocked",
                    cost_usd: 0.0,
                    last_state: state,
                    shadow_context: None,
                };
            }
        }

        // Optional layer 2: ML guard. A flag is terminal like L1; the
        // client itself fails open on transport errors.
        if self.config.safety.l2_enabled {
            if let Some(guard) = &self.guard {
                match guard.check(&query.text).await {
                    Ok(verdict) if verdict.flagged => {
                        safety.set("blocked", true);
                        safety.set("layer", "L2");
                        if let Some(category) = &verdict.category {
                            safety.set("category", category.as_str());
                        }
                        trace.push_span(safety.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                        let category = verdict.category.as_deref().unwrap_or("ml_guard");
                        self.audit_safety_block(query, "L2", category).await;
                        self.metrics.inc(
                            names::SAFETY_BLOCKED_TOTAL,
                            &[("layer", "L2"), ("reason", category)],
                            1,
                        );
                        return StageOutcome {
                            response: self.empty_response(
                                ctx,
                                ROUTE_BLOCKED,
                                false,
                                true,
                                Some("ml_guard"),
                            ),
                            status: "blocked",
                            cost_usd: 0.0,
                            last_state: state,
                            shadow_context: None,
                        };
                    }
                    Ok(_) => {}
                    Err(e) => safety.set("l2_error", e.to_string()),
                }
            }
        }
        trace.push_span(safety.finish(ctx.elapsed_ms(), SpanStatus::Ok));
        state = PipelineState::SafetyChecked;

        // Stage 3: routing.
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "routing", ROUTE_NONE, state);
        }
        let mut routing = SpanRecorder::start("routing", ctx.elapsed_ms());
        let decision = match query.options.force_route {
            Some(kind) => {
                routing.set("forced", true);
                RouteDecision {
                    route_kind: kind,
                    confidence: 1.0,
                    scores: Default::default(),
                    matched_utterance: None,
                }
            }
            None => match self.router.route(&query.text).await {
                Ok(decision) => decision,
                Err(e) => {
                    // Routing needs the embedder; degrade to the default
                    // route rather than failing the request.
                    routing.set("skipped", true);
                    routing.set("reason", "router_error");
                    routing.set("error", e.to_string());
                    RouteDecision {
                        route_kind: self.config.routing.default_route,
                        confidence: 0.0,
                        scores: Default::default(),
                        matched_utterance: None,
                    }
                }
            },
        };
        routing.set("route", decision.route_kind.as_str());
        routing.set("confidence", decision.confidence as f64);
        for (name, score) in &decision.scores {
            routing.set(format!("score_{}", name), *score as f64);
        }
        if let Some(utterance) = &decision.matched_utterance {
            routing.set("matched_utterance", utterance.as_str());
        }
        trace.push_span(routing.finish(ctx.elapsed_ms(), SpanStatus::Ok));
        state = PipelineState::Routed;
        let route = decision.route_kind;
        let route_label = route.as_str();

        // Stage 4: dispatch.
        let mut dispatch = SpanRecorder::start("dispatch", ctx.elapsed_ms());
        match route {
            RouteKind::Escalate => {
                dispatch.set("fallback", true);
                trace.push_span(dispatch.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                return StageOutcome {
                    response: self.empty_response(ctx, route_label, true, false, None),
                    status: "escalated",
                    cost_usd: 0.0,
                    last_state: PipelineState::Escalated,
                    shadow_context: None,
                };
            }
            RouteKind::SqlStructured | RouteKind::ApiLookup => {
                dispatch.set("not_implemented", true);
                dispatch.set("error", Error::NotImplementedRoute(route).to_string());
                trace.push_span(dispatch.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                return StageOutcome {
                    response: self.empty_response(ctx, route_label, true, false, None),
                    status: "not_implemented",
                    cost_usd: 0.0,
                    last_state: PipelineState::Routed,
                    shadow_context: None,
                };
            }
            RouteKind::Direct => {
                dispatch.set("direct", true);
                trace.push_span(dispatch.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                for stage in [
                    "query_expansion",
                    "retrieval",
                    "dedup_fuse",
                    "rerank",
                    "compression",
                ] {
                    let rec = SpanRecorder::start(stage, ctx.elapsed_ms());
                    trace.push_span(rec.finish_skipped(ctx.elapsed_ms(), "direct_route"));
                }
                return self
                    .generate_and_score(
                        query,
                        ctx,
                        trace,
                        route,
                        CompressedContext::default(),
                        Vec::new(),
                        PipelineState::DirectGeneration,
                    )
                    .await;
            }
            RouteKind::Rag => {
                trace.push_span(dispatch.finish(ctx.elapsed_ms(), SpanStatus::Ok));
            }
        }

        // Stage 5: query expansion.
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "query_expansion", route_label, state);
        }
        let plan = self.expand_queries(query, &decision, ctx, trace).await;

        // Stage 6: retrieval fan-out.
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "retrieval", route_label, state);
        }
        state = PipelineState::RetrievalStarted;
        let retrieval = match self.retrieve(query, &plan, ctx, trace).await {
            Ok(lists) => lists,
            Err(Error::Cancelled) => {
                return self.cancelled(trace, ctx, "retrieval", route_label, state)
            }
            Err(_) => {
                // Every sub-query failed: terminal fallback, no sources.
                return StageOutcome {
                    response: self.empty_response(ctx, route_label, true, false, None),
                    status: "retrieval_failed",
                    cost_usd: 0.0,
                    last_state: state,
                    shadow_context: None,
                };
            }
        };
        state = PipelineState::Retrieved;

        // Stage 7: dedup + fuse.
        let mut fuse_span = SpanRecorder::start("dedup_fuse", ctx.elapsed_ms());
        let union: Vec<Chunk> = retrieval.iter().flatten().cloned().collect();
        fuse_span.set("input_count", union.len() as u64);
        let accepted = dedup(union, self.config.dedup.threshold);
        let accepted_ids: Vec<&str> = accepted.iter().map(|c| c.chunk_id.as_str()).collect();
        let filtered_lists: Vec<Vec<Chunk>> = retrieval
            .into_iter()
            .map(|list| {
                list.into_iter()
                    .filter(|c| accepted_ids.contains(&c.chunk_id.as_str()))
                    .collect()
            })
            .collect();
        let fused: Vec<Chunk> = rrf_fuse(filtered_lists)
            .into_iter()
            .map(|hit| hit.chunk)
            .collect();
        fuse_span.set("output_count", fused.len() as u64);
        trace.push_span(fuse_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));

        // Stage 8: rerank.
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "rerank", route_label, state);
        }
        let mut rerank_span = SpanRecorder::start("rerank", ctx.elapsed_ms());
        let top_n = self.config.rerank.top_n;
        let reranked = match self.reranker.rerank(&query.text, fused.clone(), top_n).await {
            Ok(chunks) => chunks,
            Err(e) => {
                debug_assert_eq!(e.disposition(), Disposition::Degrade);
                rerank_span.set("skipped", true);
                rerank_span.set("reason", "rerank_error");
                rerank_span.set("error", e.to_string());
                let mut passthrough = fused;
                passthrough.truncate(top_n);
                passthrough
            }
        };
        rerank_span.set("output_count", reranked.len() as u64);
        trace.push_span(rerank_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));

        // Stage 9: compression + token budget.
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "compression", route_label, state);
        }
        let mut compress_span = SpanRecorder::start("compression", ctx.elapsed_ms());
        let tokens_before: usize = reranked
            .iter()
            .map(|c| self.tokenizer.count_tokens(&c.text))
            .sum();
        let compressed = self
            .compressor
            .compress(&query.text, &reranked, self.tokenizer.as_ref());
        let context = self
            .budgeter
            .enforce(compressed, self.config.compression.effective_budget());
        compress_span.set("tokens_before", tokens_before as u64);
        compress_span.set("tokens_after", context.total_tokens as u64);
        compress_span.set("dropped_sentences", context.dropped_sentence_count as u64);
        trace.push_span(compress_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));
        state = PipelineState::Compressed;

        // Stages 10-12.
        self.generate_and_score(query, ctx, trace, route, context, reranked, state)
            .await
    }

    /// Stages 10 (generation), 11 (grounding), 12 (output validation).
    /// Shared by the RAG and DIRECT paths.
    #[allow(clippy::too_many_arguments)]
    async fn generate_and_score(
        &self,
        query: &Query,
        ctx: &RequestContext,
        trace: &mut Trace,
        route: RouteKind,
        context: CompressedContext,
        source_chunks: Vec<Chunk>,
        mut state: PipelineState,
    ) -> StageOutcome {
        let route_label = route.as_str();
        let sources = self.build_sources(query, &source_chunks);

        // Stage 10: generation (TERMINAL on failure).
        if ctx.check_cancelled().is_err() {
            return self.cancelled(trace, ctx, "generation", route_label, state);
        }
        let mut gen_span = SpanRecorder::start("generation", ctx.elapsed_ms());
        let tier = self
            .tier_policy
            .resolve(route, &query.text, context.total_tokens);
        let model_id = self.tier_policy.model_for(tier, &self.config.generation.tiers);
        gen_span.set("tier", tier.to_string());
        gen_span.set("model", model_id.as_str());
        gen_span.set("context_tokens", context.total_tokens as u64);

        let max_tokens = query
            .options
            .max_tokens
            .min(self.config.generation.max_output_tokens);
        let generation = self
            .llm
            .generate(
                GenerationRequest {
                    system: SYSTEM_PROMPT.to_string(),
                    context: context.as_prompt_context(),
                    question: query.text.clone(),
                    model_id: model_id.clone(),
                    max_tokens,
                    temperature: query.options.temperature,
                },
                ctx,
            )
            .await;

        let generation = match generation {
            Ok(g) => g,
            Err(Error::Cancelled) => {
                trace.push_span(gen_span.finish(ctx.elapsed_ms(), SpanStatus::Failed));
                return self.cancelled(trace, ctx, "generation", route_label, state);
            }
            Err(e) => {
                gen_span.set("error", e.to_string());
                trace.push_span(gen_span.finish(ctx.elapsed_ms(), SpanStatus::Failed));
                self.metrics
                    .inc(names::LLM_ERRORS_TOTAL, &[("stage", "generation")], 1);
                let mut response = self.empty_response(ctx, route_label, true, false, None);
                response.sources = sources;
                response.metadata.model = Some(model_id);
                return StageOutcome {
                    response,
                    status: "generation_failed",
                    cost_usd: 0.0,
                    last_state: state,
                    shadow_context: None,
                };
            }
        };
        gen_span.set("tokens_in", generation.tokens_in);
        gen_span.set("tokens_out", generation.tokens_out);
        gen_span.set("cost_usd", generation.cost_usd);
        gen_span.set("finish_reason", generation.finish_reason.as_str());
        trace.push_span(gen_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));
        state = PipelineState::Generated;

        self.metrics
            .observe(names::TOKENS_IN_TOTAL, &[], generation.tokens_in as f64);
        self.metrics
            .observe(names::TOKENS_OUT_TOTAL, &[], generation.tokens_out as f64);
        self.metrics
            .observe(names::LLM_COST_USD, &[], generation.cost_usd);

        // Stage 11: grounding with the three-way decision.
        let mut answer = generation.answer_text.clone();
        let mut fallback = false;
        let mut faithfulness: Option<f32> = None;

        if route == RouteKind::Direct {
            let rec = SpanRecorder::start("grounding", ctx.elapsed_ms());
            trace.push_span(rec.finish_skipped(ctx.elapsed_ms(), "no_context"));
        } else {
            let mut grounding_span = SpanRecorder::start("grounding", ctx.elapsed_ms());
            match self
                .grounding
                .score(&context.ordered_chunks, &generation.answer_text)
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
                    grounding_span
                        .set("aggregation", format!("{:?}", verdict.aggregation).to_uppercase());
                    trace.set_score("faithfulness", verdict.score as f64);
                    let level_label = verdict.level.to_string();
                    self.metrics.inc(
                        names::HALLUCINATION_VERDICT_TOTAL,
                        &[("level", level_label.as_str())],
                        1,
                    );
                    faithfulness = Some(verdict.score);
                    match verdict.level {
                        GroundingLevel::Pass => {}
                        GroundingLevel::Warn => {
                            grounding_span.set("warn", true);
                            answer =
                                format!("{}{}", self.config.grounding.warn_disclaimer, answer);
                        }
                        GroundingLevel::Fail => {
                            grounding_span.set("suppressed", true);
                            answer = self.config.grounding.fallback_text.clone();
                            fallback = true;
                        }
                    }
                    trace.push_span(grounding_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                }
                Err(e) => {
                    // Scorer outage degrades: keep the answer, no verdict.
                    trace.push_span(
                        grounding_span.finish_skipped(ctx.elapsed_ms(), &e.to_string()),
                    );
                }
            }
            state = PipelineState::Scored;
        }

        // Stage 12: output validation (structure only, never blocks).
        let mut schema_span = SpanRecorder::start("output_validation", ctx.elapsed_ms());
        let outcome = self.schema.validate(&answer, route);
        schema_span.set("valid", outcome.valid);
        schema_span.set("wrapped", outcome.wrapped);
        if !outcome.errors.is_empty() {
            schema_span.set("errors", serde_json::json!(&outcome.errors));
        }
        trace.push_span(schema_span.finish(ctx.elapsed_ms(), SpanStatus::Ok));

        let status = if fallback { "grounding_fail" } else { "ok" };
        StageOutcome {
            response: Response {
                answer: Some(answer),
                trace_id: ctx.trace_id.clone(),
                sources,
                metadata: ResponseMetadata {
                    route_used: route_label.to_string(),
                    faithfulness_score: faithfulness,
                    model: Some(generation.model_id.clone()),
                    latency_ms: 0,
                    tokens_used: Some(generation.tokens_in + generation.tokens_out),
                    schema_valid: outcome.valid,
                },
                fallback,
                blocked: false,
                block_reason: None,
            },
            status,
            cost_usd: generation.cost_usd,
            last_state: state,
            shadow_context: Some(context),
        }
    }

    /// Stage 5 body: produce the query plan, degrading to the original
    /// query on any expander trouble.
    async fn expand_queries(
        &self,
        query: &Query,
        decision: &RouteDecision,
        ctx: &RequestContext,
        trace: &mut Trace,
    ) -> QueryPlan {
        let rec = SpanRecorder::start("query_expansion", ctx.elapsed_ms());

        if !self.config.expansion.enabled {
            trace.push_span(rec.finish_skipped(ctx.elapsed_ms(), "disabled"));
            return QueryPlan::single(&query.text);
        }
        if decision.confidence >= self.config.expansion.skip_threshold {
            trace.push_span(rec.finish_skipped(ctx.elapsed_ms(), "high_confidence"));
            return QueryPlan::single(&query.text);
        }
        let Some(expander) = &self.expander else {
            trace.push_span(rec.finish_skipped(ctx.elapsed_ms(), "no_expander"));
            return QueryPlan::single(&query.text);
        };

        let mut rec = rec;
        match expander.expand(&query.text, self.config.expansion.variants).await {
            Ok(texts) => {
                let variants: Vec<String> = texts
                    .into_iter()
                    .skip(1) // first entry is always the original
                    .collect();
                rec.set("variant_count", variants.len() as u64);
                trace.push_span(rec.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                QueryPlan {
                    primary_text: query.text.clone(),
                    variants,
                    skip_expansion: false,
                }
            }
            Err(e) => {
                rec.set("skipped", true);
                rec.set("reason", "expander_error");
                rec.set("error", e.to_string());
                trace.push_span(rec.finish(ctx.elapsed_ms(), SpanStatus::Ok));
                QueryPlan::single(&query.text)
            }
        }
    }

    /// Stage 6 body: bounded-concurrency embed + search per plan query.
    /// Returns the per-query result lists (plan order); `Err(Cancelled)`
    /// when the signal fired mid-stage, another `Err` when every
    /// sub-query failed.
    async fn retrieve(
        &self,
        query: &Query,
        plan: &QueryPlan,
        ctx: &RequestContext,
        trace: &mut Trace,
    ) -> Result<Vec<Vec<Chunk>>> {
        let mut rec = SpanRecorder::start("retrieval", ctx.elapsed_ms());
        let texts = plan.texts();
        rec.set("query_count", texts.len() as u64);

        let top_k = self.config.retrieval.top_k;
        let tenant_id = query.tenant_id.clone();
        let results: Vec<(usize, Result<Vec<Chunk>>)> = stream::iter(
            texts.iter().enumerate().map(|(i, text)| {
                let embedder = self.embedder.clone();
                let store = self.store.clone();
                let tenant_id = tenant_id.clone();
                let text = text.to_string();
                let ctx = ctx.clone();
                async move {
                    if ctx.check_cancelled().is_err() {
                        return (i, Err(Error::Cancelled));
                    }
                    let outcome = async {
                        let embedding = embedder.embed(&text).await?;
                        store.search(&embedding, &tenant_id, top_k).await
                    }
                    .await;
                    (i, outcome)
                }
            }),
        )
        .buffer_unordered(self.config.retrieval.max_parallel)
        .collect()
        .await;

        if ctx.cancellation.is_cancelled() || ctx.deadline_exceeded() {
            trace.push_span(rec.finish(ctx.elapsed_ms(), SpanStatus::Failed));
            return Err(Error::Cancelled);
        }

        let mut lists: Vec<Vec<Chunk>> = vec![Vec::new(); texts.len()];
        let mut raw_counts = vec![0u64; texts.len()];
        let mut failures = 0usize;
        for (i, outcome) in results {
            match outcome {
                Ok(chunks) => {
                    raw_counts[i] = chunks.len() as u64;
                    for chunk in &chunks {
                        self.metrics.observe(
                            names::RETRIEVAL_COSINE_SIMILARITY,
                            &[],
                            chunk.score as f64,
                        );
                    }
                    // Ingest guarantees the metadata invariant; drop and
                    // flag anything that slipped through anyway.
                    lists[i] = chunks
                        .into_iter()
                        .filter(|c| match c.validate_metadata() {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(error = %e, "chunk failed metadata invariant; dropped");
                                false
                            }
                        })
                        .collect();
                }
                Err(e) => {
                    failures += 1;
                    rec.set(format!("query_{}_error", i), e.to_string());
                }
            }
        }
        rec.set("raw_counts", serde_json::json!(&raw_counts));
        rec.set("failed_queries", failures as u64);

        let total_hits: u64 = raw_counts.iter().sum();
        let requests = self.retrieval_requests.fetch_add(1, Ordering::Relaxed) + 1;
        let empties = if total_hits == 0 {
            self.retrieval_empty.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.retrieval_empty.load(Ordering::Relaxed)
        };
        self.metrics.set(
            names::RETRIEVAL_EMPTY_RESULT_RATE,
            &[],
            empties as f64 / requests as f64,
        );

        if failures == texts.len() {
            trace.push_span(rec.finish(ctx.elapsed_ms(), SpanStatus::Failed));
            return Err(Error::Search("all retrieval sub-queries failed".into()));
        }
        rec.set("empty", total_hits == 0);
        trace.push_span(rec.finish(ctx.elapsed_ms(), SpanStatus::Ok));
        Ok(lists)
    }

    // =========================================================================
    // TERMINAL HELPERS
    // =========================================================================

    fn cancelled(
        &self,
        trace: &mut Trace,
        ctx: &RequestContext,
        stage: &str,
        route: &str,
        state: PipelineState,
    ) -> StageOutcome {
        let mut rec = SpanRecorder::start(stage, ctx.elapsed_ms());
        rec.set("reason", "cancelled");
        trace.push_span(rec.finish(ctx.elapsed_ms(), SpanStatus::Failed));
        StageOutcome {
            response: self.empty_response(ctx, route, true, false, Some("cancelled")),
            status: "cancelled",
            cost_usd: 0.0,
            last_state: state,
            shadow_context: None,
        }
    }

    fn empty_response(
        &self,
        ctx: &RequestContext,
        route_used: &str,
        fallback: bool,
        blocked: bool,
        block_reason: Option<&str>,
    ) -> Response {
        Response {
            answer: None,
            trace_id: ctx.trace_id.clone(),
            sources: Vec::new(),
            metadata: ResponseMetadata {
                route_used: route_used.to_string(),
                faithfulness_score: None,
                model: None,
                latency_ms: 0,
                tokens_used: None,
                schema_valid: true,
            },
            fallback,
            blocked,
            block_reason: block_reason.map(String::from),
        }
    }

    fn build_sources(&self, query: &Query, chunks: &[Chunk]) -> Vec<SourceInfo> {
        if !query.options.include_sources {
            return Vec::new();
        }
        chunks.iter().map(SourceInfo::from_chunk).collect()
    }

    async fn audit_safety_block(&self, query: &Query, layer: &str, reason: &str) {
        let event = AuditEvent::new(
            AuditEventType::SafetyBlock,
            AuditActor {
                actor_type: AuditActorType::User,
                id: query.user_id.clone(),
            },
            "block_input",
            query.tenant_id.clone(),
        )
        .with_detail("layer", serde_json::json!(layer))
        .with_detail("reason", serde_json::json!(reason));
        if let Err(e) = self.audits.append(&event).await {
            warn!(error = %e, "safety block audit failed");
        }
    }
}
