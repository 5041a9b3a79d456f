//! OpenAI-compatible chat-completions client.
//!
//! Works against any provider speaking the `/chat/completions` wire
//! format (OpenAI, OpenRouter, vLLM, LiteLLM proxies). Honors the
//! per-request deadline and aborts on the cancellation signal.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use strata_core::{
    Error, Generation, GenerationConfig, GenerationRequest, LlmClient, RequestContext, Result,
};

/// Default request timeout when neither config nor deadline constrain it.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// LLM client for OpenAI-compatible providers.
pub struct OpenAiLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    generation: GenerationConfig,
}

impl OpenAiLlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        generation: GenerationConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            generation,
        })
    }

    fn effective_timeout(&self, ctx: &RequestContext) -> Duration {
        let configured = if self.generation.timeout_ms > 0 {
            Duration::from_millis(self.generation.timeout_ms)
        } else {
            Duration::from_millis(DEFAULT_TIMEOUT_MS)
        };
        match ctx.remaining() {
            Some(remaining) => configured.min(remaining),
            None => configured,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn generate(&self, req: GenerationRequest, ctx: &RequestContext) -> Result<Generation> {
        ctx.check_cancelled()?;

        let system_message = if req.context.is_empty() {
            req.system.clone()
        } else {
            format!("{}\n\nContext:\n{}", req.system, req.context)
        };
        let body = json!({
            "model": req.model_id,
            "messages": [
                {"role": "system", "content": system_message},
                {"role": "user", "content": req.question},
            ],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });

        let started = Instant::now();
        let timeout = self.effective_timeout(ctx);
        let request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(Error::Cancelled),
            outcome = tokio::time::timeout(timeout, request) => match outcome {
                Err(_) => {
                    return Err(Error::GenerationFailed(format!(
                        "model {} timed out after {}ms",
                        req.model_id,
                        timeout.as_millis()
                    )))
                }
                Ok(Err(e)) => return Err(Error::GenerationFailed(e.to_string())),
                Ok(Ok(r)) => r,
            },
        };

        let response = response
            .error_for_status()
            .map_err(|e| Error::GenerationFailed(e.to_string()))?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationFailed(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::GenerationFailed("provider returned no choices".into()))?;
        let answer_text = choice.message.content.unwrap_or_default();

        // Fall back to estimates when the provider omits usage.
        let (tokens_in, tokens_out) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                strata_core::estimate_tokens(&system_message) as u64
                    + strata_core::estimate_tokens(&req.question) as u64,
                strata_core::estimate_tokens(&answer_text) as u64,
            ),
        };
        let price = self.generation.price_for(&req.model_id);
        let cost_usd = (tokens_in as f64 * price.input_per_mtok
            + tokens_out as f64 * price.output_per_mtok)
            / 1_000_000.0;
        let latency_ms = started.elapsed().as_millis() as u64;

        info!(
            model = %req.model_id,
            tokens_in,
            tokens_out,
            cost_usd,
            duration_ms = latency_ms,
            "generation complete"
        );

        Ok(Generation {
            answer_text,
            model_id: req.model_id,
            tokens_in,
            tokens_out,
            cost_usd,
            latency_ms,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }
}

/// Approximate cost of a call from token usage and the configured prices.
pub fn estimate_cost(generation: &GenerationConfig, model_id: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let price = generation.price_for(model_id);
    (tokens_in as f64 * price.input_per_mtok + tokens_out as f64 * price.output_per_mtok)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ModelPrice;

    #[test]
    fn test_estimate_cost_uses_price_table() {
        let mut generation = GenerationConfig::default();
        generation.prices.insert(
            "gpt-4o".into(),
            ModelPrice {
                input_per_mtok: 2.5,
                output_per_mtok: 10.0,
            },
        );
        let cost = estimate_cost(&generation, "gpt-4o", 1_000_000, 1_000_000);
        assert!((cost - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_cost_default_price_for_unknown_model() {
        let generation = GenerationConfig::default();
        // Defaults: $3/M in, $15/M out
        let cost = estimate_cost(&generation, "mystery-model", 2_000_000, 0);
        assert!((cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_chat_response_parsing() {
        let parsed: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "The answer."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
        }))
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("The answer."));
        assert_eq!(parsed.usage.as_ref().unwrap().prompt_tokens, 120);
    }

    #[test]
    fn test_effective_timeout_respects_deadline() {
        let client = OpenAiLlmClient::new(
            "http://localhost:9999/v1",
            "test-key",
            GenerationConfig {
                timeout_ms: 30_000,
                ..Default::default()
            },
        )
        .unwrap();

        let ctx = RequestContext::new("tr", "hash").with_timeout(Duration::from_millis(500));
        assert!(client.effective_timeout(&ctx) <= Duration::from_millis(500));

        let unbounded = RequestContext::new("tr", "hash");
        assert_eq!(
            client.effective_timeout(&unbounded),
            Duration::from_millis(30_000)
        );
    }

    #[tokio::test]
    async fn test_generate_returns_cancelled_when_signal_fired() {
        let client = OpenAiLlmClient::new(
            "http://localhost:9999/v1",
            "test-key",
            GenerationConfig::default(),
        )
        .unwrap();
        let ctx = RequestContext::new("tr", "hash");
        ctx.cancellation.cancel();

        let result = client
            .generate(
                GenerationRequest {
                    system: "Answer from context.".into(),
                    context: String::new(),
                    question: "hello?".into(),
                    model_id: "gpt-4o".into(),
                    max_tokens: 100,
                    temperature: 0.1,
                },
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
