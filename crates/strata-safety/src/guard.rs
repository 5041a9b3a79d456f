//! Layer 2: ML-based input guard over HTTP.
//!
//! A flagged verdict is terminal for the request, same as layer 1. The
//! transport fails open: a timeout or provider error logs a warning and
//! reports not-flagged rather than blocking legitimate traffic.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use strata_core::{Error, GuardVerdict, MlGuard, Result};

/// HTTP client for an ML guard service (Lakera-Guard-style API).
pub struct GuardClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GuardClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    fn parse_verdict(body: &Value) -> GuardVerdict {
        let flagged = body
            .get("flagged")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !flagged {
            return GuardVerdict::default();
        }

        // Pick the highest-scoring category for the span attributes.
        let categories = body.get("categories").and_then(Value::as_object);
        let top = categories.and_then(|map| {
            map.iter()
                .filter_map(|(name, score)| score.as_f64().map(|s| (name.clone(), s)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
        });

        GuardVerdict {
            flagged: true,
            category: top.as_ref().map(|(name, _)| name.clone()),
            confidence: top.map(|(_, score)| score as f32),
        }
    }
}

#[async_trait]
impl MlGuard for GuardClient {
    async fn check(&self, text: &str) -> Result<GuardVerdict> {
        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "input": text }));

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "ml guard unreachable; failing open");
                return Ok(GuardVerdict::default());
            }
        };

        let body: Value = match response.error_for_status() {
            Ok(r) => match r.json().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "ml guard returned malformed body; failing open");
                    return Ok(GuardVerdict::default());
                }
            },
            Err(e) => {
                warn!(error = %e, "ml guard returned error status; failing open");
                return Ok(GuardVerdict::default());
            }
        };

        Ok(Self::parse_verdict(&body))
    }
}
