//! Immutable pipeline configuration snapshot.
//!
//! Loaded once at startup from a base TOML file plus an optional
//! environment overlay merged key-wise. Every stage reads its thresholds
//! from the snapshot; reload is process-restart only.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{Aggregation, RouteKind};

/// Routing stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Below this confidence the router substitutes `default_route`.
    pub threshold: f32,
    pub default_route: RouteKind,
    /// Example utterances per route, embedded once at startup.
    pub utterances: BTreeMap<RouteKind, Vec<String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut utterances = BTreeMap::new();
        utterances.insert(
            RouteKind::Rag,
            vec![
                "What is the data retention policy for customer records?".to_string(),
                "Where can I find the onboarding documentation?".to_string(),
                "What does our contract say about termination notice?".to_string(),
                "Summarize the security requirements for vendors.".to_string(),
            ],
        );
        utterances.insert(
            RouteKind::Direct,
            vec![
                "Write a short thank-you note to a colleague.".to_string(),
                "Rephrase this sentence to be more formal.".to_string(),
                "Translate hello to French.".to_string(),
            ],
        );
        utterances.insert(
            RouteKind::Escalate,
            vec![
                "I want to speak with a human manager.".to_string(),
                "Connect me to a support agent.".to_string(),
                "Let me talk to a real person.".to_string(),
            ],
        );
        Self {
            threshold: 0.7,
            default_route: RouteKind::Rag,
            utterances,
        }
    }
}

/// Multi-query expansion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    pub enabled: bool,
    /// Number of paraphrases requested from the LLM.
    pub variants: usize,
    /// At or above this routing confidence, expansion is skipped.
    pub skip_threshold: f32,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            variants: 3,
            skip_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Concurrency bound for multi-query embedding + search fan-out.
    pub max_parallel: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Pairwise similarity above which the lower-scored chunk is dropped.
    pub threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { threshold: 0.95 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub top_n: usize,
    /// "passthrough" disables the remote provider.
    pub provider: String,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            top_n: 5,
            provider: "passthrough".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub sentences_per_chunk: usize,
    pub max_tokens: usize,
    /// Reserved for the system prompt; subtracted before enforcement.
    pub prompt_overhead_tokens: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            sentences_per_chunk: 5,
            max_tokens: 4000,
            prompt_overhead_tokens: 200,
        }
    }
}

impl CompressionConfig {
    /// Context budget after the system-prompt reserve.
    pub fn effective_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.prompt_overhead_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    pub aggregation: Aggregation,
    pub pass_threshold: f32,
    pub warn_threshold: f32,
    /// Replaces the answer on FAIL.
    pub fallback_text: String,
    /// Prefixed to the answer on WARN.
    pub warn_disclaimer: String,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            aggregation: Aggregation::Max,
            pass_threshold: 0.85,
            warn_threshold: 0.70,
            fallback_text:
                "I could not produce a well-supported answer. Please review the sources below."
                    .to_string(),
            warn_disclaimer:
                "Note: this answer may not be fully supported by the retrieved documents.\n\n"
                    .to_string(),
        }
    }
}

/// Tier name to concrete model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierModels {
    pub fast: String,
    pub standard: String,
    pub complex: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            fast: "gpt-4o-mini".to_string(),
            standard: "gpt-4o".to_string(),
            complex: "claude-sonnet-4-5".to_string(),
        }
    }
}

/// Per-model USD price per million tokens, used for cost accounting when
/// the provider reports only usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub tiers: TierModels,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_ms: u64,
    pub prices: BTreeMap<String, ModelPrice>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            tiers: TierModels::default(),
            temperature: 0.1,
            max_output_tokens: 1000,
            timeout_ms: 30_000,
            prices: BTreeMap::new(),
        }
    }
}

impl GenerationConfig {
    pub fn price_for(&self, model_id: &str) -> ModelPrice {
        self.prices.get(model_id).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SafetyConfig {
    /// Enable the remote ML guard (layer 2).
    pub l2_enabled: bool,
    /// PII findings block instead of being advisory.
    pub block_on_pii: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    pub sample_rate: f64,
    pub budget_usd: f64,
    /// Circuit opens when mean shadow latency exceeds this multiple of
    /// mean primary latency over the rolling window.
    pub circuit_multiplier: f64,
    pub max_inflight: usize,
    /// Candidate model re-run in the shadow fork.
    pub candidate_model: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 0.1,
            budget_usd: 10.0,
            circuit_multiplier: 2.0,
            max_inflight: 4,
            candidate_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// One weighted experiment arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantWeight {
    pub name: String,
    pub weight: f64,
}

/// One feature flag: weighted variants plus override maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    pub variants: Vec<VariantWeight>,
    pub user_overrides: BTreeMap<String, String>,
    pub tenant_overrides: BTreeMap<String, String>,
    pub default: String,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            variants: vec![VariantWeight {
                name: "control".to_string(),
                weight: 1.0,
            }],
            user_overrides: BTreeMap::new(),
            tenant_overrides: BTreeMap::new(),
            default: "control".to_string(),
        }
    }
}

/// The immutable snapshot every stage reads from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline_version: String,
    pub routing: RoutingConfig,
    pub expansion: ExpansionConfig,
    pub retrieval: RetrievalConfig,
    pub dedup: DedupConfig,
    pub rerank: RerankConfig,
    pub compression: CompressionConfig,
    pub grounding: GroundingConfig,
    pub generation: GenerationConfig,
    pub safety: SafetyConfig,
    pub shadow: ShadowConfig,
    pub flags: BTreeMap<String, FlagConfig>,
}

impl PipelineConfig {
    /// Default snapshot with the crate version as pipeline version.
    pub fn new() -> Self {
        Self {
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    /// Parse a snapshot from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a base file and merge an optional environment overlay on top.
    /// Overlay scalars and arrays replace base values; tables merge key-wise.
    pub fn load(base_path: &Path, overlay_path: Option<&Path>) -> Result<Self> {
        let base_text = std::fs::read_to_string(base_path)?;
        let mut value: toml::Value =
            toml::from_str(&base_text).map_err(|e| Error::Config(e.to_string()))?;

        if let Some(overlay) = overlay_path {
            if overlay.exists() {
                let overlay_text = std::fs::read_to_string(overlay)?;
                let overlay_value: toml::Value =
                    toml::from_str(&overlay_text).map_err(|e| Error::Config(e.to_string()))?;
                merge_toml(&mut value, overlay_value);
                info!(overlay = %overlay.display(), "config overlay merged");
            }
        }

        let config: PipelineConfig = value
            .try_into()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))?;
        config.validate()?;
        info!(
            version = %config.pipeline_version,
            hash = %config.config_hash(),
            "pipeline config loaded"
        );
        Ok(config)
    }

    /// Hex SHA-256 over the canonical JSON form of the snapshot. Stable
    /// across identical deployments; recorded on every trace.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        hex::encode(digest)
    }

    /// Reject snapshots that would misbehave at request time.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.routing.threshold) {
            return Err(Error::Config("routing.threshold must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.dedup.threshold) {
            return Err(Error::Config("dedup.threshold must be in [0, 1]".into()));
        }
        if self.grounding.warn_threshold > self.grounding.pass_threshold {
            return Err(Error::Config(
                "grounding.warn_threshold must not exceed pass_threshold".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::Config("retrieval.top_k must be positive".into()));
        }
        if self.retrieval.max_parallel == 0 {
            return Err(Error::Config("retrieval.max_parallel must be positive".into()));
        }
        if self.compression.effective_budget() == 0 {
            return Err(Error::Config(
                "compression budget is fully consumed by prompt overhead".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.shadow.sample_rate) {
            return Err(Error::Config("shadow.sample_rate must be in [0, 1]".into()));
        }
        for (name, flag) in &self.flags {
            let total: f64 = flag.variants.iter().map(|v| v.weight).sum();
            if flag.variants.is_empty() || total <= 0.0 {
                return Err(Error::Config(format!(
                    "flag {} must declare variants with positive total weight",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Recursive key-wise merge: tables merge, everything else replaces.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => merge_toml(base_value, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
