//! Deterministic hash-based feature flag assignment.
//!
//! Assignment priority: tenant override, user override, MD5 bucket over
//! the configured variant weights, then the flag default. The bucket is a
//! pure function of `user_id`, so assignment is sticky across the process
//! lifetime and across processes sharing a config hash.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use strata_core::{
    AuditActor, AuditActorType, AuditEvent, AuditEventType, AuditResource, AuditResourceType,
    AuditSink, FlagConfig, MetricSink, Result,
};
use strata_observe::names;

/// Number of hash buckets; weights resolve at 1/10000 granularity.
const BUCKET_COUNT: u64 = 10_000;

/// Resolves experiment variants from the immutable flag configuration.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlagResolver {
    flags: BTreeMap<String, FlagConfig>,
}

impl FeatureFlagResolver {
    pub fn new(flags: BTreeMap<String, FlagConfig>) -> Self {
        Self { flags }
    }

    /// Deterministic [0, 1) bucket for a user.
    pub fn bucket(user_id: &str) -> f64 {
        let digest = md5::compute(user_id.as_bytes());
        let hex_prefix = format!("{:x}", digest)[..8].to_string();
        let value = u64::from_str_radix(&hex_prefix, 16).unwrap_or(0);
        (value % BUCKET_COUNT) as f64 / BUCKET_COUNT as f64
    }

    /// Resolve the variant for a (flag, user, tenant) triple.
    ///
    /// Unknown flags resolve to "control" so a stale flag name in a caller
    /// degrades to the safe arm instead of failing the request.
    pub fn resolve(&self, flag_name: &str, user_id: &str, tenant_id: &str) -> String {
        let Some(flag) = self.flags.get(flag_name) else {
            return "control".to_string();
        };

        if let Some(variant) = flag.tenant_overrides.get(tenant_id) {
            return variant.clone();
        }
        if let Some(variant) = flag.user_overrides.get(user_id) {
            return variant.clone();
        }

        let bucket = Self::bucket(user_id);
        let mut cumulative = 0.0;
        for variant in &flag.variants {
            cumulative += variant.weight;
            if bucket < cumulative {
                return variant.name.clone();
            }
        }

        flag.default.clone()
    }
}

/// Emits the variant-assignment audit event and metric for every primary
/// request, before the pipeline begins.
pub struct VariantRecorder {
    audits: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricSink>,
}

impl VariantRecorder {
    pub fn new(audits: Arc<dyn AuditSink>, metrics: Arc<dyn MetricSink>) -> Self {
        Self { audits, metrics }
    }

    pub async fn record(
        &self,
        flag_name: &str,
        user_id: &str,
        tenant_id: &str,
        variant: &str,
    ) -> Result<()> {
        let event = AuditEvent::new(
            AuditEventType::VariantAssignment,
            AuditActor {
                actor_type: AuditActorType::System,
                id: "feature_flags".to_string(),
            },
            "assign_variant",
            tenant_id,
        )
        .with_resource(AuditResource {
            resource_type: AuditResourceType::Flag,
            id: flag_name.to_string(),
        })
        .with_detail("user_id", serde_json::json!(user_id))
        .with_detail("variant", serde_json::json!(variant));

        self.audits.append(&event).await?;
        self.metrics.inc(
            names::VARIANT_ASSIGNED_TOTAL,
            &[("flag", flag_name), ("variant", variant)],
            1,
        );
        info!(flag = flag_name, user_id, tenant_id, variant, "variant assigned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::VariantWeight;
    use strata_observe::{MemoryAuditSink, MetricRegistry};

    fn flag(weights: &[(&str, f64)]) -> FlagConfig {
        FlagConfig {
            variants: weights
                .iter()
                .map(|(name, weight)| VariantWeight {
                    name: name.to_string(),
                    weight: *weight,
                })
                .collect(),
            user_overrides: BTreeMap::new(),
            tenant_overrides: BTreeMap::new(),
            default: "control".to_string(),
        }
    }

    fn resolver_with(name: &str, config: FlagConfig) -> FeatureFlagResolver {
        let mut flags = BTreeMap::new();
        flags.insert(name.to_string(), config);
        FeatureFlagResolver::new(flags)
    }

    #[test]
    fn test_bucket_is_deterministic_and_in_range() {
        let a = FeatureFlagResolver::bucket("user-42");
        let b = FeatureFlagResolver::bucket("user-42");
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
    }

    #[test]
    fn test_resolution_is_sticky() {
        let resolver = resolver_with("prompt_v2", flag(&[("control", 0.9), ("treatment", 0.1)]));
        for user in ["u1", "u2", "u3", "u4"] {
            let first = resolver.resolve("prompt_v2", user, "t1");
            for _ in 0..10 {
                assert_eq!(resolver.resolve("prompt_v2", user, "t1"), first);
            }
        }
    }

    #[test]
    fn test_tenant_override_beats_user_override() {
        let mut config = flag(&[("control", 1.0)]);
        config.tenant_overrides.insert("t-vip".into(), "treatment".into());
        config.user_overrides.insert("u1".into(), "other".into());
        let resolver = resolver_with("f", config);
        assert_eq!(resolver.resolve("f", "u1", "t-vip"), "treatment");
    }

    #[test]
    fn test_user_override_beats_bucketing() {
        let mut config = flag(&[("control", 1.0)]);
        config.user_overrides.insert("u-qa".into(), "treatment".into());
        let resolver = resolver_with("f", config);
        assert_eq!(resolver.resolve("f", "u-qa", "t1"), "treatment");
        assert_eq!(resolver.resolve("f", "u-other", "t1"), "control");
    }

    #[test]
    fn test_unknown_flag_is_control() {
        let resolver = FeatureFlagResolver::default();
        assert_eq!(resolver.resolve("missing", "u1", "t1"), "control");
    }

    #[test]
    fn test_underweighted_variants_fall_back_to_default() {
        let mut config = flag(&[("rare", 0.0001)]);
        config.default = "fallback".to_string();
        let resolver = resolver_with("f", config);
        // Almost all users miss the tiny bucket and land on the default.
        let fallbacks = (0..100)
            .filter(|i| resolver.resolve("f", &format!("user-{}", i), "t1") == "fallback")
            .count();
        assert!(fallbacks > 90);
    }

    #[test]
    fn test_weight_split_approximates_ratio() {
        let resolver = resolver_with("prompt_v2", flag(&[("control", 0.9), ("treatment", 0.1)]));
        let total = 10_000;
        let treatment = (0..total)
            .filter(|i| resolver.resolve("prompt_v2", &format!("user-{}", i), "t1") == "treatment")
            .count();
        let fraction = treatment as f64 / total as f64;
        assert!(
            (fraction - 0.10).abs() < 0.02,
            "treatment fraction {} outside ±0.02 of 0.10",
            fraction
        );
    }

    #[tokio::test]
    async fn test_variant_recorder_emits_audit_and_metric() {
        let audits = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(MetricRegistry::new());
        let recorder = VariantRecorder::new(audits.clone(), metrics.clone());

        recorder.record("prompt_v2", "u1", "t1", "treatment").await.unwrap();

        let events = audits.events_of_type(AuditEventType::VariantAssignment);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tenant_id, "t1");
        assert_eq!(events[0].details["variant"], "treatment");
        assert_eq!(
            metrics.counter_value(
                names::VARIANT_ASSIGNED_TOTAL,
                &[("flag", "prompt_v2"), ("variant", "treatment")]
            ),
            1
        );
    }
}
