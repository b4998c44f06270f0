//! Evaluation rules and span matching.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::StoreError;

/// A span that just finished, as delivered by the tracing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSpan {
    pub trace_id: String,
    pub span_id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

/// Which spans a rule applies to. The empty filter matches every span.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanFilter {
    /// If non-empty, the span name must be one of these.
    #[serde(default)]
    pub span_names: Vec<String>,
    /// Every pair must be present on the span with an equal value.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl SpanFilter {
    pub fn matches(&self, span: &CompletedSpan) -> bool {
        if !self.span_names.is_empty() && !self.span_names.iter().any(|n| n == &span.name) {
            return false;
        }
        self.attributes
            .iter()
            .all(|(k, v)| span.attributes.get(k) == Some(v))
    }
}

/// A configured scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRule {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub filter: SpanFilter,
    /// Fraction of matching spans to score automatically, in `[0, 1]`.
    pub sampling_rate: f64,
    pub enabled: bool,
}

impl EvaluationRule {
    pub fn new(id: &str, project_id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            filter: SpanFilter::default(),
            sampling_rate: 1.0,
            enabled: true,
        }
    }

    pub fn with_filter(mut self, filter: SpanFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether a completed span should start an automatic execution.
    pub fn applies_to(&self, span: &CompletedSpan) -> bool {
        self.enabled && self.filter.matches(span) && self.samples(&span.span_id)
    }

    /// Deterministic sampling decision: redelivery of the same span always
    /// gets the same answer.
    pub fn samples(&self, span_id: &str) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        if self.sampling_rate.is_nan() || self.sampling_rate <= 0.0 {
            return false;
        }
        sample_point(&self.id, span_id) < self.sampling_rate
    }
}

/// Map `(rule_id, span_id)` to a point in `[0, 1)`: FNV-1a followed by the
/// murmur3 64-bit finalizer, so ids differing only in trailing digits spread out.
fn sample_point(rule_id: &str, span_id: &str) -> f64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in rule_id.bytes().chain([0u8]).chain(span_id.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

/// Source of rule configuration.
#[async_trait]
pub trait RuleCatalog: Send + Sync {
    /// Look up a rule within a project. Missing rules are `StoreError::NotFound`.
    async fn get(&self, project_id: &str, rule_id: &str) -> Result<EvaluationRule, StoreError>;

    /// Enabled rules of a project.
    async fn list_enabled(&self, project_id: &str) -> Result<Vec<EvaluationRule>, StoreError>;
}

/// In-process rule catalog.
#[derive(Debug, Default)]
pub struct MemoryRuleCatalog {
    rules: RwLock<HashMap<(String, String), EvaluationRule>>,
}

impl MemoryRuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a fixed set of rules.
    pub fn with_rules(rules: impl IntoIterator<Item = EvaluationRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| ((r.project_id.clone(), r.id.clone()), r))
            .collect();
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn put(&self, rule: EvaluationRule) {
        self.rules
            .write()
            .await
            .insert((rule.project_id.clone(), rule.id.clone()), rule);
    }
}

#[async_trait]
impl RuleCatalog for MemoryRuleCatalog {
    async fn get(&self, project_id: &str, rule_id: &str) -> Result<EvaluationRule, StoreError> {
        self.rules
            .read()
            .await
            .get(&(project_id.to_string(), rule_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("rule", rule_id))
    }

    async fn list_enabled(&self, project_id: &str) -> Result<Vec<EvaluationRule>, StoreError> {
        let mut rules: Vec<EvaluationRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.project_id == project_id && r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }
}
