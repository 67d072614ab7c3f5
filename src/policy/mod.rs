//! Request-body policies: block, redact or flag prompt content.

pub mod pii;

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;

use crate::store::types::{Policy, PolicyAction};

pub use self::pii::{PiiCategory, PiiDetector, PiiMatch, RegexPiiDetector};

/// Response header listing the rules that fired with a warn action.
pub const WARNING_HEADER: &str = "x-tollgate-policy-warning";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("{0}")]
    Blocked(String),
}

/// What evaluation did to the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyReport {
    pub redacted: bool,
    pub warnings: Vec<String>,
}

struct Hit {
    start: usize,
    end: usize,
    label: String,
    action: PolicyAction,
}

pub struct PolicyEngine {
    detector: Arc<dyn PiiDetector>,
    compiled: DashMap<String, Option<Regex>>,
}

impl PolicyEngine {
    pub fn new(detector: Arc<dyn PiiDetector>) -> Self {
        Self {
            detector,
            compiled: DashMap::new(),
        }
    }

    fn regex(&self, pattern: &str) -> Option<Regex> {
        if let Some(re) = self.compiled.get(pattern) {
            return re.clone();
        }
        let re = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Skipping invalid policy regex");
                None
            }
        };
        self.compiled.insert(pattern.to_string(), re.clone());
        re
    }

    /// Apply `policies` to every string in `body` except the top-level
    /// `model`. Redactions are written back in place.
    pub fn evaluate(
        &self,
        policies: &[Arc<Policy>],
        body: &mut Value,
    ) -> Result<PolicyReport, PolicyError> {
        let mut report = PolicyReport::default();
        if policies.is_empty() {
            return Ok(report);
        }
        match body {
            Value::Object(map) => {
                for (k, v) in map.iter_mut() {
                    if k != "model" {
                        self.walk(policies, v, &mut report)?;
                    }
                }
            }
            other => self.walk(policies, other, &mut report)?,
        }
        report.warnings.sort();
        report.warnings.dedup();
        Ok(report)
    }

    fn walk(
        &self,
        policies: &[Arc<Policy>],
        value: &mut Value,
        report: &mut PolicyReport,
    ) -> Result<(), PolicyError> {
        match value {
            Value::String(s) => {
                if let Some(redacted) = self.apply(policies, s, report)? {
                    *s = redacted;
                    report.redacted = true;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(policies, item, report)?;
                }
            }
            Value::Object(map) => {
                for v in map.values_mut() {
                    self.walk(policies, v, report)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn collect_hits(&self, policy: &Policy, text: &str, hits: &mut Vec<Hit>) {
        for rule in &policy.regex_config {
            if let Some(re) = self.regex(&rule.definition) {
                hits.extend(re.find_iter(text).map(|m| Hit {
                    start: m.start(),
                    end: m.end(),
                    label: "regex".to_string(),
                    action: rule.action,
                }));
            }
        }

        for rule in &policy.custom_config {
            for keyword in rule.definition.iter().filter(|k| !k.is_empty()) {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
                if let Some(re) = self.regex(&pattern) {
                    hits.extend(re.find_iter(text).map(|m| Hit {
                        start: m.start(),
                        end: m.end(),
                        label: rule.name.clone(),
                        action: rule.action,
                    }));
                }
            }
        }

        let semantic = &policy.config;
        let action_for = |c: PiiCategory| match c {
            PiiCategory::Name => semantic.name,
            PiiCategory::Address => semantic.address,
            PiiCategory::Email => semantic.email,
            PiiCategory::Ssn => semantic.ssn,
            PiiCategory::Password => semantic.password,
        };
        let any_semantic = [
            semantic.name,
            semantic.address,
            semantic.email,
            semantic.ssn,
            semantic.password,
        ]
        .iter()
        .any(Option::is_some);
        if any_semantic {
            for m in self.detector.detect(text) {
                if let Some(action) = action_for(m.category) {
                    hits.push(Hit {
                        start: m.start,
                        end: m.end,
                        label: m.category.to_string(),
                        action,
                    });
                }
            }
        }
    }

    /// Returns the redacted string when any redaction applied.
    fn apply(
        &self,
        policies: &[Arc<Policy>],
        text: &str,
        report: &mut PolicyReport,
    ) -> Result<Option<String>, PolicyError> {
        let mut hits = Vec::new();
        for policy in policies {
            self.collect_hits(policy, text, &mut hits);
        }

        if let Some(hit) = hits.iter().find(|h| h.action == PolicyAction::Block) {
            return Err(PolicyError::Blocked(format!(
                "content matched blocked category {}",
                hit.label
            )));
        }

        for hit in hits.iter().filter(|h| h.action == PolicyAction::AllowButWarn) {
            report.warnings.push(hit.label.clone());
        }

        let mut redactions: Vec<&Hit> = hits
            .iter()
            .filter(|h| h.action == PolicyAction::AllowButRedact)
            .collect();
        if redactions.is_empty() {
            return Ok(None);
        }
        redactions.sort_by_key(|h| (h.start, std::cmp::Reverse(h.end)));

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for hit in redactions {
            // Overlaps with an earlier span are already covered.
            if hit.start < cursor {
                continue;
            }
            out.push_str(&text[cursor..hit.start]);
            out.push_str(&format!("[REDACTED {}]", hit.label));
            cursor = hit.end;
        }
        out.push_str(&text[cursor..]);
        Ok(Some(out))
    }
}
