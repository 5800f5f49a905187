//! Decision traces: which rules were evaluated, what they bound and how
//! the decision was reached.
//!
//! Traces are produced by re-running the query through the toolchain's
//! explain mode ([`driver`]) and compacting its raw event stream
//! ([`transform`]) into the model below.

pub mod driver;
pub mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evaluator::Decision;

/// How much detail a trace carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    /// `trace()` notes and the rules around them.
    #[default]
    Summary,
    /// Every evaluation step.
    Full,
}

/// Caller options for a traced evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOptions {
    #[serde(default)]
    pub level: TraceLevel,
    /// Serialized-size budget for the trace. Falls back to the engine's
    /// configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<usize>,
}

impl TraceOptions {
    pub fn full() -> Self {
        Self {
            level: TraceLevel::Full,
            max_size_bytes: None,
        }
    }

    pub fn summary() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_size_bytes(mut self, max: usize) -> Self {
        self.max_size_bytes = Some(max);
        self
    }
}

/// Outcome of one rule or expression in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    True,
    False,
    Undefined,
}

/// A rule seen in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTraceEntry {
    pub name: String,
    /// 1-indexed line of the rule head when known, else the line the
    /// toolchain reported.
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub result: TriState,
}

/// One step of the execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPathEntry {
    pub rule: String,
    /// Whether the step succeeded.
    pub fired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Rule whose body contains this step, when it differs from `rule`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// A message emitted by the policy with `trace()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNote {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Compact trace of a single evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTrace {
    /// Rules in first-seen order, deduplicated by `(name, line)`.
    pub rules_evaluated: Vec<RuleTraceEntry>,
    /// Last value observed for each variable.
    pub variable_bindings: BTreeMap<String, Value>,
    /// `Some(true)` only for a literal `true` result, `None` when undefined.
    pub final_decision: Option<bool>,
    pub execution_path: Vec<ExecutionPathEntry>,
    pub level: TraceLevel,
    pub truncated: bool,
    /// Serialized size, measured after truncation.
    pub size_bytes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<TraceNote>,
}

/// A decision together with the trace that explains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedDecision {
    #[serde(flatten)]
    pub decision: Decision,
    pub trace: EvaluationTrace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_value(TriState::Undefined).unwrap(), "undefined");
        assert_eq!(serde_json::to_value(TriState::True).unwrap(), "true");
        assert_eq!(serde_json::to_value(TraceLevel::Full).unwrap(), "full");
    }

    #[test]
    fn options_default_to_summary_without_budget() {
        let options: TraceOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, TraceOptions::summary());
        let options = TraceOptions::full().with_max_size_bytes(1024);
        assert_eq!(options.level, TraceLevel::Full);
        assert_eq!(options.max_size_bytes, Some(1024));
    }

    #[test]
    fn traced_decision_flattens_decision_fields() {
        let traced = TracedDecision {
            decision: Decision {
                allowed: true,
                result: Some(Value::Bool(true)),
                namespace: "authz".into(),
                rule: "allow".into(),
                duration_us: 12,
            },
            trace: EvaluationTrace {
                rules_evaluated: Vec::new(),
                variable_bindings: BTreeMap::new(),
                final_decision: Some(true),
                execution_path: Vec::new(),
                level: TraceLevel::Summary,
                truncated: false,
                size_bytes: 0,
                notes: Vec::new(),
            },
        };
        let json = serde_json::to_value(&traced).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["namespace"], "authz");
        assert_eq!(json["trace"]["final_decision"], true);
        assert!(json["trace"].get("notes").is_none());
    }
}
