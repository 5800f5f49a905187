//! Evaluates a loaded policy's rule against JSON input.

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use warden_wasm_runtime::WasmError;

use crate::cache::{CachedPolicy, InstanceCache};
use crate::compiler;
use crate::error::{EngineError, ErrorCode};

static NAMESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("namespace regex is valid")
});

static RULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("rule regex is valid"));

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// `true` only when the rule's value is exactly the boolean `true`.
    pub allowed: bool,
    /// Raw rule value; `None` when the rule is undefined for the input.
    pub result: Option<Value>,
    pub namespace: String,
    pub rule: String,
    pub duration_us: u64,
}

/// Project a raw rule value onto `allowed`.
///
/// Objects, arrays, strings and numbers are never "allowed", however
/// truthy they look.
pub fn is_allowed(result: Option<&Value>) -> bool {
    matches!(result, Some(Value::Bool(true)))
}

/// A validated `(policy, namespace, rule)` triple.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) entry: Arc<CachedPolicy>,
    pub(crate) namespace: String,
    pub(crate) rule: String,
}

impl Target {
    pub(crate) fn entrypoint(&self) -> String {
        compiler::entrypoint_name(&self.namespace, &self.rule)
    }

    pub(crate) fn query(&self) -> String {
        compiler::query_path(&self.namespace, &self.rule)
    }
}

/// Find the policy for `namespace` and check that it declares `rule`.
pub(crate) fn resolve_target(
    cache: &InstanceCache,
    namespace: Option<&str>,
    rule: &str,
) -> Result<Target, EngineError> {
    if let Some(ns) = namespace {
        if !NAMESPACE_RE.is_match(ns) {
            return Err(EngineError::new(
                ErrorCode::InvalidNamespace,
                format!("'{ns}' is not a valid namespace"),
            )
            .with_suggestion("namespaces are dotted identifiers, e.g. `authz` or `team.rbac`"));
        }
    }
    if !RULE_RE.is_match(rule) {
        return Err(EngineError::new(
            ErrorCode::InvalidRule,
            format!("'{rule}' is not a valid rule name"),
        )
        .with_suggestion("rule names are identifiers, e.g. `allow`"));
    }

    let Some(entry) = cache.find_by_namespace(namespace) else {
        let message = match namespace {
            Some(ns) => format!("namespace '{ns}' is not loaded"),
            None => "no policies are loaded".to_owned(),
        };
        return Err(with_namespace_hint(
            EngineError::new(ErrorCode::InvalidNamespace, message),
            cache,
        ));
    };

    let namespace = match namespace {
        Some(ns) => ns.to_owned(),
        None => entry.first_namespace().map(str::to_owned).ok_or_else(|| {
            EngineError::new(
                ErrorCode::InvalidNamespace,
                format!("policy {} declares no namespace", entry.path.display()),
            )
        })?,
    };

    if !entry.rules.contains(rule) {
        let available: Vec<&str> = entry.rules.iter().map(String::as_str).collect();
        return Err(EngineError::new(
            ErrorCode::InvalidRule,
            format!("rule '{rule}' not found in namespace '{namespace}'"),
        )
        .with_suggestion(format!("available rules: {}", available.join(", "))));
    }

    Ok(Target {
        entry,
        namespace,
        rule: rule.to_owned(),
    })
}

fn with_namespace_hint(err: EngineError, cache: &InstanceCache) -> EngineError {
    let loaded = cache.namespaces();
    if loaded.is_empty() {
        err.with_suggestion("load a policy first")
    } else {
        let names: Vec<&str> = loaded.iter().map(String::as_str).collect();
        err.with_suggestion(format!("available namespaces: {}", names.join(", ")))
    }
}

/// Evaluate `rule` in `namespace` with the compiled instance.
///
/// With no namespace the earliest-loaded policy and its first namespace are
/// used; see [`InstanceCache::find_by_namespace`].
pub async fn evaluate(
    cache: &InstanceCache,
    input: &Value,
    namespace: Option<&str>,
    rule: &str,
) -> Result<Decision, EngineError> {
    let target = resolve_target(cache, namespace, rule)?;
    let entrypoint = target.entrypoint();
    let policy = target.entry.policy();
    let owned_input = input.clone();

    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || policy.evaluate(&entrypoint, &owned_input))
        .await
        .map_err(|e| EngineError::evaluation(format!("evaluation task failed: {e}")))?
        .map_err(wasm_error)?;
    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

    let allowed = is_allowed(result.as_ref());
    debug!(
        namespace = %target.namespace,
        rule = %target.rule,
        allowed,
        defined = result.is_some(),
        duration_us,
        "evaluated policy"
    );
    Ok(Decision {
        allowed,
        result,
        namespace: target.namespace,
        rule: target.rule,
        duration_us,
    })
}

fn wasm_error(err: WasmError) -> EngineError {
    match err {
        WasmError::InvalidInput(msg) => EngineError::new(ErrorCode::InvalidInput, msg)
            .with_suggestion("keep the input document under 1 MB"),
        WasmError::UnknownEntrypoint { name, available } => EngineError::new(
            ErrorCode::InvalidRule,
            format!("entrypoint '{name}' was not compiled into the policy"),
        )
        .with_suggestion(format!("available entrypoints: {}", available.join(", "))),
        e @ WasmError::UnsupportedBuiltin(_) => EngineError::evaluation(e.to_string())
            .with_suggestion("evaluate with a trace to run the policy through the toolchain"),
        e @ (WasmError::Timeout(_) | WasmError::MemoryExceeded(_)) => {
            EngineError::evaluation(e.to_string())
        }
        e @ (WasmError::Compilation(_) | WasmError::Abi(_) | WasmError::InvalidConfig(_)) => {
            EngineError::new(ErrorCode::ArtifactLoadError, e.to_string())
        }
        e @ (WasmError::Evaluation(_) | WasmError::InvalidOutput(_)) => {
            EngineError::evaluation(e.to_string())
        }
    }
}
