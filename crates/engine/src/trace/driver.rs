//! Runs a traced evaluation through `opa eval --explain`.
//!
//! A run moves through `Idle -> CompilingInput -> Invoking -> Parsing` and
//! ends in `Done` or `Failed`. The input document is written to a
//! [`tempfile::NamedTempFile`] that is deleted when the run ends, on every
//! path.

use std::fmt;
use std::io::Write;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::transform::{build_trace, parse_events, truncate_to_budget};
use super::{TraceLevel, TraceOptions, TracedDecision};
use crate::cache::InstanceCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorCode};
use crate::evaluator::{Decision, is_allowed, resolve_target};
use crate::toolchain::{
    ExplainMode, ExplainRequest, RETRY_SUGGESTION, Toolchain, ToolchainError,
};

/// Where a traced evaluation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Idle,
    CompilingInput,
    Invoking,
    Parsing,
    Done,
    Failed,
}

impl fmt::Display for TracePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CompilingInput => "compiling-input",
            Self::Invoking => "invoking",
            Self::Parsing => "parsing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct TraceRun {
    phase: TracePhase,
}

impl TraceRun {
    fn new() -> Self {
        Self {
            phase: TracePhase::Idle,
        }
    }

    fn advance(&mut self, next: TracePhase) {
        debug!(from = %self.phase, to = %next, "trace phase");
        self.phase = next;
    }

    /// Record the failure and hand the error back.
    fn fail(&mut self, err: EngineError) -> EngineError {
        warn!(phase = %self.phase, code = %err.code, error = %err.message, "traced evaluation failed");
        self.phase = TracePhase::Failed;
        err
    }
}

/// Explain mode used for a trace level.
pub fn explain_mode(level: TraceLevel) -> ExplainMode {
    match level {
        TraceLevel::Full => ExplainMode::Full,
        TraceLevel::Summary => ExplainMode::Notes,
    }
}

/// Evaluate `rule` through the toolchain's explain mode and return the
/// decision with its trace.
///
/// Namespace and rule are validated against the cache exactly as for
/// [`evaluate`](crate::evaluator::evaluate); the compiled instance itself
/// is not used.
pub async fn evaluate_with_trace(
    cache: &InstanceCache,
    toolchain: &dyn Toolchain,
    config: &EngineConfig,
    input: &Value,
    namespace: Option<&str>,
    rule: &str,
    options: TraceOptions,
) -> Result<TracedDecision, EngineError> {
    let target = resolve_target(cache, namespace, rule)?;
    let max_size_bytes = options.max_size_bytes.unwrap_or(config.default_trace_max_bytes);
    let started = Instant::now();
    let mut run = TraceRun::new();

    run.advance(TracePhase::CompilingInput);
    let input_file = write_input(input).map_err(|e| run.fail(e))?;

    run.advance(TracePhase::Invoking);
    let query = target.query();
    let raw = toolchain
        .eval_explain(&ExplainRequest {
            source: &target.entry.path,
            input: input_file.path(),
            query: &query,
            mode: explain_mode(options.level),
            max_output_bytes: config.trace_buffer_bytes(max_size_bytes),
        })
        .await
        .map_err(|e| run.fail(explain_error(e)))?;
    drop(input_file);

    run.advance(TracePhase::Parsing);
    if let Some(err) = embedded_error(&raw) {
        return Err(run.fail(err));
    }
    let result = decision_value(&raw);
    let events = parse_events(raw.get("explanation").unwrap_or(&Value::Null));
    let line_map = cache.line_map(&target.entry.path);
    let mut trace = build_trace(&events, &line_map, options.level, result.as_ref());
    truncate_to_budget(&mut trace, max_size_bytes);

    run.advance(TracePhase::Done);
    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    let allowed = is_allowed(result.as_ref());
    info!(
        namespace = %target.namespace,
        rule = %target.rule,
        allowed,
        events = events.len(),
        rules = trace.rules_evaluated.len(),
        truncated = trace.truncated,
        size_bytes = trace.size_bytes,
        duration_us,
        "traced evaluation"
    );

    Ok(TracedDecision {
        decision: Decision {
            allowed,
            result,
            namespace: target.namespace,
            rule: target.rule,
            duration_us,
        },
        trace,
    })
}

fn write_input(input: &Value) -> Result<tempfile::NamedTempFile, EngineError> {
    let io_error = |e: std::io::Error| {
        EngineError::evaluation(format!("failed to write trace input file: {e}"))
    };
    let mut file = tempfile::Builder::new()
        .prefix("warden-input-")
        .suffix(".json")
        .tempfile()
        .map_err(io_error)?;
    serde_json::to_writer(&mut file, input).map_err(|e| {
        EngineError::new(
            ErrorCode::InvalidInput,
            format!("input is not serializable as JSON: {e}"),
        )
    })?;
    file.flush().map_err(io_error)?;
    Ok(file)
}

/// The rule value at `result[0].expressions[0].value`.
pub fn decision_value(raw: &Value) -> Option<Value> {
    raw.get("result")?
        .get(0)?
        .get("expressions")?
        .get(0)?
        .get("value")
        .cloned()
}

/// `opa eval --format json` reports query errors as `{"errors": [...]}`.
fn embedded_error(raw: &Value) -> Option<EngineError> {
    let first = raw.get("errors")?.as_array()?.first()?;
    let message = first
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("evaluation failed");
    let code = first.get("code").and_then(Value::as_str).unwrap_or_default();
    let location = first.get("location");
    let coordinate = |key: &str| {
        location
            .and_then(|loc| loc.get(key))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };

    let error_code = if code == "rego_parse_error" {
        ErrorCode::SyntaxError
    } else {
        ErrorCode::EvaluationError
    };
    let detail = if code.is_empty() {
        message.to_owned()
    } else {
        format!("{code}: {message}")
    };
    Some(
        EngineError::new(error_code, detail)
            .with_location(coordinate("row"), coordinate("col")),
    )
}

fn explain_error(err: ToolchainError) -> EngineError {
    let retryable = err.is_retryable();
    let mapped = match err {
        ToolchainError::NotInstalled(binary) => EngineError::evaluation(format!(
            "policy toolchain '{binary}' is not installed or not on PATH; tracing requires it"
        ))
        .with_suggestion("install OPA: https://www.openpolicyagent.org/docs/latest/#running-opa")
        .with_suggestion("or set WARDEN_OPA_BINARY to the full path of the opa executable"),
        ToolchainError::Timeout { timeout, .. } => EngineError::evaluation(format!(
            "traced evaluation timed out after {}ms",
            timeout.as_millis()
        ))
        .with_suggestion("raise WARDEN_EVAL_TIMEOUT_MS or use the summary trace level"),
        ToolchainError::OutputTooLarge { limit, .. } => EngineError::evaluation(format!(
            "explain output exceeded the {limit} byte capture buffer"
        ))
        .with_suggestion("use the summary trace level")
        .with_suggestion("or raise the trace size budget"),
        ToolchainError::Failed { stdout, stderr, .. } => serde_json::from_str::<Value>(&stdout)
            .ok()
            .and_then(|raw| embedded_error(&raw))
            .unwrap_or_else(|| {
                let detail = if stderr.is_empty() { stdout } else { stderr };
                EngineError::evaluation(format!("traced evaluation failed: {detail}"))
            }),
        other => EngineError::evaluation(format!("traced evaluation failed: {other}")),
    };
    if retryable {
        mapped.with_suggestion(RETRY_SUGGESTION)
    } else {
        mapped
    }
}
