//! Converts `opa eval --explain` events into an [`EvaluationTrace`].

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    EvaluationTrace, ExecutionPathEntry, RuleTraceEntry, TraceLevel, TraceNote, TriState,
};
use crate::evaluator::is_allowed;
use crate::source::LineMap;

/// One event of the explanation stream. Unknown fields are ignored and
/// missing ones default, so older and newer toolchains both parse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub query_id: u64,
    #[serde(default)]
    pub parent_id: u64,
    #[serde(default)]
    pub location: Option<RawLocation>,
    #[serde(default)]
    pub node: Option<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub locals: Vec<RawBinding>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLocation {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub row: u32,
    #[serde(default)]
    pub col: u32,
}

/// A `{key, value}` pair of AST terms.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBinding {
    pub key: Value,
    pub value: Value,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<RawBinding>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<RawBinding>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse the `explanation` array, skipping events that do not deserialize.
pub fn parse_events(explanation: &Value) -> Vec<RawEvent> {
    let Some(items) = explanation.as_array() else {
        return Vec::new();
    };
    let mut skipped = 0usize;
    let events: Vec<RawEvent> = items
        .iter()
        .filter_map(|item| {
            RawEvent::deserialize(item)
                .map_err(|_| skipped += 1)
                .ok()
        })
        .collect();
    if skipped > 0 {
        debug!(skipped, "ignored malformed trace events");
    }
    events
}

/// Build a trace from raw events.
///
/// `result` is the rule's value (`None` when undefined). Size and
/// truncation are left for [`truncate_to_budget`].
pub fn build_trace(
    events: &[RawEvent],
    line_map: &LineMap,
    level: TraceLevel,
    result: Option<&Value>,
) -> EvaluationTrace {
    let outcomes = next_outcomes(events);
    let mut seen: HashSet<(String, u32)> = HashSet::new();
    let mut rules_evaluated = Vec::new();
    let mut execution_path = Vec::new();
    let mut variable_bindings = BTreeMap::new();
    let mut notes = Vec::new();

    for (event, outcome) in events.iter().zip(&outcomes) {
        for binding in &event.locals {
            if let Some(name) = binding_name(&binding.key) {
                variable_bindings.insert(name, render_term(&binding.value));
            }
        }

        let reported = event.location.as_ref().filter(|loc| loc.row > 0);

        if event.op == "Note" {
            if let Some(message) = &event.message {
                notes.push(TraceNote {
                    message: message.clone(),
                    line: reported.map(|loc| loc.row),
                });
            }
            continue;
        }

        if event.op != "Enter" && event.op != "Eval" {
            continue;
        }
        let Some(location) = reported else { continue };
        let Some(name) = event.node.as_ref().and_then(node_rule_name) else {
            continue;
        };

        let (line, column) = match line_map.line_of(&name) {
            Some(line) if line != location.row => (line, None),
            _ => (location.row, (location.col > 0).then_some(location.col)),
        };
        if !seen.insert((name.clone(), line)) {
            continue;
        }

        let result = match outcome {
            Some(Outcome::Exit) => TriState::True,
            Some(Outcome::Fail) => TriState::False,
            None => TriState::Undefined,
        };
        let parent = line_map
            .enclosing_rule(location.row)
            .filter(|enclosing| *enclosing != name)
            .map(str::to_owned);

        execution_path.push(ExecutionPathEntry {
            rule: name.clone(),
            fired: result == TriState::True,
            line: Some(line),
            parent,
        });
        rules_evaluated.push(RuleTraceEntry {
            name,
            line,
            column,
            result,
        });
    }

    EvaluationTrace {
        rules_evaluated,
        variable_bindings,
        final_decision: result.map(|value| is_allowed(Some(value))),
        execution_path,
        level,
        truncated: false,
        size_bytes: 0,
        notes,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exit,
    Fail,
}

/// For each event, the first later `Exit` or `Fail` carrying the same
/// query id.
fn next_outcomes(events: &[RawEvent]) -> Vec<Option<Outcome>> {
    let mut latest: HashMap<u64, Outcome> = HashMap::new();
    let mut outcomes = vec![None; events.len()];
    for (i, event) in events.iter().enumerate().rev() {
        outcomes[i] = latest.get(&event.query_id).copied();
        match event.op.as_str() {
            "Exit" => {
                latest.insert(event.query_id, Outcome::Exit);
            }
            "Fail" => {
                latest.insert(event.query_id, Outcome::Fail);
            }
            _ => {}
        }
    }
    outcomes
}

/// Rule name for an event node: a rule head's name, or the name of the
/// first term of an expression or body.
fn node_rule_name(node: &Value) -> Option<String> {
    if let Some(head) = node.get("head") {
        if let Some(name) = head.get("name").and_then(Value::as_str) {
            if !name.is_empty() {
                return Some(name.to_owned());
            }
        }
        return head
            .get("ref")
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(term_name);
    }
    if let Some(terms) = node.get("terms") {
        return match terms {
            Value::Array(terms) => terms.first().and_then(term_name),
            term => term_name(term),
        };
    }
    if let Some(body) = node.as_array() {
        return body.first().and_then(node_rule_name);
    }
    term_name(node)
}

fn term_name(term: &Value) -> Option<String> {
    let value = term.get("value")?;
    match term.get("type")?.as_str()? {
        "var" => value.as_str().map(str::to_owned),
        "ref" => {
            let parts = value.as_array()?;
            let is_data = parts
                .first()
                .is_some_and(|head| head.get("value").and_then(Value::as_str) == Some("data"));
            if is_data {
                // `data.pkg.rule` is attributed to `rule`.
                parts
                    .last()
                    .and_then(|last| last.get("value"))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            } else {
                Some(render_ref(parts))
            }
        }
        "call" => value.as_array()?.first().and_then(term_name),
        _ => None,
    }
}

/// Variable name of a binding key, skipping compiler-generated names.
fn binding_name(key: &Value) -> Option<String> {
    let name = match key.get("value") {
        Some(Value::String(name)) => name.clone(),
        _ => key.as_str()?.to_owned(),
    };
    (!name.starts_with("__") && !name.starts_with('$')).then_some(name)
}

/// Render an AST term as plain JSON.
pub fn render_term(term: &Value) -> Value {
    let (Some(kind), Some(value)) = (term.get("type").and_then(Value::as_str), term.get("value"))
    else {
        return term.clone();
    };
    match kind {
        "null" => Value::Null,
        "boolean" | "number" | "string" | "var" => value.clone(),
        "array" | "set" => Value::Array(
            value
                .as_array()
                .map(|items| items.iter().map(render_term).collect())
                .unwrap_or_default(),
        ),
        "object" => {
            let mut object = Map::new();
            for pair in value.as_array().into_iter().flatten() {
                if let Some([k, v]) = pair.as_array().map(Vec::as_slice) {
                    let key = match render_term(k) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    object.insert(key, render_term(v));
                }
            }
            Value::Object(object)
        }
        "ref" => Value::String(render_ref(value.as_array().map_or(&[][..], Vec::as_slice))),
        "call" => {
            let parts = value.as_array().map_or(&[][..], Vec::as_slice);
            let name = parts.first().and_then(term_name).unwrap_or_default();
            let args: Vec<String> = parts
                .iter()
                .skip(1)
                .map(|arg| render_term(arg).to_string())
                .collect();
            Value::String(format!("{name}({})", args.join(", ")))
        }
        _ => value.clone(),
    }
}

/// `data.authz["x-y"][i]` style rendering of a reference.
fn render_ref(parts: &[Value]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
        let value = part.get("value").cloned().unwrap_or(Value::Null);
        match (i, kind, &value) {
            (0, _, Value::String(head)) => out.push_str(head),
            (_, "string", Value::String(segment)) if is_identifier(segment) => {
                out.push('.');
                out.push_str(segment);
            }
            (_, "var", Value::String(var)) => {
                out.push('[');
                out.push_str(var);
                out.push(']');
            }
            _ => {
                out.push('[');
                out.push_str(&render_term(part).to_string());
                out.push(']');
            }
        }
    }
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Serialized size of `trace`.
pub fn measure(trace: &EvaluationTrace) -> usize {
    serde_json::to_vec(trace).map_or(0, |bytes| bytes.len())
}

/// Store the serialized size in `size_bytes`. The field is itself part of
/// the serialization, so repeat until the digits settle.
fn remeasure(trace: &mut EvaluationTrace) {
    for _ in 0..4 {
        let size = measure(trace);
        if size == trace.size_bytes {
            return;
        }
        trace.size_bytes = size;
    }
}

/// Shrink `trace` until it fits `max_size_bytes`.
///
/// The rule and path lists lose their newer half on each pass until the
/// trace fits or both are empty. If it still does not fit, variable
/// bindings and then notes are dropped. `truncated` is set if anything was
/// removed, and `size_bytes` always holds the final measured size.
pub fn truncate_to_budget(trace: &mut EvaluationTrace, max_size_bytes: usize) {
    remeasure(trace);

    while trace.size_bytes > max_size_bytes
        && (!trace.rules_evaluated.is_empty() || !trace.execution_path.is_empty())
    {
        trace.rules_evaluated.truncate(trace.rules_evaluated.len() / 2);
        trace.execution_path.truncate(trace.execution_path.len() / 2);
        trace.truncated = true;
        remeasure(trace);
    }

    if trace.size_bytes > max_size_bytes && !trace.variable_bindings.is_empty() {
        trace.variable_bindings.clear();
        trace.truncated = true;
        remeasure(trace);
    }

    if trace.size_bytes > max_size_bytes && !trace.notes.is_empty() {
        trace.notes.clear();
        trace.truncated = true;
        remeasure(trace);
    }

    if trace.truncated {
        debug!(size_bytes = trace.size_bytes, max_size_bytes, "truncated trace");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::source::build_line_map;

    const SOURCE: &str = "package authz\n\ndefault allow := false\n\nallow if {\n    is_admin\n}\n\nis_admin if input.user.role == \"admin\"\n";

    fn var(name: &str) -> Value {
        json!({"type": "var", "value": name})
    }

    fn string(s: &str) -> Value {
        json!({"type": "string", "value": s})
    }

    fn data_ref(rule: &str) -> Value {
        json!({"type": "ref", "value": [var("data"), string("authz"), string(rule)]})
    }

    fn event(op: &str, query_id: u64, row: u32, node: Value) -> Value {
        json!({
            "op": op,
            "query_id": query_id,
            "parent_id": 0,
            "location": {"file": "authz.rego", "row": row, "col": 1},
            "node": node,
            "locals": null,
        })
    }

    fn admin_stream() -> Value {
        json!([
            event("Enter", 0, 1, json!([{"index": 0, "terms": data_ref("allow")}])),
            event("Enter", 1, 5, json!({"head": {"name": "allow"}, "body": []})),
            event("Eval", 1, 6, json!({"index": 0, "terms": data_ref("is_admin")})),
            event("Enter", 2, 9, json!({"head": {"name": "is_admin"}, "body": []})),
            event("Eval", 2, 9, json!({"index": 0, "terms": [
                {"type": "ref", "value": [var("eq")]},
                {"type": "ref", "value": [var("input"), string("user"), string("role")]},
                string("admin"),
            ]})),
            {
                "op": "Exit", "query_id": 2, "parent_id": 1,
                "location": {"row": 9, "col": 1},
                "locals": [{"key": var("role"), "value": string("admin")}],
            },
            {"op": "Exit", "query_id": 1, "parent_id": 0, "location": {"row": 5, "col": 1}},
            {"op": "Exit", "query_id": 0, "parent_id": 0},
        ])
    }

    fn trace_for(stream: &Value, result: Option<&Value>) -> EvaluationTrace {
        let events = parse_events(stream);
        build_trace(&events, &build_line_map(SOURCE), TraceLevel::Full, result)
    }

    #[test]
    fn rules_are_attributed_to_their_heads() {
        let trace = trace_for(&admin_stream(), Some(&json!(true)));
        let names: Vec<(&str, u32)> = trace
            .rules_evaluated
            .iter()
            .map(|r| (r.name.as_str(), r.line))
            .collect();
        // `allow` is reported at row 1 by the query and row 5 by the rule;
        // both map to its first head on line 3.
        assert_eq!(names, vec![("allow", 3), ("is_admin", 9), ("eq", 9)]);
        assert_eq!(trace.final_decision, Some(true));
    }

    #[test]
    fn results_come_from_the_next_exit_or_fail() {
        let stream = json!([
            event("Enter", 1, 5, json!({"head": {"name": "allow"}})),
            event("Eval", 2, 9, json!({"head": {"name": "is_admin"}})),
            {"op": "Fail", "query_id": 2},
            event("Eval", 3, 12, json!({"terms": [var("orphan")]})),
            {"op": "Exit", "query_id": 1},
        ]);
        let trace = trace_for(&stream, Some(&json!(false)));
        let results: Vec<_> = trace.rules_evaluated.iter().map(|r| (r.name.as_str(), r.result)).collect();
        assert_eq!(
            results,
            vec![
                ("allow", TriState::True),
                ("is_admin", TriState::False),
                ("orphan", TriState::Undefined),
            ]
        );
        let fired: Vec<bool> = trace.execution_path.iter().map(|p| p.fired).collect();
        assert_eq!(fired, vec![true, false, false]);
        assert_eq!(trace.final_decision, Some(false));
    }

    #[test]
    fn every_rule_entry_has_one_path_entry() {
        let trace = trace_for(&admin_stream(), Some(&json!(true)));
        assert_eq!(trace.rules_evaluated.len(), trace.execution_path.len());
        for (rule, step) in trace.rules_evaluated.iter().zip(&trace.execution_path) {
            assert_eq!(rule.name, step.rule);
            assert_eq!(Some(rule.line), step.line);
        }
    }

    #[test]
    fn expressions_get_their_enclosing_rule_as_parent() {
        let trace = trace_for(&admin_stream(), Some(&json!(true)));
        let eq = trace.execution_path.iter().find(|p| p.rule == "eq").unwrap();
        assert_eq!(eq.parent.as_deref(), Some("is_admin"));
        let is_admin = trace.execution_path.iter().find(|p| p.rule == "is_admin").unwrap();
        assert_eq!(is_admin.parent.as_deref(), Some("allow"));
    }

    #[test]
    fn unmapped_rules_keep_reported_position() {
        let stream = json!([event("Eval", 1, 42, json!({"terms": [var("helper")]}))]);
        let trace = trace_for(&stream, None);
        assert_eq!(trace.rules_evaluated[0].line, 42);
        assert_eq!(trace.rules_evaluated[0].column, Some(1));
        assert_eq!(trace.final_decision, None);
    }

    #[test]
    fn events_without_location_or_name_are_skipped() {
        let stream = json!([
            {"op": "Enter", "query_id": 1, "node": {"head": {"name": "allow"}}},
            event("Eval", 1, 5, json!({"terms": [string("literal")]})),
            event("Redo", 1, 5, json!({"head": {"name": "allow"}})),
        ]);
        assert!(trace_for(&stream, None).rules_evaluated.is_empty());
    }

    #[test]
    fn bindings_keep_last_value_and_skip_generated_names() {
        let stream = json!([
            {"op": "Eval", "query_id": 1, "locals": [
                {"key": var("x"), "value": {"type": "number", "value": 1}},
                {"key": var("__local0__"), "value": string("hidden")},
            ]},
            {"op": "Eval", "query_id": 1, "locals": [
                {"key": var("x"), "value": {"type": "number", "value": 2}},
                {"key": var("user"), "value": {"type": "object", "value": [
                    [string("role"), string("admin")],
                ]}},
            ]},
        ]);
        let trace = trace_for(&stream, None);
        assert_eq!(trace.variable_bindings.len(), 2);
        assert_eq!(trace.variable_bindings["x"], json!(2));
        assert_eq!(trace.variable_bindings["user"], json!({"role": "admin"}));
    }

    #[test]
    fn notes_are_collected() {
        let stream = json!([
            {"op": "Note", "query_id": 1, "message": "checking role", "location": {"row": 6, "col": 5}},
            {"op": "Note", "query_id": 1},
        ]);
        let trace = trace_for(&stream, None);
        assert_eq!(
            trace.notes,
            vec![TraceNote {
                message: "checking role".into(),
                line: Some(6)
            }]
        );
    }

    #[test]
    fn malformed_events_are_ignored() {
        let stream = json!([42, "x", event("Eval", 1, 9, json!({"head": {"name": "is_admin"}}))]);
        assert_eq!(parse_events(&stream).len(), 1);
        assert!(parse_events(&json!({"not": "an array"})).is_empty());
    }

    #[test]
    fn terms_render_as_plain_json() {
        let term = json!({"type": "array", "value": [
            {"type": "null", "value": null},
            {"type": "boolean", "value": true},
            {"type": "set", "value": [string("a")]},
            {"type": "ref", "value": [var("input"), string("user"), string("x-y"), var("i"), {"type": "number", "value": 0}]},
            {"type": "call", "value": [{"type": "ref", "value": [var("count")]}, var("xs")]},
        ]});
        assert_eq!(
            render_term(&term),
            json!([null, true, ["a"], "input.user[\"x-y\"][i][0]", "count(\"xs\")"])
        );
    }

    fn large_trace(entries: u32) -> EvaluationTrace {
        let events: Vec<Value> = (1..=entries)
            .map(|i| event("Eval", u64::from(i), i, json!({"terms": [var(&format!("rule_{i:04}"))]})))
            .collect();
        trace_for(&Value::Array(events), Some(&json!(true)))
    }

    #[test]
    fn small_traces_are_untouched() {
        let mut trace = trace_for(&admin_stream(), Some(&json!(true)));
        let before = trace.rules_evaluated.len();
        truncate_to_budget(&mut trace, 1024 * 1024);
        assert!(!trace.truncated);
        assert_eq!(trace.rules_evaluated.len(), before);
        assert_eq!(trace.size_bytes, measure(&trace));
    }

    #[test]
    fn oversized_traces_are_halved_until_they_fit() {
        let mut trace = large_trace(200);
        let original = measure(&trace);
        assert!(original > 10 * 1024);

        truncate_to_budget(&mut trace, 1024);
        assert!(trace.truncated);
        assert!(trace.size_bytes <= 1024);
        assert_eq!(trace.size_bytes, measure(&trace));
        assert_eq!(trace.rules_evaluated.len(), trace.execution_path.len());
        // The oldest entries survive.
        assert_eq!(trace.rules_evaluated[0].name, "rule_0001");
    }

    #[test]
    fn bindings_are_dropped_as_a_last_resort() {
        let mut trace = large_trace(4);
        trace
            .variable_bindings
            .insert("blob".into(), Value::String("x".repeat(4096)));
        truncate_to_budget(&mut trace, 1024);
        assert!(trace.truncated);
        assert!(trace.rules_evaluated.is_empty());
        assert!(trace.variable_bindings.is_empty());
        assert!(trace.size_bytes <= 1024);
    }
}
