//! Heuristic extraction of package and rule declarations from Rego source.
//!
//! This is pattern matching over lines, not a parser. Rule heads are only
//! recognized when they start in column 0 (bodies are conventionally
//! indented, which keeps local assignments like `x := 1` out of the
//! results). Unusual formatting, such as a head split across lines or a
//! rule head indented inside a `# region`, can be missed or mis-detected.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// `package a.b.c` at the start of a line.
static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*package\s+([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)")
        .expect("package regex is valid")
});

/// A rule head in column 0: optional `default`, the name, an optional
/// partial-rule key, then `:=`, `=`, `{`, `if` or `contains`.
static RULE_HEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:default\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*(?:\[[^\]]*\]\s*)?(?::=|=[^=]|=\s*$|\{|if\b|contains\b)",
    )
    .expect("rule head regex is valid")
});

/// Words that can sit where a rule name would and must never be reported as one.
const RESERVED: &[&str] = &[
    "package", "import", "default", "not", "some", "every", "with", "as", "if", "else",
    "contains", "in", "true", "false", "null",
];

/// Package and rule names declared in a source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySource {
    /// Declared packages.
    pub namespaces: BTreeSet<String>,
    /// Declared rule names.
    pub rules: BTreeSet<String>,
}

impl PolicySource {
    /// Inspect raw source text.
    pub fn inspect(source: &str) -> Self {
        Self {
            namespaces: extract_namespaces(source),
            rules: extract_rule_names(source),
        }
    }
}

/// Extract every `package` declaration. Empty if there is none.
pub fn extract_namespaces(source: &str) -> BTreeSet<String> {
    source
        .lines()
        .filter_map(|line| PACKAGE_RE.captures(line))
        .map(|caps| caps[1].to_owned())
        .collect()
}

/// Extract rule names, including `default` rules.
pub fn extract_rule_names(source: &str) -> BTreeSet<String> {
    rule_heads(source).map(|(_, name)| name.to_owned()).collect()
}

/// Map each rule name to the 1-indexed line of its first head.
pub fn build_line_map(source: &str) -> LineMap {
    let mut first_lines = HashMap::new();
    let mut heads = Vec::new();
    for (line, name) in rule_heads(source) {
        first_lines.entry(name.to_owned()).or_insert(line);
        heads.push((line, name.to_owned()));
    }
    LineMap { first_lines, heads }
}

/// Read `path` and build its line map.
///
/// A read failure is not fatal: it logs a warning and returns an empty
/// map, so trace attribution falls back to toolchain-reported lines.
pub fn line_map_for_file(path: &Path) -> LineMap {
    match std::fs::read_to_string(path) {
        Ok(source) => build_line_map(&source),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read policy source for line map");
            LineMap::default()
        }
    }
}

fn rule_heads(source: &str) -> impl Iterator<Item = (u32, &str)> {
    source.lines().zip(1u32..).filter_map(|(text, line)| {
        let caps = RULE_HEAD_RE.captures(text)?;
        let name = caps.get(1)?.as_str();
        (!RESERVED.contains(&name)).then_some((line, name))
    })
}

/// Rule name to source line lookup built from a policy file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMap {
    first_lines: HashMap<String, u32>,
    /// Every head occurrence in line order.
    heads: Vec<(u32, String)>,
}

impl LineMap {
    /// Line of the first head declaring `rule`.
    pub fn line_of(&self, rule: &str) -> Option<u32> {
        self.first_lines.get(rule).copied()
    }

    /// The rule whose head most closely precedes (or is on) `line`.
    pub fn enclosing_rule(&self, line: u32) -> Option<&str> {
        let idx = self.heads.partition_point(|(head_line, _)| *head_line <= line);
        idx.checked_sub(1).map(|i| self.heads[i].1.as_str())
    }

    /// Number of distinct rule names.
    pub fn len(&self) -> usize {
        self.first_lines.len()
    }

    /// Whether no rule heads were found.
    pub fn is_empty(&self) -> bool {
        self.first_lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHZ: &str = r#"package authz.v1

import rego.v1

default allow := false

allow if {
    input.user.role == "admin"
}

is_owner if input.user.id == input.resource.owner

deny contains msg if {
    not allow
    msg := "denied"
}

violations[v] {
    v := input.items[_]
}

limit = 10

f(x) := x + 1
"#;

    #[test]
    fn extracts_dotted_namespace() {
        let namespaces = extract_namespaces(AUTHZ);
        assert_eq!(namespaces.into_iter().collect::<Vec<_>>(), vec!["authz.v1"]);
    }

    #[test]
    fn no_namespace_yields_empty_set() {
        assert!(extract_namespaces("allow := true\n").is_empty());
    }

    #[test]
    fn package_must_start_the_line() {
        assert!(extract_namespaces("# package commented\n").is_empty());
        assert!(extract_namespaces("x := \"package foo\"\n").is_empty());
    }

    #[test]
    fn extracts_rule_heads_of_every_form() {
        let rules = extract_rule_names(AUTHZ);
        let names: Vec<_> = rules.iter().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["allow", "deny", "is_owner", "limit", "violations"]
        );
    }

    #[test]
    fn body_assignments_and_functions_are_ignored() {
        let rules = extract_rule_names(AUTHZ);
        assert!(!rules.contains("msg"));
        assert!(!rules.contains("v"));
        assert!(!rules.contains("f"));
    }

    #[test]
    fn unindented_body_assignment_is_mistaken_for_a_head() {
        // Known limitation: only indentation separates a body local from a head.
        let source = "package authz\n\nallow if {\nx := input.n\nx > 1\n}\n";
        let rules = extract_rule_names(source);
        let names: Vec<_> = rules.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["allow", "x"]);

        let map = build_line_map(source);
        assert_eq!(map.line_of("x"), Some(4));
        assert_eq!(map.enclosing_rule(5), Some("x"));

        let indented = "package authz\n\nallow if {\n    x := input.n\n    x > 1\n}\n";
        assert!(!extract_rule_names(indented).contains("x"));
    }

    #[test]
    fn reserved_words_are_filtered() {
        let source = "allow if { true }\nelse := false {\n  true\n}\nimport future.keywords\n";
        let rules = extract_rule_names(source);
        assert!(rules.contains("allow"));
        assert!(!rules.contains("else"));
        assert!(!rules.contains("import"));
    }

    #[test]
    fn equality_is_not_a_head() {
        assert!(extract_rule_names("allow == true\n").is_empty());
    }

    #[test]
    fn line_map_keeps_first_occurrence() {
        let map = build_line_map(AUTHZ);
        assert_eq!(map.line_of("allow"), Some(5));
        assert_eq!(map.line_of("is_owner"), Some(11));
        assert_eq!(map.line_of("deny"), Some(13));
        assert_eq!(map.line_of("missing"), None);
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn enclosing_rule_uses_nearest_preceding_head() {
        let map = build_line_map(AUTHZ);
        assert_eq!(map.enclosing_rule(8), Some("allow"));
        assert_eq!(map.enclosing_rule(15), Some("deny"));
        assert_eq!(map.enclosing_rule(13), Some("deny"));
        assert_eq!(map.enclosing_rule(1), None);
    }

    #[test]
    fn unreadable_file_yields_empty_map() {
        let map = line_map_for_file(Path::new("/nonexistent/policy.rego"));
        assert!(map.is_empty());
    }

    #[test]
    fn inspect_collects_both_sets() {
        let source = PolicySource::inspect(AUTHZ);
        assert!(source.namespaces.contains("authz.v1"));
        assert!(source.rules.contains("allow"));
    }
}
