//! Compiles a policy source file into a WASM artifact with `opa build`.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use flate2::read::GzDecoder;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ErrorCode};
use crate::toolchain::{
    BuildRequest, RETRY_SUGGESTION, Toolchain, ToolchainError, ToolchainVersion,
};

/// Name of the compiled module inside a bundle.
pub const ARTIFACT_NAME: &str = "policy.wasm";

/// `file.rego:12: rego_parse_error: ...` with an optional column.
static PARSE_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m):(\d+)(?::(\d+))?:\s*rego_parse_error:\s*(.+)$")
        .expect("parse error regex is valid")
});

/// Any other located `rego_*_error` (type, compile, recursion...).
static LOCATED_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m):(\d+)(?::(\d+))?:\s*(rego_[a-z_]+_error:\s*.+)$")
        .expect("located error regex is valid")
});

/// The caret line under a quoted source line: tab, padding, `^`.
static CARET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t( *)\^").expect("caret regex is valid"));

/// Build entrypoints as `namespace × rule`, dots in the namespace turned
/// into path separators. With no rules, each namespace gets
/// `namespace/default_rule`.
pub fn entrypoints(
    namespaces: &BTreeSet<String>,
    rules: &BTreeSet<String>,
    default_rule: &str,
) -> Vec<String> {
    namespaces
        .iter()
        .flat_map(|ns| {
            let base = ns.replace('.', "/");
            if rules.is_empty() {
                vec![format!("{base}/{default_rule}")]
            } else {
                rules.iter().map(|rule| format!("{base}/{rule}")).collect()
            }
        })
        .collect()
}

/// Entrypoint name the compiled module exports for `namespace`/`rule`.
pub fn entrypoint_name(namespace: &str, rule: &str) -> String {
    format!("{}/{rule}", namespace.replace('.', "/"))
}

/// Fully qualified query for `opa eval`.
pub fn query_path(namespace: &str, rule: &str) -> String {
    format!("data.{namespace}.{rule}")
}

/// Compile `source` and return the bytes of its `policy.wasm`.
///
/// The build directory is a [`tempfile::TempDir`] and is removed when this
/// function returns, whichever way it returns.
pub async fn compile(
    toolchain: &dyn Toolchain,
    source: &Path,
    namespaces: &BTreeSet<String>,
    rules: &BTreeSet<String>,
    default_rule: &str,
) -> Result<Vec<u8>, EngineError> {
    let entrypoints = entrypoints(namespaces, rules, default_rule);
    let workdir = tempfile::Builder::new()
        .prefix("warden-build-")
        .tempdir()
        .map_err(|e| {
            EngineError::new(
                ErrorCode::CompilationError,
                format!("failed to create build directory: {e}"),
            )
        })?;
    let bundle = workdir.path().join("bundle.tar.gz");

    info!(
        source = %source.display(),
        entrypoints = entrypoints.len(),
        "compiling policy"
    );
    toolchain
        .build(&BuildRequest {
            source,
            entrypoints: &entrypoints,
            output: &bundle,
        })
        .await
        .map_err(|e| build_error(e, source))?;

    let artifact = extract_artifact(&bundle)?;
    debug!(source = %source.display(), bytes = artifact.len(), "extracted policy artifact");
    Ok(artifact)
}

/// Probe the toolchain version and warn if it is older than `minimum` or
/// cannot be determined. Never fails.
pub async fn check_version(toolchain: &dyn Toolchain, minimum: &str) -> Option<ToolchainVersion> {
    let version = match toolchain.version().await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "could not determine toolchain version");
            return None;
        }
    };
    match ToolchainVersion::parse(minimum) {
        Some(min) if version < min => {
            warn!(%version, minimum = %min, "toolchain is older than the supported minimum");
        }
        Some(_) => debug!(%version, "toolchain version ok"),
        None => warn!(minimum, "minimum toolchain version is malformed"),
    }
    Some(version)
}

/// Pull `policy.wasm` out of a gzipped tar bundle.
pub fn extract_artifact(bundle: &Path) -> Result<Vec<u8>, EngineError> {
    let artifact_error = |e: std::io::Error| {
        EngineError::new(
            ErrorCode::ArtifactLoadError,
            format!("failed to read bundle {}: {e}", bundle.display()),
        )
    };

    let file = File::open(bundle).map_err(artifact_error)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(artifact_error)? {
        let mut entry = entry.map_err(artifact_error)?;
        let is_artifact = {
            let path = entry.path().map_err(artifact_error)?;
            is_artifact_path(&path)
        };
        if is_artifact {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(artifact_error)?;
            return Ok(bytes);
        }
    }

    Err(EngineError::new(
        ErrorCode::ArtifactLoadError,
        format!("bundle does not contain {ARTIFACT_NAME}"),
    )
    .with_suggestion("check that `opa build -t wasm` is supported by the installed toolchain"))
}

fn is_artifact_path(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.trim_start_matches("./").trim_start_matches('/') == ARTIFACT_NAME
}

/// Map a failed build onto the public error taxonomy.
fn build_error(err: ToolchainError, source: &Path) -> EngineError {
    let retryable = err.is_retryable();
    let mapped = match err {
        ToolchainError::NotInstalled(binary) => EngineError::new(
            ErrorCode::CompilationError,
            format!("policy toolchain '{binary}' is not installed or not on PATH"),
        )
        .with_suggestion(
            "install OPA: https://www.openpolicyagent.org/docs/latest/#running-opa",
        )
        .with_suggestion("or set WARDEN_OPA_BINARY to the full path of the opa executable"),
        ToolchainError::Failed { stderr, .. } => diagnose_build_output(&stderr, source),
        ToolchainError::Timeout { timeout, .. } => EngineError::new(
            ErrorCode::CompilationError,
            format!("policy compilation timed out after {}ms", timeout.as_millis()),
        )
        .with_suggestion("raise WARDEN_BUILD_TIMEOUT_MS for very large policies"),
        other => EngineError::new(
            ErrorCode::CompilationError,
            format!("policy compilation failed: {other}"),
        ),
    };
    if retryable {
        mapped.with_suggestion(RETRY_SUGGESTION)
    } else {
        mapped
    }
}

/// Turn `opa build` stderr into a syntax or compilation error, recovering
/// the line and column when the output names them.
pub(crate) fn diagnose_build_output(stderr: &str, source: &Path) -> EngineError {
    let column_from_caret = || {
        CARET_RE
            .captures(stderr)
            .and_then(|caps| u32::try_from(caps[1].len() + 1).ok())
    };

    if let Some(caps) = PARSE_ERROR_RE.captures(stderr) {
        let line = caps[1].parse().ok();
        let column = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .or_else(column_from_caret);
        let detail = caps[3].trim();
        let mut err = EngineError::new(
            ErrorCode::SyntaxError,
            format!("syntax error in {}: {detail}", source.display()),
        )
        .with_location(line, column);
        if let Some(line) = line {
            err = err.with_suggestion(format!("check the syntax near line {line}"));
        }
        return err.with_suggestion("run `opa check` on the file for full diagnostics");
    }

    if let Some(caps) = LOCATED_ERROR_RE.captures(stderr) {
        let line = caps[1].parse().ok();
        let column = caps.get(2).and_then(|m| m.as_str().parse().ok());
        return EngineError::new(
            ErrorCode::CompilationError,
            format!("compilation failed: {}", caps[3].trim()),
        )
        .with_location(line, column);
    }

    let summary = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("no diagnostics");
    EngineError::new(
        ErrorCode::CompilationError,
        format!("compilation failed: {}", summary.trim()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::{MockFailure, MockToolchain};

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn entrypoints_are_the_cartesian_product() {
        let eps = entrypoints(&set(&["authz", "team.rbac"]), &set(&["allow", "deny"]), "allow");
        assert_eq!(
            eps,
            vec!["authz/allow", "authz/deny", "team/rbac/allow", "team/rbac/deny"]
        );
    }

    #[test]
    fn entrypoints_fall_back_to_default_rule() {
        let eps = entrypoints(&set(&["authz"]), &BTreeSet::new(), "allow");
        assert_eq!(eps, vec!["authz/allow"]);
        assert!(entrypoints(&BTreeSet::new(), &set(&["allow"]), "allow").is_empty());
    }

    #[test]
    fn names_and_queries() {
        assert_eq!(entrypoint_name("team.rbac", "allow"), "team/rbac/allow");
        assert_eq!(query_path("team.rbac", "allow"), "data.team.rbac.allow");
    }

    #[tokio::test]
    async fn compile_extracts_artifact_and_cleans_up() {
        let toolchain = MockToolchain::new().with_artifact(b"\0asm\x01\0\0\0custom".to_vec());
        let bytes = compile(
            &toolchain,
            Path::new("policy.rego"),
            &set(&["authz"]),
            &set(&["allow"]),
            "allow",
        )
        .await
        .unwrap();
        assert_eq!(bytes, b"\0asm\x01\0\0\0custom");
        assert_eq!(toolchain.last_entrypoints(), vec!["authz/allow"]);

        let bundle = toolchain.last_bundle_path().unwrap();
        assert!(!bundle.exists());
        assert!(!bundle.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn missing_artifact_is_an_artifact_error() {
        let toolchain = MockToolchain::new().without_artifact();
        let err = compile(&toolchain, Path::new("p.rego"), &set(&["a"]), &set(&["allow"]), "allow")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ArtifactLoadError);
    }

    #[tokio::test]
    async fn build_directory_is_removed_on_failure() {
        let toolchain = MockToolchain::new().with_build_failure(MockFailure::Failed {
            stderr: "1 error occurred: boom".into(),
            stdout: String::new(),
        });
        let err = compile(&toolchain, Path::new("p.rego"), &set(&["a"]), &set(&["allow"]), "allow")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CompilationError);
        let bundle = toolchain.last_bundle_path().unwrap();
        assert!(!bundle.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn missing_toolchain_has_install_suggestion() {
        let toolchain = MockToolchain::new().with_build_failure(MockFailure::NotInstalled);
        let err = compile(&toolchain, Path::new("p.rego"), &set(&["a"]), &set(&["allow"]), "allow")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CompilationError);
        assert!(err.message.contains("not installed"));
        assert!(err.suggestions[0].contains("install OPA"));
        assert!(!err.suggestions.iter().any(|s| s == RETRY_SUGGESTION));
    }

    #[tokio::test]
    async fn build_timeout_is_a_compilation_error() {
        let toolchain = MockToolchain::new().with_build_failure(MockFailure::Timeout);
        let err = compile(&toolchain, Path::new("p.rego"), &set(&["a"]), &set(&["allow"]), "allow")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CompilationError);
        assert!(err.message.contains("timed out"));
        assert_eq!(err.suggestions.last().map(String::as_str), Some(RETRY_SUGGESTION));
    }

    #[test]
    fn parse_error_with_caret_yields_line_and_column() {
        let stderr = "1 error occurred: /tmp/p.rego:7: rego_parse_error: unexpected identifier token\n\
                      \tallow iff {\n\
                      \t      ^\n";
        let err = diagnose_build_output(stderr, Path::new("/tmp/p.rego"));
        assert_eq!(err.code, ErrorCode::SyntaxError);
        assert_eq!(err.line, Some(7));
        assert_eq!(err.column, Some(7));
        assert!(err.message.contains("unexpected identifier token"));
        assert!(err.suggestions.iter().any(|s| s.contains("line 7")));
    }

    #[test]
    fn parse_error_with_explicit_column() {
        let err = diagnose_build_output(
            "p.rego:3:12: rego_parse_error: unexpected eof token",
            Path::new("p.rego"),
        );
        assert_eq!(err.code, ErrorCode::SyntaxError);
        assert_eq!((err.line, err.column), (Some(3), Some(12)));
    }

    #[test]
    fn type_error_is_a_located_compilation_error() {
        let err = diagnose_build_output(
            "1 error occurred: p.rego:9: rego_type_error: undefined function foo",
            Path::new("p.rego"),
        );
        assert_eq!(err.code, ErrorCode::CompilationError);
        assert_eq!(err.line, Some(9));
        assert!(err.message.contains("rego_type_error"));
    }

    #[test]
    fn unlocated_failure_uses_first_line() {
        let err = diagnose_build_output("\nerror: something broke\nmore", Path::new("p.rego"));
        assert_eq!(err.code, ErrorCode::CompilationError);
        assert_eq!(err.message, "compilation failed: error: something broke");
        assert_eq!(err.line, None);
    }

    #[test]
    fn artifact_names_are_normalized() {
        assert!(is_artifact_path(Path::new("/policy.wasm")));
        assert!(is_artifact_path(Path::new("./policy.wasm")));
        assert!(is_artifact_path(Path::new("policy.wasm")));
        assert!(!is_artifact_path(Path::new("nested/policy.wasm")));
        assert!(!is_artifact_path(Path::new("data.json")));
    }

    #[tokio::test]
    async fn version_check_never_fails() {
        let old = MockToolchain::new().with_version(ToolchainVersion {
            major: 0,
            minor: 30,
            patch: 0,
        });
        let version = check_version(&old, "0.40.0").await.unwrap();
        assert_eq!(version.to_string(), "0.30.0");
        assert!(check_version(&old, "garbage").await.is_some());
    }
}
