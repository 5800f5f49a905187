//! The external policy toolchain, reached only as a subprocess.
//!
//! [`Toolchain`] is the seam between the engine and `opa`: builds produce a
//! bundle archive, explain runs produce raw JSON. [`OpaCli`] drives the real
//! binary; [`MockToolchain`] stands in for it in tests.

mod mock;
mod opa;

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{MockFailure, MockToolchain, RecordedExplain};
pub use opa::OpaCli;

/// `Version: 0.68.0` line printed by `opa version`.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Version:\s*v?(\d+)\.(\d+)\.(\d+)").expect("version regex is valid")
});

/// Errors from running the toolchain.
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// The executable could not be found. Not retryable.
    #[error("toolchain executable '{0}' was not found")]
    NotInstalled(String),

    /// The toolchain ran and rejected the request.
    #[error("`opa {subcommand}` failed ({status}): {stderr}")]
    Failed {
        /// Subcommand that failed.
        subcommand: &'static str,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
        /// Captured standard output (`opa eval` reports errors here as JSON).
        stdout: String,
    },

    /// The subprocess did not finish in time and was killed.
    #[error("`opa {subcommand}` timed out after {timeout:?}")]
    Timeout {
        /// Subcommand that timed out.
        subcommand: &'static str,
        /// Configured limit.
        timeout: Duration,
    },

    /// Standard output exceeded the capture buffer.
    #[error("`opa {subcommand}` produced more than {limit} bytes of output")]
    OutputTooLarge {
        /// Subcommand whose output overflowed.
        subcommand: &'static str,
        /// Capture buffer size.
        limit: usize,
    },

    /// The toolchain produced output the engine cannot interpret.
    #[error("unexpected toolchain output: {0}")]
    InvalidOutput(String),

    /// I/O error spawning or talking to the subprocess.
    #[error("I/O error running toolchain: {0}")]
    Io(#[from] std::io::Error),
}

/// Suggestion attached to errors from retryable toolchain failures.
pub(crate) const RETRY_SUGGESTION: &str = "the toolchain failure may be transient; retry the request";

impl ToolchainError {
    /// Returns `true` if retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_))
    }
}

/// A `major.minor.patch` toolchain version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolchainVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolchainVersion {
    /// Parse `X.Y.Z` (an optional leading `v` is accepted).
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().trim_start_matches('v').splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Find the `Version: X.Y.Z` line in `opa version` output.
    pub fn from_version_output(output: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(output)?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }
}

impl fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How much the explain run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainMode {
    /// Every evaluation step.
    Full,
    /// Only `trace()` notes and their context.
    Notes,
}

impl ExplainMode {
    /// The `--explain` argument value.
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Notes => "notes",
        }
    }
}

/// Arguments for a bundle build.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Policy source file.
    pub source: &'a Path,
    /// Entrypoints as `pkg/path/rule`.
    pub entrypoints: &'a [String],
    /// Where the gzipped bundle archive is written.
    pub output: &'a Path,
}

/// Arguments for an explain evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ExplainRequest<'a> {
    /// Policy source file passed as data.
    pub source: &'a Path,
    /// File holding the JSON input document.
    pub input: &'a Path,
    /// Fully qualified query, e.g. `data.authz.allow`.
    pub query: &'a str,
    /// Explain detail.
    pub mode: ExplainMode,
    /// Capture buffer for standard output.
    pub max_output_bytes: usize,
}

/// The external compiler/evaluator.
#[async_trait::async_trait]
pub trait Toolchain: Send + Sync + fmt::Debug {
    /// Report the installed version.
    async fn version(&self) -> Result<ToolchainVersion, ToolchainError>;

    /// Compile the source into a gzipped bundle containing `/policy.wasm`.
    async fn build(&self, request: &BuildRequest<'_>) -> Result<(), ToolchainError>;

    /// Evaluate a query with explanation enabled and return the raw JSON
    /// document (`result` plus `explanation`).
    async fn eval_explain(
        &self,
        request: &ExplainRequest<'_>,
    ) -> Result<serde_json::Value, ToolchainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_prefixed_versions() {
        assert_eq!(
            ToolchainVersion::parse("0.68.1"),
            Some(ToolchainVersion {
                major: 0,
                minor: 68,
                patch: 1
            })
        );
        assert_eq!(
            ToolchainVersion::parse("v1.2.3").map(|v| v.to_string()),
            Some("1.2.3".to_owned())
        );
        assert!(ToolchainVersion::parse("1.2").is_none());
        assert!(ToolchainVersion::parse("latest").is_none());
    }

    #[test]
    fn version_line_is_found_in_output() {
        let output = "Version: 0.70.0\nBuild Commit: abc\nGo Version: go1.22\nWebAssembly: available\n";
        let version = ToolchainVersion::from_version_output(output).unwrap();
        assert_eq!(version.to_string(), "0.70.0");
        assert!(ToolchainVersion::from_version_output("opa dev build").is_none());
    }

    #[test]
    fn versions_compare_numerically() {
        let old = ToolchainVersion::parse("0.9.10").unwrap();
        let new = ToolchainVersion::parse("0.10.0").unwrap();
        assert!(old < new);
        assert!(ToolchainVersion::parse("1.0.0").unwrap() > new);
    }

    #[test]
    fn retryable_errors() {
        assert!(
            ToolchainError::Timeout {
                subcommand: "build",
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(!ToolchainError::NotInstalled("opa".into()).is_retryable());
        assert!(!ToolchainError::InvalidOutput("x".into()).is_retryable());
    }

    #[test]
    fn explain_mode_arguments() {
        assert_eq!(ExplainMode::Full.as_arg(), "full");
        assert_eq!(ExplainMode::Notes.as_arg(), "notes");
    }
}
