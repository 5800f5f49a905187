//! Structured errors returned across the engine's public boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error code. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    FileNotFound,
    SyntaxError,
    CompilationError,
    EvaluationError,
    InvalidInput,
    InvalidNamespace,
    InvalidRule,
    PathSecurityError,
    ArtifactLoadError,
}

impl ErrorCode {
    /// Return the kebab-case string representation (matches serde serialization).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNotFound => "file-not-found",
            Self::SyntaxError => "syntax-error",
            Self::CompilationError => "compilation-error",
            Self::EvaluationError => "evaluation-error",
            Self::InvalidInput => "invalid-input",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidRule => "invalid-rule",
            Self::PathSecurityError => "path-security-error",
            Self::ArtifactLoadError => "artifact-load-error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine failure with a code, a message, an optional source position
/// and actionable suggestions.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct EngineError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// 1-indexed source line, when the failure maps to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-indexed source column, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Ordered remediation hints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl EngineError {
    /// Create an error with no position and no suggestions.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            line: None,
            column: None,
            suggestions: Vec::new(),
        }
    }

    /// Attach a source position.
    #[must_use]
    pub fn with_location(mut self, line: Option<u32>, column: Option<u32>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    /// Append a suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub(crate) fn file_not_found(path: &std::path::Path) -> Self {
        Self::new(
            ErrorCode::FileNotFound,
            format!("policy file not found: {}", path.display()),
        )
        .with_suggestion("check the path and that the file is readable")
    }

    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EvaluationError, message)
    }
}
