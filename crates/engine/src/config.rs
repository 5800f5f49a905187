//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_wasm_runtime::WasmRuntimeConfig;

use crate::error::{EngineError, ErrorCode};
use crate::toolchain::ToolchainVersion;

/// Default build timeout: 30 seconds.
pub const DEFAULT_BUILD_TIMEOUT_MS: u64 = 30_000;

/// Default explain-eval timeout: 10 seconds.
pub const DEFAULT_EVAL_TIMEOUT_MS: u64 = 10_000;

/// Default `opa version` probe timeout: 5 seconds.
pub const DEFAULT_VERSION_TIMEOUT_MS: u64 = 5_000;

/// Maximum subprocess timeout: 10 minutes.
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Per-instance memory estimate above which `load` logs a warning: 50 MB.
pub const DEFAULT_MAX_INSTANCE_MEMORY_BYTES: u64 = 50 * 1024 * 1024;

/// Oldest toolchain release known to produce compatible bundles and traces.
pub const DEFAULT_MIN_TOOLCHAIN_VERSION: &str = "0.40.0";

/// Floor for the explain-output capture buffer: 8 MB.
pub const DEFAULT_TRACE_BUFFER_MIN_BYTES: usize = 8 * 1024 * 1024;

/// Default trace size budget when the caller does not supply one: 256 KB.
pub const DEFAULT_TRACE_MAX_BYTES: usize = 256 * 1024;

/// Configuration for a [`PolicyEngine`](crate::PolicyEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path or name of the `opa` executable.
    pub opa_binary: PathBuf,
    /// Timeout for `opa build`.
    pub build_timeout_ms: u64,
    /// Timeout for `opa eval --explain`.
    pub eval_timeout_ms: u64,
    /// Timeout for `opa version`.
    pub version_timeout_ms: u64,
    /// Rule evaluated when the caller names none.
    pub default_rule: String,
    /// Estimated per-instance memory above which a warning is logged.
    pub max_instance_memory_bytes: u64,
    /// Minimum supported toolchain version (`X.Y.Z`).
    pub min_toolchain_version: String,
    /// Lower bound for the explain-output capture buffer.
    pub trace_buffer_min_bytes: usize,
    /// The capture buffer is `max(trace_buffer_min_bytes, budget * multiplier)`.
    pub trace_buffer_multiplier: usize,
    /// Trace size budget used when the caller does not set one.
    pub default_trace_max_bytes: usize,
    /// Settings for the compiled-policy runtime.
    pub wasm: WasmRuntimeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opa_binary: PathBuf::from("opa"),
            build_timeout_ms: DEFAULT_BUILD_TIMEOUT_MS,
            eval_timeout_ms: DEFAULT_EVAL_TIMEOUT_MS,
            version_timeout_ms: DEFAULT_VERSION_TIMEOUT_MS,
            default_rule: "allow".to_owned(),
            max_instance_memory_bytes: DEFAULT_MAX_INSTANCE_MEMORY_BYTES,
            min_toolchain_version: DEFAULT_MIN_TOOLCHAIN_VERSION.to_owned(),
            trace_buffer_min_bytes: DEFAULT_TRACE_BUFFER_MIN_BYTES,
            trace_buffer_multiplier: 16,
            default_trace_max_bytes: DEFAULT_TRACE_MAX_BYTES,
            wasm: WasmRuntimeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Reads:
    /// - `WARDEN_OPA_BINARY`
    /// - `WARDEN_BUILD_TIMEOUT_MS`
    /// - `WARDEN_EVAL_TIMEOUT_MS`
    /// - `WARDEN_MAX_INSTANCE_MEMORY_BYTES`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(binary) = std::env::var("WARDEN_OPA_BINARY") {
            config.opa_binary = PathBuf::from(binary);
        }
        if let Some(ms) = env_u64("WARDEN_BUILD_TIMEOUT_MS") {
            config.build_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("WARDEN_EVAL_TIMEOUT_MS") {
            config.eval_timeout_ms = ms;
        }
        if let Some(bytes) = env_u64("WARDEN_MAX_INSTANCE_MEMORY_BYTES") {
            config.max_instance_memory_bytes = bytes;
        }
        config
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| invalid_config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the `opa` executable.
    #[must_use]
    pub fn with_opa_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.opa_binary = binary.into();
        self
    }

    /// Set the build timeout.
    #[must_use]
    pub fn with_build_timeout_ms(mut self, ms: u64) -> Self {
        self.build_timeout_ms = ms;
        self
    }

    /// Set the explain-eval timeout.
    #[must_use]
    pub fn with_eval_timeout_ms(mut self, ms: u64) -> Self {
        self.eval_timeout_ms = ms;
        self
    }

    /// Set the default rule name.
    #[must_use]
    pub fn with_default_rule(mut self, rule: impl Into<String>) -> Self {
        self.default_rule = rule.into();
        self
    }

    /// Set the per-instance memory warning ceiling.
    #[must_use]
    pub fn with_max_instance_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_instance_memory_bytes = bytes;
        self
    }

    /// Build timeout as a [`Duration`].
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    /// Explain-eval timeout as a [`Duration`].
    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    /// Version probe timeout as a [`Duration`].
    pub fn version_timeout(&self) -> Duration {
        Duration::from_millis(self.version_timeout_ms)
    }

    /// Capture buffer size for an explain run with the given trace budget.
    pub fn trace_buffer_bytes(&self, max_size_bytes: usize) -> usize {
        max_size_bytes
            .saturating_mul(self.trace_buffer_multiplier)
            .max(self.trace_buffer_min_bytes)
    }

    /// Validate the configuration, returning an actionable message if
    /// something is wrong.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.opa_binary.as_os_str().is_empty() {
            return Err(invalid_config("opa_binary must not be empty"));
        }
        for (name, value) in [
            ("build_timeout_ms", self.build_timeout_ms),
            ("eval_timeout_ms", self.eval_timeout_ms),
            ("version_timeout_ms", self.version_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid_config(format!("{name} must be > 0")));
            }
            if value > MAX_TIMEOUT_MS {
                return Err(invalid_config(format!(
                    "{name} ({value}) exceeds maximum of {MAX_TIMEOUT_MS} (10 minutes)"
                )));
            }
        }
        if self.default_rule.trim().is_empty() {
            return Err(invalid_config("default_rule must not be empty"));
        }
        if self.trace_buffer_min_bytes == 0 {
            return Err(invalid_config("trace_buffer_min_bytes must be > 0"));
        }
        if self.trace_buffer_multiplier == 0 {
            return Err(invalid_config("trace_buffer_multiplier must be > 0"));
        }
        if self.default_trace_max_bytes == 0 {
            return Err(invalid_config("default_trace_max_bytes must be > 0"));
        }
        if ToolchainVersion::parse(&self.min_toolchain_version).is_none() {
            return Err(invalid_config(format!(
                "min_toolchain_version '{}' is not of the form X.Y.Z",
                self.min_toolchain_version
            )));
        }
        self.wasm
            .validate()
            .map_err(|e| invalid_config(e.to_string()))
    }
}

pub(crate) fn invalid_config(message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorCode::InvalidInput, message)
        .with_suggestion("check the engine configuration")
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.default_rule, "allow");
        assert_eq!(config.opa_binary, PathBuf::from("opa"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfig::default()
            .with_opa_binary("/usr/local/bin/opa")
            .with_build_timeout_ms(1_000)
            .with_eval_timeout_ms(2_000)
            .with_default_rule("deny")
            .with_max_instance_memory_bytes(1024);
        assert_eq!(config.opa_binary, PathBuf::from("/usr/local/bin/opa"));
        assert_eq!(config.build_timeout(), Duration::from_secs(1));
        assert_eq!(config.eval_timeout(), Duration::from_secs(2));
        assert_eq!(config.default_rule, "deny");
        assert_eq!(config.max_instance_memory_bytes, 1024);
    }

    #[test]
    fn trace_buffer_scales_with_budget() {
        let config = EngineConfig::default();
        assert_eq!(config.trace_buffer_bytes(1024), DEFAULT_TRACE_BUFFER_MIN_BYTES);
        assert_eq!(config.trace_buffer_bytes(1024 * 1024), 16 * 1024 * 1024);
        assert_eq!(config.trace_buffer_bytes(usize::MAX), usize::MAX);
    }

    #[test]
    fn toml_partial_document_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            opa_binary = "/opt/opa"
            eval_timeout_ms = 2500

            [wasm]
            fuel_per_evaluation = 500000
            "#,
        )
        .unwrap();
        assert_eq!(config.opa_binary, PathBuf::from("/opt/opa"));
        assert_eq!(config.eval_timeout_ms, 2_500);
        assert_eq!(config.build_timeout_ms, DEFAULT_BUILD_TIMEOUT_MS);
        assert_eq!(config.wasm.fuel_per_evaluation, 500_000);
    }

    #[test]
    fn toml_rejects_invalid_values() {
        let err = EngineConfig::from_toml_str("build_timeout_ms = 0").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("build_timeout_ms must be > 0"));
    }

    #[test]
    fn toml_syntax_error_is_invalid_input() {
        let err = EngineConfig::from_toml_str("eval_timeout_ms = [unclosed").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.starts_with("invalid engine config"));
        assert_eq!(err.suggestions, vec!["check the engine configuration"]);

        let err = EngineConfig::from_toml_str("eval_timeout_ms = \"soon\"").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[test]
    fn validate_excessive_timeout() {
        let config = EngineConfig::default().with_eval_timeout_ms(MAX_TIMEOUT_MS + 1);
        let err = config.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn validate_empty_binary_and_rule() {
        assert!(EngineConfig::default().with_opa_binary("").validate().is_err());
        assert!(EngineConfig::default().with_default_rule("  ").validate().is_err());
    }

    #[test]
    fn validate_malformed_min_version() {
        let config = EngineConfig {
            min_toolchain_version: "latest".into(),
            ..EngineConfig::default()
        };
        assert!(config.validate().unwrap_err().message.contains("X.Y.Z"));
    }

    #[test]
    fn validate_propagates_wasm_errors() {
        let config = EngineConfig {
            wasm: WasmRuntimeConfig::default().with_memory_limit(0),
            ..EngineConfig::default()
        };
        assert!(config.validate().unwrap_err().message.contains("memory_limit_bytes"));
    }
}
