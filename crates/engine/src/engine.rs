use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use warden_wasm_runtime::{OpaWasmRuntime, PolicyRuntime};

use crate::cache::{InstanceCache, LoadOutcome, MemoryReport, PolicySummary};
use crate::config::{EngineConfig, invalid_config};
use crate::error::EngineError;
use crate::evaluator::{self, Decision};
use crate::toolchain::{OpaCli, Toolchain, ToolchainVersion};
use crate::trace::driver;
use crate::trace::{TraceOptions, TracedDecision};

/// Loads, evaluates and traces policies.
///
/// Each engine owns its own cache; nothing is global. Construct one with
/// [`PolicyEngine::from_config`] for the real `opa` binary and WASM runtime,
/// or [`PolicyEngine::new`] to inject other implementations.
#[derive(Debug)]
pub struct PolicyEngine {
    config: EngineConfig,
    toolchain: Arc<dyn Toolchain>,
    cache: InstanceCache,
}

impl PolicyEngine {
    /// Build an engine from explicit collaborators.
    pub fn new(
        config: EngineConfig,
        toolchain: Arc<dyn Toolchain>,
        runtime: Arc<dyn PolicyRuntime>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = InstanceCache::new(&config, Arc::clone(&toolchain), runtime);
        Ok(Self {
            config,
            toolchain,
            cache,
        })
    }

    /// Build an engine driving the configured `opa` binary and evaluating
    /// with [`OpaWasmRuntime`].
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime =
            OpaWasmRuntime::new(config.wasm.clone()).map_err(|e| invalid_config(e.to_string()))?;
        let toolchain = OpaCli::from_config(&config);
        Self::new(config, Arc::new(toolchain), Arc::new(runtime))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying cache.
    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    /// Load and compile the policy at `path`, optionally confined to `base`.
    pub async fn load(&self, path: &Path, base: Option<&Path>) -> Result<LoadOutcome, EngineError> {
        self.cache.load(path, base).await
    }

    /// Evaluate `rule` (the configured default rule when `None`).
    ///
    /// With no namespace the earliest-loaded policy is used. Pass a
    /// namespace whenever more than one policy is loaded.
    pub async fn evaluate(
        &self,
        input: &Value,
        namespace: Option<&str>,
        rule: Option<&str>,
    ) -> Result<Decision, EngineError> {
        let rule = rule.unwrap_or(self.config.default_rule.as_str());
        evaluator::evaluate(&self.cache, input, namespace, rule).await
    }

    /// Evaluate through the toolchain's explain mode and return the
    /// decision with a trace.
    pub async fn evaluate_with_trace(
        &self,
        input: &Value,
        namespace: Option<&str>,
        rule: Option<&str>,
        options: TraceOptions,
    ) -> Result<TracedDecision, EngineError> {
        let rule = rule.unwrap_or(self.config.default_rule.as_str());
        driver::evaluate_with_trace(
            &self.cache,
            self.toolchain.as_ref(),
            &self.config,
            input,
            namespace,
            rule,
            options,
        )
        .await
    }

    /// Unload one policy.
    pub fn unload(&self, path: &Path) -> bool {
        self.cache.remove(path)
    }

    /// Unload every policy.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn total_memory(&self) -> u64 {
        self.cache.total_memory()
    }

    pub fn policies(&self) -> Vec<PolicySummary> {
        self.cache.summaries()
    }

    pub fn memory_report(&self) -> MemoryReport {
        self.cache.memory_report()
    }

    /// Toolchain version seen by the probe that runs before the first
    /// compile. `None` until then, or if the probe failed.
    pub fn toolchain_version(&self) -> Option<ToolchainVersion> {
        self.cache.toolchain_version()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_wasm_runtime::MockPolicyRuntime;

    use super::*;
    use crate::error::ErrorCode;
    use crate::toolchain::MockToolchain;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            EngineConfig::default(),
            Arc::new(MockToolchain::new()),
            Arc::new(MockPolicyRuntime::constant(json!(true))),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = PolicyEngine::new(
            EngineConfig::default().with_build_timeout_ms(0),
            Arc::new(MockToolchain::new()),
            Arc::new(MockPolicyRuntime::constant(json!(true))),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("build_timeout_ms"));
    }

    #[test]
    fn from_config_builds_real_collaborators() {
        let engine = PolicyEngine::from_config(EngineConfig::default()).unwrap();
        assert_eq!(engine.cache_size(), 0);
        assert!(engine.toolchain_version().is_none());
    }

    #[tokio::test]
    async fn default_rule_is_used_when_none_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.rego");
        std::fs::write(&path, "package authz\nallow := true\n").unwrap();
        let engine = engine();
        engine.load(&path, None).await.unwrap();

        let decision = engine.evaluate(&json!({}), None, None).await.unwrap();
        assert_eq!(decision.rule, "allow");
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn cache_operations_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.rego");
        std::fs::write(&path, "package authz\nallow := true\n").unwrap();
        let engine = engine();
        engine.load(&path, None).await.unwrap();

        assert_eq!(engine.cache_size(), 1);
        assert_eq!(engine.policies().len(), 1);
        assert_eq!(engine.memory_report().total_estimated_bytes, engine.total_memory());
        assert!(engine.unload(&path));
        assert_eq!(engine.cache_size(), 0);

        engine.load(&path, None).await.unwrap();
        engine.clear();
        assert_eq!(engine.total_memory(), 0);
    }
}
