use std::sync::Arc;

use crate::error::WasmError;

/// Loads compiled policy binaries into executable instances.
///
/// The engine only talks to this trait, so an alternative evaluator can be
/// substituted without touching cache or trace logic.
pub trait PolicyRuntime: Send + Sync + std::fmt::Debug {
    /// Compile and validate a policy binary.
    fn load(&self, binary: &[u8]) -> Result<Arc<dyn CompiledPolicy>, WasmError>;
}

/// An executable policy.
///
/// Evaluation is synchronous and CPU-bound; async callers should run it on
/// a blocking thread.
pub trait CompiledPolicy: Send + Sync + std::fmt::Debug {
    /// Entrypoints compiled into the policy, as `pkg/path/rule`.
    fn entrypoints(&self) -> Vec<String>;

    /// Evaluate an entrypoint against a JSON input.
    ///
    /// Returns `Ok(None)` when the rule is undefined for this input.
    fn evaluate(
        &self,
        entrypoint: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, WasmError>;
}
