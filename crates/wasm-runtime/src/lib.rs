//! OPA WebAssembly policy runtime for Warden.
//!
//! This crate loads policies compiled with `opa build -t wasm` into a
//! `Wasmtime` engine and evaluates their entrypoints against JSON input.
//! Evaluation returns the raw rule value, or `None` when the rule is
//! undefined for that input.

pub mod config;
pub mod error;
pub mod opa;
pub mod runtime;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use config::WasmRuntimeConfig;
pub use error::WasmError;
pub use opa::{OpaPolicy, OpaWasmRuntime};
pub use runtime::{CompiledPolicy, PolicyRuntime};

type MockRule = dyn Fn(&str, &serde_json::Value) -> Option<serde_json::Value> + Send + Sync;

/// Mock runtime for testing without compiled policy binaries.
///
/// Ignores the binary it is handed and answers every evaluation with the
/// configured closure. Counts loads so callers can assert caching.
pub struct MockPolicyRuntime {
    rule: Arc<MockRule>,
    entrypoints: Vec<String>,
    loads: AtomicUsize,
}

impl std::fmt::Debug for MockPolicyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPolicyRuntime")
            .field("entrypoints", &self.entrypoints)
            .field("loads", &self.loads.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockPolicyRuntime {
    /// Create a mock whose policies evaluate every entrypoint with `rule`.
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            rule: Arc::new(rule),
            entrypoints: Vec::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always returns `value`.
    pub fn constant(value: serde_json::Value) -> Self {
        Self::new(move |_, _| Some(value.clone()))
    }

    /// Set the entrypoints reported by loaded policies.
    #[must_use]
    pub fn with_entrypoints<I, S>(mut self, entrypoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoints = entrypoints.into_iter().map(Into::into).collect();
        self
    }

    /// Number of times [`PolicyRuntime::load`] was called.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl PolicyRuntime for MockPolicyRuntime {
    fn load(&self, _binary: &[u8]) -> Result<Arc<dyn CompiledPolicy>, WasmError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPolicy {
            rule: Arc::clone(&self.rule),
            entrypoints: self.entrypoints.clone(),
        }))
    }
}

struct MockPolicy {
    rule: Arc<MockRule>,
    entrypoints: Vec<String>,
}

impl std::fmt::Debug for MockPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPolicy")
            .field("entrypoints", &self.entrypoints)
            .finish_non_exhaustive()
    }
}

impl CompiledPolicy for MockPolicy {
    fn entrypoints(&self) -> Vec<String> {
        self.entrypoints.clone()
    }

    fn evaluate(
        &self,
        entrypoint: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, WasmError> {
        Ok((self.rule)(entrypoint, input))
    }
}

/// A runtime whose loads always fail, for testing error handling paths.
#[derive(Debug)]
pub struct FailingPolicyRuntime;

impl PolicyRuntime for FailingPolicyRuntime {
    fn load(&self, binary: &[u8]) -> Result<Arc<dyn CompiledPolicy>, WasmError> {
        Err(WasmError::Compilation(format!(
            "mock failure loading {} byte policy",
            binary.len()
        )))
    }
}
