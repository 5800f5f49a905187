use serde::{Deserialize, Serialize};

use crate::error::WasmError;

/// Default memory limit for a policy evaluation: 64 MB.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Absolute maximum memory limit: 1 GB.
///
/// Prevents misconfiguration from allocating unbounded host memory.
pub const MAX_MEMORY_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

/// Default fuel budget for a single evaluation.
pub const DEFAULT_FUEL_PER_EVALUATION: u64 = 2_000_000_000;

/// Minimum meaningful fuel budget.
pub const MIN_FUEL_PER_EVALUATION: u64 = 10_000;

/// Runtime configuration shared by every loaded policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmRuntimeConfig {
    /// Maximum linear memory in bytes a policy instance can grow to.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,
    /// Instruction fuel granted to each evaluation. Running out traps the
    /// call with [`WasmError::Timeout`].
    #[serde(default = "default_fuel")]
    pub fuel_per_evaluation: u64,
}

impl Default for WasmRuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            fuel_per_evaluation: DEFAULT_FUEL_PER_EVALUATION,
        }
    }
}

impl WasmRuntimeConfig {
    /// Set the memory limit.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the per-evaluation fuel budget.
    #[must_use]
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel_per_evaluation = fuel;
        self
    }

    /// Validate the runtime configuration, returning an error with an
    /// actionable message if something is wrong.
    pub fn validate(&self) -> Result<(), WasmError> {
        if self.memory_limit_bytes == 0 {
            return Err(WasmError::InvalidConfig(
                "memory_limit_bytes must be > 0".into(),
            ));
        }
        if self.memory_limit_bytes > MAX_MEMORY_LIMIT_BYTES {
            return Err(WasmError::InvalidConfig(format!(
                "memory_limit_bytes ({}) exceeds maximum of {} (1 GB)",
                self.memory_limit_bytes, MAX_MEMORY_LIMIT_BYTES
            )));
        }
        if self.fuel_per_evaluation < MIN_FUEL_PER_EVALUATION {
            return Err(WasmError::InvalidConfig(format!(
                "fuel_per_evaluation must be >= {MIN_FUEL_PER_EVALUATION}"
            )));
        }
        Ok(())
    }
}

const fn default_memory_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

const fn default_fuel() -> u64 {
    DEFAULT_FUEL_PER_EVALUATION
}
