/// Errors that can occur while loading or evaluating a compiled policy.
#[derive(Debug, thiserror::Error)]
pub enum WasmError {
    /// Invalid runtime configuration.
    #[error("invalid WASM runtime config: {0}")]
    InvalidConfig(String),

    /// Error compiling the WASM module.
    ///
    /// This usually means the artifact is corrupted or was not produced by
    /// `opa build -t wasm`.
    #[error("WASM compilation error: {0}")]
    Compilation(String),

    /// The module compiled but does not follow the OPA WASM ABI.
    #[error("policy module does not follow the OPA WASM ABI: {0}")]
    Abi(String),

    /// The requested entrypoint was not compiled into the module.
    #[error("entrypoint '{name}' not found. Available entrypoints: {}", available.join(", "))]
    UnknownEntrypoint {
        /// Requested entrypoint (`pkg/rule`).
        name: String,
        /// Entrypoints exported by the module.
        available: Vec<String>,
    },

    /// The input value could not be handed to the policy.
    #[error("invalid policy input: {0}")]
    InvalidInput(String),

    /// Error during policy evaluation (trap, abort, non-zero status).
    #[error("policy evaluation error: {0}")]
    Evaluation(String),

    /// The policy called a builtin the host does not implement.
    #[error(
        "policy requires builtin '{0}' which this runtime does not provide. \
         Use the toolchain's eval mode for policies depending on it."
    )]
    UnsupportedBuiltin(String),

    /// Evaluation ran out of fuel.
    #[error("policy evaluation exhausted its fuel budget of {0} units. Consider raising fuel_per_evaluation.")]
    Timeout(u64),

    /// Evaluation exceeded the configured memory limit.
    #[error(
        "policy evaluation exceeded memory limit of {0} bytes. Consider increasing memory_limit_bytes."
    )]
    MemoryExceeded(u64),

    /// The policy produced output that is not valid JSON or is too large.
    #[error("invalid policy output: {0}")]
    InvalidOutput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entrypoint_lists_available() {
        let err = WasmError::UnknownEntrypoint {
            name: "authz/deny".into(),
            available: vec!["authz/allow".into(), "authz/admin".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("authz/deny"));
        assert!(msg.contains("authz/allow, authz/admin"));
    }

    #[test]
    fn unsupported_builtin_names_builtin() {
        let err = WasmError::UnsupportedBuiltin("http.send".into());
        assert!(err.to_string().contains("http.send"));
    }

    #[test]
    fn timeout_message_contains_fuel() {
        let err = WasmError::Timeout(500);
        assert!(err.to_string().contains("500 units"));
    }

    #[test]
    fn memory_exceeded_message_contains_bytes() {
        let err = WasmError::MemoryExceeded(16_777_216);
        assert!(err.to_string().contains("16777216"));
    }

    #[test]
    fn all_variants_are_debug() {
        let errors: Vec<WasmError> = vec![
            WasmError::InvalidConfig("c".into()),
            WasmError::Compilation("c".into()),
            WasmError::Abi("a".into()),
            WasmError::UnknownEntrypoint {
                name: "e".into(),
                available: vec![],
            },
            WasmError::InvalidInput("i".into()),
            WasmError::Evaluation("e".into()),
            WasmError::UnsupportedBuiltin("b".into()),
            WasmError::Timeout(100),
            WasmError::MemoryExceeded(1024),
            WasmError::InvalidOutput("o".into()),
        ];
        for err in &errors {
            let _ = format!("{err:?}");
            let _ = format!("{err}");
        }
    }
}
