//! Policy compilation, caching, evaluation and trace capture.
//!
//! Warden loads Rego policy files, compiles them to WebAssembly with the
//! `opa` toolchain, caches the compiled instances by file path and
//! evaluates rules against JSON input. On request it re-runs a query
//! through `opa eval --explain` and condenses the raw event stream into a
//! size-bounded [`EvaluationTrace`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), warden_engine::EngineError> {
//! use std::path::Path;
//! use warden_engine::{EngineConfig, PolicyEngine, TraceOptions};
//!
//! let engine = PolicyEngine::from_config(EngineConfig::from_env())?;
//! engine.load(Path::new("policies/authz.rego"), None).await?;
//!
//! let input = serde_json::json!({"user": {"role": "admin"}});
//! let decision = engine.evaluate(&input, Some("authz"), None).await?;
//! assert!(decision.allowed);
//!
//! let traced = engine
//!     .evaluate_with_trace(&input, Some("authz"), None, TraceOptions::full())
//!     .await?;
//! println!("{} rules evaluated", traced.trace.rules_evaluated.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod source;
pub mod toolchain;
pub mod trace;

pub use cache::{
    CachedPolicy, InstanceCache, LoadOutcome, MemoryReport, PolicyMemory, PolicySummary,
};
pub use config::EngineConfig;
pub use engine::PolicyEngine;
pub use error::{EngineError, ErrorCode};
pub use evaluator::Decision;
pub use source::{LineMap, PolicySource};
pub use toolchain::{
    ExplainMode, MockFailure, MockToolchain, OpaCli, Toolchain, ToolchainError, ToolchainVersion,
};
pub use trace::{
    EvaluationTrace, ExecutionPathEntry, RuleTraceEntry, TraceLevel, TraceNote, TraceOptions,
    TracedDecision, TriState,
};
