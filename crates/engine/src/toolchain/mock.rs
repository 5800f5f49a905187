use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;

use super::{
    BuildRequest, ExplainMode, ExplainRequest, Toolchain, ToolchainError, ToolchainVersion,
};

/// Smallest valid WASM module header.
const EMPTY_WASM: &[u8] = b"\0asm\x01\0\0\0";

/// A canned toolchain failure.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// The binary is missing.
    NotInstalled,
    /// The binary ran and exited non-zero.
    Failed {
        /// Text written to stderr.
        stderr: String,
        /// Text written to stdout.
        stdout: String,
    },
    /// The call timed out.
    Timeout,
}

impl MockFailure {
    fn to_error(&self, subcommand: &'static str) -> ToolchainError {
        match self {
            Self::NotInstalled => ToolchainError::NotInstalled("opa".into()),
            Self::Failed { stderr, stdout } => ToolchainError::Failed {
                subcommand,
                status: "exit status: 1".into(),
                stderr: stderr.clone(),
                stdout: stdout.clone(),
            },
            Self::Timeout => ToolchainError::Timeout {
                subcommand,
                timeout: Duration::from_millis(1),
            },
        }
    }
}

/// What the last explain call was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedExplain {
    /// Requested detail.
    pub mode: ExplainMode,
    /// Query string.
    pub query: String,
    /// Input document read from the materialized file.
    pub input: serde_json::Value,
    /// Path of the materialized input file.
    pub input_path: PathBuf,
    /// Capture buffer size requested.
    pub max_output_bytes: usize,
}

/// In-process stand-in for `opa`.
///
/// Builds write a real gzipped bundle holding the configured artifact, so
/// archive extraction is exercised; explain calls return a canned document.
#[derive(Debug)]
pub struct MockToolchain {
    artifact: Option<Vec<u8>>,
    explain_output: serde_json::Value,
    version: ToolchainVersion,
    build_failure: Option<MockFailure>,
    explain_failure: Option<MockFailure>,
    build_delay: Option<Duration>,
    builds: AtomicUsize,
    builds_in_flight: AtomicUsize,
    peak_builds: AtomicUsize,
    explains: AtomicUsize,
    last_entrypoints: Mutex<Vec<String>>,
    last_bundle: Mutex<Option<PathBuf>>,
    last_explain: Mutex<Option<RecordedExplain>>,
}

impl Default for MockToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockToolchain {
    /// A toolchain whose builds succeed with an empty module.
    pub fn new() -> Self {
        Self {
            artifact: Some(EMPTY_WASM.to_vec()),
            explain_output: serde_json::json!({ "result": [], "explanation": [] }),
            version: ToolchainVersion {
                major: 0,
                minor: 70,
                patch: 0,
            },
            build_failure: None,
            explain_failure: None,
            build_delay: None,
            builds: AtomicUsize::new(0),
            builds_in_flight: AtomicUsize::new(0),
            peak_builds: AtomicUsize::new(0),
            explains: AtomicUsize::new(0),
            last_entrypoints: Mutex::new(Vec::new()),
            last_bundle: Mutex::new(None),
            last_explain: Mutex::new(None),
        }
    }

    /// Bundle `bytes` as `policy.wasm`.
    #[must_use]
    pub fn with_artifact(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.artifact = Some(bytes.into());
        self
    }

    /// Produce bundles with no `policy.wasm` entry.
    #[must_use]
    pub fn without_artifact(mut self) -> Self {
        self.artifact = None;
        self
    }

    /// Return `output` from every explain call.
    #[must_use]
    pub fn with_explain_output(mut self, output: serde_json::Value) -> Self {
        self.explain_output = output;
        self
    }

    /// Report `version` from `version()`.
    #[must_use]
    pub fn with_version(mut self, version: ToolchainVersion) -> Self {
        self.version = version;
        self
    }

    /// Fail every build.
    #[must_use]
    pub fn with_build_failure(mut self, failure: MockFailure) -> Self {
        self.build_failure = Some(failure);
        self
    }

    /// Fail every explain call.
    #[must_use]
    pub fn with_explain_failure(mut self, failure: MockFailure) -> Self {
        self.explain_failure = Some(failure);
        self
    }

    /// Sleep before finishing each build.
    #[must_use]
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Number of builds attempted.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Most builds that were ever running at the same time.
    pub fn peak_concurrent_builds(&self) -> usize {
        self.peak_builds.load(Ordering::SeqCst)
    }

    /// Number of explain calls attempted.
    pub fn explain_count(&self) -> usize {
        self.explains.load(Ordering::SeqCst)
    }

    /// Entrypoints passed to the most recent build.
    pub fn last_entrypoints(&self) -> Vec<String> {
        self.last_entrypoints.lock().clone()
    }

    /// Bundle path the most recent build was asked to write.
    pub fn last_bundle_path(&self) -> Option<PathBuf> {
        self.last_bundle.lock().clone()
    }

    /// The most recent explain call.
    pub fn last_explain(&self) -> Option<RecordedExplain> {
        self.last_explain.lock().clone()
    }
}

#[async_trait::async_trait]
impl Toolchain for MockToolchain {
    async fn version(&self) -> Result<ToolchainVersion, ToolchainError> {
        Ok(self.version)
    }

    async fn build(&self, request: &BuildRequest<'_>) -> Result<(), ToolchainError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.last_entrypoints.lock() = request.entrypoints.to_vec();
        *self.last_bundle.lock() = Some(request.output.to_path_buf());

        let in_flight = self.builds_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_builds.fetch_max(in_flight, Ordering::SeqCst);
        let result = self.run_build(request).await;
        self.builds_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn eval_explain(
        &self,
        request: &ExplainRequest<'_>,
    ) -> Result<serde_json::Value, ToolchainError> {
        self.explains.fetch_add(1, Ordering::SeqCst);

        let raw = std::fs::read(request.input)?;
        let input = serde_json::from_slice(&raw)
            .map_err(|e| ToolchainError::InvalidOutput(format!("input file is not JSON: {e}")))?;
        *self.last_explain.lock() = Some(RecordedExplain {
            mode: request.mode,
            query: request.query.to_owned(),
            input,
            input_path: request.input.to_path_buf(),
            max_output_bytes: request.max_output_bytes,
        });

        if let Some(failure) = &self.explain_failure {
            return Err(failure.to_error("eval"));
        }
        Ok(self.explain_output.clone())
    }
}

impl MockToolchain {
    async fn run_build(&self, request: &BuildRequest<'_>) -> Result<(), ToolchainError> {
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = &self.build_failure {
            return Err(failure.to_error("build"));
        }
        write_bundle(request.output, self.artifact.as_deref())?;
        Ok(())
    }
}

/// Write a gzipped tar bundle in the layout `opa build` produces.
fn write_bundle(path: &Path, artifact: Option<&[u8]>) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    append(&mut builder, "data.json", b"{}")?;
    append(&mut builder, ".manifest", br#"{"revision":"","roots":[""]}"#)?;
    if let Some(bytes) = artifact {
        append(&mut builder, "policy.wasm", bytes)?;
    }
    builder.into_inner()?.finish()?.flush()
}

fn append<W: Write>(builder: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}
