//! In-memory cache of compiled policies, keyed by resolved file path.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use warden_wasm_runtime::{CompiledPolicy, PolicyRuntime};

use crate::compiler;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorCode};
use crate::source::{LineMap, PolicySource, build_line_map, line_map_for_file};
use crate::toolchain::{Toolchain, ToolchainVersion};

/// Fixed overhead added to every memory estimate: one 64 KiB WASM page.
const PAGE_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Heap reserve assumed per byte of compiled module.
const HEAP_MULTIPLIER: u64 = 2;

/// Estimated resident size of an instance compiled from `wasm_size` bytes.
pub fn estimate_memory(wasm_size: u64) -> u64 {
    wasm_size
        .saturating_add(PAGE_OVERHEAD_BYTES)
        .saturating_add(wasm_size.saturating_mul(HEAP_MULTIPLIER))
}

/// A loaded policy and its metadata.
pub struct CachedPolicy {
    /// Resolved absolute source path (the cache key).
    pub path: PathBuf,
    /// Packages declared in the source.
    pub namespaces: BTreeSet<String>,
    /// Rules compiled as entrypoints.
    pub rules: BTreeSet<String>,
    /// Size of the compiled module.
    pub wasm_size_bytes: u64,
    /// See [`estimate_memory`].
    pub estimated_memory_bytes: u64,
    /// When the policy was compiled.
    pub loaded_at: DateTime<Utc>,
    last_access: Mutex<DateTime<Utc>>,
    seq: u64,
    policy: Arc<dyn CompiledPolicy>,
}

impl std::fmt::Debug for CachedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPolicy")
            .field("path", &self.path)
            .field("namespaces", &self.namespaces)
            .field("rules", &self.rules)
            .field("wasm_size_bytes", &self.wasm_size_bytes)
            .field("estimated_memory_bytes", &self.estimated_memory_bytes)
            .finish_non_exhaustive()
    }
}

impl CachedPolicy {
    /// Last time the policy was loaded or looked up.
    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.lock()
    }

    /// The executable instance.
    pub fn policy(&self) -> Arc<dyn CompiledPolicy> {
        Arc::clone(&self.policy)
    }

    /// Lexically first declared namespace.
    pub fn first_namespace(&self) -> Option<&str> {
        self.namespaces.iter().next().map(String::as_str)
    }

    fn touch(&self) {
        *self.last_access.lock() = Utc::now();
    }

    fn summary(&self) -> PolicySummary {
        PolicySummary {
            path: self.path.clone(),
            namespaces: self.namespaces.iter().cloned().collect(),
            rules: self.rules.iter().cloned().collect(),
            wasm_size_bytes: self.wasm_size_bytes,
            estimated_memory_bytes: self.estimated_memory_bytes,
            loaded_at: self.loaded_at,
            last_access: self.last_access(),
        }
    }
}

/// What a `load` call produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub path: PathBuf,
    pub namespaces: Vec<String>,
    pub rules: Vec<String>,
    /// `true` when the policy was already loaded and nothing was compiled.
    pub cached: bool,
    pub wasm_size_bytes: u64,
    pub estimated_memory_bytes: u64,
}

/// Listing entry for one loaded policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub path: PathBuf,
    pub namespaces: Vec<String>,
    pub rules: Vec<String>,
    pub wasm_size_bytes: u64,
    pub estimated_memory_bytes: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Estimated memory held by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub total_estimated_bytes: u64,
    pub policy_count: usize,
    pub policies: Vec<PolicyMemory>,
}

/// One row of a [`MemoryReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMemory {
    pub path: PathBuf,
    pub wasm_size_bytes: u64,
    pub estimated_memory_bytes: u64,
}

/// Compiled policies keyed by resolved absolute path.
///
/// Loads of the same path are serialized by a per-path lock, so a policy
/// is compiled at most once however many callers race to load it. Loads of
/// different paths proceed in parallel.
pub struct InstanceCache {
    toolchain: Arc<dyn Toolchain>,
    runtime: Arc<dyn PolicyRuntime>,
    default_rule: String,
    max_instance_memory_bytes: u64,
    min_toolchain_version: String,
    entries: RwLock<HashMap<PathBuf, Arc<CachedPolicy>>>,
    line_maps: RwLock<HashMap<PathBuf, Arc<LineMap>>>,
    load_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    next_seq: AtomicU64,
    toolchain_version: OnceCell<Option<ToolchainVersion>>,
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("policies", &self.entries.read().len())
            .field("default_rule", &self.default_rule)
            .finish_non_exhaustive()
    }
}

impl InstanceCache {
    /// Create an empty cache compiling with `toolchain` and loading with `runtime`.
    pub fn new(
        config: &EngineConfig,
        toolchain: Arc<dyn Toolchain>,
        runtime: Arc<dyn PolicyRuntime>,
    ) -> Self {
        Self {
            toolchain,
            runtime,
            default_rule: config.default_rule.clone(),
            max_instance_memory_bytes: config.max_instance_memory_bytes,
            min_toolchain_version: config.min_toolchain_version.clone(),
            entries: RwLock::new(HashMap::new()),
            line_maps: RwLock::new(HashMap::new()),
            load_locks: DashMap::new(),
            next_seq: AtomicU64::new(0),
            toolchain_version: OnceCell::new(),
        }
    }

    /// Load and compile the policy at `path`.
    ///
    /// If `base` is given the resolved path must lie inside it, otherwise
    /// the call fails with `path-security-error` and the cache is left
    /// untouched. Loading an already cached path only refreshes its
    /// last-access time.
    pub async fn load(&self, path: &Path, base: Option<&Path>) -> Result<LoadOutcome, EngineError> {
        let resolved = resolve_policy_path(path, base)?;

        if let Some(entry) = self.get(&resolved) {
            entry.touch();
            debug!(path = %resolved.display(), "policy already loaded");
            return Ok(outcome(&entry, true));
        }

        let lock = Arc::clone(&*self.load_locks.entry(resolved.clone()).or_default());
        let guard = lock.lock().await;

        // Another caller may have finished the load while we waited.
        let result = match self.get(&resolved) {
            Some(entry) => {
                entry.touch();
                Ok(outcome(&entry, true))
            }
            None => self.compile_and_insert(&resolved).await,
        };

        // Waiters still hold clones of this lock; the last holder drops it
        // from the map so a later caller cannot start a second compile.
        self.load_locks.remove_if(&resolved, |_, current| {
            Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2
        });
        drop(guard);
        result
    }

    async fn compile_and_insert(&self, path: &Path) -> Result<LoadOutcome, EngineError> {
        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::file_not_found(path));
            }
            Err(e) => {
                return Err(EngineError::new(
                    ErrorCode::FileNotFound,
                    format!("failed to read policy file {}: {e}", path.display()),
                ));
            }
        };

        let inspected = PolicySource::inspect(&source);
        if inspected.namespaces.is_empty() {
            return Err(EngineError::new(
                ErrorCode::InvalidNamespace,
                format!("no package declaration found in {}", path.display()),
            )
            .with_suggestion("add a package declaration at the top of the file, e.g. `package authz`"));
        }

        self.toolchain_version
            .get_or_init(|| compiler::check_version(self.toolchain.as_ref(), &self.min_toolchain_version))
            .await;

        let artifact = compiler::compile(
            self.toolchain.as_ref(),
            path,
            &inspected.namespaces,
            &inspected.rules,
            &self.default_rule,
        )
        .await?;

        let wasm_size_bytes = artifact.len() as u64;
        let runtime = Arc::clone(&self.runtime);
        let policy = tokio::task::spawn_blocking(move || runtime.load(&artifact))
            .await
            .map_err(|e| {
                EngineError::new(
                    ErrorCode::ArtifactLoadError,
                    format!("policy load task failed: {e}"),
                )
            })?
            .map_err(|e| {
                EngineError::new(
                    ErrorCode::ArtifactLoadError,
                    format!("failed to load compiled policy: {e}"),
                )
            })?;

        let estimated_memory_bytes = estimate_memory(wasm_size_bytes);
        if estimated_memory_bytes > self.max_instance_memory_bytes {
            warn!(
                path = %path.display(),
                estimated_memory_bytes,
                limit = self.max_instance_memory_bytes,
                "policy instance exceeds the memory estimate ceiling"
            );
        }

        // A policy with no recognizable rule heads still exports the default rule.
        let rules = if inspected.rules.is_empty() {
            BTreeSet::from([self.default_rule.clone()])
        } else {
            inspected.rules
        };

        let now = Utc::now();
        let entry = Arc::new(CachedPolicy {
            path: path.to_path_buf(),
            namespaces: inspected.namespaces,
            rules,
            wasm_size_bytes,
            estimated_memory_bytes,
            loaded_at: now,
            last_access: Mutex::new(now),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            policy,
        });

        self.line_maps
            .write()
            .insert(path.to_path_buf(), Arc::new(build_line_map(&source)));
        self.entries
            .write()
            .insert(path.to_path_buf(), Arc::clone(&entry));

        info!(
            path = %path.display(),
            namespaces = ?entry.namespaces,
            rules = entry.rules.len(),
            wasm_size_bytes,
            estimated_memory_bytes,
            "loaded policy"
        );
        Ok(outcome(&entry, false))
    }

    fn get(&self, path: &Path) -> Option<Arc<CachedPolicy>> {
        self.entries.read().get(path).cloned()
    }

    /// Find a loaded policy declaring `namespace` and mark it accessed.
    ///
    /// With no namespace this returns the earliest-loaded policy. That is a
    /// convenience for callers that only ever load one policy; with several
    /// loaded, pass the namespace explicitly.
    pub fn find_by_namespace(&self, namespace: Option<&str>) -> Option<Arc<CachedPolicy>> {
        let entry = {
            let entries = self.entries.read();
            match namespace {
                Some(ns) => entries
                    .values()
                    .filter(|e| e.namespaces.contains(ns))
                    .min_by_key(|e| e.seq)
                    .cloned(),
                None => entries.values().min_by_key(|e| e.seq).cloned(),
            }
        }?;
        entry.touch();
        Some(entry)
    }

    /// Rule line map for a loaded policy's source, read from disk if it is
    /// not cached. An unreadable file gives an empty map.
    pub fn line_map(&self, path: &Path) -> Arc<LineMap> {
        if let Some(map) = self.line_maps.read().get(path) {
            return Arc::clone(map);
        }
        let map = Arc::new(line_map_for_file(path));
        self.line_maps
            .write()
            .insert(path.to_path_buf(), Arc::clone(&map));
        map
    }

    /// Unload one policy. Returns whether it was loaded.
    pub fn remove(&self, path: &Path) -> bool {
        let key = std::path::absolute(path).map_or_else(|_| path.to_path_buf(), |p| normalize(&p));
        self.line_maps.write().remove(&key);
        let removed = self.entries.write().remove(&key).is_some();
        if removed {
            info!(path = %key.display(), "unloaded policy");
        }
        removed
    }

    /// Drop every policy and line map.
    pub fn clear(&self) {
        let count = {
            let mut entries = self.entries.write();
            let count = entries.len();
            entries.clear();
            count
        };
        self.line_maps.write().clear();
        info!(count, "cleared policy cache");
    }

    /// Sum of per-policy memory estimates.
    pub fn total_memory(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|e| e.estimated_memory_bytes)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every namespace declared by a loaded policy.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.entries
            .read()
            .values()
            .flat_map(|e| e.namespaces.iter().cloned())
            .collect()
    }

    /// Loaded policies in load order.
    pub fn summaries(&self) -> Vec<PolicySummary> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.summary()).collect()
    }

    /// Total and per-policy memory estimates.
    pub fn memory_report(&self) -> MemoryReport {
        let policies: Vec<PolicyMemory> = self
            .summaries()
            .into_iter()
            .map(|s| PolicyMemory {
                path: s.path,
                wasm_size_bytes: s.wasm_size_bytes,
                estimated_memory_bytes: s.estimated_memory_bytes,
            })
            .collect();
        MemoryReport {
            total_estimated_bytes: policies.iter().map(|p| p.estimated_memory_bytes).sum(),
            policy_count: policies.len(),
            policies,
        }
    }

    /// Version reported by the toolchain's one-time probe, if it has run
    /// and succeeded.
    pub fn toolchain_version(&self) -> Option<ToolchainVersion> {
        self.toolchain_version.get().copied().flatten()
    }
}

fn outcome(entry: &CachedPolicy, cached: bool) -> LoadOutcome {
    LoadOutcome {
        path: entry.path.clone(),
        namespaces: entry.namespaces.iter().cloned().collect(),
        rules: entry.rules.iter().cloned().collect(),
        cached,
        wasm_size_bytes: entry.wasm_size_bytes,
        estimated_memory_bytes: entry.estimated_memory_bytes,
    }
}

/// Resolve `path` to an absolute, normalized path and enforce the `base`
/// boundary.
///
/// A relative `path` is taken relative to `base` when one is given, and to
/// the working directory otherwise. The check runs on the lexical path and
/// again after symlinks are resolved, so a link inside `base` that points
/// outside it is rejected as well.
pub fn resolve_policy_path(path: &Path, base: Option<&Path>) -> Result<PathBuf, EngineError> {
    let absolutize = |p: &Path| {
        std::path::absolute(p).map(|abs| normalize(&abs)).map_err(|e| {
            EngineError::new(
                ErrorCode::InvalidInput,
                format!("cannot resolve path {}: {e}", p.display()),
            )
        })
    };

    let Some(base) = base else {
        return absolutize(path);
    };

    let base = absolutize(base)?;
    let resolved = normalize(&base.join(path));
    if !resolved.starts_with(&base) {
        return Err(traversal_error(path, &base));
    }

    if let (Ok(real), Ok(real_base)) = (resolved.canonicalize(), base.canonicalize()) {
        if !real.starts_with(&real_base) {
            return Err(traversal_error(path, &base));
        }
    }
    Ok(resolved)
}

fn traversal_error(path: &Path, base: &Path) -> EngineError {
    warn!(path = %path.display(), base = %base.display(), "rejected policy path outside base");
    EngineError::new(
        ErrorCode::PathSecurityError,
        format!(
            "policy path {} resolves outside the allowed directory {}",
            path.display(),
            base.display()
        ),
    )
    .with_suggestion("use a path inside the allowed directory without '..' segments")
}

/// Remove `.` and resolve `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
