use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{
    Caller, Engine, Extern, Func, Instance, Memory, Module, Store, Trap, WasmParams, WasmResults,
};

use crate::config::WasmRuntimeConfig;
use crate::error::WasmError;
use crate::runtime::{CompiledPolicy, PolicyRuntime};

/// Maximum size of serialized JSON input copied into guest memory (1 MB).
const MAX_INPUT_JSON_BYTES: usize = 1_024 * 1_024;

/// Maximum size of a JSON string read back out of guest memory (4 MB).
const MAX_OUTPUT_JSON_BYTES: usize = 4 * 1_024 * 1_024;

/// Maximum number of table elements a policy can allocate.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Loads `opa build -t wasm` artifacts into executable policies.
///
/// # Host contract
///
/// Every evaluation gets a fresh `Store` and `Instance`, so policies cannot
/// observe each other's heap. The host provides `env.memory` (sized from
/// the module's own import declaration), `opa_abort`, `opa_println` and
/// `opa_builtin0..4`. Builtins that OPA does not compile into the module
/// (e.g. `http.send`) are not implemented and trap with
/// [`WasmError::UnsupportedBuiltin`].
pub struct OpaWasmRuntime {
    engine: Engine,
    config: WasmRuntimeConfig,
}

impl std::fmt::Debug for OpaWasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaWasmRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OpaWasmRuntime {
    /// Create a runtime with fuel metering enabled and wasm threads disabled.
    pub fn new(config: WasmRuntimeConfig) -> Result<Self, WasmError> {
        config.validate()?;

        let mut wasmtime_config = wasmtime::Config::new();
        wasmtime_config.consume_fuel(true);
        wasmtime_config.wasm_threads(false);

        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| WasmError::Compilation(format!("failed to create WASM engine: {e}")))?;

        Ok(Self { engine, config })
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &WasmRuntimeConfig {
        &self.config
    }

    /// Compile a policy binary and read its entrypoint and builtin tables.
    pub fn load_policy(&self, binary: &[u8]) -> Result<OpaPolicy, WasmError> {
        if binary.is_empty() {
            return Err(WasmError::Compilation(
                "policy binary is empty. Rebuild it with `opa build -t wasm`.".into(),
            ));
        }

        let module = Module::new(&self.engine, binary)
            .map_err(|e| WasmError::Compilation(format!("failed to compile policy: {e}")))?;

        let mut session = Session::new(&self.engine, &module, &self.config, Arc::default())?;

        let builtins_addr: i32 = session.call("builtins", ())?;
        let builtin_ids: BTreeMap<String, i32> =
            serde_json::from_value(session.read_json(builtins_addr)?)
                .map_err(|e| WasmError::Abi(format!("builtins() is not a name->id map: {e}")))?;
        let builtins: BTreeMap<i32, String> =
            builtin_ids.into_iter().map(|(name, id)| (id, name)).collect();

        let entrypoints_addr: i32 = session.call("entrypoints", ())?;
        let entrypoints: BTreeMap<String, i32> =
            serde_json::from_value(session.read_json(entrypoints_addr)?).map_err(|e| {
                WasmError::Abi(format!("entrypoints() is not a name->id map: {e}"))
            })?;

        if entrypoints.is_empty() {
            return Err(WasmError::Abi("module exports no entrypoints".into()));
        }

        info!(
            entrypoints = entrypoints.len(),
            builtins = builtins.len(),
            bytes = binary.len(),
            "loaded OPA policy module"
        );
        if !builtins.is_empty() {
            debug!(builtins = ?builtins.values().collect::<Vec<_>>(), "policy depends on host builtins");
        }

        Ok(OpaPolicy {
            engine: self.engine.clone(),
            module,
            config: self.config.clone(),
            entrypoints,
            builtins: Arc::new(builtins),
        })
    }
}

impl PolicyRuntime for OpaWasmRuntime {
    fn load(&self, binary: &[u8]) -> Result<Arc<dyn CompiledPolicy>, WasmError> {
        Ok(Arc::new(self.load_policy(binary)?))
    }
}

/// A compiled OPA policy module.
pub struct OpaPolicy {
    engine: Engine,
    module: Module,
    config: WasmRuntimeConfig,
    entrypoints: BTreeMap<String, i32>,
    builtins: Arc<BTreeMap<i32, String>>,
}

impl std::fmt::Debug for OpaPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaPolicy")
            .field("module", &"<wasmtime::Module>")
            .field("entrypoints", &self.entrypoints)
            .field("builtins", &self.builtins)
            .finish()
    }
}

impl CompiledPolicy for OpaPolicy {
    fn entrypoints(&self) -> Vec<String> {
        self.entrypoints.keys().cloned().collect()
    }

    fn evaluate(
        &self,
        entrypoint: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, WasmError> {
        let entrypoint_id =
            *self
                .entrypoints
                .get(entrypoint)
                .ok_or_else(|| WasmError::UnknownEntrypoint {
                    name: entrypoint.to_owned(),
                    available: self.entrypoints(),
                })?;

        let mut session = Session::new(
            &self.engine,
            &self.module,
            &self.config,
            Arc::clone(&self.builtins),
        )?;

        let data_addr = session.write_json(&serde_json::Value::Object(serde_json::Map::new()))?;
        let input_addr = session.write_json(input)?;

        let ctx: i32 = session.call("opa_eval_ctx_new", ())?;
        session.call::<(i32, i32), ()>("opa_eval_ctx_set_input", (ctx, input_addr))?;
        session.call::<(i32, i32), ()>("opa_eval_ctx_set_data", (ctx, data_addr))?;
        session.call::<(i32, i32), ()>("opa_eval_ctx_set_entrypoint", (ctx, entrypoint_id))?;

        let status: i32 = session.call("eval", ctx)?;
        if status != 0 {
            return Err(WasmError::Evaluation(format!(
                "eval of '{entrypoint}' returned status {status} ({})",
                describe_status(status)
            )));
        }

        let result_addr: i32 = session.call("opa_eval_ctx_get_result", ctx)?;
        let result_set = session.read_json(result_addr)?;
        Ok(first_result(result_set))
    }
}

fn describe_status(status: i32) -> &'static str {
    match status {
        1 => "internal error",
        2 => "invalid type",
        3 => "invalid path",
        _ => "unknown error",
    }
}

/// Pull the value out of an OPA result set (`[{"result": <value>}]`).
///
/// An empty set means the rule is undefined for the input.
fn first_result(result_set: serde_json::Value) -> Option<serde_json::Value> {
    match result_set {
        serde_json::Value::Array(items) => items
            .into_iter()
            .next()
            .and_then(|mut item| item.get_mut("result").map(serde_json::Value::take)),
        _ => None,
    }
}

/// Per-store host state.
struct HostState {
    memory: Option<Memory>,
    limiter: MemoryLimiter,
    builtins: Arc<BTreeMap<i32, String>>,
}

/// One instantiation of a policy module.
struct Session {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    fuel: u64,
    memory_limit: u64,
}

impl Session {
    fn new(
        engine: &Engine,
        module: &Module,
        config: &WasmRuntimeConfig,
        builtins: Arc<BTreeMap<i32, String>>,
    ) -> Result<Self, WasmError> {
        let max_memory_bytes = usize::try_from(config.memory_limit_bytes).unwrap_or(usize::MAX);
        let mut store = Store::new(
            engine,
            HostState {
                memory: None,
                limiter: MemoryLimiter {
                    max_memory_bytes,
                    max_table_elements: MAX_TABLE_ELEMENTS,
                    denied: false,
                },
                builtins,
            },
        );
        store
            .set_fuel(config.fuel_per_evaluation)
            .map_err(|e| WasmError::Evaluation(format!("failed to set fuel: {e}")))?;
        store.limiter(|state| &mut state.limiter as &mut dyn wasmtime::ResourceLimiter);

        let mut imported_memory = None;
        let mut imports: Vec<Extern> = Vec::new();
        for import in module.imports() {
            let external = match (import.module(), import.name()) {
                ("env", "memory") => {
                    let ty = import.ty().memory().cloned().ok_or_else(|| {
                        WasmError::Abi("env.memory is not declared as a memory".into())
                    })?;
                    let memory = Memory::new(&mut store, ty).map_err(|e| {
                        WasmError::Abi(format!("failed to allocate policy memory: {e}"))
                    })?;
                    imported_memory = Some(memory);
                    Extern::Memory(memory)
                }
                ("env", name) => Extern::Func(host_function(&mut store, name)?),
                (module_name, name) => {
                    return Err(WasmError::Abi(format!(
                        "unexpected import '{module_name}::{name}'"
                    )));
                }
            };
            imports.push(external);
        }

        let instance = Instance::new(&mut store, module, &imports)
            .map_err(|e| WasmError::Abi(format!("failed to instantiate policy: {e}")))?;

        let memory = imported_memory
            .or_else(|| instance.get_memory(&mut store, "memory"))
            .ok_or_else(|| WasmError::Abi("policy neither imports nor exports memory".into()))?;
        store.data_mut().memory = Some(memory);

        Ok(Self {
            store,
            instance,
            memory,
            fuel: config.fuel_per_evaluation,
            memory_limit: config.memory_limit_bytes,
        })
    }

    fn call<P, R>(&mut self, name: &str, params: P) -> Result<R, WasmError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| WasmError::Abi(format!("missing or mistyped export '{name}': {e}")))?;
        func.call(&mut self.store, params)
            .map_err(|e| self.classify_trap(name, &e))
    }

    fn classify_trap(&self, name: &str, err: &wasmtime::Error) -> WasmError {
        if let Some(WasmError::UnsupportedBuiltin(builtin)) = err.downcast_ref::<WasmError>() {
            return WasmError::UnsupportedBuiltin(builtin.clone());
        }
        if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel))
            || self.store.get_fuel().ok() == Some(0)
        {
            return WasmError::Timeout(self.fuel);
        }
        if self.store.data().limiter.denied {
            return WasmError::MemoryExceeded(self.memory_limit);
        }
        WasmError::Evaluation(format!("'{name}' trapped: {err:#}"))
    }

    /// Copy a JSON value into guest memory and parse it into an OPA value.
    fn write_json(&mut self, value: &serde_json::Value) -> Result<i32, WasmError> {
        let json = serde_json::to_vec(value)
            .map_err(|e| WasmError::InvalidInput(format!("failed to serialize input: {e}")))?;
        if json.len() > MAX_INPUT_JSON_BYTES {
            return Err(WasmError::InvalidInput(format!(
                "serialized input ({} bytes) exceeds maximum of {MAX_INPUT_JSON_BYTES} bytes",
                json.len()
            )));
        }
        let len = i32::try_from(json.len())
            .map_err(|_| WasmError::InvalidInput("input too large for i32 addressing".into()))?;

        let addr: i32 = self.call("opa_malloc", len)?;
        let offset = usize::try_from(addr)
            .map_err(|_| WasmError::Abi(format!("opa_malloc returned negative address {addr}")))?;
        self.memory
            .write(&mut self.store, offset, &json)
            .map_err(|_| WasmError::MemoryExceeded(self.memory_limit))?;

        let parsed: i32 = self.call("opa_json_parse", (addr, len))?;
        if parsed == 0 {
            return Err(WasmError::InvalidInput(
                "policy runtime rejected the input JSON".into(),
            ));
        }
        Ok(parsed)
    }

    /// Serialize an OPA value to JSON inside the guest and read it back.
    fn read_json(&mut self, value_addr: i32) -> Result<serde_json::Value, WasmError> {
        let text_addr: i32 = self.call("opa_json_dump", value_addr)?;
        let text = read_c_string(self.memory.data(&self.store), text_addr)?;
        serde_json::from_str(&text)
            .map_err(|e| WasmError::InvalidOutput(format!("policy emitted invalid JSON: {e}")))
    }
}

fn host_function(store: &mut Store<HostState>, name: &str) -> Result<Func, WasmError> {
    let func = match name {
        "opa_abort" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>, addr: i32| -> wasmtime::Result<()> {
                let message = read_guest_string(&caller, addr)
                    .unwrap_or_else(|_| "<unreadable abort message>".to_owned());
                Err(wasmtime::Error::msg(format!("opa_abort: {message}")))
            },
        ),
        "opa_println" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>, addr: i32| {
                if let Ok(message) = read_guest_string(&caller, addr) {
                    debug!(message = %message, "policy println");
                }
            },
        ),
        "opa_builtin0" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>, id: i32, _ctx: i32| -> wasmtime::Result<i32> {
                Err(unsupported_builtin(&caller, id))
            },
        ),
        "opa_builtin1" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>, id: i32, _ctx: i32, _a: i32| -> wasmtime::Result<i32> {
                Err(unsupported_builtin(&caller, id))
            },
        ),
        "opa_builtin2" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             _a: i32,
             _b: i32|
             -> wasmtime::Result<i32> { Err(unsupported_builtin(&caller, id)) },
        ),
        "opa_builtin3" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             _a: i32,
             _b: i32,
             _c: i32|
             -> wasmtime::Result<i32> { Err(unsupported_builtin(&caller, id)) },
        ),
        "opa_builtin4" => Func::wrap(
            &mut *store,
            |caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             _a: i32,
             _b: i32,
             _c: i32,
             _d: i32|
             -> wasmtime::Result<i32> { Err(unsupported_builtin(&caller, id)) },
        ),
        other => {
            return Err(WasmError::Abi(format!(
                "policy imports unknown host function 'env::{other}'"
            )));
        }
    };
    Ok(func)
}

fn unsupported_builtin(caller: &Caller<'_, HostState>, id: i32) -> wasmtime::Error {
    let name = caller
        .data()
        .builtins
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("#{id}"));
    wasmtime::Error::new(WasmError::UnsupportedBuiltin(name))
}

fn read_guest_string(caller: &Caller<'_, HostState>, addr: i32) -> Result<String, WasmError> {
    let memory = caller
        .data()
        .memory
        .ok_or_else(|| WasmError::Abi("host call before memory was attached".into()))?;
    read_c_string(memory.data(caller), addr)
}

/// Read a NUL-terminated UTF-8 string starting at `addr`.
fn read_c_string(data: &[u8], addr: i32) -> Result<String, WasmError> {
    let start = usize::try_from(addr)
        .map_err(|_| WasmError::InvalidOutput(format!("negative guest address {addr}")))?;
    let tail = data.get(start..).ok_or_else(|| {
        WasmError::InvalidOutput(format!("guest address {addr} is outside linear memory"))
    })?;
    let len = tail
        .iter()
        .take(MAX_OUTPUT_JSON_BYTES + 1)
        .position(|b| *b == 0)
        .ok_or_else(|| {
            WasmError::InvalidOutput(format!(
                "string at {addr} is unterminated or exceeds {MAX_OUTPUT_JSON_BYTES} bytes"
            ))
        })?;
    String::from_utf8(tail[..len].to_vec())
        .map_err(|e| WasmError::InvalidOutput(format!("string at {addr} is not UTF-8: {e}")))
}

/// Resource limiter enforcing both linear memory and table growth bounds.
struct MemoryLimiter {
    max_memory_bytes: usize,
    max_table_elements: usize,
    denied: bool,
}

impl wasmtime::ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let allowed = desired <= self.max_memory_bytes;
        if !allowed {
            self.denied = true;
        }
        Ok(allowed)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }
}
