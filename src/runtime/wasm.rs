//! WebAssembly sandbox built on `wasmtime`.
//!
//! Each task gets its own engine, so epoch interruption terminates exactly
//! one task. Fuel bounds CPU work, a store limiter bounds linear memory, and
//! no host functions are linked: modules that import anything fail to
//! instantiate. The called export takes numeric parameters from the
//! `params` input array and its results become the tool output:
//!
//! ```json
//! { "export": "add", "results": [5], "fuel_consumed": 42 }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;
use wasmtime::{Config as EngineConfig, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Val, ValType};

use super::output::CapturedOutput;
use super::sandbox::{ExecutionPlan, RawOutcome, Sandbox};
use super::security::SecurityProfile;
use super::task::{Entrypoint, Task};
use crate::tools::Arguments;
use crate::types::{Error, Result};

fn default_fuel() -> u64 {
    1_000_000_000
}

/// Wasm sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct WasmSettings {
    /// Fuel granted to each call.
    #[serde(default = "default_fuel")]
    pub fuel: u64,

    /// Directory relative module paths are resolved against.
    #[serde(default)]
    pub module_root: Option<PathBuf>,
}

impl Default for WasmSettings {
    fn default() -> Self {
        Self {
            fuel: default_fuel(),
            module_root: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WasmSandbox {
    settings: WasmSettings,
}

/// Compiled module plus the engine that interrupts it.
pub struct WasmHandle {
    engine: Engine,
    module: Module,
    export: String,
}

impl std::fmt::Debug for WasmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmHandle")
            .field("export", &self.export)
            .finish_non_exhaustive()
    }
}

struct StoreState {
    limits: StoreLimits,
}

impl WasmSandbox {
    pub fn new(settings: WasmSettings) -> Self {
        Self { settings }
    }

    fn module_path(&self, path: &PathBuf) -> PathBuf {
        match (&self.settings.module_root, path.is_relative()) {
            (Some(root), true) => root.join(path),
            _ => path.clone(),
        }
    }
}

#[async_trait]
impl Sandbox for WasmSandbox {
    type Handle = WasmHandle;

    fn kind(&self) -> &str {
        "wasm"
    }

    fn max_profile(&self) -> SecurityProfile {
        SecurityProfile::Hardened
    }

    async fn acquire(&self, task: &Task, plan: &ExecutionPlan) -> Result<WasmHandle> {
        let Entrypoint::Module { path, export } = &task.entrypoint else {
            return Err(Error::config(format!(
                "tool '{}' needs a module entrypoint to run as wasm",
                plan.tool_id
            )));
        };
        let path = self.module_path(path);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            Error::config(format!("cannot read wasm module {}: {}", path.display(), e))
        })?;

        let export = export.clone();
        tokio::task::spawn_blocking(move || {
            let mut config = EngineConfig::new();
            config.consume_fuel(true);
            config.epoch_interruption(true);
            let engine = Engine::new(&config)
                .map_err(|e| Error::sandbox_unavailable(format!("wasm engine init failed: {}", e)))?;
            let module = Module::new(&engine, &bytes)
                .map_err(|e| Error::config(format!("invalid wasm module: {}", e)))?;
            Ok(WasmHandle {
                engine,
                module,
                export,
            })
        })
        .await
        .map_err(|e| Error::internal(format!("wasm compile task failed: {}", e)))?
    }

    async fn run(
        &self,
        handle: &mut WasmHandle,
        task: &Task,
        plan: &ExecutionPlan,
    ) -> Result<RawOutcome> {
        let engine = handle.engine.clone();
        let module = handle.module.clone();
        let export = handle.export.clone();
        let params = task.input.clone();
        let fuel = self.settings.fuel;
        let memory_limit = plan
            .resources
            .memory_bytes
            .map(|b| usize::try_from(b).unwrap_or(usize::MAX));

        let outcome = tokio::task::spawn_blocking(move || {
            call_export(&engine, &module, &export, &params, fuel, memory_limit)
        })
        .await
        .map_err(|e| Error::internal(format!("wasm call task failed: {}", e)))?;

        Ok(match outcome {
            Ok(value) => RawOutcome {
                exit_code: Some(0),
                stdout: CapturedOutput {
                    text: value.to_string(),
                    ..Default::default()
                },
                stderr: CapturedOutput::default(),
            },
            Err(message) => {
                debug!(error = %message, "wasm call trapped");
                RawOutcome {
                    exit_code: Some(1),
                    stdout: CapturedOutput::default(),
                    stderr: CapturedOutput {
                        total_bytes: message.len() as u64,
                        text: message,
                        truncated: false,
                    },
                }
            }
        })
    }

    async fn terminate(&self, handle: &mut WasmHandle) -> Result<()> {
        handle.engine.increment_epoch();
        Ok(())
    }

    async fn release(&self, handle: WasmHandle) -> Result<()> {
        // A call still running on the blocking pool traps at its next epoch check.
        handle.engine.increment_epoch();
        Ok(())
    }
}

/// Instantiate and call; `Err` carries the trap or link error text.
fn call_export(
    engine: &Engine,
    module: &Module,
    export: &str,
    input: &Arguments,
    fuel: u64,
    memory_limit: Option<usize>,
) -> std::result::Result<Value, String> {
    let mut limits = StoreLimitsBuilder::new();
    if let Some(bytes) = memory_limit {
        limits = limits.memory_size(bytes);
    }
    let mut store = Store::new(
        engine,
        StoreState {
            limits: limits.build(),
        },
    );
    store.limiter(|state| &mut state.limits);
    store.set_fuel(fuel).map_err(|e| e.to_string())?;
    store.set_epoch_deadline(1);

    let linker = Linker::<StoreState>::new(engine);
    let instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| format!("instantiation failed: {:#}", e))?;
    let func = instance
        .get_func(&mut store, export)
        .ok_or_else(|| format!("module has no exported function '{}'", export))?;

    let ty = func.ty(&store);
    let param_types: Vec<ValType> = ty.params().collect();
    let result_types: Vec<ValType> = ty.results().collect();

    let raw_params: Vec<Value> = match input.get("params") {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };
    if raw_params.len() != param_types.len() {
        return Err(format!(
            "'{}' takes {} parameter(s), got {}",
            export,
            param_types.len(),
            raw_params.len()
        ));
    }
    let params = raw_params
        .iter()
        .zip(param_types.iter())
        .enumerate()
        .map(|(i, (value, ty))| to_val(value, ty).map_err(|e| format!("parameter {}: {}", i, e)))
        .collect::<std::result::Result<Vec<Val>, String>>()?;
    let mut results = result_types
        .iter()
        .map(zero_val)
        .collect::<std::result::Result<Vec<Val>, String>>()?;

    func.call(&mut store, &params, &mut results)
        .map_err(|e| format!("trap in '{}': {:#}", export, e))?;

    let remaining = store.get_fuel().unwrap_or(0);
    Ok(json!({
        "export": export,
        "results": results.iter().map(from_val).collect::<Vec<_>>(),
        "fuel_consumed": fuel.saturating_sub(remaining),
    }))
}

fn to_val(value: &Value, ty: &ValType) -> std::result::Result<Val, String> {
    let as_int = || {
        value
            .as_i64()
            .or_else(|| value.as_u64().map(|v| v as i64))
            .or_else(|| value.as_bool().map(i64::from))
    };
    let as_float = || {
        value
            .as_f64()
            .ok_or_else(|| format!("expected a number, got {}", value))
    };
    match ty {
        ValType::I32 => as_int()
            .map(|v| Val::I32(v as i32))
            .ok_or_else(|| format!("expected an i32, got {}", value)),
        ValType::I64 => as_int()
            .map(Val::I64)
            .ok_or_else(|| format!("expected an i64, got {}", value)),
        ValType::F32 => as_float().map(|v| Val::F32((v as f32).to_bits())),
        ValType::F64 => as_float().map(|v| Val::F64(v.to_bits())),
        _ => Err("only i32, i64, f32 and f64 parameters are supported".to_string()),
    }
}

fn zero_val(ty: &ValType) -> std::result::Result<Val, String> {
    match ty {
        ValType::I32 => Ok(Val::I32(0)),
        ValType::I64 => Ok(Val::I64(0)),
        ValType::F32 => Ok(Val::F32(0f32.to_bits())),
        ValType::F64 => Ok(Val::F64(0f64.to_bits())),
        _ => Err("only numeric results are supported".to_string()),
    }
}

fn from_val(val: &Val) -> Value {
    match val {
        Val::I32(v) => json!(v),
        Val::I64(v) => json!(v),
        Val::F32(v) => json!(f32::from_bits(*v)),
        Val::F64(v) => json!(f64::from_bits(*v)),
        _ => Value::Null,
    }
}
