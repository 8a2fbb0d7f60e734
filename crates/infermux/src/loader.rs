//! Model loading.
//!
//! A model version's entry points are WebAssembly modules. The loader
//! compiles each declared module, instantiates one worker per
//! `max_concurrent_inferences`, feeds the weight files to the guest, and
//! runs warmup iterations, all under a wall-clock budget. Each worker
//! owns its own store (its own linear memory and symbol table), so
//! nothing leaks between versions or between workers of one version.
//!
//! # Guest ABI (v1)
//!
//! Every stage module exports:
//! - `memory`: linear memory
//! - `alloc(len: i32) -> i32`: reserve `len` bytes for host input
//! - the stage function `infer` / `preprocess` / `postprocess`
//!   `(ptr: i32, len: i32) -> i64`, returning `(ptr << 32) | len` of a
//!   UTF-8 JSON result in guest memory
//!
//! Optional exports:
//! - `load_weights(ptr: i32, len: i32) -> i32`: receives a JSON manifest
//!   of the `weights/` directory (base64 payloads); nonzero is failure
//! - `warmup() -> i32`: invoked `performance.warmup_iterations` times
//!
//! Guests get no WASI and no imports: a model package cannot touch the
//! filesystem, network, or clock. Compute is bounded by fuel, wall time
//! by epoch deadlines, and memory by store limits.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use wasmtime::{
    Config, Engine, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    Trap, TypedFunc,
};

use crate::descriptor::{VersionDescriptor, VersionKey};
use crate::error::{ErrorCode, Result, RuntimeError};

/// Epoch tick period driven by the loader's background ticker. Stage
/// deadlines are expressed in these ticks.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// ABI export names.
pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_ALLOC: &str = "alloc";
pub const EXPORT_INFER: &str = "infer";
pub const EXPORT_PREPROCESS: &str = "preprocess";
pub const EXPORT_POSTPROCESS: &str = "postprocess";
pub const EXPORT_LOAD_WEIGHTS: &str = "load_weights";
pub const EXPORT_WARMUP: &str = "warmup";

/// Convert a millisecond budget to epoch ticks, rounding up.
#[must_use]
pub fn ticks_for_ms(timeout_ms: u64) -> u64 {
    timeout_ms.div_ceil(EPOCH_TICK.as_millis() as u64).max(1)
}

/// Loader configuration from process-level settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Wall-clock budget for loading one version.
    pub load_timeout: Duration,
    /// Whether GPU-only contracts may be accepted.
    pub enable_gpu: bool,
    /// Fuel budget per guest call.
    pub max_fuel: u64,
    /// Linear memory cap when the contract declares no `max_memory_mb`.
    pub default_max_memory_bytes: usize,
    /// Maximum size of one entry-point module file.
    pub max_module_size_bytes: usize,
    /// Maximum total size of the weights manifest fed to the guest.
    pub max_weights_bytes: usize,
    /// Guest stack cap.
    pub max_stack_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(60),
            enable_gpu: true,
            max_fuel: 5_000_000_000,
            default_max_memory_bytes: 256 * 1024 * 1024,
            max_module_size_bytes: 64 * 1024 * 1024,
            max_weights_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 2 * 1024 * 1024,
        }
    }
}

impl LoaderConfig {
    /// Relaxed limits and a short budget for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            max_fuel: 50_000_000,
            default_max_memory_bytes: 64 * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Store state: resource limits enforced on guest memory growth.
pub struct StoreState {
    limits: StoreLimits,
}

/// Resolved handles for one stage function in one worker.
#[derive(Clone, Debug)]
pub struct StageHandle {
    pub(crate) func: TypedFunc<(i32, i32), i64>,
    pub(crate) alloc: TypedFunc<i32, i32>,
    pub(crate) memory: Memory,
}

/// Why a guest call failed, before classification into stage codes.
#[derive(Debug)]
pub enum GuestCallError {
    /// Epoch deadline or fuel budget exhausted.
    Timeout,
    /// Memory growth denied by the store limits.
    OutOfMemory,
    /// The guest trapped or returned an unusable result.
    Trap(String),
}

impl GuestCallError {
    fn classify(err: &wasmtime::Error) -> Self {
        if let Some(trap) = err.downcast_ref::<Trap>() {
            return match trap {
                Trap::Interrupt | Trap::OutOfFuel => Self::Timeout,
                _ => {
                    let message = err.to_string();
                    if message.contains("memory") || message.contains("grow") {
                        Self::OutOfMemory
                    } else {
                        Self::Trap(message)
                    }
                }
            };
        }
        let message = err.to_string();
        if message.contains("grow") || message.contains("memory limit") {
            Self::OutOfMemory
        } else {
            Self::Trap(message)
        }
    }
}

/// Write `payload` into the guest, invoke the stage function under the
/// given fuel and epoch budgets, and read the JSON result back out.
pub(crate) fn call_guest(
    store: &mut Store<StoreState>,
    handle: &StageHandle,
    payload: &[u8],
    fuel: u64,
    deadline_ticks: u64,
) -> std::result::Result<Vec<u8>, GuestCallError> {
    store
        .set_fuel(fuel)
        .map_err(|e| GuestCallError::Trap(e.to_string()))?;
    store.set_epoch_deadline(deadline_ticks);

    let len = i32::try_from(payload.len())
        .map_err(|_| GuestCallError::Trap("payload exceeds addressable guest memory".into()))?;
    let ptr = handle
        .alloc
        .call(&mut *store, len)
        .map_err(|e| GuestCallError::classify(&e))?;
    handle
        .memory
        .write(&mut *store, ptr as usize, payload)
        .map_err(|e| GuestCallError::Trap(format!("guest alloc returned bad pointer: {e}")))?;

    let packed = handle
        .func
        .call(&mut *store, (ptr, len))
        .map_err(|e| GuestCallError::classify(&e))?;

    let out_ptr = (packed >> 32) as u32 as usize;
    let out_len = packed as u32 as usize;
    let data = handle.memory.data(&*store);
    let end = out_ptr
        .checked_add(out_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| GuestCallError::Trap("guest returned out-of-bounds result".into()))?;
    Ok(data[out_ptr..end].to_vec())
}

/// One instantiated execution context: a store plus resolved stage
/// functions. Owned by exactly one in-flight execution at a time.
#[derive(Debug)]
pub struct Worker {
    pub(crate) store: Store<StoreState>,
    pub(crate) infer: StageHandle,
    pub(crate) preprocess: Option<StageHandle>,
    pub(crate) postprocess: Option<StageHandle>,
}

struct StageModules {
    inference: Module,
    preprocess: Option<Module>,
    postprocess: Option<Module>,
    loader: Option<Module>,
}

/// Builds workers for one loaded version. Retained by the sandbox so
/// poisoned workers can be replaced without re-reading the package.
#[derive(Debug)]
pub struct WorkerFactory {
    engine: Engine,
    descriptor: Arc<VersionDescriptor>,
    modules: StageModules,
    weights_manifest: Vec<u8>,
    max_fuel: u64,
    memory_limit_bytes: usize,
    init_deadline_ticks: u64,
}

impl WorkerFactory {
    /// Instantiate, feed weights, and warm up one worker.
    pub fn build_worker(&self) -> Result<Worker> {
        let key = self.descriptor.key();
        let mut store = Store::new(
            &self.engine,
            StoreState {
                limits: StoreLimitsBuilder::new()
                    .memory_size(self.memory_limit_bytes)
                    .memories(4)
                    .tables(4)
                    .table_elements(10_000)
                    .instances(8)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(self.init_deadline_ticks);
        // Instantiation may run a start section; give it fuel up front.
        store.set_fuel(self.max_fuel).map_err(|e| {
            RuntimeError::new(ErrorCode::LoadGenericError, "cannot initialize fuel")
                .with_model_id(key.model_id.clone())
                .with_version(key.version.to_string())
                .with_cause(e)
        })?;

        let linker: Linker<StoreState> = Linker::new(&self.engine);

        // The loader module, when declared, initializes first.
        if let Some(module) = &self.modules.loader {
            let instance = instantiate(&linker, &mut store, module, &key)?;
            let handle = resolve_weights_handle(&mut store, &instance, &key)?.ok_or_else(|| {
                RuntimeError::new(
                    ErrorCode::LoadWeightsFailed,
                    "declared loader module does not export load_weights",
                )
                .with_model_id(key.model_id.clone())
                .with_version(key.version.to_string())
            })?;
            self.feed_weights(&mut store, &handle, &key)?;
        }

        let inference_instance = instantiate(&linker, &mut store, &self.modules.inference, &key)?;
        let infer = resolve_stage(&mut store, &inference_instance, EXPORT_INFER, &key)
            .map_err(|e| e.with_code_if_missing(ErrorCode::LoadInferNotFound))?;

        // Stage modules that carry their own weights self-initialize.
        if let Some(handle) = resolve_weights_handle(&mut store, &inference_instance, &key)? {
            self.feed_weights(&mut store, &handle, &key)?;
        }

        let preprocess = match &self.modules.preprocess {
            Some(module) => {
                let instance = instantiate(&linker, &mut store, module, &key)?;
                Some(
                    resolve_stage(&mut store, &instance, EXPORT_PREPROCESS, &key)
                        .map_err(|e| e.with_code_if_missing(ErrorCode::LoadPreprocessNotFound))?,
                )
            }
            None => None,
        };

        let postprocess = match &self.modules.postprocess {
            Some(module) => {
                let instance = instantiate(&linker, &mut store, module, &key)?;
                Some(
                    resolve_stage(&mut store, &instance, EXPORT_POSTPROCESS, &key)
                        .map_err(|e| e.with_code_if_missing(ErrorCode::LoadPostprocessNotFound))?,
                )
            }
            None => None,
        };

        self.warmup(&mut store, &inference_instance, &key)?;

        Ok(Worker {
            store,
            infer,
            preprocess,
            postprocess,
        })
    }

    /// Fuel budget per guest call, shared with the sandbox.
    #[must_use]
    pub fn max_fuel(&self) -> u64 {
        self.max_fuel
    }

    fn feed_weights(
        &self,
        store: &mut Store<StoreState>,
        handle: &WeightsHandle,
        key: &VersionKey,
    ) -> Result<()> {
        if let Err(e) = store.set_fuel(self.max_fuel) {
            return Err(weights_error(key, e.to_string()));
        }
        store.set_epoch_deadline(self.init_deadline_ticks);

        let len = i32::try_from(self.weights_manifest.len())
            .map_err(|_| weights_error(key, "weights manifest too large".into()))?;
        let ptr = handle
            .alloc
            .call(&mut *store, len)
            .map_err(|e| weights_error(key, e.to_string()))?;
        handle
            .memory
            .write(&mut *store, ptr as usize, &self.weights_manifest)
            .map_err(|e| weights_error(key, e.to_string()))?;
        let status = handle
            .func
            .call(&mut *store, (ptr, len))
            .map_err(|e| weights_error(key, e.to_string()))?;
        if status != 0 {
            return Err(weights_error(key, format!("load_weights returned {status}")));
        }
        Ok(())
    }

    fn warmup(
        &self,
        store: &mut Store<StoreState>,
        instance: &Instance,
        key: &VersionKey,
    ) -> Result<()> {
        let iterations = self.descriptor.performance.warmup_iterations;
        if iterations == 0 {
            return Ok(());
        }
        let Ok(warmup) = instance.get_typed_func::<(), i32>(&mut *store, EXPORT_WARMUP) else {
            debug!(version = %key, "no warmup export, skipping warmup iterations");
            return Ok(());
        };

        for iteration in 0..iterations {
            if let Err(e) = store.set_fuel(self.max_fuel) {
                return Err(warmup_error(key, iteration, e.to_string()));
            }
            store.set_epoch_deadline(self.init_deadline_ticks);
            let status = warmup
                .call(&mut *store, ())
                .map_err(|e| warmup_error(key, iteration, e.to_string()))?;
            if status != 0 {
                return Err(warmup_error(key, iteration, format!("returned {status}")));
            }
        }
        debug!(version = %key, iterations, "warmup complete");
        Ok(())
    }
}

struct WeightsHandle {
    func: TypedFunc<(i32, i32), i32>,
    alloc: TypedFunc<i32, i32>,
    memory: Memory,
}

fn weights_error(key: &VersionKey, cause: String) -> RuntimeError {
    RuntimeError::new(ErrorCode::LoadWeightsFailed, "weight loading failed")
        .with_model_id(key.model_id.clone())
        .with_version(key.version.to_string())
        .with_cause(cause)
}

fn warmup_error(key: &VersionKey, iteration: u32, cause: String) -> RuntimeError {
    RuntimeError::new(
        ErrorCode::LoadWarmupFailed,
        format!("warmup iteration {iteration} failed"),
    )
    .with_model_id(key.model_id.clone())
    .with_version(key.version.to_string())
    .with_cause(cause)
}

fn instantiate(
    linker: &Linker<StoreState>,
    store: &mut Store<StoreState>,
    module: &Module,
    key: &VersionKey,
) -> Result<Instance> {
    linker.instantiate(&mut *store, module).map_err(|e| {
        let message = e.to_string();
        let code = if message.contains("unknown import") {
            ErrorCode::LoadMissingDependency
        } else {
            ErrorCode::LoadImportFailed
        };
        RuntimeError::new(code, "failed to instantiate entry-point module")
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_cause(message)
    })
}

/// Stage resolution error that still needs its final code: missing
/// exports map to stage-specific codes at the call site.
struct StageResolveError {
    missing_export: bool,
    inner: RuntimeError,
}

impl StageResolveError {
    fn with_code_if_missing(self, code: ErrorCode) -> RuntimeError {
        if self.missing_export {
            RuntimeError::new(code, self.inner.message.clone())
                .with_model_id(self.inner.context.model_id.clone().unwrap_or_default())
                .with_version(self.inner.context.version.clone().unwrap_or_default())
        } else {
            self.inner
        }
    }
}

fn resolve_stage(
    store: &mut Store<StoreState>,
    instance: &Instance,
    export: &str,
    key: &VersionKey,
) -> std::result::Result<StageHandle, StageResolveError> {
    let memory = instance
        .get_memory(&mut *store, EXPORT_MEMORY)
        .ok_or_else(|| StageResolveError {
            missing_export: false,
            inner: abi_error(key, "module does not export memory"),
        })?;
    let alloc = instance
        .get_typed_func::<i32, i32>(&mut *store, EXPORT_ALLOC)
        .map_err(|e| StageResolveError {
            missing_export: false,
            inner: abi_error(key, &format!("module does not export alloc: {e}")),
        })?;
    let func = instance
        .get_typed_func::<(i32, i32), i64>(&mut *store, export)
        .map_err(|_| StageResolveError {
            missing_export: true,
            inner: abi_error(key, &format!("{export} export not found or has wrong signature")),
        })?;
    Ok(StageHandle {
        func,
        alloc,
        memory,
    })
}

fn resolve_weights_handle(
    store: &mut Store<StoreState>,
    instance: &Instance,
    key: &VersionKey,
) -> Result<Option<WeightsHandle>> {
    let Ok(func) = instance.get_typed_func::<(i32, i32), i32>(&mut *store, EXPORT_LOAD_WEIGHTS)
    else {
        return Ok(None);
    };
    let memory = instance
        .get_memory(&mut *store, EXPORT_MEMORY)
        .ok_or_else(|| abi_error(key, "module does not export memory"))?;
    let alloc = instance
        .get_typed_func::<i32, i32>(&mut *store, EXPORT_ALLOC)
        .map_err(|e| abi_error(key, &format!("module does not export alloc: {e}")))?;
    Ok(Some(WeightsHandle {
        func,
        alloc,
        memory,
    }))
}

fn abi_error(key: &VersionKey, message: &str) -> RuntimeError {
    RuntimeError::new(ErrorCode::LoadImportFailed, message)
        .with_model_id(key.model_id.clone())
        .with_version(key.version.to_string())
}

// ============================================================================
// Loaded model
// ============================================================================

/// A fully loaded version: pre-built workers plus the factory to rebuild
/// them.
#[derive(Debug)]
pub struct LoadedModel {
    pub descriptor: Arc<VersionDescriptor>,
    pub factory: Arc<WorkerFactory>,
    pub workers: Vec<Worker>,
}

// ============================================================================
// Model loader
// ============================================================================

/// Compiles and instantiates model packages.
///
/// One engine is shared by every version; isolation comes from per-worker
/// stores. A background ticker advances the engine epoch so stage
/// deadlines actually interrupt running guest code.
pub struct ModelLoader {
    engine: Engine,
    config: LoaderConfig,
    ticker: tokio::task::JoinHandle<()>,
}

impl ModelLoader {
    /// Create the engine and start the epoch ticker.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.consume_fuel(true);
        wasmtime_config.epoch_interruption(true);
        wasmtime_config.max_wasm_stack(config.max_stack_bytes);
        wasmtime_config.wasm_threads(false);
        wasmtime_config.wasm_reference_types(false);

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::new(ErrorCode::LoadGenericError, "failed to create wasm engine")
                .with_cause(e)
        })?;

        let ticker_engine = engine.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                ticker_engine.increment_epoch();
            }
        });

        Ok(Self {
            engine,
            config,
            ticker,
        })
    }

    /// Load a validated version: compile entry points, build one worker
    /// per declared concurrency slot, feed weights, warm up. The whole
    /// operation is bounded by the configured load timeout.
    pub async fn load(&self, descriptor: Arc<VersionDescriptor>) -> Result<LoadedModel> {
        let key = descriptor.key();
        self.check_hardware(&descriptor)?;

        let engine = self.engine.clone();
        let config = self.config.clone();
        let load_descriptor = Arc::clone(&descriptor);

        let load = tokio::task::spawn_blocking(move || {
            load_blocking(&engine, &config, load_descriptor)
        });

        match tokio::time::timeout(self.config.load_timeout, load).await {
            Ok(Ok(result)) => {
                if let Ok(loaded) = &result {
                    info!(
                        version = %key,
                        workers = loaded.workers.len(),
                        "model loaded"
                    );
                }
                result
            }
            Ok(Err(join_err)) => Err(RuntimeError::new(
                ErrorCode::LoadGenericError,
                "load task failed",
            )
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_cause(join_err)),
            Err(_) => {
                warn!(version = %key, "load exceeded wall-clock budget");
                Err(RuntimeError::new(
                    ErrorCode::LoadTimeout,
                    format!(
                        "load exceeded {} ms budget",
                        self.config.load_timeout.as_millis()
                    ),
                )
                .with_model_id(key.model_id.clone())
                .with_version(key.version.to_string()))
            }
        }
    }

    fn check_hardware(&self, descriptor: &VersionDescriptor) -> Result<()> {
        let hardware = &descriptor.hardware;
        let gpu_available = self.config.enable_gpu && (hardware.supports_gpu || hardware.supports_jetson);
        if !hardware.supports_cpu && !gpu_available {
            return Err(RuntimeError::new(
                ErrorCode::ValHardwareIncompatible,
                "no compatible hardware target for this contract",
            )
            .with_model_id(descriptor.model_id.clone())
            .with_version(descriptor.version.to_string()));
        }
        Ok(())
    }
}

impl Drop for ModelLoader {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

fn load_blocking(
    engine: &Engine,
    config: &LoaderConfig,
    descriptor: Arc<VersionDescriptor>,
) -> Result<LoadedModel> {
    let key = descriptor.key();
    let dir = &descriptor.directory_path;
    let entry_points = &descriptor.entry_points;

    let inference = compile_module(engine, config, dir, &entry_points.inference, &key)?;
    let preprocess = entry_points
        .preprocess
        .as_ref()
        .map(|name| compile_module(engine, config, dir, name, &key))
        .transpose()?;
    let postprocess = entry_points
        .postprocess
        .as_ref()
        .map(|name| compile_module(engine, config, dir, name, &key))
        .transpose()?;
    let loader = entry_points
        .loader
        .as_ref()
        .map(|name| compile_module(engine, config, dir, name, &key))
        .transpose()?;

    let weights_manifest = build_weights_manifest(dir, config.max_weights_bytes, &key)?;

    let memory_limit_bytes = descriptor
        .limits
        .max_memory_mb
        .map(|mb| usize::try_from(mb).unwrap_or(usize::MAX).saturating_mul(1024 * 1024))
        .unwrap_or(config.default_max_memory_bytes);

    let factory = Arc::new(WorkerFactory {
        engine: engine.clone(),
        descriptor: Arc::clone(&descriptor),
        modules: StageModules {
            inference,
            preprocess,
            postprocess,
            loader,
        },
        weights_manifest,
        max_fuel: config.max_fuel,
        memory_limit_bytes,
        init_deadline_ticks: ticks_for_ms(config.load_timeout.as_millis() as u64),
    });

    let worker_count = descriptor.limits.max_concurrent_inferences.max(1);
    let mut workers = Vec::with_capacity(worker_count as usize);
    for _ in 0..worker_count {
        workers.push(factory.build_worker()?);
    }

    Ok(LoadedModel {
        descriptor,
        factory,
        workers,
    })
}

fn compile_module(
    engine: &Engine,
    config: &LoaderConfig,
    dir: &Path,
    file_name: &str,
    key: &VersionKey,
) -> Result<Module> {
    let path = dir.join(file_name);
    let bytes = fs::read(&path).map_err(|e| {
        RuntimeError::new(
            ErrorCode::LoadImportFailed,
            format!("cannot read entry point '{file_name}'"),
        )
        .with_model_id(key.model_id.clone())
        .with_version(key.version.to_string())
        .with_path(path.clone())
        .with_cause(e)
    })?;

    if bytes.len() > config.max_module_size_bytes {
        return Err(RuntimeError::new(
            ErrorCode::LoadImportFailed,
            format!(
                "entry point '{file_name}' exceeds module size limit ({} bytes)",
                config.max_module_size_bytes
            ),
        )
        .with_model_id(key.model_id.clone())
        .with_version(key.version.to_string())
        .with_path(path));
    }

    Module::new(engine, &bytes).map_err(|e| {
        RuntimeError::new(
            ErrorCode::LoadSyntaxError,
            format!("entry point '{file_name}' failed to compile"),
        )
        .with_model_id(key.model_id.clone())
        .with_version(key.version.to_string())
        .with_path(path)
        .with_cause(e)
    })
}

fn build_weights_manifest(
    dir: &Path,
    max_weights_bytes: usize,
    key: &VersionKey,
) -> Result<Vec<u8>> {
    let weights_dir = dir.join("weights");
    let mut files = Vec::new();
    let mut total: usize = 0;

    for entry in WalkDir::new(&weights_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let data = fs::read(entry.path()).map_err(|e| {
            RuntimeError::new(ErrorCode::LoadWeightsFailed, "cannot read weight file")
                .with_model_id(key.model_id.clone())
                .with_version(key.version.to_string())
                .with_path(entry.path())
                .with_cause(e)
        })?;
        total = total.saturating_add(data.len());
        if total > max_weights_bytes {
            return Err(RuntimeError::new(
                ErrorCode::LoadWeightsFailed,
                format!("weights exceed {max_weights_bytes} byte limit"),
            )
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_path(weights_dir));
        }
        let name = entry
            .path()
            .strip_prefix(&weights_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        files.push(serde_json::json!({
            "name": name,
            "data": BASE64.encode(&data),
        }));
    }

    serde_json::to_vec(&serde_json::json!({ "files": files })).map_err(|e| {
        RuntimeError::new(ErrorCode::LoadWeightsFailed, "cannot encode weights manifest")
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_cause(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        infer_module_wat, loader_module_wat, warmup_module_wat, write_package, ContractOptions,
    };
    use tempfile::TempDir;

    fn load_descriptor(dir: &Path) -> Arc<VersionDescriptor> {
        let report = crate::contract::ContractValidator::new().validate(dir, "sample_det", "1.0.0");
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        Arc::new(report.descriptor.unwrap())
    }

    #[tokio::test]
    async fn test_load_stub_model() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), &ContractOptions::frame_detector());

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let loaded = loader.load(load_descriptor(tmp.path())).await.unwrap();
        assert_eq!(loaded.workers.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_infer_export() {
        let tmp = TempDir::new().unwrap();
        let mut options = ContractOptions::frame_detector();
        // A module whose only stage export is preprocess.
        options.inference_wat =
            infer_module_wat("preprocess", r#"{"event_type":"detected"}"#);
        write_package(tmp.path(), &options);

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let err = loader.load(load_descriptor(tmp.path())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadInferNotFound);
    }

    #[tokio::test]
    async fn test_unparseable_module() {
        let tmp = TempDir::new().unwrap();
        let mut options = ContractOptions::frame_detector();
        options.inference_wat = "(module (broken".to_string();
        write_package(tmp.path(), &options);

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let err = loader.load(load_descriptor(tmp.path())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadSyntaxError);
    }

    #[tokio::test]
    async fn test_unknown_import_is_missing_dependency() {
        let tmp = TempDir::new().unwrap();
        let mut options = ContractOptions::frame_detector();
        options.inference_wat =
            r#"(module (import "env" "missing" (func)) (memory (export "memory") 1))"#.to_string();
        write_package(tmp.path(), &options);

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let err = loader.load(load_descriptor(tmp.path())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadMissingDependency);
    }

    #[tokio::test]
    async fn test_failing_load_weights() {
        let tmp = TempDir::new().unwrap();
        let mut options = ContractOptions::frame_detector();
        options.loader_wat = Some(loader_module_wat(7));
        write_package(tmp.path(), &options);

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let err = loader.load(load_descriptor(tmp.path())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadWeightsFailed);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_gpu_only_contract_rejected_without_gpu() {
        let tmp = TempDir::new().unwrap();
        let mut options = ContractOptions::frame_detector();
        options.supports_cpu = false;
        options.supports_gpu = true;
        write_package(tmp.path(), &options);

        let mut config = LoaderConfig::for_testing();
        config.enable_gpu = false;
        let loader = ModelLoader::new(config).unwrap();
        let err = loader.load(load_descriptor(tmp.path())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValHardwareIncompatible);
    }

    #[tokio::test]
    async fn test_failing_warmup() {
        let tmp = TempDir::new().unwrap();
        let mut options = ContractOptions::frame_detector();
        options.warmup_iterations = 2;
        options.inference_wat = warmup_module_wat(r#"{"event_type":"detected"}"#, 3);
        write_package(tmp.path(), &options);

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let err = loader.load(load_descriptor(tmp.path())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadWarmupFailed);
        assert!(err.retryable);
    }
}
