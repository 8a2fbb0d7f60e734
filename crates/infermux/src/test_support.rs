//! Test fixtures: synthetic model packages with WebAssembly text-format
//! entry points.
//!
//! Used by the unit and integration suites to build real on-disk
//! packages without a guest toolchain; wasmtime compiles the text format
//! directly. Not part of the runtime's public surface.

#![allow(clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use semver::Version;

use crate::backend::BackendClient;
use crate::descriptor::{
    EntryPoints, HardwareSpec, HealthStatus, InputFormat, InputKind, InputSpec, LoadState,
    ModelCapabilities, OutputSpec, PerformanceHints, ResourceLimits, VersionDescriptor, VersionKey,
};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::registry::ModelRegistry;
use crate::reporting::FullCapabilityReport;

const ALLOC_AND_MEMORY: &str = r#"
  (memory (export "memory") 16)
  (global $heap (mut i32) (i32.const 65536))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
"#;

fn escape_wat(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Module exporting `stage` that ignores its input and returns
/// `result_json`.
#[must_use]
pub fn stage_module_wat(stage: &str, result_json: &str) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (data (i32.const 1024) "{data}")
  (func (export "{stage}") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.const 1024) (i64.const 32))
      (i64.const {len}))))"#,
        data = escape_wat(result_json),
        len = result_json.len(),
    )
}

/// Alias kept for readability at call sites building inference modules.
#[must_use]
pub fn infer_module_wat(stage: &str, result_json: &str) -> String {
    stage_module_wat(stage, result_json)
}

/// Module exporting `stage` that returns its input unchanged.
#[must_use]
pub fn echo_module_wat(stage: &str) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (func (export "{stage}") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len)))))"#,
    )
}

/// Module exporting `stage` that always traps.
#[must_use]
pub fn trap_module_wat(stage: &str) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (func (export "{stage}") (param $ptr i32) (param $len i32) (result i64)
    unreachable))"#,
    )
}

/// Module exporting `stage` that spins forever. Only fuel or an epoch
/// deadline stops it.
#[must_use]
pub fn loop_module_wat(stage: &str) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (func (export "{stage}") (param $ptr i32) (param $len i32) (result i64)
    (loop $spin (br $spin))
    unreachable))"#,
    )
}

/// Module whose `infer` burns `iterations` loop rounds before returning
/// `result_json`. Used to keep executions in flight long enough for
/// admission tests to observe overlap.
#[must_use]
pub fn busy_module_wat(result_json: &str, iterations: u64) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (data (i32.const 1024) "{data}")
  (func (export "infer") (param $ptr i32) (param $len i32) (result i64)
    (local $n i64)
    (local.set $n (i64.const {iterations}))
    (block $done
      (loop $spin
        (br_if $done (i64.eqz (local.get $n)))
        (local.set $n (i64.sub (local.get $n) (i64.const 1)))
        (br $spin)))
    (i64.or
      (i64.shl (i64.const 1024) (i64.const 32))
      (i64.const {len}))))"#,
        data = escape_wat(result_json),
        len = result_json.len(),
    )
}

/// Inference module whose `warmup` export returns `status`.
#[must_use]
pub fn warmup_module_wat(result_json: &str, status: i32) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (data (i32.const 1024) "{data}")
  (func (export "warmup") (result i32)
    i32.const {status})
  (func (export "infer") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.const 1024) (i64.const 32))
      (i64.const {len}))))"#,
        data = escape_wat(result_json),
        len = result_json.len(),
    )
}

/// Loader module whose `load_weights` export returns `status`.
#[must_use]
pub fn loader_module_wat(status: i32) -> String {
    format!(
        r#"(module
{ALLOC_AND_MEMORY}
  (func (export "load_weights") (param i32 i32) (result i32)
    i32.const {status}))"#,
    )
}

/// Everything needed to write a synthetic package to disk.
pub struct ContractOptions {
    pub model_id: String,
    pub version: String,
    pub input_type: String,
    pub max_concurrent: u32,
    pub inference_timeout_ms: u64,
    pub preprocessing_timeout_ms: u64,
    pub postprocessing_timeout_ms: u64,
    pub warmup_iterations: u32,
    pub supports_cpu: bool,
    pub supports_gpu: bool,
    pub event_enum: Vec<String>,
    pub metadata_allowed_keys: Vec<String>,
    pub batch_range: Option<(u32, u32)>,
    pub temporal_range: Option<(u32, u32)>,
    pub inference_wat: String,
    pub preprocess_wat: Option<String>,
    pub postprocess_wat: Option<String>,
    pub loader_wat: Option<String>,
}

impl ContractOptions {
    /// A healthy single-frame detector with two concurrency slots.
    #[must_use]
    pub fn frame_detector() -> Self {
        Self {
            model_id: "sample_det".to_string(),
            version: "1.0.0".to_string(),
            input_type: "frame".to_string(),
            max_concurrent: 2,
            inference_timeout_ms: 5000,
            preprocessing_timeout_ms: 1000,
            postprocessing_timeout_ms: 1000,
            warmup_iterations: 0,
            supports_cpu: true,
            supports_gpu: false,
            event_enum: vec!["detected".to_string(), "not_detected".to_string()],
            metadata_allowed_keys: vec!["confidence".to_string()],
            batch_range: None,
            temporal_range: None,
            inference_wat: stage_module_wat(
                "infer",
                r#"{"event_type":"detected","metadata":{"confidence":0.92}}"#,
            ),
            preprocess_wat: None,
            postprocess_wat: None,
            loader_wat: None,
        }
    }

    /// A detector whose infer always traps.
    #[must_use]
    pub fn failing_detector() -> Self {
        Self {
            inference_wat: trap_module_wat("infer"),
            ..Self::frame_detector()
        }
    }

    /// A detector whose infer spins until the deadline.
    #[must_use]
    pub fn slow_detector(inference_timeout_ms: u64) -> Self {
        Self {
            inference_timeout_ms,
            inference_wat: loop_module_wat("infer"),
            ..Self::frame_detector()
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    fn contract_yaml(&self) -> String {
        let mut yaml = format!(
            r#"model_id: {model_id}
version: {version}
display_name: {model_id}
contract_schema_version: 1.0.0
input:
  type: {input_type}
  format: rgb8
  min_width: 320
  min_height: 240
  channels: 3
"#,
            model_id = self.model_id,
            version = self.version,
            input_type = self.input_type,
        );

        if let Some((min, max)) = self.batch_range {
            yaml.push_str(&format!(
                "  batch:\n    min_size: {min}\n    max_size: {max}\n"
            ));
        }
        if let Some((min, max)) = self.temporal_range {
            yaml.push_str(&format!(
                "  temporal:\n    min_frames: {min}\n    max_frames: {max}\n"
            ));
        }

        let events = self.event_enum.join(", ");
        let keys = self.metadata_allowed_keys.join(", ");
        yaml.push_str(&format!(
            r#"output:
  schema_version: "1.0"
  schema:
    event_type:
      enum: [{events}]
    metadata:
      allowed_keys: [{keys}]
hardware:
  supports_cpu: {cpu}
  supports_gpu: {gpu}
  supports_jetson: false
performance:
  inference_time_hint_ms: 50
  recommended_fps: 10
  warmup_iterations: {warmup}
limits:
  inference_timeout_ms: {infer_ms}
  preprocessing_timeout_ms: {pre_ms}
  postprocessing_timeout_ms: {post_ms}
  max_concurrent_inferences: {max_concurrent}
"#,
            cpu = self.supports_cpu,
            gpu = self.supports_gpu,
            warmup = self.warmup_iterations,
            infer_ms = self.inference_timeout_ms,
            pre_ms = self.preprocessing_timeout_ms,
            post_ms = self.postprocessing_timeout_ms,
            max_concurrent = self.max_concurrent,
        ));

        yaml.push_str("entry_points:\n  inference: inference.wasm\n");
        if self.preprocess_wat.is_some() {
            yaml.push_str("  preprocess: preprocessing.wasm\n");
        }
        if self.postprocess_wat.is_some() {
            yaml.push_str("  postprocess: postprocessing.wasm\n");
        }
        if self.loader_wat.is_some() {
            yaml.push_str("  loader: loader.wasm\n");
        }
        yaml
    }
}

/// Write a complete package (contract, weights, entry points) into
/// `dir`, which becomes the version directory.
pub fn write_package(dir: &Path, options: &ContractOptions) {
    fs::create_dir_all(dir.join("weights")).expect("create weights dir");
    fs::write(dir.join("weights/model.bin"), b"\x00synthetic-weights")
        .expect("write weights");
    fs::write(dir.join("model.yaml"), options.contract_yaml()).expect("write contract");
    fs::write(dir.join("inference.wasm"), &options.inference_wat).expect("write inference");
    if let Some(wat) = &options.preprocess_wat {
        fs::write(dir.join("preprocessing.wasm"), wat).expect("write preprocess");
    }
    if let Some(wat) = &options.postprocess_wat {
        fs::write(dir.join("postprocessing.wasm"), wat).expect("write postprocess");
    }
    if let Some(wat) = &options.loader_wat {
        fs::write(dir.join("loader.wasm"), wat).expect("write loader");
    }
}

/// Write a package under `<root>/<model_id>/<version>/`, the layout the
/// discovery scanner expects.
pub fn write_package_tree(root: &Path, options: &ContractOptions) {
    let dir = root.join(&options.model_id).join(&options.version);
    fs::create_dir_all(&dir).expect("create version dir");
    write_package(&dir, options);
}

/// In-memory descriptor for registry-only tests (no package on disk).
#[must_use]
pub fn synthetic_descriptor(model_id: &str, version: &str) -> Arc<VersionDescriptor> {
    Arc::new(VersionDescriptor {
        model_id: model_id.to_string(),
        version: Version::parse(version).expect("valid semver"),
        display_name: model_id.to_string(),
        description: String::new(),
        author: "test".to_string(),
        contract_schema_version: "1.0.0".to_string(),
        directory_path: PathBuf::from("/nonexistent"),
        input: InputSpec {
            kind: InputKind::Frame,
            format: InputFormat::Rgb8,
            min_width: 320,
            min_height: 240,
            max_width: None,
            max_height: None,
            channels: 3,
            batch_min_size: None,
            batch_max_size: None,
            batch_recommended_size: None,
            temporal_min_frames: None,
            temporal_max_frames: None,
            temporal_recommended_frames: None,
            temporal_fps_requirement: None,
        },
        output: OutputSpec {
            schema_version: "1.0".to_string(),
            event_type_enum: vec!["detected".to_string(), "not_detected".to_string()],
            provides_bounding_boxes: false,
            provides_metadata: false,
            metadata_allowed_keys: Vec::new(),
        },
        hardware: HardwareSpec {
            supports_cpu: true,
            supports_gpu: false,
            supports_jetson: false,
            min_gpu_memory_mb: None,
            min_cpu_cores: None,
            min_ram_mb: None,
        },
        performance: PerformanceHints {
            inference_time_hint_ms: 100,
            recommended_fps: 10,
            max_fps: None,
            recommended_batch_size: 1,
            warmup_iterations: 0,
        },
        limits: ResourceLimits::default(),
        capabilities: ModelCapabilities::default(),
        entry_points: EntryPoints::default(),
    })
}

/// Register a synthetic version and walk it to READY with the given
/// health.
pub fn registry_with_ready_version(
    registry: &Arc<ModelRegistry>,
    model_id: &str,
    version: &str,
    health: HealthStatus,
) -> VersionKey {
    let descriptor = synthetic_descriptor(model_id, version);
    let key = descriptor.key();
    registry.register_version(descriptor).expect("register");
    registry
        .update_state(&key, LoadState::Validating, None, None)
        .expect("validating");
    registry
        .update_state(&key, LoadState::Valid, None, None)
        .expect("valid");
    registry
        .update_state(&key, LoadState::Loading, None, None)
        .expect("loading");
    registry
        .update_state(&key, LoadState::Ready, None, None)
        .expect("ready");
    registry.update_health(&key, health).expect("health");
    key
}

/// Backend double that records every push and can fail the first N
/// calls to exercise retry paths.
#[derive(Default)]
pub struct RecordingBackendClient {
    /// Push log: kind ("register" / "health") and the report sent.
    pub pushes: Mutex<Vec<(String, FullCapabilityReport)>>,
    pub deregistered: AtomicBool,
    fail_remaining: AtomicU32,
    failures_seen: AtomicU32,
}

impl RecordingBackendClient {
    /// A client whose first `n` calls fail.
    #[must_use]
    pub fn failing(n: u32) -> Self {
        Self {
            fail_remaining: AtomicU32::new(n),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failures_seen(&self) -> u32 {
        self.failures_seen.load(Ordering::Acquire)
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.fail_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::Release);
            self.failures_seen.fetch_add(1, Ordering::AcqRel);
            return Err(RuntimeError::new(
                ErrorCode::PipeGenericError,
                "injected backend failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for RecordingBackendClient {
    async fn register_capabilities(
        &self,
        report: &FullCapabilityReport,
        _correlation_id: &str,
    ) -> Result<()> {
        self.maybe_fail()?;
        self.pushes
            .lock()
            .push(("register".to_string(), report.clone()));
        Ok(())
    }

    async fn push_health(
        &self,
        report: &FullCapabilityReport,
        _correlation_id: &str,
    ) -> Result<()> {
        self.maybe_fail()?;
        self.pushes
            .lock()
            .push(("health".to_string(), report.clone()));
        Ok(())
    }

    async fn deregister(&self, _runtime_id: &str, _correlation_id: &str) -> Result<()> {
        self.deregistered.store(true, Ordering::Release);
        Ok(())
    }
}
