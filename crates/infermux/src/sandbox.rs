//! Execution sandbox.
//!
//! One sandbox wraps one loaded version and owns its pool of workers
//! (one per declared concurrency slot). All model code runs inside the
//! workers' stores: an exception becomes a classified error outcome, a
//! stage that overruns its budget is interrupted by the engine epoch,
//! and memory growth beyond the declared limit traps. Nothing a model
//! does can reach another sandbox.
//!
//! A worker whose stage timed out is poisoned: it is dropped (the epoch
//! trap ends any straggling computation) and a replacement is built in
//! the background, so subsequent requests never wait on a stuck stage.
//!
//! Health is a windowed failure rate over recent executions. Transitions
//! are written to the registry; UNHEALTHY is sticky until the version is
//! re-enabled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::descriptor::{HealthStatus, InputKind, VersionDescriptor, VersionKey};
use crate::error::{ErrorCode, RuntimeError};
use crate::loader::{call_guest, ticks_for_ms, GuestCallError, LoadedModel, StageHandle, Worker, WorkerFactory};
use crate::pipeline::InferenceInput;
use crate::registry::ModelRegistry;

/// Extra wall-clock slack on top of a stage budget before the host gives
/// up waiting for the epoch trap.
const STAGE_GRACE: Duration = Duration::from_millis(500);

/// Pipeline stage labels carried in outcomes and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Validation,
    Preprocess,
    Inference,
    Postprocess,
    OutputValidation,
}

impl ExecutionStage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Preprocess => "preprocess",
            Self::Inference => "inference",
            Self::Postprocess => "postprocess",
            Self::OutputValidation => "output_validation",
        }
    }

    fn timeout_code(&self) -> ErrorCode {
        match self {
            Self::Preprocess => ErrorCode::ExecPreprocessTimeout,
            Self::Postprocess => ErrorCode::ExecPostprocessTimeout,
            _ => ErrorCode::ExecInferenceTimeout,
        }
    }

    fn failure_code(&self) -> ErrorCode {
        match self {
            Self::Preprocess => ErrorCode::ExecPreprocessFailed,
            Self::Postprocess => ErrorCode::ExecPostprocessFailed,
            _ => ErrorCode::ExecInferenceFailed,
        }
    }
}

/// Per-stage wall-clock measurements, when the stage ran.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub preprocess_ms: Option<u64>,
    pub inference_ms: Option<u64>,
    pub postprocess_ms: Option<u64>,
}

/// Result of one sandboxed execution.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Opaque model output, present on success.
    pub output: Option<Map<String, Value>>,
    /// Classified error, present on failure.
    pub error: Option<RuntimeError>,
    /// Stage reached when the outcome was decided.
    pub stage: ExecutionStage,
    /// Total wall-clock time.
    pub duration_ms: u64,
    pub timings: StageTimings,
}

impl ExecutionOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn failure(error: RuntimeError, stage: ExecutionStage, started: Instant, timings: StageTimings) -> Self {
        Self {
            output: None,
            error: Some(error.with_stage(stage.as_str()).with_duration_ms(elapsed_ms(started))),
            stage,
            duration_ms: elapsed_ms(started),
            timings,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    // Round up so sub-millisecond stages still report nonzero time.
    let micros = started.elapsed().as_micros() as u64;
    micros.div_ceil(1000)
}

// ============================================================================
// Health
// ============================================================================

/// Windowed failure-rate policy.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Number of recent executions considered.
    pub window: usize,
    /// Executions required before the rate is judged at all.
    pub min_samples: usize,
    /// Failure rate below this is HEALTHY.
    pub degraded_threshold: f64,
    /// Failure rate above this is UNHEALTHY.
    pub unhealthy_threshold: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            degraded_threshold: 0.10,
            unhealthy_threshold: 0.50,
        }
    }
}

struct HealthInner {
    samples: VecDeque<bool>,
    current: HealthStatus,
}

/// Derives health from recent execution outcomes. UNHEALTHY never
/// promotes; only a fresh sandbox (re-enable) resets it.
pub struct HealthManager {
    policy: HealthPolicy,
    inner: Mutex<HealthInner>,
}

impl HealthManager {
    #[must_use]
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(HealthInner {
                samples: VecDeque::new(),
                current: HealthStatus::Healthy,
            }),
        }
    }

    /// Record one outcome; returns the new health iff it changed.
    pub fn record(&self, success: bool) -> Option<HealthStatus> {
        let mut inner = self.inner.lock();
        if inner.samples.len() == self.policy.window {
            inner.samples.pop_front();
        }
        inner.samples.push_back(success);

        if inner.current == HealthStatus::Unhealthy {
            return None;
        }
        if inner.samples.len() < self.policy.min_samples {
            return None;
        }

        let failures = inner.samples.iter().filter(|s| !**s).count();
        let rate = failures as f64 / inner.samples.len() as f64;
        let next = if rate < self.policy.degraded_threshold {
            HealthStatus::Healthy
        } else if rate <= self.policy.unhealthy_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        if next == inner.current {
            None
        } else {
            inner.current = next;
            Some(next)
        }
    }

    #[must_use]
    pub fn current(&self) -> HealthStatus {
        self.inner.lock().current
    }
}

// ============================================================================
// Sandbox
// ============================================================================

/// Execution boundary for exactly one loaded version.
pub struct ExecutionSandbox {
    descriptor: Arc<VersionDescriptor>,
    key: VersionKey,
    factory: Arc<WorkerFactory>,
    pool_tx: mpsc::Sender<Worker>,
    pool_rx: tokio::sync::Mutex<mpsc::Receiver<Worker>>,
    health: HealthManager,
    registry: Arc<ModelRegistry>,
    closed: AtomicBool,
}

impl ExecutionSandbox {
    /// Wrap a loaded model. Workers go straight into the pool.
    #[must_use]
    pub fn new(loaded: LoadedModel, registry: Arc<ModelRegistry>) -> Arc<Self> {
        let capacity = loaded.workers.len().max(1);
        let (pool_tx, pool_rx) = mpsc::channel(capacity);
        for worker in loaded.workers {
            // Capacity equals the worker count; the sends cannot fail.
            let _ = pool_tx.try_send(worker);
        }
        Arc::new(Self {
            key: loaded.descriptor.key(),
            descriptor: loaded.descriptor,
            factory: loaded.factory,
            pool_tx,
            pool_rx: tokio::sync::Mutex::new(pool_rx),
            health: HealthManager::new(HealthPolicy::default()),
            registry,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<VersionDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.health.current()
    }

    /// Refuse new executions. In-flight stages finish on their own;
    /// workers are dropped as they come back to the closed pool.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Run the full preprocess -> infer -> postprocess contract for one
    /// request. Never panics and never lets a guest error escape
    /// unclassified.
    pub async fn execute(
        &self,
        request_id: &str,
        input: &InferenceInput,
        metadata: Option<&Map<String, Value>>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        if self.closed.load(Ordering::Acquire) {
            return ExecutionOutcome::failure(
                self.exec_error(ErrorCode::ExecModelNotReady, "sandbox is shut down", request_id),
                ExecutionStage::Validation,
                started,
                timings,
            );
        }

        // Step 1: input conformance, before any model code runs.
        if let Err(error) = self.validate_input(input, request_id) {
            return ExecutionOutcome::failure(error, ExecutionStage::Validation, started, timings);
        }

        let mut payload = build_guest_payload(request_id, input, metadata);

        let Some(mut worker) = self.acquire_worker().await else {
            return ExecutionOutcome::failure(
                self.exec_error(
                    ErrorCode::ExecModelNotReady,
                    "no execution worker available",
                    request_id,
                ),
                ExecutionStage::Validation,
                started,
                timings,
            );
        };

        // Steps 2-4: the declared stages, each under its own budget.
        let limits = &self.descriptor.limits;
        let stages: [(ExecutionStage, Option<StageHandle>, u64); 3] = [
            (
                ExecutionStage::Preprocess,
                worker.preprocess.clone(),
                limits.preprocessing_timeout_ms,
            ),
            (
                ExecutionStage::Inference,
                Some(worker.infer.clone()),
                limits.inference_timeout_ms,
            ),
            (
                ExecutionStage::Postprocess,
                worker.postprocess.clone(),
                limits.postprocessing_timeout_ms,
            ),
        ];

        for (stage, handle, timeout_ms) in stages {
            let Some(handle) = handle else { continue };
            let stage_started = Instant::now();
            let (returned, result) = self
                .run_stage(worker, handle, stage, payload, timeout_ms, request_id)
                .await;
            let stage_ms = elapsed_ms(stage_started);
            match stage {
                ExecutionStage::Preprocess => timings.preprocess_ms = Some(stage_ms),
                ExecutionStage::Postprocess => timings.postprocess_ms = Some(stage_ms),
                _ => timings.inference_ms = Some(stage_ms),
            }

            match result {
                Ok(output) => {
                    payload = output;
                    // A stage error may consume the worker (poisoned); a
                    // success always returns it.
                    worker = match returned {
                        Some(worker) => worker,
                        None => {
                            self.record_outcome(false);
                            return ExecutionOutcome::failure(
                                self.exec_error(
                                    ErrorCode::ExecGenericError,
                                    "worker lost after successful stage",
                                    request_id,
                                ),
                                stage,
                                started,
                                timings,
                            );
                        }
                    };
                }
                Err(error) => {
                    if let Some(worker) = returned {
                        self.release_worker(worker);
                    }
                    self.record_outcome(false);
                    return ExecutionOutcome::failure(error, stage, started, timings);
                }
            }
        }

        self.release_worker(worker);

        // Step 5: output schema conformance.
        match self.validate_output(&payload, request_id) {
            Ok(output) => {
                self.record_outcome(true);
                ExecutionOutcome {
                    output: Some(output),
                    error: None,
                    stage: ExecutionStage::Postprocess,
                    duration_ms: elapsed_ms(started),
                    timings,
                }
            }
            Err(error) => {
                self.record_outcome(false);
                ExecutionOutcome::failure(error, ExecutionStage::OutputValidation, started, timings)
            }
        }
    }

    async fn acquire_worker(&self) -> Option<Worker> {
        let mut pool = self.pool_rx.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        // Admission caps in-flight work at the pool size, so a worker is
        // normally available immediately; the wait covers the short
        // replacement window after a poisoned worker. The bound keeps a
        // failed replacement from hanging requests.
        let limits = &self.descriptor.limits;
        let budget = Duration::from_millis(
            limits.preprocessing_timeout_ms
                + limits.inference_timeout_ms
                + limits.postprocessing_timeout_ms,
        ) + STAGE_GRACE;
        match tokio::time::timeout(budget, pool.recv()).await {
            Ok(worker) => worker,
            Err(_) => None,
        }
    }

    fn release_worker(&self, worker: Worker) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.pool_tx.try_send(worker) {
            // Pool full can only mean accounting is broken; log and drop.
            warn!(version = %self.key, error = %e, "failed to return worker to pool");
        }
    }

    /// Run one stage on a blocking thread under fuel, epoch deadline,
    /// and an outer wall-clock backstop.
    async fn run_stage(
        &self,
        worker: Worker,
        handle: StageHandle,
        stage: ExecutionStage,
        payload: Vec<u8>,
        timeout_ms: u64,
        request_id: &str,
    ) -> (Option<Worker>, Result<Vec<u8>, RuntimeError>) {
        let fuel = self.factory.max_fuel();
        let ticks = ticks_for_ms(timeout_ms);

        let task = tokio::task::spawn_blocking(move || {
            let mut worker = worker;
            let result = call_guest(&mut worker.store, &handle, &payload, fuel, ticks);
            (worker, result)
        });

        let budget = Duration::from_millis(timeout_ms) + STAGE_GRACE;
        match tokio::time::timeout(budget, task).await {
            Ok(Ok((worker, Ok(bytes)))) => (Some(worker), Ok(bytes)),
            Ok(Ok((worker, Err(guest_err)))) => match guest_err {
                GuestCallError::Timeout => {
                    // The epoch trap ended the stage; the worker's guest
                    // state is suspect. Replace it.
                    debug!(version = %self.key, stage = stage.as_str(), "stage deadline exceeded");
                    drop(worker);
                    self.respawn_worker();
                    (
                        None,
                        Err(self.exec_error(
                            stage.timeout_code(),
                            format!("{} exceeded {timeout_ms} ms budget", stage.as_str()),
                            request_id,
                        )),
                    )
                }
                GuestCallError::OutOfMemory => {
                    drop(worker);
                    self.respawn_worker();
                    (
                        None,
                        Err(self.exec_error(
                            ErrorCode::ExecOutOfMemory,
                            format!("{} exceeded the memory limit", stage.as_str()),
                            request_id,
                        )),
                    )
                }
                GuestCallError::Trap(message) => (
                    Some(worker),
                    Err(self
                        .exec_error(
                            stage.failure_code(),
                            format!("{} raised an error", stage.as_str()),
                            request_id,
                        )
                        .with_cause(message)),
                ),
            },
            Ok(Err(join_err)) => {
                // The blocking task panicked; the worker is gone.
                error!(version = %self.key, error = %join_err, "stage task panicked");
                self.respawn_worker();
                (
                    None,
                    Err(self.exec_error(
                        ErrorCode::ExecGenericError,
                        format!("{} stage failed internally", stage.as_str()),
                        request_id,
                    )),
                )
            }
            Err(_) => {
                // Epoch trap did not fire in time; abandon the stage.
                // The detached task drops the worker when the trap lands.
                warn!(
                    version = %self.key,
                    stage = stage.as_str(),
                    "stage did not stop at its deadline, abandoning worker"
                );
                self.respawn_worker();
                (
                    None,
                    Err(self.exec_error(
                        stage.timeout_code(),
                        format!("{} exceeded {timeout_ms} ms budget", stage.as_str()),
                        request_id,
                    )),
                )
            }
        }
    }

    /// Build a replacement worker off the hot path.
    fn respawn_worker(&self) {
        let factory = Arc::clone(&self.factory);
        let tx = self.pool_tx.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            let built = tokio::task::spawn_blocking(move || factory.build_worker()).await;
            match built {
                Ok(Ok(worker)) => {
                    if tx.send(worker).await.is_err() {
                        debug!(version = %key, "sandbox closed before replacement worker landed");
                    }
                }
                Ok(Err(e)) => {
                    error!(version = %key, error = %e, "failed to rebuild poisoned worker");
                }
                Err(e) => {
                    error!(version = %key, error = %e, "worker rebuild task failed");
                }
            }
        });
    }

    fn validate_input(&self, input: &InferenceInput, request_id: &str) -> Result<(), RuntimeError> {
        let spec = &self.descriptor.input;
        match (spec.kind, input) {
            (InputKind::Frame, InferenceInput::Frame(frame)) => {
                if frame.reference.is_empty() {
                    return Err(self.invalid_input("frame reference is empty", request_id));
                }
                if frame.width < spec.min_width || frame.height < spec.min_height {
                    return Err(self.invalid_input(
                        format!(
                            "frame {}x{} below declared minimum {}x{}",
                            frame.width, frame.height, spec.min_width, spec.min_height
                        ),
                        request_id,
                    ));
                }
                if let Some(max_width) = spec.max_width {
                    if frame.width > max_width {
                        return Err(self.invalid_input("frame wider than declared maximum", request_id));
                    }
                }
                if let Some(max_height) = spec.max_height {
                    if frame.height > max_height {
                        return Err(self.invalid_input("frame taller than declared maximum", request_id));
                    }
                }
                Ok(())
            }
            (InputKind::Batch, InferenceInput::Batch { references }) => {
                let len = references.len() as u32;
                let min = spec.batch_min_size.unwrap_or(1);
                let max = spec.batch_max_size.unwrap_or(u32::MAX);
                if len < min || len > max {
                    return Err(self.invalid_input(
                        format!("batch size {len} outside [{min}, {max}]"),
                        request_id,
                    ));
                }
                if references.iter().any(String::is_empty) {
                    return Err(self.invalid_input("batch contains empty reference", request_id));
                }
                Ok(())
            }
            (InputKind::Temporal, InferenceInput::Temporal { sequence }) => {
                let len = sequence.len() as u32;
                let min = spec.temporal_min_frames.unwrap_or(1);
                let max = spec.temporal_max_frames.unwrap_or(u32::MAX);
                if len < min || len > max {
                    return Err(self.invalid_input(
                        format!("sequence length {len} outside [{min}, {max}]"),
                        request_id,
                    ));
                }
                Ok(())
            }
            (declared, _) => Err(self.invalid_input(
                format!("input does not match declared kind '{}'", declared.as_str()),
                request_id,
            )),
        }
    }

    fn validate_output(
        &self,
        payload: &[u8],
        request_id: &str,
    ) -> Result<Map<String, Value>, RuntimeError> {
        let spec = &self.descriptor.output;
        let value: Value = serde_json::from_slice(payload).map_err(|e| {
            self.exec_error(ErrorCode::ExecInvalidOutput, "model output is not valid JSON", request_id)
                .with_cause(e)
        })?;
        let Value::Object(output) = value else {
            return Err(self.exec_error(
                ErrorCode::ExecInvalidOutput,
                "model output is not a JSON object",
                request_id,
            ));
        };

        match output.get("event_type").and_then(Value::as_str) {
            Some(event) if spec.event_type_enum.iter().any(|e| e == event) => {}
            Some(event) => {
                return Err(self
                    .exec_error(
                        ErrorCode::ExecInvalidOutput,
                        format!("event_type '{event}' is not in the declared enum"),
                        request_id,
                    )
                    .with_field("event_type")
                    .with_actual(event));
            }
            None => {
                return Err(self
                    .exec_error(
                        ErrorCode::ExecInvalidOutput,
                        "model output is missing event_type",
                        request_id,
                    )
                    .with_field("event_type"));
            }
        }

        if let Some(metadata) = output.get("metadata") {
            let Value::Object(metadata) = metadata else {
                return Err(self.exec_error(
                    ErrorCode::ExecInvalidOutput,
                    "metadata must be a JSON object",
                    request_id,
                ));
            };
            if !spec.provides_metadata && !metadata.is_empty() {
                return Err(self.exec_error(
                    ErrorCode::ExecInvalidOutput,
                    "model emitted metadata but the contract declares none",
                    request_id,
                ));
            }
            for field in metadata.keys() {
                if !spec.metadata_allowed_keys.iter().any(|k| k == field) {
                    return Err(self
                        .exec_error(
                            ErrorCode::ExecInvalidOutput,
                            format!("metadata key '{field}' is not allowed by the contract"),
                            request_id,
                        )
                        .with_field(field.clone()));
                }
            }
        }

        Ok(output)
    }

    fn record_outcome(&self, success: bool) {
        if let Some(health) = self.health.record(success) {
            if let Err(e) = self.registry.update_health(&self.key, health) {
                debug!(version = %self.key, error = %e, "health update after execution failed");
            }
        }
    }

    fn invalid_input(&self, message: impl Into<String>, request_id: &str) -> RuntimeError {
        self.exec_error(ErrorCode::ExecInvalidInput, message, request_id)
    }

    fn exec_error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        request_id: &str,
    ) -> RuntimeError {
        RuntimeError::new(code, message)
            .with_model_id(self.key.model_id.clone())
            .with_version(self.key.version.to_string())
            .with_request_id(request_id)
    }
}

fn build_guest_payload(
    request_id: &str,
    input: &InferenceInput,
    metadata: Option<&Map<String, Value>>,
) -> Vec<u8> {
    let mut root = Map::new();
    root.insert("request_id".to_string(), Value::String(request_id.to_string()));
    match input {
        InferenceInput::Frame(frame) => {
            root.insert("input_type".to_string(), Value::String("frame".to_string()));
            root.insert(
                "frame".to_string(),
                serde_json::json!({
                    "reference": frame.reference,
                    "width": frame.width,
                    "height": frame.height,
                    "format": frame.format,
                }),
            );
        }
        InferenceInput::Batch { references } => {
            root.insert("input_type".to_string(), Value::String("batch".to_string()));
            root.insert(
                "references".to_string(),
                Value::Array(references.iter().cloned().map(Value::String).collect()),
            );
        }
        InferenceInput::Temporal { sequence } => {
            root.insert("input_type".to_string(), Value::String("temporal".to_string()));
            root.insert(
                "sequence".to_string(),
                Value::Array(sequence.iter().cloned().map(Value::String).collect()),
            );
        }
    }
    if let Some(metadata) = metadata {
        root.insert("metadata".to_string(), Value::Object(metadata.clone()));
    }
    serde_json::to_vec(&Value::Object(root)).unwrap_or_else(|_| b"{}".to_vec())
}

// ============================================================================
// Sandbox manager
// ============================================================================

/// Owns the sandbox set. Mutated only through the coordinator so the
/// registry's READY set and this map stay in lockstep.
#[derive(Default)]
pub struct SandboxManager {
    sandboxes: parking_lot::RwLock<std::collections::HashMap<VersionKey, Arc<ExecutionSandbox>>>,
}

impl SandboxManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sandbox. Fails if one already exists for the version.
    pub fn insert(&self, sandbox: Arc<ExecutionSandbox>) -> Result<(), RuntimeError> {
        let key = sandbox.descriptor().key();
        let mut sandboxes = self.sandboxes.write();
        if sandboxes.contains_key(&key) {
            return Err(RuntimeError::new(
                ErrorCode::PipeGenericError,
                format!("sandbox already exists for {key}"),
            ));
        }
        sandboxes.insert(key, sandbox);
        Ok(())
    }

    /// Remove and close a sandbox.
    pub fn remove(&self, key: &VersionKey) -> Option<Arc<ExecutionSandbox>> {
        let sandbox = self.sandboxes.write().remove(key);
        if let Some(sandbox) = &sandbox {
            sandbox.close();
        }
        sandbox
    }

    #[must_use]
    pub fn get(&self, key: &VersionKey) -> Option<Arc<ExecutionSandbox>> {
        self.sandboxes.read().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &VersionKey) -> bool {
        self.sandboxes.read().contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<VersionKey> {
        self.sandboxes.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sandboxes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sandboxes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::loader::{LoaderConfig, ModelLoader};
    use crate::pipeline::FrameInput;
    use crate::test_support::{
        echo_module_wat, stage_module_wat, write_package, ContractOptions,
    };
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        // Keeps the epoch ticker alive for the sandbox's lifetime.
        _loader: ModelLoader,
        registry: Arc<ModelRegistry>,
        sandbox: Arc<ExecutionSandbox>,
    }

    async fn sandbox_for(options: &ContractOptions) -> Fixture {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), options);
        let report =
            ContractValidator::new().validate(tmp.path(), &options.model_id, &options.version);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        let descriptor = Arc::new(report.descriptor.unwrap());

        let loader = ModelLoader::new(LoaderConfig::for_testing()).unwrap();
        let loaded = loader.load(descriptor).await.unwrap();
        let registry = Arc::new(ModelRegistry::new());
        let sandbox = ExecutionSandbox::new(loaded, Arc::clone(&registry));
        Fixture {
            _tmp: tmp,
            _loader: loader,
            registry,
            sandbox,
        }
    }

    fn frame_input() -> InferenceInput {
        InferenceInput::Frame(FrameInput {
            reference: "f1".to_string(),
            width: 640,
            height: 480,
            format: "rgb8".to_string(),
        })
    }

    #[tokio::test]
    async fn test_happy_path_execution() {
        let fixture = sandbox_for(&ContractOptions::frame_detector()).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        assert!(outcome.is_success(), "error: {:?}", outcome.error);
        let output = outcome.output.unwrap();
        assert_eq!(output.get("event_type").unwrap(), "detected");
        assert!(outcome.timings.inference_ms.is_some());
        assert!(outcome.timings.preprocess_ms.is_none());
    }

    #[tokio::test]
    async fn test_trap_is_contained_and_classified() {
        let fixture = sandbox_for(&ContractOptions::failing_detector()).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        assert!(!outcome.is_success());
        let error = outcome.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecInferenceFailed);
        assert_eq!(outcome.stage, ExecutionStage::Inference);
        assert!(!error.retryable);

        // The sandbox keeps serving after a trap.
        let outcome = sandbox.execute("req-2", &frame_input(), None).await;
        assert_eq!(outcome.error.unwrap().code, ErrorCode::ExecInferenceFailed);
    }

    #[tokio::test]
    async fn test_timeout_interrupts_and_is_retryable() {
        let fixture = sandbox_for(&ContractOptions::slow_detector(100)).await;
        let sandbox = &fixture.sandbox;

        let started = Instant::now();
        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let error = outcome.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecInferenceTimeout);
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_second_request_not_blocked_by_first_timeout() {
        let mut options = ContractOptions::slow_detector(100);
        options.max_concurrent = 2;
        let fixture = sandbox_for(&options).await;
        let sandbox = &fixture.sandbox;

        let input1 = frame_input();
        let input2 = frame_input();
        let first = sandbox.execute("req-1", &input1, None);
        let second = sandbox.execute("req-2", &input2, None);
        let started = Instant::now();
        let (a, b) = tokio::join!(first, second);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(a.error.unwrap().code, ErrorCode::ExecInferenceTimeout);
        assert_eq!(b.error.unwrap().code, ErrorCode::ExecInferenceTimeout);
    }

    #[tokio::test]
    async fn test_input_kind_mismatch_rejected_before_model_code() {
        let fixture = sandbox_for(&ContractOptions::frame_detector()).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox
            .execute(
                "req-1",
                &InferenceInput::Batch {
                    references: vec!["f1".to_string()],
                },
                None,
            )
            .await;
        let error = outcome.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecInvalidInput);
        assert_eq!(outcome.stage, ExecutionStage::Validation);
    }

    #[tokio::test]
    async fn test_undersized_frame_rejected() {
        let fixture = sandbox_for(&ContractOptions::frame_detector()).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox
            .execute(
                "req-1",
                &InferenceInput::Frame(FrameInput {
                    reference: "f1".to_string(),
                    width: 64,
                    height: 64,
                    format: "rgb8".to_string(),
                }),
                None,
            )
            .await;
        assert_eq!(outcome.error.unwrap().code, ErrorCode::ExecInvalidInput);
    }

    #[tokio::test]
    async fn test_output_schema_enforced() {
        let mut options = ContractOptions::frame_detector();
        options.inference_wat = stage_module_wat("infer", r#"{"event_type":"intruder"}"#);
        let fixture = sandbox_for(&options).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        let error = outcome.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecInvalidOutput);
        assert_eq!(outcome.stage, ExecutionStage::OutputValidation);
    }

    #[tokio::test]
    async fn test_metadata_keys_enforced() {
        let mut options = ContractOptions::frame_detector();
        options.inference_wat = stage_module_wat(
            "infer",
            r#"{"event_type":"detected","metadata":{"secret":1}}"#,
        );
        let fixture = sandbox_for(&options).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        assert_eq!(outcome.error.unwrap().code, ErrorCode::ExecInvalidOutput);
    }

    #[tokio::test]
    async fn test_preprocess_output_feeds_inference() {
        let mut options = ContractOptions::frame_detector();
        // Echo postprocess proves the inference output flows through.
        options.preprocess_wat = Some(echo_module_wat("preprocess"));
        options.postprocess_wat = Some(echo_module_wat("postprocess"));
        let fixture = sandbox_for(&options).await;
        let sandbox = &fixture.sandbox;

        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        assert!(outcome.is_success(), "error: {:?}", outcome.error);
        assert!(outcome.timings.preprocess_ms.is_some());
        assert!(outcome.timings.postprocess_ms.is_some());
    }

    #[tokio::test]
    async fn test_health_degrades_with_failures() {
        let fixture = sandbox_for(&ContractOptions::failing_detector()).await;
        let sandbox = &fixture.sandbox;
        let descriptor = Arc::clone(sandbox.descriptor());
        fixture.registry.register_version(descriptor).unwrap();

        // Below the minimum sample count the failures are not judged.
        for i in 0..4 {
            let _ = sandbox.execute(&format!("req-{i}"), &frame_input(), None).await;
            assert_eq!(sandbox.health(), HealthStatus::Healthy);
        }
        let _ = sandbox.execute("req-final", &frame_input(), None).await;
        assert_eq!(sandbox.health(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_closed_sandbox_refuses() {
        let fixture = sandbox_for(&ContractOptions::frame_detector()).await;
        let sandbox = &fixture.sandbox;
        sandbox.close();

        let outcome = sandbox.execute("req-1", &frame_input(), None).await;
        assert_eq!(outcome.error.unwrap().code, ErrorCode::ExecModelNotReady);
    }

    #[test]
    fn test_health_window_thresholds() {
        let health = HealthManager::new(HealthPolicy::default());

        // Nothing is judged before the minimum sample count.
        for _ in 0..4 {
            assert_eq!(health.record(false), None);
        }
        // The fifth sample makes the rate judgeable: 100% failure.
        assert_eq!(health.record(false), Some(HealthStatus::Unhealthy));

        // Unhealthy is sticky.
        for _ in 0..40 {
            assert_eq!(health.record(true), None);
        }
        assert_eq!(health.current(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_degraded_band() {
        let health = HealthManager::new(HealthPolicy::default());
        for _ in 0..16 {
            health.record(true);
        }
        // 4 failures in a window of 20 is a 20% rate.
        let mut last = None;
        for _ in 0..4 {
            if let Some(next) = health.record(false) {
                last = Some(next);
            }
        }
        assert_eq!(last, Some(HealthStatus::Degraded));
        assert_eq!(health.current(), HealthStatus::Degraded);
    }
}
