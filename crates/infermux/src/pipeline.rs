//! Inference pipeline.
//!
//! Public entry point for inference. A request flows through structural
//! validation, version resolution, contract checks, admission, and
//! sandbox dispatch; the outcome is recorded to the circuit breaker and
//! translated into a response. The pipeline interprets no model output
//! semantics and holds no model state of its own.
//!
//! Frame references are opaque handles. The pipeline never decodes
//! video, never fetches frames, and never talks to the upstream
//! analytics service.

use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::concurrency::AdmissionController;
use crate::descriptor::{is_valid_model_id, InputKind, VersionKey};
use crate::error::{ErrorCategory, ErrorCode, RuntimeError};
use crate::metrics::RuntimeMetrics;
use crate::recovery::{FailureKind, RecoveryManager};
use crate::registry::VersionSnapshot;
use crate::sandbox::{SandboxManager, StageTimings};
use crate::versioning::VersionResolver;

/// Maximum advisory priority value. Priority is reserved; scheduling
/// ignores it.
pub const MAX_PRIORITY: u8 = 10;

/// A single frame reference with its declared dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInput {
    pub reference: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Request input matching one of the declared input kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input_type", rename_all = "lowercase")]
pub enum InferenceInput {
    Frame(FrameInput),
    Batch { references: Vec<String> },
    Temporal { sequence: Vec<String> },
}

impl InferenceInput {
    /// Structural kind of this input.
    #[must_use]
    pub fn kind(&self) -> InputKind {
        match self {
            Self::Frame(_) => InputKind::Frame,
            Self::Batch { .. } => InputKind::Batch,
            Self::Temporal { .. } => InputKind::Temporal,
        }
    }
}

/// An inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: String,
    pub model_id: String,
    /// Explicit version; omitted means highest eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    pub input: InferenceInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Advisory, 0-10. Reserved; not used for scheduling.
    #[serde(default)]
    pub priority: u8,
}

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
    Rejected,
}

/// Response returned for every submitted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: String,
    /// Resolved model, when resolution got that far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RuntimeError>,
    pub inference_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<StageTimings>,
}

impl InferenceResponse {
    fn failed(request_id: &str, error: RuntimeError) -> Self {
        Self {
            request_id: request_id.to_string(),
            model_id: None,
            version: None,
            status: ResponseStatus::Failed,
            result: None,
            error: Some(error),
            inference_time_ms: 0,
            timings: None,
        }
    }

    fn rejected(request_id: &str, key: &VersionKey, error: RuntimeError) -> Self {
        Self {
            request_id: request_id.to_string(),
            model_id: Some(key.model_id.clone()),
            version: Some(key.version.clone()),
            status: ResponseStatus::Rejected,
            result: None,
            error: Some(error),
            inference_time_ms: 0,
            timings: None,
        }
    }
}

// ============================================================================
// Request validation
// ============================================================================

/// Structural request validation: identifier shapes and input structure
/// only. Contract-dependent checks run after resolution.
#[derive(Debug, Default)]
pub struct RequestValidator;

impl RequestValidator {
    /// Validate request structure; first failure wins.
    pub fn validate(request: &InferenceRequest) -> Result<(), RuntimeError> {
        if request.request_id.is_empty() {
            return Err(RuntimeError::new(
                ErrorCode::PipeRequestInvalid,
                "request_id must not be empty",
            ));
        }
        if !is_valid_model_id(&request.model_id) {
            return Err(RuntimeError::new(
                ErrorCode::PipeRequestInvalid,
                format!("model_id '{}' is not valid", request.model_id),
            )
            .with_request_id(request.request_id.clone()));
        }
        if request.priority > MAX_PRIORITY {
            return Err(RuntimeError::new(
                ErrorCode::PipeRequestInvalid,
                format!("priority {} exceeds maximum {MAX_PRIORITY}", request.priority),
            )
            .with_request_id(request.request_id.clone()));
        }

        match &request.input {
            InferenceInput::Frame(frame) => {
                if frame.reference.is_empty() || frame.format.is_empty() {
                    return Err(invalid_frame_ref(request, "frame reference or format is empty"));
                }
                if frame.width == 0 || frame.height == 0 {
                    return Err(invalid_frame_ref(request, "frame dimensions must be nonzero"));
                }
            }
            InferenceInput::Batch { references } => {
                if references.is_empty() {
                    return Err(RuntimeError::new(
                        ErrorCode::PipeBatchSizeInvalid,
                        "batch must contain at least one reference",
                    )
                    .with_request_id(request.request_id.clone()));
                }
                if references.iter().any(String::is_empty) {
                    return Err(invalid_frame_ref(request, "batch contains empty reference"));
                }
            }
            InferenceInput::Temporal { sequence } => {
                if sequence.is_empty() {
                    return Err(RuntimeError::new(
                        ErrorCode::PipeTemporalLengthInvalid,
                        "temporal sequence must contain at least one reference",
                    )
                    .with_request_id(request.request_id.clone()));
                }
                if sequence.iter().any(String::is_empty) {
                    return Err(invalid_frame_ref(request, "sequence contains empty reference"));
                }
            }
        }
        Ok(())
    }

    /// Contract-dependent checks once the version is resolved.
    pub fn validate_against_contract(
        request: &InferenceRequest,
        snapshot: &VersionSnapshot,
    ) -> Result<(), RuntimeError> {
        let spec = &snapshot.descriptor.input;
        let declared = spec.kind;
        let actual = request.input.kind();
        if declared != actual {
            return Err(RuntimeError::new(
                ErrorCode::PipeInputTypeMismatch,
                format!(
                    "model declares input kind '{}' but request carries '{}'",
                    declared.as_str(),
                    actual.as_str()
                ),
            )
            .with_model_id(snapshot.descriptor.model_id.clone())
            .with_version(snapshot.descriptor.version.to_string())
            .with_request_id(request.request_id.clone()));
        }

        match &request.input {
            InferenceInput::Batch { references } => {
                let len = references.len() as u32;
                let min = spec.batch_min_size.unwrap_or(1);
                let max = spec.batch_max_size.unwrap_or(u32::MAX);
                if len < min || len > max {
                    return Err(RuntimeError::new(
                        ErrorCode::PipeBatchSizeInvalid,
                        format!("batch size {len} outside declared range [{min}, {max}]"),
                    )
                    .with_request_id(request.request_id.clone()));
                }
            }
            InferenceInput::Temporal { sequence } => {
                let len = sequence.len() as u32;
                let min = spec.temporal_min_frames.unwrap_or(1);
                let max = spec.temporal_max_frames.unwrap_or(u32::MAX);
                if len < min || len > max {
                    return Err(RuntimeError::new(
                        ErrorCode::PipeTemporalLengthInvalid,
                        format!("sequence length {len} outside declared range [{min}, {max}]"),
                    )
                    .with_request_id(request.request_id.clone()));
                }
            }
            InferenceInput::Frame(_) => {}
        }
        Ok(())
    }
}

fn invalid_frame_ref(request: &InferenceRequest, message: &str) -> RuntimeError {
    RuntimeError::new(ErrorCode::PipeInvalidFrameRef, message)
        .with_request_id(request.request_id.clone())
}

// ============================================================================
// Pipeline
// ============================================================================

/// Routes requests from callers to sandboxes.
pub struct InferencePipeline {
    resolver: VersionResolver,
    admission: Arc<AdmissionController>,
    sandboxes: Arc<SandboxManager>,
    recovery: Arc<RecoveryManager>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl InferencePipeline {
    pub fn new(
        resolver: VersionResolver,
        admission: Arc<AdmissionController>,
        sandboxes: Arc<SandboxManager>,
        recovery: Arc<RecoveryManager>,
        metrics: Option<Arc<RuntimeMetrics>>,
    ) -> Self {
        Self {
            resolver,
            admission,
            sandboxes,
            recovery,
            metrics,
        }
    }

    /// Submit one request and translate the outcome into a response.
    ///
    /// The admission slot is released on every exit path: the slot's
    /// drop guard funnels panics and early returns through the same
    /// idempotent release as the explicit call.
    pub async fn submit(&self, request: InferenceRequest) -> InferenceResponse {
        let request_id = request.request_id.clone();

        // Step 1: structural validation.
        if let Err(error) = RequestValidator::validate(&request) {
            debug!(%request_id, error = %error, "request failed structural validation");
            return self.finish_failed(InferenceResponse::failed(&request_id, error));
        }

        // Step 2: version resolution.
        let snapshot = match self
            .resolver
            .resolve(&request.model_id, request.version.as_ref())
        {
            Ok(snapshot) => snapshot,
            Err(error) => {
                debug!(%request_id, error = %error, "version resolution failed");
                return self.finish_failed(InferenceResponse::failed(&request_id, error));
            }
        };
        let key = snapshot.key();

        // Contract-dependent input checks.
        if let Err(error) = RequestValidator::validate_against_contract(&request, &snapshot) {
            return self.finish_failed(InferenceResponse::failed(&request_id, error));
        }

        // Step 3: admission.
        let slot = match self.admission.try_admit(&key, &request_id) {
            Ok(slot) => slot,
            Err(error) => {
                let rejected = error.category() == ErrorCategory::Pipeline
                    && matches!(
                        error.code,
                        ErrorCode::PipeConcurrencyRejected
                            | ErrorCode::PipeConcurrencyGlobalLimit
                            | ErrorCode::PipeConcurrencyModelLimit
                            | ErrorCode::PipeConcurrencyVersionLimit
                            | ErrorCode::PipeConcurrencyBackpressure
                    );
                if rejected {
                    debug!(%request_id, version = %key, code = %error.code, "admission rejected");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_rejection(error.code.as_str());
                    }
                    return InferenceResponse::rejected(&request_id, &key, error);
                }
                return self.finish_failed(InferenceResponse::failed(&request_id, error));
            }
        };

        // Step 4: dispatch. A READY version without a sandbox is an
        // activation-invariant violation, not a normal condition.
        let Some(sandbox) = self.sandboxes.get(&key) else {
            warn!(version = %key, "no sandbox for READY version");
            slot.release();
            let error = RuntimeError::new(
                ErrorCode::PipeNoSandbox,
                format!("no sandbox available for {key}"),
            )
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_request_id(request_id.clone());
            return self.finish_failed(InferenceResponse::failed(&request_id, error));
        };

        let outcome = sandbox
            .execute(&request_id, &request.input, request.metadata.as_ref())
            .await;

        // Step 5: record the outcome to the breaker either way.
        if outcome.is_success() {
            self.recovery.breaker().record_success(&key);
        } else if let Some(error) = &outcome.error {
            if let Some(kind) = FailureKind::from_error_code(error.code) {
                if self.recovery.breaker().record_failure(&key, kind, Some(error.code)) {
                    info!(version = %key, "circuit opened, disabling version");
                    self.recovery
                        .disable_version(&key, "execution failure threshold exceeded");
                }
            }
        }

        // Step 6: release the slot before translation returns.
        slot.release();

        if let Some(metrics) = &self.metrics {
            let status = if outcome.is_success() { "success" } else { "failure" };
            metrics.record_inference(status, outcome.duration_ms);
        }

        InferenceResponse {
            request_id,
            model_id: Some(key.model_id.clone()),
            version: Some(key.version.clone()),
            status: if outcome.is_success() {
                ResponseStatus::Success
            } else {
                ResponseStatus::Failed
            },
            result: outcome.output,
            error: outcome.error,
            inference_time_ms: outcome.duration_ms,
            timings: Some(outcome.timings),
        }
    }

    fn finish_failed(&self, response: InferenceResponse) -> InferenceResponse {
        if let Some(metrics) = &self.metrics {
            metrics.record_inference("failed_before_dispatch", response.inference_time_ms);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_request() -> InferenceRequest {
        InferenceRequest {
            request_id: "req-1".to_string(),
            model_id: "sample_det".to_string(),
            version: None,
            input: InferenceInput::Frame(FrameInput {
                reference: "f1".to_string(),
                width: 640,
                height: 480,
                format: "rgb8".to_string(),
            }),
            metadata: None,
            priority: 0,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(RequestValidator::validate(&frame_request()).is_ok());
    }

    #[test]
    fn test_empty_request_id() {
        let mut request = frame_request();
        request.request_id = String::new();
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeRequestInvalid);
    }

    #[test]
    fn test_bad_model_id() {
        let mut request = frame_request();
        request.model_id = "Not-Valid".to_string();
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeRequestInvalid);
    }

    #[test]
    fn test_priority_out_of_range() {
        let mut request = frame_request();
        request.priority = 11;
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeRequestInvalid);
    }

    #[test]
    fn test_empty_frame_reference() {
        let mut request = frame_request();
        request.input = InferenceInput::Frame(FrameInput {
            reference: String::new(),
            width: 640,
            height: 480,
            format: "rgb8".to_string(),
        });
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeInvalidFrameRef);
    }

    #[test]
    fn test_zero_dimensions() {
        let mut request = frame_request();
        request.input = InferenceInput::Frame(FrameInput {
            reference: "f1".to_string(),
            width: 0,
            height: 480,
            format: "rgb8".to_string(),
        });
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeInvalidFrameRef);
    }

    #[test]
    fn test_empty_batch() {
        let mut request = frame_request();
        request.input = InferenceInput::Batch { references: vec![] };
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeBatchSizeInvalid);
    }

    #[test]
    fn test_empty_temporal_sequence() {
        let mut request = frame_request();
        request.input = InferenceInput::Temporal { sequence: vec![] };
        let err = RequestValidator::validate(&request).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeTemporalLengthInvalid);
    }

    #[test]
    fn test_input_kind_helper() {
        assert_eq!(frame_request().input.kind(), InputKind::Frame);
        assert_eq!(
            InferenceInput::Batch {
                references: vec!["a".to_string()]
            }
            .kind(),
            InputKind::Batch
        );
        assert_eq!(
            InferenceInput::Temporal {
                sequence: vec!["a".to_string()]
            }
            .kind(),
            InputKind::Temporal
        );
    }

    #[test]
    fn test_request_serialization_roundtrip() {
        let request = frame_request();
        let json = serde_json::to_string(&request).unwrap();
        let back: InferenceRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, request.request_id);
        assert_eq!(back.input, request.input);
    }
}
