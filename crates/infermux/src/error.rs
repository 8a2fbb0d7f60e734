//! Error classification for the inference runtime.
//!
//! Every failure in the runtime carries a code from a closed taxonomy,
//! a human-readable message, structured context for logging, and a
//! retryable flag. The taxonomy is what callers branch on: retryable
//! errors may be resubmitted as-is, non-retryable errors require a
//! request fix or operator intervention.
//!
//! Error code format: `CATEGORY_SPECIFIC_ERROR`. Categories:
//! - `DISC`: filesystem discovery
//! - `VAL` / `CONTRACT`: contract validation and parsing
//! - `LOAD`: module loading, weights, warmup
//! - `EXEC`: sandboxed execution
//! - `PIPE`: request routing, resolution, admission

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime result type.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Closed set of error codes used throughout the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // ========================================================================
    // Discovery (DISC_*)
    // ========================================================================
    /// Models root directory not found.
    DiscRootNotFound,
    /// Models root exists but is not a directory.
    DiscRootNotDirectory,
    /// Permission denied while reading the models root.
    DiscPermissionDenied,
    /// Model directory name is not a valid model id.
    DiscInvalidModelId,
    /// Version directory name is not valid SemVer.
    DiscInvalidVersion,
    /// Model directory contains no version directories.
    DiscNoVersions,
    /// Symlink resolves outside the allowed directory.
    DiscForbiddenSymlink,

    // ========================================================================
    // Validation (VAL_*)
    // ========================================================================
    /// Contract file not found in the version directory.
    ValContractNotFound,
    /// Contract file is not valid YAML.
    ValInvalidYaml,
    /// Required contract field is missing.
    ValMissingRequiredField,
    /// Contract field has the wrong type.
    ValInvalidFieldType,
    /// Contract field value is out of the allowed range.
    ValFieldOutOfRange,
    /// `model_id` in the contract does not match the directory name.
    ValModelIdMismatch,
    /// `version` in the contract does not match the directory name.
    ValVersionMismatch,
    /// Required file or directory is missing from the package.
    ValRequiredFileMissing,
    /// Entry point file exists but is not usable.
    ValInvalidEntryPoint,
    /// Contract schema version is not supported.
    ValUnsupportedSchemaVersion,
    /// Declared hardware requirements cannot be satisfied.
    ValHardwareIncompatible,
    /// Declared input kind is not recognized.
    ValInvalidInputType,
    /// Declared output schema is invalid.
    ValInvalidOutputSchema,
    /// Forbidden content found in the package.
    ValForbiddenContent,

    // ========================================================================
    // Contract parsing (CONTRACT_*)
    // ========================================================================
    /// Contract file cannot be parsed as a mapping.
    ContractParseError,
    /// Contract failed schema validation.
    ContractSchemaError,
    /// Conditional contract requirement not met.
    ContractConditionalError,

    // ========================================================================
    // Loading (LOAD_*)
    // ========================================================================
    /// Entry-point module failed to compile or instantiate.
    LoadImportFailed,
    /// `infer` export not found in the inference module.
    LoadInferNotFound,
    /// `preprocess` export not found in the declared preprocess module.
    LoadPreprocessNotFound,
    /// `postprocess` export not found in the declared postprocess module.
    LoadPostprocessNotFound,
    /// Entry-point module is malformed.
    LoadSyntaxError,
    /// Weight loading failed.
    LoadWeightsFailed,
    /// Out of memory while loading.
    LoadOutOfMemory,
    /// Load exceeded its wall-clock budget.
    LoadTimeout,
    /// Warmup iteration failed.
    LoadWarmupFailed,
    /// A declared dependency is missing.
    LoadMissingDependency,
    /// Generic loading error.
    LoadGenericError,

    // ========================================================================
    // Execution (EXEC_*)
    // ========================================================================
    /// Preprocess stage raised an error.
    ExecPreprocessFailed,
    /// Preprocess stage exceeded its budget.
    ExecPreprocessTimeout,
    /// Inference stage raised an error.
    ExecInferenceFailed,
    /// Inference stage exceeded its budget.
    ExecInferenceTimeout,
    /// Postprocess stage raised an error.
    ExecPostprocessFailed,
    /// Postprocess stage exceeded its budget.
    ExecPostprocessTimeout,
    /// Out of memory during execution.
    ExecOutOfMemory,
    /// Input failed contract validation before any model code ran.
    ExecInvalidInput,
    /// Model output violates the declared output schema.
    ExecInvalidOutput,
    /// Execution cancelled before completion.
    ExecCancelled,
    /// Sandbox is not in a servable state.
    ExecModelNotReady,
    /// Generic execution error.
    ExecGenericError,

    // ========================================================================
    // Pipeline (PIPE_*)
    // ========================================================================
    /// Model not present in the registry.
    PipeModelNotFound,
    /// Requested version not present for the model.
    PipeVersionNotFound,
    /// Model exists but no version is servable.
    PipeModelNotReady,
    /// Model-level health forbids serving.
    PipeModelUnhealthy,
    /// Requested version exists but is not READY.
    PipeVersionNotReady,
    /// Requested version health forbids serving.
    PipeVersionUnhealthy,
    /// No version satisfies the eligibility policy.
    PipeNoEligibleVersion,
    /// Version resolution failed.
    PipeVersionResolutionFailed,
    /// Frame reference structure is invalid.
    PipeInvalidFrameRef,
    /// Request input kind does not match the model's declared kind.
    PipeInputTypeMismatch,
    /// Batch size outside the declared range.
    PipeBatchSizeInvalid,
    /// Temporal sequence length outside the declared range.
    PipeTemporalLengthInvalid,
    /// No sandbox exists for a READY version (invariant violation).
    PipeNoSandbox,
    /// Request failed structural validation.
    PipeRequestInvalid,
    /// Rejected by the admission controller (unclassified).
    PipeConcurrencyRejected,
    /// Global concurrency limit reached.
    PipeConcurrencyGlobalLimit,
    /// Per-model concurrency limit reached.
    PipeConcurrencyModelLimit,
    /// Per-version concurrency limit reached.
    PipeConcurrencyVersionLimit,
    /// Hard backpressure active.
    PipeConcurrencyBackpressure,
    /// Generic pipeline error.
    PipeGenericError,
}

impl ErrorCode {
    /// Stable string form of the code, e.g. `EXEC_INFERENCE_TIMEOUT`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiscRootNotFound => "DISC_ROOT_NOT_FOUND",
            Self::DiscRootNotDirectory => "DISC_ROOT_NOT_DIRECTORY",
            Self::DiscPermissionDenied => "DISC_PERMISSION_DENIED",
            Self::DiscInvalidModelId => "DISC_INVALID_MODEL_ID",
            Self::DiscInvalidVersion => "DISC_INVALID_VERSION",
            Self::DiscNoVersions => "DISC_NO_VERSIONS",
            Self::DiscForbiddenSymlink => "DISC_FORBIDDEN_SYMLINK",
            Self::ValContractNotFound => "VAL_CONTRACT_NOT_FOUND",
            Self::ValInvalidYaml => "VAL_INVALID_YAML",
            Self::ValMissingRequiredField => "VAL_MISSING_REQUIRED_FIELD",
            Self::ValInvalidFieldType => "VAL_INVALID_FIELD_TYPE",
            Self::ValFieldOutOfRange => "VAL_FIELD_OUT_OF_RANGE",
            Self::ValModelIdMismatch => "VAL_MODEL_ID_MISMATCH",
            Self::ValVersionMismatch => "VAL_VERSION_MISMATCH",
            Self::ValRequiredFileMissing => "VAL_REQUIRED_FILE_MISSING",
            Self::ValInvalidEntryPoint => "VAL_INVALID_ENTRY_POINT",
            Self::ValUnsupportedSchemaVersion => "VAL_UNSUPPORTED_SCHEMA_VERSION",
            Self::ValHardwareIncompatible => "VAL_HARDWARE_INCOMPATIBLE",
            Self::ValInvalidInputType => "VAL_INVALID_INPUT_TYPE",
            Self::ValInvalidOutputSchema => "VAL_INVALID_OUTPUT_SCHEMA",
            Self::ValForbiddenContent => "VAL_FORBIDDEN_CONTENT",
            Self::ContractParseError => "CONTRACT_PARSE_ERROR",
            Self::ContractSchemaError => "CONTRACT_SCHEMA_ERROR",
            Self::ContractConditionalError => "CONTRACT_CONDITIONAL_ERROR",
            Self::LoadImportFailed => "LOAD_IMPORT_FAILED",
            Self::LoadInferNotFound => "LOAD_INFER_NOT_FOUND",
            Self::LoadPreprocessNotFound => "LOAD_PREPROCESS_NOT_FOUND",
            Self::LoadPostprocessNotFound => "LOAD_POSTPROCESS_NOT_FOUND",
            Self::LoadSyntaxError => "LOAD_SYNTAX_ERROR",
            Self::LoadWeightsFailed => "LOAD_WEIGHTS_FAILED",
            Self::LoadOutOfMemory => "LOAD_OUT_OF_MEMORY",
            Self::LoadTimeout => "LOAD_TIMEOUT",
            Self::LoadWarmupFailed => "LOAD_WARMUP_FAILED",
            Self::LoadMissingDependency => "LOAD_MISSING_DEPENDENCY",
            Self::LoadGenericError => "LOAD_GENERIC_ERROR",
            Self::ExecPreprocessFailed => "EXEC_PREPROCESS_FAILED",
            Self::ExecPreprocessTimeout => "EXEC_PREPROCESS_TIMEOUT",
            Self::ExecInferenceFailed => "EXEC_INFERENCE_FAILED",
            Self::ExecInferenceTimeout => "EXEC_INFERENCE_TIMEOUT",
            Self::ExecPostprocessFailed => "EXEC_POSTPROCESS_FAILED",
            Self::ExecPostprocessTimeout => "EXEC_POSTPROCESS_TIMEOUT",
            Self::ExecOutOfMemory => "EXEC_OUT_OF_MEMORY",
            Self::ExecInvalidInput => "EXEC_INVALID_INPUT",
            Self::ExecInvalidOutput => "EXEC_INVALID_OUTPUT",
            Self::ExecCancelled => "EXEC_CANCELLED",
            Self::ExecModelNotReady => "EXEC_MODEL_NOT_READY",
            Self::ExecGenericError => "EXEC_GENERIC_ERROR",
            Self::PipeModelNotFound => "PIPE_MODEL_NOT_FOUND",
            Self::PipeVersionNotFound => "PIPE_VERSION_NOT_FOUND",
            Self::PipeModelNotReady => "PIPE_MODEL_NOT_READY",
            Self::PipeModelUnhealthy => "PIPE_MODEL_UNHEALTHY",
            Self::PipeVersionNotReady => "PIPE_VERSION_NOT_READY",
            Self::PipeVersionUnhealthy => "PIPE_VERSION_UNHEALTHY",
            Self::PipeNoEligibleVersion => "PIPE_NO_ELIGIBLE_VERSION",
            Self::PipeVersionResolutionFailed => "PIPE_VERSION_RESOLUTION_FAILED",
            Self::PipeInvalidFrameRef => "PIPE_INVALID_FRAME_REF",
            Self::PipeInputTypeMismatch => "PIPE_INPUT_TYPE_MISMATCH",
            Self::PipeBatchSizeInvalid => "PIPE_BATCH_SIZE_INVALID",
            Self::PipeTemporalLengthInvalid => "PIPE_TEMPORAL_LENGTH_INVALID",
            Self::PipeNoSandbox => "PIPE_NO_SANDBOX",
            Self::PipeRequestInvalid => "PIPE_REQUEST_INVALID",
            Self::PipeConcurrencyRejected => "PIPE_CONCURRENCY_REJECTED",
            Self::PipeConcurrencyGlobalLimit => "PIPE_CONCURRENCY_GLOBAL_LIMIT",
            Self::PipeConcurrencyModelLimit => "PIPE_CONCURRENCY_MODEL_LIMIT",
            Self::PipeConcurrencyVersionLimit => "PIPE_CONCURRENCY_VERSION_LIMIT",
            Self::PipeConcurrencyBackpressure => "PIPE_CONCURRENCY_BACKPRESSURE",
            Self::PipeGenericError => "PIPE_GENERIC_ERROR",
        }
    }

    /// Error category derived from the code prefix.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self.as_str().split('_').next() {
            Some("DISC") => ErrorCategory::Discovery,
            Some("VAL") => ErrorCategory::Validation,
            Some("CONTRACT") => ErrorCategory::Contract,
            Some("LOAD") => ErrorCategory::Load,
            Some("EXEC") => ErrorCategory::Execution,
            _ => ErrorCategory::Pipeline,
        }
    }

    /// Whether a failure with this code is potentially recoverable by
    /// retrying the same operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DiscPermissionDenied
                | Self::LoadOutOfMemory
                | Self::LoadTimeout
                | Self::LoadWarmupFailed
                // Execution timeouts are transient resource contention.
                | Self::ExecPreprocessTimeout
                | Self::ExecInferenceTimeout
                | Self::ExecPostprocessTimeout
                | Self::ExecOutOfMemory
                // Concurrency rejections clear as in-flight work drains.
                | Self::PipeConcurrencyRejected
                | Self::PipeConcurrencyGlobalLimit
                | Self::PipeConcurrencyModelLimit
                | Self::PipeConcurrencyVersionLimit
                | Self::PipeConcurrencyBackpressure
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Discovery,
    Validation,
    Contract,
    Load,
    Execution,
    Pipeline,
}

/// Structured context attached to errors for logging and debugging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// Pipeline stage the error occurred in (preprocess, inference, postprocess).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// A classified runtime error.
///
/// The retryable flag is derived from the code at construction time and
/// carried explicitly so responses can surface it without re-deriving.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl RuntimeError {
    /// Create an error with retryability derived from the code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            retryable: code.is_retryable(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.context.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.context.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.context.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.context.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.context.expected = Some(expected.into());
        self
    }

    #[must_use]
    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.context.actual = Some(actual.into());
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.context.stage = Some(stage.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.context.duration_ms = Some(duration_ms);
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.context.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Error category derived from the code.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// One-line rendering including context, for log messages that are
    /// not structured.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("[{}] {}", self.code, self.message)];
        if let Some(model_id) = &self.context.model_id {
            parts.push(format!("model={model_id}"));
        }
        if let Some(version) = &self.context.version {
            parts.push(format!("version={version}"));
        }
        if let Some(path) = &self.context.path {
            parts.push(format!("path={}", path.display()));
        }
        if let Some(stage) = &self.context.stage {
            parts.push(format!("stage={stage}"));
        }
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_string_roundtrip() {
        assert_eq!(
            ErrorCode::ExecInferenceTimeout.as_str(),
            "EXEC_INFERENCE_TIMEOUT"
        );
        assert_eq!(
            ErrorCode::PipeConcurrencyModelLimit.as_str(),
            "PIPE_CONCURRENCY_MODEL_LIMIT"
        );
    }

    #[test]
    fn test_category_from_prefix() {
        assert_eq!(
            ErrorCode::DiscRootNotFound.category(),
            ErrorCategory::Discovery
        );
        assert_eq!(
            ErrorCode::ContractParseError.category(),
            ErrorCategory::Contract
        );
        assert_eq!(
            ErrorCode::ValModelIdMismatch.category(),
            ErrorCategory::Validation
        );
        assert_eq!(ErrorCode::LoadTimeout.category(), ErrorCategory::Load);
        assert_eq!(
            ErrorCode::ExecInvalidOutput.category(),
            ErrorCategory::Execution
        );
        assert_eq!(
            ErrorCode::PipeNoSandbox.category(),
            ErrorCategory::Pipeline
        );
    }

    #[test]
    fn test_retryable_set() {
        assert!(ErrorCode::ExecInferenceTimeout.is_retryable());
        assert!(ErrorCode::ExecOutOfMemory.is_retryable());
        assert!(ErrorCode::PipeConcurrencyGlobalLimit.is_retryable());
        assert!(ErrorCode::LoadWarmupFailed.is_retryable());
        assert!(!ErrorCode::ValModelIdMismatch.is_retryable());
        assert!(!ErrorCode::ExecInferenceFailed.is_retryable());
        assert!(!ErrorCode::PipeRequestInvalid.is_retryable());
    }

    #[test]
    fn test_error_display_and_context() {
        let err = RuntimeError::new(ErrorCode::ValVersionMismatch, "version mismatch")
            .with_model_id("sample_det")
            .with_version("1.0.0")
            .with_expected("1.0.0")
            .with_actual("1.0.1");
        assert_eq!(err.to_string(), "[VAL_VERSION_MISMATCH] version mismatch");
        assert!(err.describe().contains("model=sample_det"));
        assert!(!err.retryable);
    }

    #[test]
    fn test_retryable_flag_follows_code() {
        let err = RuntimeError::new(ErrorCode::ExecInferenceTimeout, "deadline exceeded");
        assert!(err.retryable);
    }

    #[test]
    fn test_serialization_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ExecInvalidInput).unwrap();
        assert_eq!(json, "\"EXEC_INVALID_INPUT\"");
    }
}
