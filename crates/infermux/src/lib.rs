//! infermux - multi-model AI inference runtime.
//!
//! A long-lived process that discovers pluggable model packages on disk,
//! validates their declarative contracts, loads their WebAssembly entry
//! points, and serves inference requests from a backend controller. The
//! runtime treats every model as untrusted code: execution is sandboxed
//! per version with per-stage budgets, failures are isolated and fed to
//! a circuit breaker, and capability/health state is pushed to the
//! backend.
//!
//! # Architecture
//!
//! ```text
//! request -> InferencePipeline -> VersionResolver -> AdmissionController
//!             -> ExecutionSandbox -> (outcome) -> CircuitBreaker
//!             -> response
//!
//! disk -> DiscoveryScanner -> ContractValidator -> ModelRegistry
//!          -> ModelLoader -> Coordinator -> sandbox set
//!
//! registry events -> CapabilityPublisher -> backend controller
//! ```
//!
//! The registry is the only shared mutable structure; everything else is
//! a process-owned service created at startup by [`ModelRuntime`] and
//! passed explicitly to its collaborators.
//!
//! # Example
//!
//! ```rust,ignore
//! use infermux::{ModelRuntime, RuntimeConfig, InferenceRequest};
//!
//! let config = RuntimeConfig::from_env()?;
//! let runtime = Arc::new(ModelRuntime::new(config)?);
//! runtime.start().await?;
//!
//! let response = runtime.submit(request).await;
//! assert_eq!(response.status, ResponseStatus::Success);
//!
//! runtime.shutdown().await;
//! ```

pub mod backend;
pub mod concurrency;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod recovery;
pub mod registry;
pub mod reporting;
pub mod runtime;
pub mod sandbox;
pub mod versioning;

// Test fixtures (synthetic WASM packages); used by the integration
// suite, not part of the runtime surface.
#[doc(hidden)]
pub mod test_support;

// Re-exports for convenience
pub use backend::{BackendClient, HttpBackendClient, NoopBackendClient};
pub use concurrency::{
    AdmissionController, BackpressureLevel, ConcurrencyManager, ConcurrencySlot, RejectionReason,
};
pub use config::{ConfigError, LogFormat, RuntimeConfig};
pub use contract::{ContractValidator, ValidationReport, CONTRACT_FILE_NAME};
pub use coordinator::Coordinator;
pub use descriptor::{
    is_valid_model_id, is_valid_version, HealthStatus, InputKind, LoadState, ModelHealth,
    VersionDescriptor, VersionKey,
};
pub use discovery::{DirectoryWatcher, DiscoveryResult, DiscoveryScanner};
pub use error::{ErrorCategory, ErrorCode, ErrorContext, Result, RuntimeError};
pub use loader::{LoadedModel, LoaderConfig, ModelLoader};
pub use metrics::RuntimeMetrics;
pub use pipeline::{
    FrameInput, InferenceInput, InferencePipeline, InferenceRequest, InferenceResponse,
    RequestValidator, ResponseStatus,
};
pub use recovery::{CircuitBreaker, CircuitState, FailureKind, FailurePolicy, RecoveryManager};
pub use registry::{ModelRegistry, RegistryError, RegistryEvent, RegistryEventKind, VersionSnapshot};
pub use reporting::{
    CapabilityPublisher, FullCapabilityReport, HealthAggregator, ModelCapabilityReport,
    PublisherConfig, RuntimeCapacityReport, VersionCapability,
};
pub use runtime::ModelRuntime;
pub use sandbox::{ExecutionOutcome, ExecutionSandbox, ExecutionStage, SandboxManager, StageTimings};
pub use versioning::{EligibilityConfig, OpenGate, ServabilityGate, VersionResolver};
