//! Core data model: identifiers, descriptors, states, and health.
//!
//! A model version is identified by a `(model_id, version)` pair. The
//! descriptor built from its on-disk contract is immutable after
//! validation; load state and health are the mutable parts and live in
//! the registry.

use std::fmt;
use std::path::PathBuf;

use semver::Version;
use serde::{Deserialize, Serialize};

/// Maximum model id length (directory name and contract field).
pub const MODEL_ID_MAX_LEN: usize = 64;

/// Minimum model id length.
pub const MODEL_ID_MIN_LEN: usize = 3;

/// Check a model id against the naming rule: lowercase, starts with a
/// letter, 3-64 chars, `[a-z][a-z0-9_]*`.
#[must_use]
pub fn is_valid_model_id(model_id: &str) -> bool {
    if model_id.len() < MODEL_ID_MIN_LEN || model_id.len() > MODEL_ID_MAX_LEN {
        return false;
    }
    let mut chars = model_id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Check a version string parses as SemVer `X.Y.Z[-prerelease]`.
///
/// Build metadata (`+build`) is rejected: the directory standard only
/// allows release and prerelease forms.
#[must_use]
pub fn is_valid_version(version: &str) -> bool {
    match Version::parse(version) {
        Ok(v) => v.build.is_empty(),
        Err(_) => false,
    }
}

/// Key identifying one deployable model artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub model_id: String,
    pub version: Version,
}

impl VersionKey {
    pub fn new(model_id: impl Into<String>, version: Version) -> Self {
        Self {
            model_id: model_id.into(),
            version,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_id, self.version)
    }
}

// ============================================================================
// Load State
// ============================================================================

/// Lifecycle state of a model version. Only `Ready` is servable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadState {
    Discovered,
    Validating,
    Valid,
    Invalid,
    Loading,
    Ready,
    Failed,
    Unloading,
    Disabled,
}

impl LoadState {
    /// Whether the state machine allows `self -> next`.
    ///
    /// `Failed`, `Invalid`, and `Disabled` are terminal-but-reversible:
    /// re-validation or re-enable moves out of them. `Disabled -> Ready`
    /// is reserved for the coordinator's re-activation path.
    #[must_use]
    pub fn can_transition_to(&self, next: LoadState) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (Discovered, Validating)
                | (Validating, Valid)
                | (Validating, Invalid)
                | (Valid, Loading)
                | (Loading, Ready)
                | (Loading, Failed)
                | (Ready, Unloading)
                | (Ready, Disabled)
                | (Ready, Failed)
                | (Failed, Validating)
                | (Invalid, Validating)
                | (Disabled, Ready)
        )
    }

    /// Whether inference may be routed to a version in this state.
    #[must_use]
    pub fn is_servable(&self) -> bool {
        matches!(self, LoadState::Ready)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadState::Discovered => "DISCOVERED",
            LoadState::Validating => "VALIDATING",
            LoadState::Valid => "VALID",
            LoadState::Invalid => "INVALID",
            LoadState::Loading => "LOADING",
            LoadState::Ready => "READY",
            LoadState::Failed => "FAILED",
            LoadState::Unloading => "UNLOADING",
            LoadState::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Health
// ============================================================================

/// Per-version health, orthogonal to load state.
///
/// Health never promotes out of `Unhealthy` except through an explicit
/// re-enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether a version with this health may serve under the default
    /// eligibility policy.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Model-level health, derived from version-level health. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelHealth {
    Healthy,
    Degraded,
    /// No servable version; the model is not advertised.
    Unavailable,
}

impl ModelHealth {
    /// Derivation rule over `(state, health)` pairs of a model's versions:
    /// any READY+HEALTHY version wins, then READY+DEGRADED, else the
    /// model is unavailable.
    #[must_use]
    pub fn derive<'a, I>(versions: I) -> Self
    where
        I: IntoIterator<Item = (&'a LoadState, &'a HealthStatus)>,
    {
        let mut any_degraded = false;
        for (state, health) in versions {
            if !state.is_servable() {
                continue;
            }
            match health {
                HealthStatus::Healthy => return ModelHealth::Healthy,
                HealthStatus::Degraded => any_degraded = true,
                _ => {}
            }
        }
        if any_degraded {
            ModelHealth::Degraded
        } else {
            ModelHealth::Unavailable
        }
    }
}

// ============================================================================
// Input / Output specifications
// ============================================================================

/// Declared input kind of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Frame,
    Batch,
    Temporal,
}

impl InputKind {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "frame" => Some(Self::Frame),
            "batch" => Some(Self::Batch),
            "temporal" => Some(Self::Temporal),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frame => "frame",
            Self::Batch => "batch",
            Self::Temporal => "temporal",
        }
    }
}

/// Declared wire format of frame references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Jpeg,
    Png,
    Rgb8,
    Bgr8,
    Nv12,
}

impl InputFormat {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "rgb8" => Some(Self::Rgb8),
            "bgr8" => Some(Self::Bgr8),
            "nv12" => Some(Self::Nv12),
            _ => None,
        }
    }
}

/// Input shape constraints declared by the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub kind: InputKind,
    pub format: InputFormat,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub channels: u32,
    pub batch_min_size: Option<u32>,
    pub batch_max_size: Option<u32>,
    pub batch_recommended_size: Option<u32>,
    pub temporal_min_frames: Option<u32>,
    pub temporal_max_frames: Option<u32>,
    pub temporal_recommended_frames: Option<u32>,
    pub temporal_fps_requirement: Option<f64>,
}

/// Output schema declared by the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub schema_version: String,
    /// Allowed values of the `event_type` output field.
    pub event_type_enum: Vec<String>,
    pub provides_bounding_boxes: bool,
    pub provides_metadata: bool,
    /// Keys the model may emit under `metadata`. Empty means none.
    pub metadata_allowed_keys: Vec<String>,
}

/// Hardware compatibility flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub supports_cpu: bool,
    pub supports_gpu: bool,
    pub supports_jetson: bool,
    pub min_gpu_memory_mb: Option<u64>,
    pub min_cpu_cores: Option<u32>,
    pub min_ram_mb: Option<u64>,
}

/// Performance hints. Advisory only; never enforced by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceHints {
    pub inference_time_hint_ms: u64,
    pub recommended_fps: u32,
    pub max_fps: Option<u32>,
    pub recommended_batch_size: u32,
    pub warmup_iterations: u32,
}

/// Resource limits for loading and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub inference_timeout_ms: u64,
    pub preprocessing_timeout_ms: u64,
    pub postprocessing_timeout_ms: u64,
    pub max_concurrent_inferences: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: None,
            inference_timeout_ms: 5000,
            preprocessing_timeout_ms: 1000,
            postprocessing_timeout_ms: 1000,
            max_concurrent_inferences: 1,
        }
    }
}

/// Capability flags. Opaque to the runtime; forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports_batching: bool,
    pub supports_async: bool,
    pub provides_tracking: bool,
    pub confidence_calibrated: bool,
    pub provides_bounding_boxes: bool,
    pub provides_keypoints: bool,
}

/// Entry-point file names inside the version directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPoints {
    pub inference: String,
    pub preprocess: Option<String>,
    pub postprocess: Option<String>,
    pub loader: Option<String>,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            inference: "inference.wasm".to_string(),
            preprocess: None,
            postprocess: None,
            loader: None,
        }
    }
}

// ============================================================================
// Version descriptor
// ============================================================================

/// Immutable metadata for one model version, built by the contract
/// validator. Everything the runtime needs to load and execute the
/// version is here; nothing is inferred at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub model_id: String,
    pub version: Version,
    pub display_name: String,
    pub description: String,
    pub author: String,
    pub contract_schema_version: String,
    pub directory_path: PathBuf,
    pub input: InputSpec,
    pub output: OutputSpec,
    pub hardware: HardwareSpec,
    pub performance: PerformanceHints,
    pub limits: ResourceLimits,
    pub capabilities: ModelCapabilities,
    pub entry_points: EntryPoints,
}

impl VersionDescriptor {
    /// Key identifying this version.
    #[must_use]
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.model_id.clone(), self.version.clone())
    }
}
