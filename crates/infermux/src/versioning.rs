//! Deterministic version resolution.
//!
//! Resolution is pure in the registry snapshot: the same registry
//! contents produce the same answer regardless of load order, thread, or
//! call site. No registry state is mutated and there are no implicit
//! fallbacks (no `latest` alias).
//!
//! SemVer total order comes from the `semver` crate: numeric
//! major.minor.patch, prerelease lower than release, prerelease
//! identifiers compared left-to-right with numeric identifiers below
//! alphanumeric ones.

use std::sync::Arc;

use semver::Version;

use crate::descriptor::{HealthStatus, LoadState, VersionKey};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::registry::{ModelRegistry, VersionSnapshot};

/// Blocks resolution of versions whose circuit is open. Implemented by
/// the circuit breaker; a no-op gate is used when recovery is disabled.
pub trait ServabilityGate: Send + Sync {
    /// Whether the gate currently forbids serving this version.
    fn is_blocked(&self, key: &VersionKey) -> bool;
}

/// Gate that never blocks.
pub struct OpenGate;

impl ServabilityGate for OpenGate {
    fn is_blocked(&self, _key: &VersionKey) -> bool {
        false
    }
}

/// Which versions the resolver may pick.
#[derive(Debug, Clone)]
pub struct EligibilityConfig {
    /// Health values that remain servable.
    pub allowed_health: Vec<HealthStatus>,
    /// Whether prerelease versions participate in implicit resolution.
    pub include_prerelease: bool,
}

impl EligibilityConfig {
    /// Default policy: READY, not prerelease, HEALTHY or DEGRADED.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            allowed_health: vec![HealthStatus::Healthy, HealthStatus::Degraded],
            include_prerelease: false,
        }
    }

    /// Strict policy: HEALTHY only.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            allowed_health: vec![HealthStatus::Healthy],
            include_prerelease: false,
        }
    }

    /// Permissive policy: prereleases allowed, UNKNOWN health tolerated.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allowed_health: vec![
                HealthStatus::Healthy,
                HealthStatus::Degraded,
                HealthStatus::Unknown,
            ],
            include_prerelease: true,
        }
    }

    fn health_allowed(&self, health: HealthStatus) -> bool {
        self.allowed_health.contains(&health)
    }
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Resolves `(model_id, optional version)` to a servable version.
pub struct VersionResolver {
    registry: Arc<ModelRegistry>,
    gate: Arc<dyn ServabilityGate>,
    eligibility: EligibilityConfig,
}

impl VersionResolver {
    pub fn new(registry: Arc<ModelRegistry>, gate: Arc<dyn ServabilityGate>) -> Self {
        Self {
            registry,
            gate,
            eligibility: EligibilityConfig::standard(),
        }
    }

    #[must_use]
    pub fn with_eligibility(mut self, eligibility: EligibilityConfig) -> Self {
        self.eligibility = eligibility;
        self
    }

    /// Resolve a request to a concrete version snapshot.
    ///
    /// With an explicit version the snapshot is returned iff it is READY,
    /// its circuit is not open, and its health is allowed. Without one,
    /// the highest eligible version by SemVer order is returned.
    pub fn resolve(&self, model_id: &str, version: Option<&Version>) -> Result<VersionSnapshot> {
        match version {
            Some(version) => self.resolve_explicit(model_id, version),
            None => self.resolve_implicit(model_id),
        }
    }

    fn resolve_explicit(&self, model_id: &str, version: &Version) -> Result<VersionSnapshot> {
        let key = VersionKey::new(model_id, version.clone());
        let Some(snapshot) = self.registry.get_version(&key) else {
            return if self.registry.has_model(model_id) {
                Err(RuntimeError::new(
                    ErrorCode::PipeVersionNotFound,
                    format!("version {version} not found for model {model_id}"),
                )
                .with_model_id(model_id)
                .with_version(version.to_string()))
            } else {
                Err(RuntimeError::new(
                    ErrorCode::PipeModelNotFound,
                    format!("model {model_id} not found"),
                )
                .with_model_id(model_id))
            };
        };

        match snapshot.state {
            LoadState::Ready => {}
            LoadState::Disabled => {
                return Err(RuntimeError::new(
                    ErrorCode::PipeModelUnhealthy,
                    format!("version {key} is disabled"),
                )
                .with_model_id(model_id)
                .with_version(version.to_string()));
            }
            other => {
                return Err(RuntimeError::new(
                    ErrorCode::PipeVersionNotReady,
                    format!("version {key} is not servable (state {other})"),
                )
                .with_model_id(model_id)
                .with_version(version.to_string()));
            }
        }

        if self.gate.is_blocked(&key) {
            return Err(RuntimeError::new(
                ErrorCode::PipeVersionUnhealthy,
                format!("version {key} is circuit-blocked"),
            )
            .with_model_id(model_id)
            .with_version(version.to_string()));
        }

        if !self.eligibility.health_allowed(snapshot.health) {
            return Err(RuntimeError::new(
                ErrorCode::PipeVersionUnhealthy,
                format!("version {key} health is {}", snapshot.health),
            )
            .with_model_id(model_id)
            .with_version(version.to_string()));
        }

        Ok(snapshot)
    }

    fn resolve_implicit(&self, model_id: &str) -> Result<VersionSnapshot> {
        let versions = self.registry.get_model_versions(model_id);
        if versions.is_empty() {
            return Err(RuntimeError::new(
                ErrorCode::PipeModelNotFound,
                format!("model {model_id} not found"),
            )
            .with_model_id(model_id));
        }

        let best = versions
            .into_iter()
            .filter(|s| self.is_eligible(s))
            .max_by(|a, b| a.descriptor.version.cmp(&b.descriptor.version));

        best.ok_or_else(|| {
            RuntimeError::new(
                ErrorCode::PipeNoEligibleVersion,
                format!("no eligible version for model {model_id}"),
            )
            .with_model_id(model_id)
        })
    }

    fn is_eligible(&self, snapshot: &VersionSnapshot) -> bool {
        if snapshot.state != LoadState::Ready {
            return false;
        }
        if !self.eligibility.include_prerelease && !snapshot.descriptor.version.pre.is_empty() {
            return false;
        }
        if !self.eligibility.health_allowed(snapshot.health) {
            return false;
        }
        !self.gate.is_blocked(&snapshot.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{
        EntryPoints, HardwareSpec, InputFormat, InputKind, InputSpec, ModelCapabilities,
        OutputSpec, PerformanceHints, ResourceLimits, VersionDescriptor,
    };
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn descriptor(model_id: &str, version: &str) -> Arc<VersionDescriptor> {
        Arc::new(VersionDescriptor {
            model_id: model_id.to_string(),
            version: Version::parse(version).unwrap(),
            display_name: model_id.to_string(),
            description: String::new(),
            author: "test".to_string(),
            contract_schema_version: "1.0.0".to_string(),
            directory_path: PathBuf::from("/tmp"),
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
                event_type_enum: vec!["detected".to_string()],
                provides_bounding_boxes: false,
                provides_metadata: false,
                metadata_allowed_keys: vec![],
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

    fn ready(registry: &ModelRegistry, model_id: &str, version: &str, health: HealthStatus) {
        registry.register_version(descriptor(model_id, version)).unwrap();
        let key = VersionKey::new(model_id, Version::parse(version).unwrap());
        registry
            .update_state(&key, LoadState::Validating, None, None)
            .unwrap();
        registry.update_state(&key, LoadState::Valid, None, None).unwrap();
        registry
            .update_state(&key, LoadState::Loading, None, None)
            .unwrap();
        registry.update_state(&key, LoadState::Ready, None, None).unwrap();
        registry.update_health(&key, health).unwrap();
    }

    fn resolver(registry: &Arc<ModelRegistry>) -> VersionResolver {
        VersionResolver::new(Arc::clone(registry), Arc::new(OpenGate))
    }

    #[test]
    fn test_explicit_resolution() {
        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);

        let version = Version::parse("1.0.0").unwrap();
        let snap = resolver(&registry)
            .resolve("sample_det", Some(&version))
            .unwrap();
        assert_eq!(snap.descriptor.version, version);
    }

    #[test]
    fn test_explicit_unknown_model_and_version() {
        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);
        let r = resolver(&registry);

        let err = r
            .resolve("missing", Some(&Version::parse("1.0.0").unwrap()))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeModelNotFound);

        let err = r
            .resolve("sample_det", Some(&Version::parse("9.9.9").unwrap()))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeVersionNotFound);
    }

    #[test]
    fn test_explicit_not_ready_and_unhealthy() {
        let registry = Arc::new(ModelRegistry::new());
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        let r = resolver(&registry);
        let version = Version::parse("1.0.0").unwrap();

        let err = r.resolve("sample_det", Some(&version)).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeVersionNotReady);

        ready(&registry, "sample_det", "1.1.0", HealthStatus::Unhealthy);
        let err = r
            .resolve("sample_det", Some(&Version::parse("1.1.0").unwrap()))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeVersionUnhealthy);
    }

    #[test]
    fn test_implicit_picks_highest_release() {
        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);
        ready(&registry, "sample_det", "1.1.0", HealthStatus::Healthy);
        ready(&registry, "sample_det", "1.1.0-alpha", HealthStatus::Healthy);

        let snap = resolver(&registry).resolve("sample_det", None).unwrap();
        assert_eq!(snap.descriptor.version, Version::parse("1.1.0").unwrap());
    }

    #[test]
    fn test_implicit_skips_unhealthy() {
        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);
        ready(&registry, "sample_det", "1.1.0", HealthStatus::Unhealthy);

        let snap = resolver(&registry).resolve("sample_det", None).unwrap();
        assert_eq!(snap.descriptor.version, Version::parse("1.0.0").unwrap());
    }

    #[test]
    fn test_implicit_no_eligible() {
        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.0.0", HealthStatus::Unhealthy);

        let err = resolver(&registry).resolve("sample_det", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeNoEligibleVersion);
    }

    #[test]
    fn test_prerelease_included_when_permissive() {
        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.1.0-alpha", HealthStatus::Healthy);

        let err = resolver(&registry).resolve("sample_det", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeNoEligibleVersion);

        let permissive = VersionResolver::new(Arc::clone(&registry), Arc::new(OpenGate))
            .with_eligibility(EligibilityConfig::permissive());
        let snap = permissive.resolve("sample_det", None).unwrap();
        assert_eq!(
            snap.descriptor.version,
            Version::parse("1.1.0-alpha").unwrap()
        );
    }

    #[test]
    fn test_gate_blocks_versions() {
        struct BlockAll;
        impl ServabilityGate for BlockAll {
            fn is_blocked(&self, _key: &VersionKey) -> bool {
                true
            }
        }

        let registry = Arc::new(ModelRegistry::new());
        ready(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);

        let gated = VersionResolver::new(Arc::clone(&registry), Arc::new(BlockAll));
        let err = gated.resolve("sample_det", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeNoEligibleVersion);

        let err = gated
            .resolve("sample_det", Some(&Version::parse("1.0.0").unwrap()))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PipeVersionUnhealthy);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let registry = Arc::new(ModelRegistry::new());
        for v in ["2.0.0", "1.0.0", "1.5.0", "2.0.0-rc.1"] {
            ready(&registry, "sample_det", v, HealthStatus::Healthy);
        }
        let r = resolver(&registry);

        let mut seen = HashSet::new();
        for _ in 0..16 {
            let snap = r.resolve("sample_det", None).unwrap();
            seen.insert(snap.descriptor.version.clone());
        }
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&Version::parse("2.0.0").unwrap()));
    }
}
