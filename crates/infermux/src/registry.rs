//! In-memory model registry.
//!
//! The registry is the central coordination point for model lifecycle
//! state. It is the only cross-component shared mutable structure in the
//! runtime; every mutation goes through its locked API (many concurrent
//! readers, exclusive writers).
//!
//! State transitions are validated against the lifecycle state machine;
//! disallowed edges fail rather than being silently adopted. Every
//! mutation that changes observable state emits a [`RegistryEvent`] to
//! subscribers, synchronously in the mutating thread after the lock is
//! released. Per-version event ordering relies on the single-writer-per-
//! version discipline of the lifecycle components (scanner, coordinator,
//! sandbox health). Subscriber callbacks must be non-blocking and must
//! not re-enter the registry's write path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use semver::Version;
use thiserror::Error;
use tracing::debug;

use crate::descriptor::{HealthStatus, LoadState, VersionDescriptor, VersionKey};
use crate::error::ErrorCode;

/// Errors from registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A descriptor for this version is already registered.
    #[error("version {0} is already registered")]
    AlreadyRegistered(VersionKey),

    /// The version is not present in the registry.
    #[error("version {0} is not registered")]
    UnknownVersion(VersionKey),

    /// The requested state transition is not an allowed edge.
    #[error("invalid transition {from} -> {to} for {key}")]
    InvalidTransition {
        key: VersionKey,
        from: LoadState,
        to: LoadState,
    },
}

/// What changed in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    VersionRegistered,
    StateChanged,
    HealthChanged,
    VersionRemoved,
}

/// A registry change notification.
///
/// Events for a single version are totally ordered; no cross-version
/// ordering is guaranteed.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub key: VersionKey,
    pub state: LoadState,
    pub previous_state: Option<LoadState>,
    pub health: HealthStatus,
    pub previous_health: Option<HealthStatus>,
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot-consistent view of one registered version.
#[derive(Debug, Clone)]
pub struct VersionSnapshot {
    pub descriptor: Arc<VersionDescriptor>,
    pub state: LoadState,
    pub health: HealthStatus,
    pub error_code: Option<ErrorCode>,
    pub state_message: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionSnapshot {
    #[must_use]
    pub fn key(&self) -> VersionKey {
        self.descriptor.key()
    }
}

struct VersionEntry {
    descriptor: Arc<VersionDescriptor>,
    state: LoadState,
    health: HealthStatus,
    error_code: Option<ErrorCode>,
    state_message: Option<String>,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl VersionEntry {
    fn snapshot(&self) -> VersionSnapshot {
        VersionSnapshot {
            descriptor: Arc::clone(&self.descriptor),
            state: self.state,
            health: self.health,
            error_code: self.error_code,
            state_message: self.state_message.clone(),
            registered_at: self.registered_at,
            updated_at: self.updated_at,
        }
    }
}

type Subscriber = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Thread-safe store of model version descriptors with state and health.
#[derive(Default)]
pub struct ModelRegistry {
    versions: RwLock<HashMap<VersionKey, VersionEntry>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly discovered version in `Discovered` state with
    /// `Unknown` health. Fails if the version is already present.
    pub fn register_version(
        &self,
        descriptor: Arc<VersionDescriptor>,
    ) -> Result<(), RegistryError> {
        let key = descriptor.key();
        let mut versions = self.versions.write();
        if versions.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        let now = Utc::now();
        versions.insert(
            key.clone(),
            VersionEntry {
                descriptor,
                state: LoadState::Discovered,
                health: HealthStatus::Unknown,
                error_code: None,
                state_message: None,
                registered_at: now,
                updated_at: now,
            },
        );
        let event = RegistryEvent {
            kind: RegistryEventKind::VersionRegistered,
            key: key.clone(),
            state: LoadState::Discovered,
            previous_state: None,
            health: HealthStatus::Unknown,
            previous_health: None,
            error_code: None,
            timestamp: now,
        };
        drop(versions);
        debug!(version = %key, "registered model version");
        self.emit(&event);
        Ok(())
    }

    /// Transition a version to `new_state` along an allowed edge.
    pub fn update_state(
        &self,
        key: &VersionKey,
        new_state: LoadState,
        error_code: Option<ErrorCode>,
        message: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut versions = self.versions.write();
        let entry = versions
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownVersion(key.clone()))?;
        let previous = entry.state;
        if !previous.can_transition_to(new_state) {
            return Err(RegistryError::InvalidTransition {
                key: key.clone(),
                from: previous,
                to: new_state,
            });
        }
        let now = Utc::now();
        entry.state = new_state;
        entry.error_code = error_code;
        entry.state_message = message.map(str::to_string);
        entry.updated_at = now;
        let event = RegistryEvent {
            kind: RegistryEventKind::StateChanged,
            key: key.clone(),
            state: new_state,
            previous_state: Some(previous),
            health: entry.health,
            previous_health: None,
            error_code,
            timestamp: now,
        };
        drop(versions);
        debug!(version = %key, from = %previous, to = %new_state, "state transition");
        self.emit(&event);
        Ok(())
    }

    /// Overwrite a version's health. Emits an event only when the value
    /// actually changed.
    pub fn update_health(
        &self,
        key: &VersionKey,
        health: HealthStatus,
    ) -> Result<(), RegistryError> {
        let mut versions = self.versions.write();
        let entry = versions
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownVersion(key.clone()))?;
        let previous = entry.health;
        if previous == health {
            return Ok(());
        }
        let now = Utc::now();
        entry.health = health;
        entry.updated_at = now;
        let event = RegistryEvent {
            kind: RegistryEventKind::HealthChanged,
            key: key.clone(),
            state: entry.state,
            previous_state: None,
            health,
            previous_health: Some(previous),
            error_code: None,
            timestamp: now,
        };
        drop(versions);
        debug!(version = %key, from = %previous, to = %health, "health changed");
        self.emit(&event);
        Ok(())
    }

    /// Swap in a freshly validated descriptor. Only legal while the
    /// version is re-validating; descriptors are immutable otherwise.
    pub fn replace_descriptor(
        &self,
        key: &VersionKey,
        descriptor: Arc<VersionDescriptor>,
    ) -> Result<(), RegistryError> {
        let mut versions = self.versions.write();
        let entry = versions
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownVersion(key.clone()))?;
        if entry.state != LoadState::Validating {
            return Err(RegistryError::InvalidTransition {
                key: key.clone(),
                from: entry.state,
                to: LoadState::Validating,
            });
        }
        entry.descriptor = descriptor;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Remove a version after unloading. The version must be in
    /// `Unloading` state.
    pub fn remove_version(&self, key: &VersionKey) -> Result<(), RegistryError> {
        let mut versions = self.versions.write();
        let entry = versions
            .get(key)
            .ok_or_else(|| RegistryError::UnknownVersion(key.clone()))?;
        if entry.state != LoadState::Unloading {
            return Err(RegistryError::InvalidTransition {
                key: key.clone(),
                from: entry.state,
                to: LoadState::Unloading,
            });
        }
        let health = entry.health;
        versions.remove(key);
        let event = RegistryEvent {
            kind: RegistryEventKind::VersionRemoved,
            key: key.clone(),
            state: LoadState::Unloading,
            previous_state: Some(LoadState::Unloading),
            health,
            previous_health: None,
            error_code: None,
            timestamp: Utc::now(),
        };
        drop(versions);
        self.emit(&event);
        Ok(())
    }

    /// Snapshot of a single version.
    #[must_use]
    pub fn get_version(&self, key: &VersionKey) -> Option<VersionSnapshot> {
        self.versions.read().get(key).map(VersionEntry::snapshot)
    }

    /// Convenience lookup by id and version.
    #[must_use]
    pub fn get(&self, model_id: &str, version: &Version) -> Option<VersionSnapshot> {
        self.get_version(&VersionKey::new(model_id, version.clone()))
    }

    /// All versions currently in `state`.
    #[must_use]
    pub fn get_versions_by_state(&self, state: LoadState) -> Vec<VersionSnapshot> {
        self.versions
            .read()
            .values()
            .filter(|e| e.state == state)
            .map(VersionEntry::snapshot)
            .collect()
    }

    /// All versions of one model.
    #[must_use]
    pub fn get_model_versions(&self, model_id: &str) -> Vec<VersionSnapshot> {
        self.versions
            .read()
            .values()
            .filter(|e| e.descriptor.model_id == model_id)
            .map(VersionEntry::snapshot)
            .collect()
    }

    /// Whether any version of this model is registered.
    #[must_use]
    pub fn has_model(&self, model_id: &str) -> bool {
        self.versions
            .read()
            .values()
            .any(|e| e.descriptor.model_id == model_id)
    }

    /// Distinct model ids, unordered.
    #[must_use]
    pub fn model_ids(&self) -> Vec<String> {
        let versions = self.versions.read();
        let mut ids: Vec<String> = versions
            .values()
            .map(|e| e.descriptor.model_id.clone())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Snapshot of every registered version.
    #[must_use]
    pub fn snapshot(&self) -> Vec<VersionSnapshot> {
        self.versions
            .read()
            .values()
            .map(VersionEntry::snapshot)
            .collect()
    }

    /// Number of registered versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }

    /// Register a callback invoked for every subsequent event. Callbacks
    /// run synchronously in the mutating thread and must be non-blocking.
    pub fn subscribe(&self, callback: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.subscribers.write().push(Arc::new(callback));
    }

    fn emit(&self, event: &RegistryEvent) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::descriptor::{
        EntryPoints, HardwareSpec, InputFormat, InputKind, InputSpec, ModelCapabilities,
        OutputSpec, PerformanceHints, ResourceLimits,
    };

    fn descriptor(model_id: &str, version: &str) -> Arc<VersionDescriptor> {
        Arc::new(VersionDescriptor {
            model_id: model_id.to_string(),
            version: Version::parse(version).unwrap(),
            display_name: model_id.to_string(),
            description: String::new(),
            author: "test".to_string(),
            contract_schema_version: "1.0.0".to_string(),
            directory_path: std::path::PathBuf::from("/tmp"),
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

    fn key(model_id: &str, version: &str) -> VersionKey {
        VersionKey::new(model_id, Version::parse(version).unwrap())
    }

    #[test]
    fn test_register_and_get() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();

        let snap = registry.get_version(&key("sample_det", "1.0.0")).unwrap();
        assert_eq!(snap.state, LoadState::Discovered);
        assert_eq!(snap.health, HealthStatus::Unknown);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        let err = registry
            .register_version(descriptor("sample_det", "1.0.0"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_state_transitions_enforced() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        let k = key("sample_det", "1.0.0");

        // Discovered -> Ready is not an edge.
        let err = registry
            .update_state(&k, LoadState::Ready, None, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        registry
            .update_state(&k, LoadState::Validating, None, None)
            .unwrap();
        registry.update_state(&k, LoadState::Valid, None, None).unwrap();
        registry
            .update_state(&k, LoadState::Loading, None, None)
            .unwrap();
        registry.update_state(&k, LoadState::Ready, None, None).unwrap();
        assert_eq!(
            registry.get_version(&k).unwrap().state,
            LoadState::Ready
        );
    }

    #[test]
    fn test_health_event_only_on_change() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        let k = key("sample_det", "1.0.0");

        let events: Arc<Mutex<Vec<RegistryEvent>>> = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&events);
        registry.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        registry.update_health(&k, HealthStatus::Healthy).unwrap();
        registry.update_health(&k, HealthStatus::Healthy).unwrap();
        registry.update_health(&k, HealthStatus::Degraded).unwrap();

        let events = events.lock().unwrap();
        let health_events: Vec<_> = events
            .iter()
            .filter(|e| e.kind == RegistryEventKind::HealthChanged)
            .collect();
        assert_eq!(health_events.len(), 2);
        assert_eq!(health_events[0].health, HealthStatus::Healthy);
        assert_eq!(health_events[1].health, HealthStatus::Degraded);
        assert_eq!(health_events[1].previous_health, Some(HealthStatus::Healthy));
    }

    #[test]
    fn test_events_ordered_per_version() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        let k = key("sample_det", "1.0.0");

        let events: Arc<Mutex<Vec<LoadState>>> = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&events);
        registry.subscribe(move |e| {
            if e.kind == RegistryEventKind::StateChanged {
                sink.lock().unwrap().push(e.state);
            }
        });

        registry
            .update_state(&k, LoadState::Validating, None, None)
            .unwrap();
        registry.update_state(&k, LoadState::Valid, None, None).unwrap();
        registry
            .update_state(&k, LoadState::Loading, None, None)
            .unwrap();
        registry.update_state(&k, LoadState::Ready, None, None).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                LoadState::Validating,
                LoadState::Valid,
                LoadState::Loading,
                LoadState::Ready
            ]
        );
    }

    #[test]
    fn test_queries() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        registry.register_version(descriptor("sample_det", "1.1.0")).unwrap();
        registry.register_version(descriptor("other_model", "0.1.0")).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get_model_versions("sample_det").len(), 2);
        assert_eq!(
            registry.get_versions_by_state(LoadState::Discovered).len(),
            3
        );
        assert_eq!(registry.model_ids(), vec!["other_model", "sample_det"]);
        assert!(registry.has_model("other_model"));
        assert!(!registry.has_model("missing"));
    }

    #[test]
    fn test_remove_requires_unloading() {
        let registry = ModelRegistry::new();
        registry.register_version(descriptor("sample_det", "1.0.0")).unwrap();
        let k = key("sample_det", "1.0.0");

        assert!(registry.remove_version(&k).is_err());

        registry
            .update_state(&k, LoadState::Validating, None, None)
            .unwrap();
        registry.update_state(&k, LoadState::Valid, None, None).unwrap();
        registry
            .update_state(&k, LoadState::Loading, None, None)
            .unwrap();
        registry.update_state(&k, LoadState::Ready, None, None).unwrap();
        registry
            .update_state(&k, LoadState::Unloading, None, None)
            .unwrap();
        registry.remove_version(&k).unwrap();
        assert!(registry.get_version(&k).is_none());
    }
}
