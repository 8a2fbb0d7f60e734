//! Package discovery.
//!
//! Walks `<models_root>/<model_id>/<version>/` two levels deep, hands
//! each candidate to the contract validator, and registers the result.
//! The scanner is deliberately conservative: malformed directory names
//! are skipped with a warning, one broken package never stops discovery
//! of the others, and rescans are idempotent (already-registered
//! versions are left alone).
//!
//! [`DirectoryWatcher`] restores hot discovery: filesystem events under
//! the models root are debounced into rescan triggers so packages
//! dropped in at runtime are picked up without a restart.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::contract::ContractValidator;
use crate::descriptor::{
    is_valid_model_id, is_valid_version, EntryPoints, HardwareSpec, InputFormat, InputKind,
    InputSpec, LoadState, ModelCapabilities, OutputSpec, PerformanceHints, ResourceLimits,
    VersionDescriptor, VersionKey,
};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::registry::ModelRegistry;

/// Outcome of one scan pass.
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Versions newly registered by this pass.
    pub registered: Vec<VersionKey>,
    /// Of those, versions that validated clean.
    pub valid: Vec<VersionKey>,
    /// Of those, versions registered as INVALID.
    pub invalid: Vec<VersionKey>,
    /// Directory names skipped with a warning.
    pub skipped: Vec<String>,
    /// Non-fatal errors collected along the way.
    pub errors: Vec<RuntimeError>,
}

/// Scans the models root and feeds the registry.
pub struct DiscoveryScanner {
    models_root: PathBuf,
    validator: ContractValidator,
}

impl DiscoveryScanner {
    #[must_use]
    pub fn new(models_root: impl Into<PathBuf>) -> Self {
        Self {
            models_root: models_root.into(),
            validator: ContractValidator::new(),
        }
    }

    #[must_use]
    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    /// Scan the root, validate every new candidate, and register the
    /// results. Fatal only when the root itself is unusable.
    pub fn scan_into_registry(&self, registry: &ModelRegistry) -> Result<DiscoveryResult> {
        let mut result = DiscoveryResult::default();

        let entries = self.read_dir_checked(&self.models_root)?;
        for model_entry in entries.filter_map(|e| e.ok()) {
            let model_path = model_entry.path();
            if !model_path.is_dir() {
                continue;
            }
            let model_id = model_entry.file_name().to_string_lossy().into_owned();
            if model_id.starts_with('.') {
                continue;
            }
            if !is_valid_model_id(&model_id) {
                warn!(directory = %model_id, "skipping directory: not a valid model id");
                result.skipped.push(model_id.clone());
                result.errors.push(
                    RuntimeError::new(
                        ErrorCode::DiscInvalidModelId,
                        format!("directory '{model_id}' is not a valid model id"),
                    )
                    .with_path(model_path),
                );
                continue;
            }

            self.scan_model_dir(registry, &model_id, &model_path, &mut result);
        }

        info!(
            registered = result.registered.len(),
            valid = result.valid.len(),
            invalid = result.invalid.len(),
            skipped = result.skipped.len(),
            "discovery scan complete"
        );
        Ok(result)
    }

    fn scan_model_dir(
        &self,
        registry: &ModelRegistry,
        model_id: &str,
        model_path: &Path,
        result: &mut DiscoveryResult,
    ) {
        let entries = match fs::read_dir(model_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(model_id, error = %e, "cannot read model directory");
                result.errors.push(
                    io_error(&e, model_path).with_model_id(model_id),
                );
                return;
            }
        };

        let mut saw_version = false;
        for entry in entries.filter_map(|e| e.ok()) {
            let version_path = entry.path();
            if !version_path.is_dir() {
                continue;
            }
            let version_name = entry.file_name().to_string_lossy().into_owned();
            if version_name.starts_with('.') {
                continue;
            }
            if !is_valid_version(&version_name) {
                warn!(model_id, directory = %version_name, "skipping directory: not a valid version");
                result.skipped.push(format!("{model_id}/{version_name}"));
                result.errors.push(
                    RuntimeError::new(
                        ErrorCode::DiscInvalidVersion,
                        format!("directory '{version_name}' is not a valid version"),
                    )
                    .with_model_id(model_id)
                    .with_path(version_path),
                );
                continue;
            }
            saw_version = true;

            self.register_candidate(registry, model_id, &version_name, &version_path, result);
        }

        if !saw_version {
            result.errors.push(
                RuntimeError::new(
                    ErrorCode::DiscNoVersions,
                    format!("model '{model_id}' has no version directories"),
                )
                .with_model_id(model_id)
                .with_path(model_path),
            );
        }
    }

    fn register_candidate(
        &self,
        registry: &ModelRegistry,
        model_id: &str,
        version_name: &str,
        version_path: &Path,
        result: &mut DiscoveryResult,
    ) {
        let Ok(parsed_version) = semver::Version::parse(version_name) else {
            return;
        };
        let key = VersionKey::new(model_id, parsed_version);
        if let Some(existing) = registry.get_version(&key) {
            // A package fixed on disk gets another chance; everything
            // else is left alone.
            if matches!(existing.state, LoadState::Invalid | LoadState::Failed) {
                self.revalidate(registry, &key, version_path, result);
            } else {
                debug!(version = %key, "already registered, skipping");
            }
            return;
        }

        let report = self.validator.validate(version_path, model_id, version_name);
        let descriptor = match report.descriptor {
            Some(descriptor) => Arc::new(descriptor),
            None => Arc::new(placeholder_descriptor(model_id, &key, version_path)),
        };

        if let Err(e) = registry.register_version(descriptor) {
            // Lost a race with a concurrent scan; nothing to do.
            debug!(version = %key, error = %e, "registration skipped");
            return;
        }
        result.registered.push(key.clone());

        let _ = registry.update_state(&key, LoadState::Validating, None, None);
        if report.errors.is_empty() {
            let _ = registry.update_state(&key, LoadState::Valid, None, None);
            result.valid.push(key);
        } else {
            for error in &report.errors {
                warn!(version = %key, error = %error, "contract validation error");
            }
            let first_code = report.errors.first().map(|e| e.code);
            let message = report
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "contract validation failed".to_string());
            let _ = registry.update_state(&key, LoadState::Invalid, first_code, Some(&message));
            result.invalid.push(key);
            result.errors.extend(report.errors);
        }
    }

    /// Re-run validation for an INVALID or FAILED version whose
    /// directory may have been fixed.
    fn revalidate(
        &self,
        registry: &ModelRegistry,
        key: &VersionKey,
        version_path: &Path,
        result: &mut DiscoveryResult,
    ) {
        if registry
            .update_state(key, LoadState::Validating, None, None)
            .is_err()
        {
            return;
        }

        let report =
            self.validator
                .validate(version_path, &key.model_id, &key.version.to_string());
        if let Some(descriptor) = report.descriptor {
            if let Err(e) = registry.replace_descriptor(key, Arc::new(descriptor)) {
                warn!(version = %key, error = %e, "descriptor replacement failed");
                return;
            }
        }

        if report.errors.is_empty() {
            info!(version = %key, "re-validation succeeded");
            let _ = registry.update_state(key, LoadState::Valid, None, None);
            result.valid.push(key.clone());
        } else {
            let first_code = report.errors.first().map(|e| e.code);
            let message = report
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "contract validation failed".to_string());
            let _ = registry.update_state(key, LoadState::Invalid, first_code, Some(&message));
            result.invalid.push(key.clone());
            result.errors.extend(report.errors);
        }
    }

    fn read_dir_checked(&self, root: &Path) -> Result<fs::ReadDir> {
        match fs::read_dir(root) {
            Ok(entries) => {
                if root.is_dir() {
                    Ok(entries)
                } else {
                    Err(RuntimeError::new(
                        ErrorCode::DiscRootNotDirectory,
                        format!("models root '{}' is not a directory", root.display()),
                    )
                    .with_path(root))
                }
            }
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Err(RuntimeError::new(
                    ErrorCode::DiscRootNotFound,
                    format!("models root '{}' does not exist", root.display()),
                )
                .with_path(root)),
                io::ErrorKind::PermissionDenied => Err(RuntimeError::new(
                    ErrorCode::DiscPermissionDenied,
                    format!("permission denied reading '{}'", root.display()),
                )
                .with_path(root)),
                _ if root.exists() && !root.is_dir() => Err(RuntimeError::new(
                    ErrorCode::DiscRootNotDirectory,
                    format!("models root '{}' is not a directory", root.display()),
                )
                .with_path(root)),
                _ => Err(io_error(&e, root)),
            },
        }
    }
}

fn io_error(e: &io::Error, path: &Path) -> RuntimeError {
    let code = if e.kind() == io::ErrorKind::PermissionDenied {
        ErrorCode::DiscPermissionDenied
    } else {
        ErrorCode::DiscRootNotFound
    };
    RuntimeError::new(code, e.to_string()).with_path(path)
}

/// Minimal descriptor for versions whose contract never produced one,
/// so INVALID versions are still tracked (and re-validatable) in the
/// registry.
fn placeholder_descriptor(
    model_id: &str,
    key: &VersionKey,
    version_path: &Path,
) -> VersionDescriptor {
    VersionDescriptor {
        model_id: model_id.to_string(),
        version: key.version.clone(),
        display_name: model_id.to_string(),
        description: String::new(),
        author: "unknown".to_string(),
        contract_schema_version: "1.0.0".to_string(),
        directory_path: version_path.to_path_buf(),
        input: InputSpec {
            kind: InputKind::Frame,
            format: InputFormat::Jpeg,
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
            warmup_iterations: 1,
        },
        limits: ResourceLimits::default(),
        capabilities: ModelCapabilities::default(),
        entry_points: EntryPoints::default(),
    }
}

// ============================================================================
// Directory watcher
// ============================================================================

/// Debounced filesystem watcher over the models root.
pub struct DirectoryWatcher {
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl DirectoryWatcher {
    /// Watch `root` recursively. Events are coalesced; consumers see at
    /// most one trigger per quiet period.
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(16);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if event.is_ok() {
                // Coalescing: a full queue already guarantees a rescan.
                let _ = tx.try_send(());
            }
        })
        .map_err(|e| watch_error(root, e))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(root, e))?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for filesystem activity, then for it to settle. Returns
    /// false when the watcher is gone.
    pub async fn wait_for_change(&mut self, debounce: Duration) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }
        loop {
            match tokio::time::timeout(debounce, self.rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }
}

fn watch_error(root: &Path, e: notify::Error) -> RuntimeError {
    RuntimeError::new(
        ErrorCode::DiscRootNotFound,
        format!("cannot watch models root '{}'", root.display()),
    )
    .with_path(root)
    .with_cause(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_package_tree, ContractOptions};
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_is_fatal() {
        let registry = ModelRegistry::new();
        let scanner = DiscoveryScanner::new("/nonexistent/models/root");
        let err = scanner.scan_into_registry(&registry).unwrap_err();
        assert_eq!(err.code, ErrorCode::DiscRootNotFound);
    }

    #[test]
    fn test_scan_registers_valid_package() {
        let tmp = TempDir::new().unwrap();
        write_package_tree(tmp.path(), &ContractOptions::frame_detector());

        let registry = ModelRegistry::new();
        let scanner = DiscoveryScanner::new(tmp.path());
        let result = scanner.scan_into_registry(&registry).unwrap();

        assert_eq!(result.registered.len(), 1);
        assert_eq!(result.valid.len(), 1);
        let snapshot = registry.get_version(&result.valid[0]).unwrap();
        assert_eq!(snapshot.state, LoadState::Valid);
    }

    #[test]
    fn test_invalid_directory_names_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        write_package_tree(tmp.path(), &ContractOptions::frame_detector());
        std::fs::create_dir_all(tmp.path().join("Bad-Name/1.0.0")).unwrap();
        std::fs::create_dir_all(tmp.path().join("okay_model/not_a_version")).unwrap();

        let registry = ModelRegistry::new();
        let result = DiscoveryScanner::new(tmp.path())
            .scan_into_registry(&registry)
            .unwrap();

        assert_eq!(result.valid.len(), 1);
        assert!(result.skipped.iter().any(|s| s == "Bad-Name"));
        assert!(result
            .skipped
            .iter()
            .any(|s| s == "okay_model/not_a_version"));
        // okay_model has no usable versions.
        assert!(result
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::DiscNoVersions));
    }

    #[test]
    fn test_broken_package_registered_invalid() {
        let tmp = TempDir::new().unwrap();
        write_package_tree(tmp.path(), &ContractOptions::frame_detector());
        // A package with a contract that mismatches its directory.
        let broken = ContractOptions::frame_detector()
            .with_model_id("broken_det")
            .with_version("9.9.9");
        let dir = tmp.path().join("broken_det/1.0.0");
        std::fs::create_dir_all(&dir).unwrap();
        crate::test_support::write_package(&dir, &broken);

        let registry = ModelRegistry::new();
        let result = DiscoveryScanner::new(tmp.path())
            .scan_into_registry(&registry)
            .unwrap();

        assert_eq!(result.valid.len(), 1);
        assert_eq!(result.invalid.len(), 1);
        let invalid = registry.get_version(&result.invalid[0]).unwrap();
        assert_eq!(invalid.state, LoadState::Invalid);
        assert!(invalid.error_code.is_some());
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_package_tree(tmp.path(), &ContractOptions::frame_detector());

        let registry = ModelRegistry::new();
        let scanner = DiscoveryScanner::new(tmp.path());
        let first = scanner.scan_into_registry(&registry).unwrap();
        let second = scanner.scan_into_registry(&registry).unwrap();

        assert_eq!(first.registered.len(), 1);
        assert!(second.registered.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fixed_package_revalidates_on_rescan() {
        let tmp = TempDir::new().unwrap();
        // Contract whose version mismatches its directory.
        let broken = ContractOptions::frame_detector().with_version("9.9.9");
        let dir = tmp.path().join("sample_det/1.0.0");
        std::fs::create_dir_all(&dir).unwrap();
        crate::test_support::write_package(&dir, &broken);

        let registry = ModelRegistry::new();
        let scanner = DiscoveryScanner::new(tmp.path());
        let first = scanner.scan_into_registry(&registry).unwrap();
        assert_eq!(first.invalid.len(), 1);
        let key = first.invalid[0].clone();
        assert_eq!(registry.get_version(&key).unwrap().state, LoadState::Invalid);

        // Fix the package and rescan.
        crate::test_support::write_package(&dir, &ContractOptions::frame_detector());
        let second = scanner.scan_into_registry(&registry).unwrap();
        assert!(second.valid.contains(&key));
        let snapshot = registry.get_version(&key).unwrap();
        assert_eq!(snapshot.state, LoadState::Valid);
        assert_eq!(snapshot.descriptor.limits.max_concurrent_inferences, 2);
    }

    #[tokio::test]
    async fn test_watcher_sees_new_package() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = DirectoryWatcher::new(tmp.path()).unwrap();

        let root = tmp.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            write_package_tree(&root, &ContractOptions::frame_detector());
        });

        let changed = tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait_for_change(Duration::from_millis(100)),
        )
        .await;
        assert!(matches!(changed, Ok(true)));
    }
}
