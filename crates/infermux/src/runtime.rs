//! Runtime assembly and lifecycle.
//!
//! [`ModelRuntime`] owns every service (registry, loader, concurrency,
//! breaker, coordinator, pipeline, publisher) and wires them together at
//! startup; there are no hidden globals. Startup discovers and loads
//! everything servable, then background tasks keep the system live:
//! recovery sweeps, publisher pushes, and hot discovery rescans.
//!
//! Shutdown order matters: stop the publisher first (so transient
//! teardown states are never pushed), refuse new admissions, drain
//! in-flight work within the grace budget, destroy sandboxes, then
//! deregister from the backend.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::backend::{BackendClient, HttpBackendClient, NoopBackendClient};
use crate::concurrency::{AdmissionController, ConcurrencyManager};
use crate::config::RuntimeConfig;
use crate::coordinator::Coordinator;
use crate::descriptor::{LoadState, VersionKey};
use crate::discovery::{DirectoryWatcher, DiscoveryScanner};
use crate::error::Result;
use crate::loader::{LoaderConfig, ModelLoader};
use crate::metrics::RuntimeMetrics;
use crate::pipeline::{InferencePipeline, InferenceRequest, InferenceResponse};
use crate::recovery::{CircuitBreaker, FailurePolicy, RecoveryManager};
use crate::registry::ModelRegistry;
use crate::reporting::{CapabilityPublisher, PublisherConfig};
use crate::sandbox::SandboxManager;
use crate::versioning::VersionResolver;

/// Debounce window for filesystem-triggered rescans.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Cooldown sweep period for the recovery manager.
const RECOVERY_SWEEP: Duration = Duration::from_secs(1);

/// The assembled inference runtime.
pub struct ModelRuntime {
    config: RuntimeConfig,
    registry: Arc<ModelRegistry>,
    scanner: DiscoveryScanner,
    loader: Arc<ModelLoader>,
    concurrency: Arc<ConcurrencyManager>,
    admission: Arc<AdmissionController>,
    coordinator: Arc<Coordinator>,
    recovery: Arc<RecoveryManager>,
    pipeline: InferencePipeline,
    publisher: Arc<CapabilityPublisher>,
    metrics: Option<Arc<RuntimeMetrics>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    publisher_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModelRuntime {
    /// Assemble all services. Must run inside a tokio runtime; fails
    /// only on unrecoverable setup errors (engine creation, bad config).
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::new());
        let scanner = DiscoveryScanner::new(config.models_root.clone());

        let loader = Arc::new(ModelLoader::new(LoaderConfig {
            load_timeout: config.model_load_timeout,
            enable_gpu: config.enable_gpu,
            ..LoaderConfig::default()
        })?);

        let concurrency = Arc::new(ConcurrencyManager::new(config.max_concurrent_inferences));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&concurrency),
            Arc::clone(&registry),
        ));

        let sandboxes = Arc::new(SandboxManager::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&sandboxes),
            Arc::clone(&concurrency),
        ));

        let breaker = Arc::new(CircuitBreaker::new(FailurePolicy::default()));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&breaker),
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            Arc::clone(&loader),
        ));

        let metrics = if config.metrics_enabled {
            match RuntimeMetrics::new() {
                Ok(metrics) => Some(Arc::new(metrics)),
                Err(e) => {
                    warn!(error = %e, "metrics setup failed, continuing without metrics");
                    None
                }
            }
        } else {
            None
        };

        let resolver = VersionResolver::new(
            Arc::clone(&registry),
            Arc::clone(&breaker) as Arc<dyn crate::versioning::ServabilityGate>,
        );
        let pipeline = InferencePipeline::new(
            resolver,
            Arc::clone(&admission),
            Arc::clone(&sandboxes),
            Arc::clone(&recovery),
            metrics.clone(),
        );

        let client: Arc<dyn BackendClient> = match &config.backend_url {
            Some(url) => Arc::new(HttpBackendClient::new(
                url.clone(),
                config.backend_api_key.clone(),
                config.backend_service_token.clone(),
            )?),
            None => Arc::new(NoopBackendClient),
        };
        let publisher = Arc::new(CapabilityPublisher::new(
            Arc::clone(&registry),
            Arc::clone(&concurrency),
            client,
            config.runtime_id.clone(),
            PublisherConfig {
                heartbeat_interval: config.heartbeat_interval,
                ..PublisherConfig::default()
            },
        ));

        Ok(Self {
            config,
            registry,
            scanner,
            loader,
            concurrency,
            admission,
            coordinator,
            recovery,
            pipeline,
            publisher,
            metrics,
            tasks: Mutex::new(Vec::new()),
            publisher_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<RuntimeMetrics>> {
        self.metrics.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Discover, validate, load, and activate everything servable, then
    /// start background work. Fatal only when the models root is
    /// unusable.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            runtime_id = %self.config.runtime_id,
            models_root = %self.config.models_root.display(),
            "starting runtime"
        );

        self.discover_and_load().await?;

        let recovery_task = self.recovery.start(RECOVERY_SWEEP);
        self.tasks.lock().push(recovery_task);

        *self.publisher_task.lock() = Some(self.publisher.start());

        match DirectoryWatcher::new(&self.config.models_root) {
            Ok(mut watcher) => {
                let runtime = Arc::clone(self);
                let task = tokio::spawn(async move {
                    while watcher.wait_for_change(WATCH_DEBOUNCE).await {
                        info!("models root changed, rescanning");
                        if let Err(e) = runtime.discover_and_load().await {
                            error!(error = %e, "rescan failed");
                        }
                    }
                });
                self.tasks.lock().push(task);
            }
            Err(e) => {
                warn!(error = %e, "hot discovery disabled: cannot watch models root");
            }
        }

        info!(
            versions = self.registry.len(),
            ready = self.registry.get_versions_by_state(LoadState::Ready).len(),
            "runtime started"
        );
        Ok(())
    }

    /// One discovery pass plus loading of every VALID version. A single
    /// failed package never blocks the others.
    pub async fn discover_and_load(&self) -> Result<()> {
        self.scanner.scan_into_registry(&self.registry)?;

        for snapshot in self.registry.get_versions_by_state(LoadState::Valid) {
            let key = snapshot.key();
            if let Err(e) =
                self.registry
                    .update_state(&key, LoadState::Loading, None, None)
            {
                warn!(version = %key, error = %e, "cannot move version to LOADING");
                continue;
            }

            match self.loader.load(Arc::clone(&snapshot.descriptor)).await {
                Ok(loaded) => {
                    if let Err(e) = self.coordinator.activate(loaded) {
                        error!(version = %key, error = %e, "activation failed");
                        let _ = self.registry.update_state(
                            &key,
                            LoadState::Failed,
                            Some(e.code),
                            Some(&e.message),
                        );
                    }
                }
                Err(e) => {
                    warn!(version = %key, error = %e, "load failed");
                    let _ = self.registry.update_state(
                        &key,
                        LoadState::Failed,
                        Some(e.code),
                        Some(&e.message),
                    );
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_ready_versions(
                self.registry.get_versions_by_state(LoadState::Ready).len() as i64,
            );
        }
        Ok(())
    }

    /// Submit one inference request.
    pub async fn submit(&self, request: InferenceRequest) -> InferenceResponse {
        if let Some(metrics) = &self.metrics {
            metrics.set_in_flight(self.concurrency.global_active());
        }
        self.pipeline.submit(request).await
    }

    /// Graceful shutdown: publisher first, then drain, then teardown,
    /// then deregister.
    pub async fn shutdown(&self) {
        info!("shutting down runtime");

        if let Some(task) = self.publisher_task.lock().take() {
            task.abort();
        }

        self.admission.begin_draining();

        let drain_deadline = tokio::time::Instant::now() + self.config.graceful_shutdown_timeout;
        while self.concurrency.global_active() > 0 {
            if tokio::time::Instant::now() >= drain_deadline {
                warn!(
                    in_flight = self.concurrency.global_active(),
                    "drain budget exhausted, tearing down with work in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for key in self.coordinator.sandboxes().keys() {
            self.unload_version(&key);
        }

        self.publisher.deregister().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("runtime stopped");
    }

    fn unload_version(&self, key: &VersionKey) {
        if let Err(e) = self
            .coordinator
            .deactivate(key, LoadState::Unloading, Some("shutdown"))
        {
            warn!(version = %key, error = %e, "deactivation during shutdown failed");
            return;
        }
        if let Err(e) = self.registry.remove_version(key) {
            warn!(version = %key, error = %e, "removal during shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_package_tree, ContractOptions};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_startup_loads_and_activates() {
        let tmp = TempDir::new().unwrap();
        write_package_tree(tmp.path(), &ContractOptions::frame_detector());

        let runtime =
            Arc::new(ModelRuntime::new(RuntimeConfig::for_testing(tmp.path())).unwrap());
        runtime.start().await.unwrap();

        let ready = runtime.registry.get_versions_by_state(LoadState::Ready);
        assert_eq!(ready.len(), 1);
        runtime.shutdown().await;
        assert!(runtime.registry.is_empty());
    }

    #[tokio::test]
    async fn test_startup_with_missing_root_fails() {
        let runtime = Arc::new(
            ModelRuntime::new(RuntimeConfig::for_testing("/nonexistent/models")).unwrap(),
        );
        assert!(runtime.start().await.is_err());
    }

    #[tokio::test]
    async fn test_one_broken_package_does_not_block_others() {
        let tmp = TempDir::new().unwrap();
        write_package_tree(tmp.path(), &ContractOptions::frame_detector());
        let mut broken = ContractOptions::frame_detector().with_model_id("broken_det");
        broken.inference_wat = "(not wasm".to_string();
        write_package_tree(tmp.path(), &broken);

        let runtime =
            Arc::new(ModelRuntime::new(RuntimeConfig::for_testing(tmp.path())).unwrap());
        runtime.start().await.unwrap();

        assert_eq!(
            runtime.registry.get_versions_by_state(LoadState::Ready).len(),
            1
        );
        assert_eq!(
            runtime.registry.get_versions_by_state(LoadState::Failed).len(),
            1
        );
        runtime.shutdown().await;
    }
}
