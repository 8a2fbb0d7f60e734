//! Capability and health reporting.
//!
//! Push-based: the runtime tells the backend what it can serve; the
//! backend never polls. Model-level health is derived from version-level
//! health at report-build time and never stored. UNHEALTHY versions are
//! elided from reports entirely; DEGRADED versions are advertised as
//! DEGRADED. Models with no servable version are not advertised.
//!
//! Concurrency pressure is reported alongside capabilities but never
//! folded into health: admission rejections tell the backend to
//! throttle, not that the runtime is sick.
//!
//! Registry events reach the publisher through a bounded trigger channel
//! drained by a dedicated worker, so pushes (and push retries, with
//! exponential backoff) never block registry mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::concurrency::{BackpressureLevel, ConcurrencyManager};
use crate::descriptor::{
    HardwareSpec, HealthStatus, InputKind, ModelCapabilities, ModelHealth, PerformanceHints,
};
use crate::registry::ModelRegistry;

/// One advertised version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionCapability {
    pub version: semver::Version,
    pub health: HealthStatus,
    pub input_kind: InputKind,
    pub hardware: HardwareSpec,
    pub performance: PerformanceHints,
    pub capabilities: ModelCapabilities,
}

/// One advertised model with its derived health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilityReport {
    pub model_id: String,
    pub health: ModelHealth,
    pub versions: Vec<VersionCapability>,
}

/// Runtime-wide capacity picture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCapacityReport {
    pub slots_total: u32,
    pub slots_in_use: u32,
    pub backpressure: BackpressureLevel,
}

/// The full payload pushed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullCapabilityReport {
    pub runtime_id: String,
    pub generated_at: DateTime<Utc>,
    pub models: Vec<ModelCapabilityReport>,
    pub capacity: RuntimeCapacityReport,
}

// ============================================================================
// Aggregation
// ============================================================================

/// Derives the advertised view from registry state.
pub struct HealthAggregator {
    registry: Arc<ModelRegistry>,
}

impl HealthAggregator {
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Build the advertised model list. Deterministic ordering so
    /// reports are comparable snapshot-to-snapshot.
    #[must_use]
    pub fn model_reports(&self) -> Vec<ModelCapabilityReport> {
        let snapshot = self.registry.snapshot();
        let mut model_ids: Vec<String> = snapshot
            .iter()
            .map(|s| s.descriptor.model_id.clone())
            .collect();
        model_ids.sort_unstable();
        model_ids.dedup();

        let mut reports = Vec::new();
        for model_id in model_ids {
            let versions: Vec<_> = snapshot
                .iter()
                .filter(|s| s.descriptor.model_id == model_id)
                .collect();

            let states: Vec<_> = versions.iter().map(|s| (s.state, s.health)).collect();
            let health = ModelHealth::derive(states.iter().map(|(s, h)| (s, h)));
            if health == ModelHealth::Unavailable {
                continue;
            }

            let mut advertised: Vec<VersionCapability> = versions
                .iter()
                .filter(|s| s.state.is_servable() && s.health.is_eligible())
                .map(|s| VersionCapability {
                    version: s.descriptor.version.clone(),
                    health: s.health,
                    input_kind: s.descriptor.input.kind,
                    hardware: s.descriptor.hardware.clone(),
                    performance: s.descriptor.performance.clone(),
                    capabilities: s.descriptor.capabilities.clone(),
                })
                .collect();
            advertised.sort_by(|a, b| b.version.cmp(&a.version));

            reports.push(ModelCapabilityReport {
                model_id,
                health,
                versions: advertised,
            });
        }
        reports
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Publisher timing and retry policy.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Periodic full push even without changes.
    pub heartbeat_interval: Duration,
    /// First retry delay after a failed push.
    pub backoff_initial: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Pushes capability and health reports to the backend.
pub struct CapabilityPublisher {
    aggregator: HealthAggregator,
    registry: Arc<ModelRegistry>,
    concurrency: Arc<ConcurrencyManager>,
    client: Arc<dyn BackendClient>,
    runtime_id: String,
    config: PublisherConfig,
    last_advertised: Mutex<Option<Vec<ModelCapabilityReport>>>,
    registered: AtomicBool,
}

impl CapabilityPublisher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        concurrency: Arc<ConcurrencyManager>,
        client: Arc<dyn BackendClient>,
        runtime_id: impl Into<String>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            aggregator: HealthAggregator::new(Arc::clone(&registry)),
            registry,
            concurrency,
            client,
            runtime_id: runtime_id.into(),
            config,
            last_advertised: Mutex::new(None),
            registered: AtomicBool::new(false),
        }
    }

    /// Build the current full report.
    #[must_use]
    pub fn build_report(&self) -> FullCapabilityReport {
        FullCapabilityReport {
            runtime_id: self.runtime_id.clone(),
            generated_at: Utc::now(),
            models: self.aggregator.model_reports(),
            capacity: RuntimeCapacityReport {
                slots_total: self.concurrency.global_limit(),
                slots_in_use: self.concurrency.global_active(),
                backpressure: self.concurrency.backpressure_level(),
            },
        }
    }

    /// Whether the advertised view changed since the last successful
    /// push.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let current = self.aggregator.model_reports();
        self.last_advertised.lock().as_ref() != Some(&current)
    }

    /// One push attempt: registration first, health afterwards. On
    /// success the advertised view becomes the new last-known-good.
    pub async fn push_once(&self) -> crate::error::Result<()> {
        let report = self.build_report();
        let correlation_id = uuid::Uuid::new_v4().to_string();

        let result = if self.registered.load(Ordering::Acquire) {
            self.client.push_health(&report, &correlation_id).await
        } else {
            self.client
                .register_capabilities(&report, &correlation_id)
                .await
        };

        match result {
            Ok(()) => {
                self.registered.store(true, Ordering::Release);
                *self.last_advertised.lock() = Some(report.models);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deregister from the backend. Best effort; used at shutdown.
    pub async fn deregister(&self) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.client.deregister(&self.runtime_id, &correlation_id).await {
            warn!(error = %e, "deregistration failed");
        }
    }

    /// Subscribe to registry events and run the push loop until the
    /// returned task is aborted.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<()>(64);
        self.registry.subscribe(move |_event| {
            // Coalescing trigger; a full channel already implies a push.
            let _ = tx.try_send(());
        });

        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = publisher.config.backoff_initial;
            let mut heartbeat = tokio::time::interval(publisher.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; it
            // doubles as the startup full registration.
            loop {
                let force = tokio::select! {
                    maybe = rx.recv() => {
                        if maybe.is_none() {
                            break;
                        }
                        false
                    }
                    _ = heartbeat.tick() => true,
                };

                if !force && !publisher.is_dirty() {
                    continue;
                }

                // Retry with exponential backoff until this snapshot (or
                // a newer one; the report is rebuilt each attempt) lands.
                loop {
                    match publisher.push_once().await {
                        Ok(()) => {
                            backoff = publisher.config.backoff_initial;
                            debug!("capability push complete");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "push failed, backing off");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(publisher.config.backoff_max);
                        }
                    }
                }
            }
            info!("publisher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LoadState;
    use crate::registry::ModelRegistry;
    use crate::test_support::{registry_with_ready_version, RecordingBackendClient};

    fn publisher_with(
        registry: &Arc<ModelRegistry>,
        client: &Arc<RecordingBackendClient>,
    ) -> Arc<CapabilityPublisher> {
        Arc::new(CapabilityPublisher::new(
            Arc::clone(registry),
            Arc::new(ConcurrencyManager::new(10)),
            Arc::clone(client) as Arc<dyn BackendClient>,
            "runtime-test",
            PublisherConfig {
                heartbeat_interval: Duration::from_millis(5_000),
                backoff_initial: Duration::from_millis(10),
                backoff_max: Duration::from_millis(40),
            },
        ))
    }

    #[test]
    fn test_aggregation_rules() {
        let registry = Arc::new(ModelRegistry::new());
        let healthy = registry_with_ready_version(&registry, "model_a", "1.0.0", HealthStatus::Healthy);
        let degraded = registry_with_ready_version(&registry, "model_a", "1.1.0", HealthStatus::Degraded);
        let unhealthy = registry_with_ready_version(&registry, "model_a", "1.2.0", HealthStatus::Unhealthy);
        let _unavailable_model =
            registry_with_ready_version(&registry, "model_b", "1.0.0", HealthStatus::Unhealthy);

        let reports = HealthAggregator::new(Arc::clone(&registry)).model_reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.model_id, "model_a");
        assert_eq!(report.health, ModelHealth::Healthy);

        let advertised: Vec<_> = report.versions.iter().map(|v| v.version.clone()).collect();
        assert!(advertised.contains(&healthy.version));
        assert!(advertised.contains(&degraded.version));
        assert!(!advertised.contains(&unhealthy.version));
    }

    #[test]
    fn test_degraded_only_model() {
        let registry = Arc::new(ModelRegistry::new());
        registry_with_ready_version(&registry, "model_a", "1.0.0", HealthStatus::Degraded);

        let reports = HealthAggregator::new(Arc::clone(&registry)).model_reports();
        assert_eq!(reports[0].health, ModelHealth::Degraded);
        assert_eq!(reports[0].versions[0].health, HealthStatus::Degraded);
    }

    #[test]
    fn test_non_ready_versions_not_advertised() {
        let registry = Arc::new(ModelRegistry::new());
        let key = registry_with_ready_version(&registry, "model_a", "1.0.0", HealthStatus::Healthy);
        registry
            .update_state(&key, LoadState::Disabled, None, None)
            .unwrap();

        let reports = HealthAggregator::new(Arc::clone(&registry)).model_reports();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_publisher_registration_then_delta() {
        let registry = Arc::new(ModelRegistry::new());
        let key = registry_with_ready_version(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);

        let client = Arc::new(RecordingBackendClient::default());
        let publisher = publisher_with(&registry, &client);
        let task = publisher.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        {
            let pushes = client.pushes.lock();
            assert!(!pushes.is_empty());
            let (kind, report) = &pushes[0];
            assert_eq!(kind, "register");
            assert_eq!(report.models.len(), 1);
            assert_eq!(report.models[0].versions.len(), 1);
        }

        // Health change triggers a delta push.
        registry.update_health(&key, HealthStatus::Degraded).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        {
            let pushes = client.pushes.lock();
            let (kind, report) = pushes.last().unwrap();
            assert_eq!(kind, "health");
            assert_eq!(report.models[0].versions[0].health, HealthStatus::Degraded);
        }

        // Unhealthy versions disappear from the next push.
        registry.update_health(&key, HealthStatus::Unhealthy).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        {
            let pushes = client.pushes.lock();
            let (_, report) = pushes.last().unwrap();
            assert!(report.models.is_empty());
        }

        task.abort();
    }

    #[tokio::test]
    async fn test_push_retries_with_backoff() {
        let registry = Arc::new(ModelRegistry::new());
        registry_with_ready_version(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);

        let client = Arc::new(RecordingBackendClient::failing(3));
        let publisher = publisher_with(&registry, &client);
        let task = publisher.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        {
            let pushes = client.pushes.lock();
            assert!(!pushes.is_empty(), "push should land after retries");
        }
        assert!(client.failures_seen() >= 3);
        task.abort();
    }

    #[tokio::test]
    async fn test_no_push_when_nothing_changed() {
        let registry = Arc::new(ModelRegistry::new());
        registry_with_ready_version(&registry, "sample_det", "1.0.0", HealthStatus::Healthy);

        let client = Arc::new(RecordingBackendClient::default());
        let publisher = publisher_with(&registry, &client);
        let task = publisher.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_startup = client.pushes.lock().len();

        // Idempotent health write emits no event and changes nothing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.pushes.lock().len(), after_startup);
        task.abort();
    }
}
