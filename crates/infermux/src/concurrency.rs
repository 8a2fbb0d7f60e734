//! Multi-model concurrency control.
//!
//! Enforces three simultaneous caps on in-flight inference: a global
//! limit, a per-model limit (declared in each contract), and a
//! per-version limit (defaults to the model limit). Admission is
//! all-or-nothing: a request either gets a slot against all three
//! counters or is rejected with a classified reason. The manager never
//! queues; rejection is explicit and retryable.
//!
//! Fairness is best-effort: no model can hold more than its own limit of
//! the global pool, so slots interleave across models under sustained
//! overload. Strict round-robin is not promised.
//!
//! Backpressure level is derived from global utilization and is purely
//! informational for the capability publisher; admission decisions
//! depend only on the hard limits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::{LoadState, VersionKey};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::registry::ModelRegistry;

/// Informational utilization level derived from `global_active / limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackpressureLevel {
    /// Below 70% of the global limit.
    None,
    /// 70-90% of the global limit.
    Soft,
    /// Above 90% of the global limit.
    Hard,
}

/// Why an admission attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    GlobalLimit,
    ModelLimit,
    VersionLimit,
}

impl RejectionReason {
    /// Error code surfaced to the caller.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::GlobalLimit => ErrorCode::PipeConcurrencyGlobalLimit,
            Self::ModelLimit => ErrorCode::PipeConcurrencyModelLimit,
            Self::VersionLimit => ErrorCode::PipeConcurrencyVersionLimit,
        }
    }
}

/// Counters snapshot for diagnostics and capacity reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyDiagnostics {
    pub global_active: u32,
    pub global_limit: u32,
    pub acquired_total: u64,
    pub released_total: u64,
    /// `global_active` minus the sum of per-version actives. Nonzero
    /// indicates a slot accounting bug.
    pub leaked_slots: i64,
    pub backpressure: BackpressureLevel,
}

#[derive(Default, Debug)]
struct Counters {
    global_active: u32,
    model_active: HashMap<String, u32>,
    version_active: HashMap<VersionKey, u32>,
    model_limits: HashMap<String, u32>,
    version_limits: HashMap<VersionKey, u32>,
    acquired_total: u64,
    released_total: u64,
}

/// Tracks in-flight inference counts under global/model/version limits.
pub struct ConcurrencyManager {
    global_limit: u32,
    counters: Arc<Mutex<Counters>>,
}

impl ConcurrencyManager {
    #[must_use]
    pub fn new(global_limit: u32) -> Self {
        Self {
            global_limit: global_limit.max(1),
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Register limits for a version at activation time.
    ///
    /// The per-model limit is the largest declared
    /// `max_concurrent_inferences` across the model's registered
    /// versions; the per-version limit defaults to the version's own
    /// declared value.
    pub fn register_version(
        &self,
        key: &VersionKey,
        max_concurrent: u32,
        version_limit: Option<u32>,
    ) {
        let max_concurrent = max_concurrent.max(1);
        let mut counters = self.counters.lock();
        let model_limit = counters
            .model_limits
            .entry(key.model_id.clone())
            .or_insert(0);
        *model_limit = (*model_limit).max(max_concurrent);
        counters
            .version_limits
            .insert(key.clone(), version_limit.unwrap_or(max_concurrent).max(1));
    }

    /// Drop the version's limit entry. In-flight slots keep their
    /// counters until released.
    pub fn unregister_version(&self, key: &VersionKey) {
        let mut counters = self.counters.lock();
        counters.version_limits.remove(key);
        let remaining: u32 = counters
            .version_limits
            .iter()
            .filter(|(k, _)| k.model_id == key.model_id)
            .map(|(_, limit)| *limit)
            .max()
            .unwrap_or(0);
        if remaining == 0 {
            counters.model_limits.remove(&key.model_id);
        } else {
            counters.model_limits.insert(key.model_id.clone(), remaining);
        }
    }

    /// Atomically try to take one slot against all three limits.
    pub fn try_acquire(
        &self,
        key: &VersionKey,
        request_id: &str,
    ) -> std::result::Result<ConcurrencySlot, RejectionReason> {
        let mut counters = self.counters.lock();

        if counters.global_active >= self.global_limit {
            return Err(RejectionReason::GlobalLimit);
        }

        let model_limit = counters
            .model_limits
            .get(&key.model_id)
            .copied()
            .unwrap_or(1);
        let model_active = counters
            .model_active
            .get(&key.model_id)
            .copied()
            .unwrap_or(0);
        if model_active >= model_limit {
            return Err(RejectionReason::ModelLimit);
        }

        let version_limit = counters.version_limits.get(key).copied().unwrap_or(1);
        let version_active = counters.version_active.get(key).copied().unwrap_or(0);
        if version_active >= version_limit {
            return Err(RejectionReason::VersionLimit);
        }

        counters.global_active += 1;
        *counters.model_active.entry(key.model_id.clone()).or_insert(0) += 1;
        *counters.version_active.entry(key.clone()).or_insert(0) += 1;
        counters.acquired_total += 1;
        drop(counters);

        debug!(version = %key, request_id, "admission slot acquired");
        Ok(ConcurrencySlot {
            inner: Arc::new(SlotInner {
                counters: Arc::clone(&self.counters),
                key: key.clone(),
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Current backpressure level.
    #[must_use]
    pub fn backpressure_level(&self) -> BackpressureLevel {
        let active = self.counters.lock().global_active;
        level_for(active, self.global_limit)
    }

    /// Global in-flight count.
    #[must_use]
    pub fn global_active(&self) -> u32 {
        self.counters.lock().global_active
    }

    /// Configured global limit.
    #[must_use]
    pub fn global_limit(&self) -> u32 {
        self.global_limit
    }

    /// Slot accounting snapshot.
    #[must_use]
    pub fn diagnostics(&self) -> ConcurrencyDiagnostics {
        let counters = self.counters.lock();
        let version_sum: u32 = counters.version_active.values().sum();
        let leaked = i64::from(counters.global_active) - i64::from(version_sum);
        if leaked != 0 {
            warn!(leaked, "concurrency slot accounting mismatch");
        }
        ConcurrencyDiagnostics {
            global_active: counters.global_active,
            global_limit: self.global_limit,
            acquired_total: counters.acquired_total,
            released_total: counters.released_total,
            leaked_slots: leaked,
            backpressure: level_for(counters.global_active, self.global_limit),
        }
    }
}

fn level_for(active: u32, limit: u32) -> BackpressureLevel {
    let ratio = f64::from(active) / f64::from(limit.max(1));
    if ratio < 0.7 {
        BackpressureLevel::None
    } else if ratio <= 0.9 {
        BackpressureLevel::Soft
    } else {
        BackpressureLevel::Hard
    }
}

#[derive(Debug)]
struct SlotInner {
    counters: Arc<Mutex<Counters>>,
    key: VersionKey,
    released: AtomicBool,
}

impl SlotInner {
    fn release_once(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut counters = self.counters.lock();
        counters.global_active = counters.global_active.saturating_sub(1);
        if let Some(n) = counters.model_active.get_mut(&self.key.model_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counters.model_active.remove(&self.key.model_id);
            }
        }
        if let Some(n) = counters.version_active.get_mut(&self.key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counters.version_active.remove(&self.key);
            }
        }
        counters.released_total += 1;
    }
}

/// Held reservation against the concurrency counters.
///
/// Released exactly once: explicit [`release`](Self::release) and drop
/// both funnel into the same idempotent path, so every exit from the
/// pipeline (including panics and early returns) gives the slot back.
#[derive(Debug)]
pub struct ConcurrencySlot {
    inner: Arc<SlotInner>,
}

impl ConcurrencySlot {
    /// Give the slot back. Safe to call more than once.
    pub fn release(&self) {
        self.inner.release_once();
    }

    /// Version this slot was acquired for.
    #[must_use]
    pub fn key(&self) -> &VersionKey {
        &self.inner.key
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.inner.release_once();
    }
}

/// Admission decisions combining registry state with concurrency limits.
///
/// Reading registry state here closes the race with deactivation: after
/// the coordinator deactivates a version, no new admissions can succeed
/// for it even if a request already resolved the version.
pub struct AdmissionController {
    manager: Arc<ConcurrencyManager>,
    registry: Arc<ModelRegistry>,
    draining: AtomicBool,
}

impl AdmissionController {
    pub fn new(manager: Arc<ConcurrencyManager>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            manager,
            registry,
            draining: AtomicBool::new(false),
        }
    }

    /// Refuse all new admissions from now on. In-flight slots drain
    /// normally. Used by shutdown.
    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Admit a request for a resolved version or reject it with a
    /// classified, retryable error.
    pub fn try_admit(&self, key: &VersionKey, request_id: &str) -> Result<ConcurrencySlot> {
        if self.draining.load(Ordering::Acquire) {
            return Err(RuntimeError::new(
                ErrorCode::PipeModelNotReady,
                "runtime is shutting down",
            )
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_request_id(request_id));
        }
        match self.registry.get_version(key) {
            Some(snapshot) if snapshot.state == LoadState::Ready => {}
            Some(snapshot) => {
                return Err(RuntimeError::new(
                    ErrorCode::PipeVersionNotReady,
                    format!("version {key} is no longer servable (state {})", snapshot.state),
                )
                .with_model_id(key.model_id.clone())
                .with_version(key.version.to_string())
                .with_request_id(request_id));
            }
            None => {
                return Err(RuntimeError::new(
                    ErrorCode::PipeVersionNotFound,
                    format!("version {key} is not registered"),
                )
                .with_model_id(key.model_id.clone())
                .with_version(key.version.to_string())
                .with_request_id(request_id));
            }
        }

        self.manager.try_acquire(key, request_id).map_err(|reason| {
            RuntimeError::new(
                reason.error_code(),
                format!("concurrency limit reached for {key}"),
            )
            .with_model_id(key.model_id.clone())
            .with_version(key.version.to_string())
            .with_request_id(request_id)
        })
    }

    /// Backpressure level for capacity reporting.
    #[must_use]
    pub fn backpressure_level(&self) -> BackpressureLevel {
        self.manager.backpressure_level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn key(model_id: &str, version: &str) -> VersionKey {
        VersionKey::new(model_id, Version::parse(version).unwrap())
    }

    #[test]
    fn test_acquire_and_release() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");
        manager.register_version(&k, 2, None);

        let slot = manager.try_acquire(&k, "req-1").unwrap();
        assert_eq!(manager.global_active(), 1);
        slot.release();
        assert_eq!(manager.global_active(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");
        manager.register_version(&k, 2, None);

        let slot = manager.try_acquire(&k, "req-1").unwrap();
        slot.release();
        slot.release();
        drop(slot);
        assert_eq!(manager.global_active(), 0);
        let diag = manager.diagnostics();
        assert_eq!(diag.acquired_total, 1);
        assert_eq!(diag.released_total, 1);
    }

    #[test]
    fn test_drop_releases() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");
        manager.register_version(&k, 2, None);

        {
            let _slot = manager.try_acquire(&k, "req-1").unwrap();
            assert_eq!(manager.global_active(), 1);
        }
        assert_eq!(manager.global_active(), 0);
    }

    #[test]
    fn test_model_limit_binds_when_equal_to_version_limit() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");
        manager.register_version(&k, 1, None);

        let _slot = manager.try_acquire(&k, "req-1").unwrap();
        let reason = manager.try_acquire(&k, "req-2").unwrap_err();
        // Limits are checked global -> model -> version; with V == M
        // the model cap classifies the rejection.
        assert_eq!(reason, RejectionReason::ModelLimit);
    }

    #[test]
    fn test_version_limit_rejection() {
        let manager = ConcurrencyManager::new(10);
        let v1 = key("sample_det", "1.0.0");
        let v2 = key("sample_det", "1.1.0");
        // Model limit 3 (the max), but v1 itself allows only 1.
        manager.register_version(&v1, 1, Some(1));
        manager.register_version(&v2, 3, Some(3));

        let _slot = manager.try_acquire(&v1, "req-1").unwrap();
        let reason = manager.try_acquire(&v1, "req-2").unwrap_err();
        assert_eq!(reason, RejectionReason::VersionLimit);
    }

    #[test]
    fn test_model_limit_spans_versions() {
        let manager = ConcurrencyManager::new(10);
        let v1 = key("sample_det", "1.0.0");
        let v2 = key("sample_det", "1.1.0");
        manager.register_version(&v1, 2, Some(2));
        manager.register_version(&v2, 2, Some(2));

        let _a = manager.try_acquire(&v1, "req-1").unwrap();
        let _b = manager.try_acquire(&v2, "req-2").unwrap();
        let reason = manager.try_acquire(&v1, "req-3").unwrap_err();
        assert_eq!(reason, RejectionReason::ModelLimit);
    }

    #[test]
    fn test_global_limit_rejection() {
        let manager = ConcurrencyManager::new(2);
        let a = key("model_a", "1.0.0");
        let b = key("model_b", "1.0.0");
        let c = key("model_c", "1.0.0");
        for k in [&a, &b, &c] {
            manager.register_version(k, 4, None);
        }

        let _s1 = manager.try_acquire(&a, "req-1").unwrap();
        let _s2 = manager.try_acquire(&b, "req-2").unwrap();
        let reason = manager.try_acquire(&c, "req-3").unwrap_err();
        assert_eq!(reason, RejectionReason::GlobalLimit);
    }

    #[test]
    fn test_unknown_version_defaults_to_limit_one() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");

        let _slot = manager.try_acquire(&k, "req-1").unwrap();
        assert!(manager.try_acquire(&k, "req-2").is_err());
    }

    #[test]
    fn test_backpressure_levels() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");
        manager.register_version(&k, 10, Some(10));

        assert_eq!(manager.backpressure_level(), BackpressureLevel::None);

        let slots: Vec<_> = (0..7)
            .map(|i| manager.try_acquire(&k, &format!("req-{i}")).unwrap())
            .collect();
        assert_eq!(manager.backpressure_level(), BackpressureLevel::Soft);

        let more: Vec<_> = (7..10)
            .map(|i| manager.try_acquire(&k, &format!("req-{i}")).unwrap())
            .collect();
        assert_eq!(manager.backpressure_level(), BackpressureLevel::Hard);

        drop(slots);
        drop(more);
        assert_eq!(manager.backpressure_level(), BackpressureLevel::None);
    }

    #[test]
    fn test_diagnostics_balance() {
        let manager = ConcurrencyManager::new(10);
        let k = key("sample_det", "1.0.0");
        manager.register_version(&k, 4, None);

        let slots: Vec<_> = (0..3)
            .map(|i| manager.try_acquire(&k, &format!("req-{i}")).unwrap())
            .collect();
        let diag = manager.diagnostics();
        assert_eq!(diag.global_active, 3);
        assert_eq!(diag.leaked_slots, 0);

        drop(slots);
        let diag = manager.diagnostics();
        assert_eq!(diag.global_active, 0);
        assert_eq!(diag.acquired_total, 3);
        assert_eq!(diag.released_total, 3);
        assert_eq!(diag.leaked_slots, 0);
    }

    #[test]
    fn test_unregister_recomputes_model_limit() {
        let manager = ConcurrencyManager::new(10);
        let v1 = key("sample_det", "1.0.0");
        let v2 = key("sample_det", "1.1.0");
        manager.register_version(&v1, 1, None);
        manager.register_version(&v2, 3, None);

        manager.unregister_version(&v2);
        let _slot = manager.try_acquire(&v1, "req-1").unwrap();
        assert_eq!(
            manager.try_acquire(&v1, "req-2").unwrap_err(),
            RejectionReason::VersionLimit
        );
    }
}
