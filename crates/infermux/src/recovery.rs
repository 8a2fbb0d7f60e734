//! Failure isolation and recovery.
//!
//! Each model version has an independent circuit: CLOSED while serving,
//! OPEN after the failure policy trips (the version is deactivated and
//! its sandbox destroyed), HALF_OPEN after the cooldown expires (the
//! version is re-activated for probe traffic). Enough consecutive
//! successes in HALF_OPEN close the circuit; a single failure reopens
//! it.
//!
//! Disablement is deterministic and reversible. Circuit state is
//! orthogonal to concurrency pressure: admission rejections never feed
//! the breaker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::descriptor::{HealthStatus, LoadState, VersionKey};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::loader::ModelLoader;
use crate::registry::{ModelRegistry, RegistryEventKind};
use crate::versioning::ServabilityGate;

/// Bounded failure history kept per version.
const FAILURE_RING_CAPACITY: usize = 32;

/// Per-version circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Classified failure kinds consumed by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ExecutionError,
    Timeout,
    Oom,
    UnhealthyTransition,
}

impl FailureKind {
    /// Map an execution error code to the failure kind the breaker
    /// counts, if any. Caller-side errors (invalid input, cancellation)
    /// do not count against the model.
    #[must_use]
    pub fn from_error_code(code: ErrorCode) -> Option<Self> {
        match code {
            ErrorCode::ExecPreprocessTimeout
            | ErrorCode::ExecInferenceTimeout
            | ErrorCode::ExecPostprocessTimeout => Some(Self::Timeout),
            ErrorCode::ExecOutOfMemory => Some(Self::Oom),
            ErrorCode::ExecPreprocessFailed
            | ErrorCode::ExecInferenceFailed
            | ErrorCode::ExecPostprocessFailed
            | ErrorCode::ExecInvalidOutput
            | ErrorCode::ExecGenericError => Some(Self::ExecutionError),
            _ => None,
        }
    }
}

/// Timestamped failure entry in the per-version ring.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

/// Thresholds and cooldowns controlling the breaker.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    /// Consecutive counted failures that trip CLOSED -> OPEN.
    pub failure_threshold: u32,
    /// UNHEALTHY transitions that trip the circuit.
    pub unhealthy_threshold: u32,
    /// Time in OPEN before automatically moving to HALF_OPEN.
    pub cooldown: Duration,
    /// Successes in HALF_OPEN required to close the circuit.
    pub half_open_successes: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            unhealthy_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_successes: 3,
        }
    }
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    unhealthy_transitions: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    records: VecDeque<FailureRecord>,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            unhealthy_transitions: 0,
            half_open_successes: 0,
            opened_at: None,
            records: VecDeque::with_capacity(FAILURE_RING_CAPACITY),
        }
    }
}

impl CircuitEntry {
    fn push_record(&mut self, record: FailureRecord) {
        if self.records.len() == FAILURE_RING_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
    }
}

/// Tracks failure patterns per version and decides disablement.
pub struct CircuitBreaker {
    policy: FailurePolicy,
    circuits: Mutex<HashMap<VersionKey, CircuitEntry>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Current circuit state. Versions with no recorded activity are
    /// CLOSED.
    #[must_use]
    pub fn state(&self, key: &VersionKey) -> CircuitState {
        self.circuits
            .lock()
            .get(key)
            .map_or(CircuitState::Closed, |entry| entry.state)
    }

    /// Record a successful execution. Returns true when this success
    /// closed a HALF_OPEN circuit.
    pub fn record_success(&self, key: &VersionKey) -> bool {
        let mut circuits = self.circuits.lock();
        let entry = circuits.entry(key.clone()).or_default();
        entry.consecutive_failures = 0;
        if entry.state == CircuitState::HalfOpen {
            entry.half_open_successes += 1;
            if entry.half_open_successes >= self.policy.half_open_successes {
                entry.state = CircuitState::Closed;
                entry.opened_at = None;
                entry.unhealthy_transitions = 0;
                info!(version = %key, "circuit closed after half-open probes");
                return true;
            }
        }
        false
    }

    /// Record a counted execution failure. Returns true when the circuit
    /// tripped to OPEN and the version must be deactivated.
    pub fn record_failure(
        &self,
        key: &VersionKey,
        kind: FailureKind,
        error_code: Option<ErrorCode>,
    ) -> bool {
        let mut circuits = self.circuits.lock();
        let entry = circuits.entry(key.clone()).or_default();
        entry.push_record(FailureRecord {
            kind,
            error_code,
            timestamp: Utc::now(),
        });

        match entry.state {
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                // One failed probe reopens immediately.
                entry.open();
                warn!(version = %key, "half-open probe failed, circuit reopened");
                true
            }
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.policy.failure_threshold {
                    entry.open();
                    warn!(
                        version = %key,
                        failures = entry.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a health transition to UNHEALTHY. Returns true when the
    /// transition count tripped the circuit.
    pub fn record_unhealthy_transition(&self, key: &VersionKey) -> bool {
        let mut circuits = self.circuits.lock();
        let entry = circuits.entry(key.clone()).or_default();
        entry.push_record(FailureRecord {
            kind: FailureKind::UnhealthyTransition,
            error_code: None,
            timestamp: Utc::now(),
        });
        if entry.state != CircuitState::Closed {
            return false;
        }
        entry.unhealthy_transitions += 1;
        if entry.unhealthy_transitions >= self.policy.unhealthy_threshold {
            entry.open();
            warn!(
                version = %key,
                transitions = entry.unhealthy_transitions,
                "unhealthy threshold reached, circuit opened"
            );
            true
        } else {
            false
        }
    }

    /// Move OPEN circuits whose cooldown has expired to HALF_OPEN and
    /// return them for re-activation.
    #[must_use]
    pub fn due_for_half_open(&self) -> Vec<VersionKey> {
        let mut circuits = self.circuits.lock();
        let mut due = Vec::new();
        for (key, entry) in circuits.iter_mut() {
            if entry.state == CircuitState::Open {
                let expired = entry
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.policy.cooldown);
                if expired {
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_successes = 0;
                    entry.consecutive_failures = 0;
                    due.push(key.clone());
                }
            }
        }
        due
    }

    /// Reset a version's circuit to CLOSED with empty counters. Used by
    /// explicit operator re-enable.
    pub fn reset(&self, key: &VersionKey) {
        self.circuits.lock().remove(key);
    }

    /// Force a circuit back to OPEN (failed re-activation); the cooldown
    /// restarts.
    pub fn reopen(&self, key: &VersionKey) {
        let mut circuits = self.circuits.lock();
        circuits.entry(key.clone()).or_default().open();
    }

    /// Failure history snapshot for diagnostics.
    #[must_use]
    pub fn failure_records(&self, key: &VersionKey) -> Vec<FailureRecord> {
        self.circuits
            .lock()
            .get(key)
            .map(|entry| entry.records.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl ServabilityGate for CircuitBreaker {
    fn is_blocked(&self, key: &VersionKey) -> bool {
        self.state(key) == CircuitState::Open
    }
}

// ============================================================================
// Recovery manager
// ============================================================================

/// Coordinates disablement and re-enable around the breaker.
///
/// Health events arrive from a registry subscription through a bounded
/// channel (registry callbacks must not re-enter the registry), and a
/// periodic sweep re-activates versions whose cooldown expired.
pub struct RecoveryManager {
    breaker: Arc<CircuitBreaker>,
    registry: Arc<ModelRegistry>,
    coordinator: Arc<Coordinator>,
    loader: Arc<ModelLoader>,
}

impl RecoveryManager {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        registry: Arc<ModelRegistry>,
        coordinator: Arc<Coordinator>,
        loader: Arc<ModelLoader>,
    ) -> Self {
        Self {
            breaker,
            registry,
            coordinator,
            loader,
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Deactivate a tripped version: destroy its sandbox and move it to
    /// DISABLED. In-flight requests drain; new admissions are refused.
    pub fn disable_version(&self, key: &VersionKey, reason: &str) {
        info!(version = %key, reason, "disabling version");
        if let Err(e) = self
            .coordinator
            .deactivate(key, LoadState::Disabled, Some(reason))
        {
            error!(version = %key, error = %e, "deactivation failed");
        }
    }

    /// Explicit operator re-enable: reset the circuit, re-load, and
    /// re-activate.
    pub async fn re_enable(&self, key: &VersionKey) -> Result<()> {
        self.breaker.reset(key);
        self.reactivate(key).await
    }

    /// One pass of the cooldown sweep: every OPEN circuit past its
    /// cooldown moves to HALF_OPEN and gets re-activated for probes.
    pub async fn sweep_cooldowns(&self) {
        for key in self.breaker.due_for_half_open() {
            info!(version = %key, "cooldown expired, re-activating for half-open probes");
            if let Err(e) = self.reactivate(&key).await {
                warn!(version = %key, error = %e, "re-activation failed, reopening circuit");
                self.breaker.reopen(&key);
            }
        }
    }

    async fn reactivate(&self, key: &VersionKey) -> Result<()> {
        let snapshot = self.registry.get_version(key).ok_or_else(|| {
            RuntimeError::new(
                ErrorCode::PipeVersionNotFound,
                format!("version {key} is not registered"),
            )
        })?;

        if snapshot.state != LoadState::Disabled {
            return Err(RuntimeError::new(
                ErrorCode::ExecModelNotReady,
                format!("version {key} is not disabled (state {})", snapshot.state),
            ));
        }

        let loaded = self.loader.load(Arc::clone(&snapshot.descriptor)).await?;
        self.coordinator.activate(loaded)?;
        Ok(())
    }

    /// Drive recovery in the background: react to UNHEALTHY transitions
    /// and sweep cooldowns. The subscription is installed here; the
    /// returned task runs until aborted.
    pub fn start(self: &Arc<Self>, sweep_interval: Duration) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<VersionKey>(256);
        self.registry.subscribe(move |event| {
            if event.kind == RegistryEventKind::HealthChanged
                && event.health == HealthStatus::Unhealthy
            {
                // Bounded and non-blocking; a full queue drops the
                // notification and the next sweep or event catches up.
                let _ = tx.try_send(event.key.clone());
            }
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    maybe_key = rx.recv() => {
                        let Some(key) = maybe_key else { break };
                        if manager.breaker.record_unhealthy_transition(&key) {
                            manager.disable_version(&key, "unhealthy transition threshold exceeded");
                        }
                    }
                    _ = ticker.tick() => {
                        manager.sweep_cooldowns().await;
                    }
                }
            }
        })
    }
}
