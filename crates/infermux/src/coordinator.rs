//! Lifecycle coordination.
//!
//! The registry and the sandbox set have separate locks; mutating them
//! independently can strand a READY version without a sandbox or leave a
//! sandbox behind for a disabled version. The coordinator is the single
//! serialization point for changes that touch both, keeping one
//! invariant: a version is READY if and only if a sandbox exists for it.
//!
//! Lock order is fixed: the coordinator's own lock, then the registry
//! write lock, then the sandbox map, then the concurrency manager.
//! Nothing acquires them in reverse.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::concurrency::ConcurrencyManager;
use crate::descriptor::{HealthStatus, LoadState, VersionKey};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::loader::LoadedModel;
use crate::registry::ModelRegistry;
use crate::sandbox::{ExecutionSandbox, SandboxManager};

/// Atomic activation and deactivation of model versions.
pub struct Coordinator {
    registry: Arc<ModelRegistry>,
    sandboxes: Arc<SandboxManager>,
    concurrency: Arc<ConcurrencyManager>,
    // Serializes activate/deactivate pairs; see module docs for order.
    lifecycle: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        sandboxes: Arc<SandboxManager>,
        concurrency: Arc<ConcurrencyManager>,
    ) -> Self {
        Self {
            registry,
            sandboxes,
            concurrency,
            lifecycle: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    /// Activate a loaded version: create its sandbox, register
    /// concurrency limits, and transition the registry to READY (from
    /// LOADING, or from DISABLED on the re-enable path). On any failure
    /// no sandbox remains and the state is untouched.
    pub fn activate(&self, loaded: LoadedModel) -> Result<()> {
        let key = loaded.descriptor.key();
        let max_concurrent = loaded.descriptor.limits.max_concurrent_inferences;
        let _guard = self.lifecycle.lock();

        let snapshot = self.registry.get_version(&key).ok_or_else(|| {
            RuntimeError::new(
                ErrorCode::PipeVersionNotFound,
                format!("cannot activate unregistered version {key}"),
            )
        })?;
        if !snapshot.state.can_transition_to(LoadState::Ready) {
            return Err(RuntimeError::new(
                ErrorCode::ExecModelNotReady,
                format!("cannot activate {key} from state {}", snapshot.state),
            ));
        }

        let sandbox = ExecutionSandbox::new(loaded, Arc::clone(&self.registry));
        self.sandboxes.insert(sandbox)?;

        if let Err(e) = self
            .registry
            .update_state(&key, LoadState::Ready, None, None)
        {
            // Roll back so no sandbox exists for a non-READY version.
            self.sandboxes.remove(&key);
            return Err(RuntimeError::new(
                ErrorCode::ExecModelNotReady,
                format!("activation state transition failed for {key}"),
            )
            .with_cause(e));
        }

        self.concurrency
            .register_version(&key, max_concurrent, None);

        // A freshly activated version served its warmup; it starts
        // healthy until the execution window says otherwise.
        if let Err(e) = self.registry.update_health(&key, HealthStatus::Healthy) {
            warn!(version = %key, error = %e, "could not reset health on activation");
        }

        info!(version = %key, "version activated");
        Ok(())
    }

    /// Deactivate a version: destroy its sandbox, drop its concurrency
    /// limits, and transition the registry to `new_state` (DISABLED,
    /// FAILED, or UNLOADING). In-flight requests drain on their own; new
    /// admissions are refused as soon as the state leaves READY.
    pub fn deactivate(
        &self,
        key: &VersionKey,
        new_state: LoadState,
        reason: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lifecycle.lock();

        let snapshot = self.registry.get_version(key).ok_or_else(|| {
            RuntimeError::new(
                ErrorCode::PipeVersionNotFound,
                format!("cannot deactivate unregistered version {key}"),
            )
        })?;
        if !snapshot.state.can_transition_to(new_state) {
            return Err(RuntimeError::new(
                ErrorCode::ExecModelNotReady,
                format!(
                    "cannot deactivate {key}: {} -> {new_state} is not allowed",
                    snapshot.state
                ),
            ));
        }

        self.registry
            .update_state(key, new_state, None, reason)
            .map_err(|e| {
                RuntimeError::new(
                    ErrorCode::ExecModelNotReady,
                    format!("deactivation state transition failed for {key}"),
                )
                .with_cause(e)
            })?;

        self.sandboxes.remove(key);
        self.concurrency.unregister_version(key);

        info!(version = %key, state = %new_state, "version deactivated");
        Ok(())
    }

    /// Sandbox for a READY version, when the invariant holds.
    #[must_use]
    pub fn get_ready_sandbox(&self, key: &VersionKey) -> Option<Arc<ExecutionSandbox>> {
        self.sandboxes.get(key)
    }
}
