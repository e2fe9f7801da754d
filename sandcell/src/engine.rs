//! Engine facade handed to the chat front end

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::protocol::ExecutionResult;
use crate::sandbox::{BubblewrapSandbox, ContextLauncher, ExecutionContextManager};
use crate::secrets::{CredentialGuard, CredentialListener, PendingCredentialRequest, Substitution};
use crate::supervisor::RunSupervisor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of [`Engine::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Completed(ExecutionResult),
    /// Nothing ran; supply a credential for `origin` through [`Engine::resolve`].
    NeedsCredential { origin: String },
}

/// Credential guard plus run supervisor, each single-slot.
///
/// Methods take `&self`; share the engine behind an `Arc` to cancel a run
/// from another task.
pub struct Engine {
    guard: Mutex<CredentialGuard>,
    supervisor: RunSupervisor,
}

impl Engine {
    /// Engine running contexts through bubblewrap (or unjailed, per config).
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self::with_launcher(config, Arc::new(BubblewrapSandbox::new())))
    }

    pub fn with_launcher(config: &EngineConfig, launcher: Arc<dyn ContextLauncher>) -> Self {
        let contexts = ExecutionContextManager::new(launcher, config.sandbox.clone());
        Self {
            guard: Mutex::new(CredentialGuard::with_placeholder(config.placeholder.clone())),
            supervisor: RunSupervisor::new(contexts, config.timeout()),
        }
    }

    /// Register the "credential needed for origin X" notification point.
    pub fn set_credential_listener(&self, listener: Arc<dyn CredentialListener>) {
        self.guard().set_listener(listener);
    }

    pub fn substitute(&self, code: &str) -> EngineResult<Substitution> {
        self.guard().substitute(code)
    }

    pub fn resolve(&self, value: &str) -> Option<String> {
        self.guard().resolve(value)
    }

    pub fn dismiss_credential(&self) -> Option<PendingCredentialRequest> {
        self.guard().dismiss()
    }

    pub fn pending_credential(&self) -> Option<PendingCredentialRequest> {
        self.guard().pending().cloned()
    }

    pub fn has_credential(&self, origin: &str) -> bool {
        self.guard().has_credential(origin)
    }

    pub async fn run(&self, code: impl Into<String>) -> EngineResult<ExecutionResult> {
        self.supervisor.run(code).await
    }

    /// Substitute credentials, then run if nothing is missing.
    pub async fn submit(&self, code: &str) -> EngineResult<Submission> {
        let substitution = self.substitute(code)?;
        match substitution {
            Substitution::Ready(code) => Ok(Submission::Completed(self.run(code).await?)),
            Substitution::NeedsInput { origin } => Ok(Submission::NeedsCredential { origin }),
        }
    }

    pub fn cancel(&self) -> bool {
        self.supervisor.cancel()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    fn guard(&self) -> MutexGuard<'_, CredentialGuard> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
