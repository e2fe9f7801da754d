//! Disposable execution contexts
//!
//! A [`ContextLauncher`] knows how to bring up one isolated context; the
//! [`ExecutionContextManager`] owns the single live context and the mailbox all
//! contexts report into.

pub mod bubblewrap;
pub mod config;
pub mod manager;

use crate::error::EngineResult;
use crate::protocol::{HostMessage, Signal};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

pub use bubblewrap::BubblewrapSandbox;
pub use config::{no_sandbox_requested, SandboxConfig, SandboxRuntimeType, SANDCELL_NO_SANDBOX};
pub use manager::ExecutionContextManager;

/// Identity of one launched context. Every signal a context emits carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Lifecycle of the live context. A torn-down context is no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Creating,
    Ready,
    Executing,
}

/// Sink a launched context reports into. Signals must be tagged with the id
/// the context was launched with.
pub type SignalSender = mpsc::UnboundedSender<Signal>;

/// Brings up isolated execution contexts.
#[async_trait]
pub trait ContextLauncher: Send + Sync {
    fn name(&self) -> &str;

    async fn launch(
        &self,
        id: ContextId,
        config: &SandboxConfig,
        signals: SignalSender,
    ) -> EngineResult<Box<dyn ContextHost>>;
}

/// Host-side handle to one running context.
#[async_trait]
pub trait ContextHost: Send {
    async fn deliver(&mut self, message: &HostMessage) -> EngineResult<()>;

    /// Stop the context and release its listeners. Must be idempotent and
    /// must not block.
    fn terminate(&mut self);
}
