use crate::error::{EngineError, EngineResult};
use crate::protocol::{HostMessage, Signal};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::{ContextHost, ContextId, ContextLauncher, ContextState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct LiveContext {
    id: ContextId,
    state: ContextState,
    host: Box<dyn ContextHost>,
}

/// Owns at most one live execution context and the mailbox every context
/// reports into.
pub struct ExecutionContextManager {
    launcher: Arc<dyn ContextLauncher>,
    config: SandboxConfig,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    current: Option<LiveContext>,
    next_id: u64,
}

impl ExecutionContextManager {
    pub fn new(launcher: Arc<dyn ContextLauncher>, config: SandboxConfig) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            launcher,
            config,
            signals_tx,
            signals_rx,
            current: None,
            next_id: 1,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Launch a fresh context, tearing down any context left behind first.
    pub async fn create(&mut self) -> EngineResult<ContextId> {
        if let Some(stale) = self.current.as_ref() {
            warn!(context_id = %stale.id, "destroying leftover context before create");
            self.destroy();
        }

        let mut discarded = 0usize;
        while self.signals_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "discarded stale signals from earlier contexts");
        }

        let id = ContextId::new(self.next_id);
        self.next_id += 1;
        debug!(context_id = %id, launcher = self.launcher.name(), "creating context");

        let host = self
            .launcher
            .launch(id, &self.config, self.signals_tx.clone())
            .await?;
        self.current = Some(LiveContext {
            id,
            state: ContextState::Creating,
            host,
        });
        info!(context_id = %id, "context created");
        Ok(id)
    }

    /// Tear down the live context, if any. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(mut context) = self.current.take() {
            context.host.terminate();
            debug!(
                context_id = %context.id,
                state = ?context.state,
                "context torn down"
            );
        }
    }

    pub fn mark_ready(&mut self, id: ContextId) {
        if let Some(context) = self.live_mut(id) {
            context.state = ContextState::Ready;
        }
    }

    /// Send `message` to context `id`, which must be the live context.
    pub async fn deliver(&mut self, id: ContextId, message: &HostMessage) -> EngineResult<()> {
        let context = self.live_mut(id).ok_or_else(|| {
            EngineError::Channel(format!("context {} is no longer live", id))
        })?;
        context.host.deliver(message).await?;
        context.state = ContextState::Executing;
        Ok(())
    }

    /// Next signal from any context. Stale and foreign signals are returned
    /// too; filtering them is the caller's job.
    pub async fn next_signal(&mut self) -> Option<Signal> {
        self.signals_rx.recv().await
    }

    pub fn current_id(&self) -> Option<ContextId> {
        self.current.as_ref().map(|c| c.id)
    }

    pub fn state(&self) -> Option<ContextState> {
        self.current.as_ref().map(|c| c.state)
    }

    fn live_mut(&mut self, id: ContextId) -> Option<&mut LiveContext> {
        self.current.as_mut().filter(|c| c.id == id)
    }
}

impl Drop for ExecutionContextManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
