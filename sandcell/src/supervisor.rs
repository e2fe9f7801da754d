//! Run supervisor
//!
//! Owns the single in-flight invocation. `run` creates a context, drives the
//! handshake and resolves exactly once, through whichever comes first of the
//! context's own result, the timeout, or `cancel`. The context is torn down on
//! every exit path, including when the caller drops the `run` future.
//!
//! A `run` issued while another is in flight is rejected with
//! [`EngineError::Busy`]; nothing is queued.

use crate::error::{EngineError, EngineResult};
use crate::protocol::{Correlator, ExecutionResult, HostMessage, Step};
use crate::sandbox::ExecutionContextManager;
use crate::token::{CorrelationToken, TokenSource};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One request to execute a code string.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub code: String,
    pub token: CorrelationToken,
    pub started_at: DateTime<Utc>,
    deadline: Instant,
}

struct ActiveRun {
    token: CorrelationToken,
    cancel: Option<oneshot::Sender<()>>,
}

pub struct RunSupervisor {
    contexts: tokio::sync::Mutex<ExecutionContextManager>,
    tokens: TokenSource,
    timeout: Duration,
    slot: Mutex<Option<ActiveRun>>,
}

impl RunSupervisor {
    pub fn new(contexts: ExecutionContextManager, timeout: Duration) -> Self {
        Self {
            contexts: tokio::sync::Mutex::new(contexts),
            tokens: TokenSource::new(),
            timeout,
            slot: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `code` in a fresh isolated context.
    ///
    /// The invocation starts when the returned future is first polled. Every
    /// outcome, including faults, timeout and cancellation, comes back as an
    /// [`ExecutionResult`]; the only error is [`EngineError::Busy`].
    pub async fn run(&self, code: impl Into<String>) -> EngineResult<ExecutionResult> {
        let (invocation, cancelled) = self.begin(code.into())?;
        let _slot = SlotRelease { slot: &self.slot };

        let mut contexts = Teardown(self.contexts.lock().await);
        let result = tokio::select! {
            biased;
            _ = cancelled => ExecutionResult::cancelled(),
            _ = tokio::time::sleep_until(invocation.deadline) => {
                warn!(token = invocation.token.short(), timeout_ms = self.timeout.as_millis() as u64, "run timed out");
                ExecutionResult::timed_out()
            }
            result = drive(&mut contexts.0, &invocation) => result,
        };
        drop(contexts);

        let elapsed_ms = (Utc::now() - invocation.started_at).num_milliseconds();
        info!(
            token = invocation.token.short(),
            ok = result.ok,
            elapsed_ms,
            "run finished"
        );
        Ok(result)
    }

    /// Abort the in-flight run, which resolves as cancelled. Returns whether a
    /// cancellation was delivered; with no run active this does nothing.
    pub fn cancel(&self) -> bool {
        let sender = self.slot().as_mut().and_then(|run| {
            debug!(token = run.token.short(), "cancel requested");
            run.cancel.take()
        });
        match sender {
            Some(sender) => sender.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    fn begin(&self, code: String) -> EngineResult<(Invocation, oneshot::Receiver<()>)> {
        let mut slot = self.slot();
        if let Some(active) = slot.as_ref() {
            warn!(active = active.token.short(), "rejecting run while another is in flight");
            return Err(EngineError::Busy);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let invocation = Invocation {
            code,
            token: self.tokens.issue(),
            started_at: Utc::now(),
            deadline: Instant::now() + self.timeout,
        };
        *slot = Some(ActiveRun {
            token: invocation.token.clone(),
            cancel: Some(cancel_tx),
        });
        debug!(token = invocation.token.short(), "run started");
        Ok((invocation, cancel_rx))
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the run slot however `run` exits.
struct SlotRelease<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Destroys the live context however `run` exits.
struct Teardown<'a>(tokio::sync::MutexGuard<'a, ExecutionContextManager>);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

async fn drive(contexts: &mut ExecutionContextManager, invocation: &Invocation) -> ExecutionResult {
    let context = match contexts.create().await {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "failed to create execution context");
            return ExecutionResult::failure(err.to_string());
        }
    };

    let mut correlator = Correlator::new(context, invocation.token.clone());
    loop {
        let Some(signal) = contexts.next_signal().await else {
            return ExecutionResult::failure("execution context mailbox closed");
        };
        match correlator.observe(&signal) {
            Step::Ignore => continue,
            Step::SendCode => {
                contexts.mark_ready(context);
                let message = HostMessage::Exec {
                    token: invocation.token.clone(),
                    code: invocation.code.clone(),
                };
                if let Err(err) = contexts.deliver(context, &message).await {
                    warn!(context_id = %context, error = %err, "failed to deliver code");
                    return ExecutionResult::failure(format!("failed to deliver code: {}", err));
                }
                debug!(context_id = %context, "code delivered");
            }
            Step::Complete(result) => return result,
        }
    }
}
