//! Scripted in-process contexts for exercising the supervisor without a
//! real interpreter.

#![allow(dead_code)]

use async_trait::async_trait;
use sandcell::protocol::{GuestMessage, HostMessage, Signal};
use sandcell::sandbox::{ContextHost, ContextId, ContextLauncher, SandboxConfig, SignalSender};
use sandcell::token::CorrelationToken;
use sandcell::{EngineError, EngineResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How one launched context behaves.
#[derive(Debug, Clone)]
pub enum Script {
    /// Ready at once; answers with the code as the value.
    Echo,
    /// Ready at once; answers with a failure carrying this message.
    Fail(String),
    /// Ready at once; never answers.
    Hang,
    /// Never announces ready.
    NeverReady,
    /// Ready at once; answers with a wrong token, then with the right token
    /// from a context that is not this one. Never answers properly.
    Forge,
    /// Ready at once; exits with this stderr detail once code arrives.
    Crash(String),
    /// Launch itself fails.
    FailLaunch,
}

#[derive(Default)]
pub struct Recorder {
    pub launched: AtomicUsize,
    pub terminated: AtomicUsize,
    pub delivered: Mutex<Vec<(ContextId, HostMessage)>>,
    pub senders: Mutex<Vec<(ContextId, SignalSender)>>,
}

impl Recorder {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    /// Context id and token of the `index`th delivered exec.
    pub fn exec(&self, index: usize) -> (ContextId, CorrelationToken) {
        let delivered = self.delivered.lock().unwrap();
        let (id, HostMessage::Exec { token, .. }) = &delivered[index];
        (*id, token.clone())
    }

    /// Mailbox sender handed to the `index`th launched context.
    pub fn sender(&self, index: usize) -> SignalSender {
        self.senders.lock().unwrap()[index].1.clone()
    }
}

pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    pub recorder: Arc<Recorder>,
}

impl ScriptedLauncher {
    pub fn new(fallback: Script) -> Self {
        Self::with_scripts(Vec::new(), fallback)
    }

    /// Contexts follow `scripts` in launch order, then `fallback`.
    pub fn with_scripts(scripts: Vec<Script>, fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            recorder: Arc::new(Recorder::default()),
        }
    }
}

#[async_trait]
impl ContextLauncher for ScriptedLauncher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn launch(
        &self,
        id: ContextId,
        _config: &SandboxConfig,
        signals: SignalSender,
    ) -> EngineResult<Box<dyn ContextHost>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Script::FailLaunch = script {
            return Err(EngineError::Launch("scripted launch failure".to_string()));
        }

        self.recorder.launched.fetch_add(1, Ordering::SeqCst);
        self.recorder.senders.lock().unwrap().push((id, signals.clone()));
        if !matches!(script, Script::NeverReady) {
            let _ = signals.send(Signal::message(id, GuestMessage::Ready));
        }
        Ok(Box::new(ScriptedHost {
            id,
            script,
            signals,
            recorder: Arc::clone(&self.recorder),
            terminated: false,
        }))
    }
}

struct ScriptedHost {
    id: ContextId,
    script: Script,
    signals: SignalSender,
    recorder: Arc<Recorder>,
    terminated: bool,
}

impl ScriptedHost {
    fn reply(&self, source: ContextId, token: CorrelationToken, ok: bool, value: &str) {
        let _ = self.signals.send(Signal::message(
            source,
            GuestMessage::Result {
                token,
                ok,
                value: value.to_string(),
            },
        ));
    }
}

#[async_trait]
impl ContextHost for ScriptedHost {
    async fn deliver(&mut self, message: &HostMessage) -> EngineResult<()> {
        self.recorder
            .delivered
            .lock()
            .unwrap()
            .push((self.id, message.clone()));
        let HostMessage::Exec { token, code } = message;
        match &self.script {
            Script::Echo => self.reply(self.id, token.clone(), true, code),
            Script::Fail(reason) => self.reply(self.id, token.clone(), false, reason),
            Script::Forge => {
                self.reply(self.id, CorrelationToken::from("forged"), true, "forged");
                let foreign = ContextId::new(self.id.get() + 1000);
                self.reply(foreign, token.clone(), true, "foreign");
            }
            Script::Crash(detail) => {
                let _ = self.signals.send(Signal::closed(self.id, detail.clone()));
            }
            Script::Hang | Script::NeverReady | Script::FailLaunch => {}
        }
        Ok(())
    }

    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.recorder.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
