//! Ready/exec/result handshake across the isolation boundary
//!
//! A fresh context announces `ready`; the host answers with the code and the
//! invocation's token; the context answers with a `result` carrying the same
//! token. Everything else reaching the host mailbox is noise: signals from a
//! context other than the one created for this invocation, results before the
//! code was sent, and results carrying any other token.

use crate::sandbox::ContextId;
use crate::token::CorrelationToken;
use serde::{Deserialize, Serialize};

pub const TIMED_OUT_MESSAGE: &str = "timed out";
pub const CANCELLED_MESSAGE: &str = "execution cancelled";
pub const CONTEXT_EXITED_MESSAGE: &str = "execution context exited unexpectedly";

/// Terminal outcome of one invocation. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ok: bool,
    pub value: String,
}

impl ExecutionResult {
    pub fn success(value: impl Into<String>) -> Self {
        Self {
            ok: true,
            value: value.into(),
        }
    }

    pub fn failure(value: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: value.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::failure(TIMED_OUT_MESSAGE)
    }

    pub fn cancelled() -> Self {
        Self::failure(CANCELLED_MESSAGE)
    }

    pub fn context_exited(detail: &str) -> Self {
        if detail.is_empty() {
            Self::failure(CONTEXT_EXITED_MESSAGE)
        } else {
            Self::failure(format!("{}: {}", CONTEXT_EXITED_MESSAGE, detail))
        }
    }
}

/// Host to context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Exec {
        token: CorrelationToken,
        code: String,
    },
}

/// Context to host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    Ready,
    Result {
        token: CorrelationToken,
        ok: bool,
        #[serde(default)]
        value: String,
    },
}

/// What a launcher forwards into the manager's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Message(GuestMessage),
    /// The context's output stream ended; `detail` is its recent stderr.
    Closed { detail: String },
}

/// An inbound event tagged with the context it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub source: ContextId,
    pub event: SignalEvent,
}

impl Signal {
    pub fn message(source: ContextId, message: GuestMessage) -> Self {
        Self {
            source,
            event: SignalEvent::Message(message),
        }
    }

    pub fn closed(source: ContextId, detail: impl Into<String>) -> Self {
        Self {
            source,
            event: SignalEvent::Closed {
                detail: detail.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingReady,
    AwaitingResult,
    Done,
}

/// What the caller must do after feeding a signal to the [`Correlator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Ignore,
    /// The context is ready: send the code and token now.
    SendCode,
    Complete(ExecutionResult),
}

/// Per-invocation state machine matching inbound signals to one context and
/// one token.
#[derive(Debug)]
pub struct Correlator {
    context: ContextId,
    token: CorrelationToken,
    phase: Phase,
}

impl Correlator {
    pub fn new(context: ContextId, token: CorrelationToken) -> Self {
        Self {
            context,
            token,
            phase: Phase::AwaitingReady,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn observe(&mut self, signal: &Signal) -> Step {
        if self.phase == Phase::Done {
            return Step::Ignore;
        }
        if signal.source != self.context {
            tracing::debug!(
                expected = %self.context,
                source = %signal.source,
                "dropping signal from foreign context"
            );
            return Step::Ignore;
        }

        match (self.phase, &signal.event) {
            (Phase::AwaitingReady, SignalEvent::Message(GuestMessage::Ready)) => {
                self.phase = Phase::AwaitingResult;
                Step::SendCode
            }
            (Phase::AwaitingResult, SignalEvent::Message(GuestMessage::Result { token, ok, value }))
                if *token == self.token =>
            {
                self.phase = Phase::Done;
                Step::Complete(ExecutionResult {
                    ok: *ok,
                    value: value.clone(),
                })
            }
            (_, SignalEvent::Closed { detail }) => {
                self.phase = Phase::Done;
                Step::Complete(ExecutionResult::context_exited(detail))
            }
            (phase, SignalEvent::Message(message)) => {
                tracing::debug!(?phase, ?message, "dropping out-of-order or mismatched signal");
                Step::Ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn result(token: &str, value: &str) -> GuestMessage {
        GuestMessage::Result {
            token: CorrelationToken::from(token),
            ok: true,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_happy_path() {
        let ctx = ContextId::new(1);
        let mut correlator = Correlator::new(ctx, CorrelationToken::from("t1"));
        assert_eq!(correlator.phase(), Phase::AwaitingReady);
        assert_eq!(
            correlator.observe(&Signal::message(ctx, GuestMessage::Ready)),
            Step::SendCode
        );
        assert_eq!(correlator.phase(), Phase::AwaitingResult);
        assert_eq!(
            correlator.observe(&Signal::message(ctx, result("t1", "42"))),
            Step::Complete(ExecutionResult::success("42"))
        );
        assert_eq!(correlator.phase(), Phase::Done);
    }

    #[test]
    fn test_result_before_ready_is_noise() {
        let ctx = ContextId::new(1);
        let mut correlator = Correlator::new(ctx, CorrelationToken::from("t1"));
        assert_eq!(
            correlator.observe(&Signal::message(ctx, result("t1", "early"))),
            Step::Ignore
        );
        assert_eq!(correlator.phase(), Phase::AwaitingReady);
    }

    #[test]
    fn test_mismatched_token_and_foreign_source_are_dropped() {
        let ctx = ContextId::new(7);
        let mut correlator = Correlator::new(ctx, CorrelationToken::from("good"));
        correlator.observe(&Signal::message(ctx, GuestMessage::Ready));

        assert_eq!(
            correlator.observe(&Signal::message(ctx, result("forged", "x"))),
            Step::Ignore
        );
        assert_eq!(
            correlator.observe(&Signal::message(ContextId::new(6), result("good", "stale"))),
            Step::Ignore
        );
        assert_eq!(
            correlator.observe(&Signal::closed(ContextId::new(6), "old context died")),
            Step::Ignore
        );
        assert_eq!(correlator.phase(), Phase::AwaitingResult);
        assert_eq!(
            correlator.observe(&Signal::message(ctx, result("good", "real"))),
            Step::Complete(ExecutionResult::success("real"))
        );
    }

    #[test]
    fn test_duplicate_ready_is_ignored() {
        let ctx = ContextId::new(2);
        let mut correlator = Correlator::new(ctx, CorrelationToken::from("t"));
        assert_eq!(
            correlator.observe(&Signal::message(ctx, GuestMessage::Ready)),
            Step::SendCode
        );
        assert_eq!(
            correlator.observe(&Signal::message(ctx, GuestMessage::Ready)),
            Step::Ignore
        );
    }

    #[test]
    fn test_close_completes_with_failure() {
        let ctx = ContextId::new(3);
        let mut correlator = Correlator::new(ctx, CorrelationToken::from("t"));
        let step = correlator.observe(&Signal::closed(ctx, "SyntaxError: bad"));
        assert_eq!(
            step,
            Step::Complete(ExecutionResult::failure(
                "execution context exited unexpectedly: SyntaxError: bad"
            ))
        );
    }

    #[test]
    fn test_nothing_after_done() {
        let ctx = ContextId::new(4);
        let mut correlator = Correlator::new(ctx, CorrelationToken::from("t"));
        correlator.observe(&Signal::message(ctx, GuestMessage::Ready));
        correlator.observe(&Signal::message(ctx, result("t", "first")));
        assert_eq!(correlator.phase(), Phase::Done);
        assert_eq!(
            correlator.observe(&Signal::message(ctx, result("t", "second"))),
            Step::Ignore
        );
        assert_eq!(
            correlator.observe(&Signal::closed(ctx, "")),
            Step::Ignore
        );
    }

    #[test]
    fn test_wire_format() {
        let exec = HostMessage::Exec {
            token: CorrelationToken::from("abc"),
            code: "return 1".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&exec).unwrap(),
            r#"{"type":"exec","token":"abc","code":"return 1"}"#
        );

        let ready: GuestMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready, GuestMessage::Ready);

        let done: GuestMessage =
            serde_json::from_str(r#"{"type":"result","token":"abc","ok":false,"value":"boom"}"#)
                .unwrap();
        assert_eq!(
            done,
            GuestMessage::Result {
                token: CorrelationToken::from("abc"),
                ok: false,
                value: "boom".to_string()
            }
        );
    }
}
