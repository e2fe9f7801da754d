//! sandcell - isolated execution engine for model-generated code
//!
//! Generated source text passes through the [`secrets::CredentialGuard`], which
//! resolves a credential placeholder from a per-origin cache (or asks the caller
//! for one), and is then handed to the [`supervisor::RunSupervisor`]. The
//! supervisor owns the single in-flight run: it creates a disposable context via
//! the [`sandbox::ExecutionContextManager`], carries the ready/exec/result
//! handshake from [`protocol`], and enforces the timeout and cancellation.
//!
//! [`engine::Engine`] bundles both halves behind the surface a chat front end
//! needs: `substitute`, `resolve`, `run`, `cancel` and `is_running`.

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod sandbox;
pub mod secrets;
pub mod supervisor;
pub mod token;

pub use config::EngineConfig;
pub use engine::{Engine, Submission};
pub use error::{EngineError, EngineResult};
pub use protocol::ExecutionResult;
pub use secrets::{CredentialGuard, CredentialListener, PendingCredentialRequest, Substitution};
pub use supervisor::RunSupervisor;
pub use token::{CorrelationToken, TokenSource};
