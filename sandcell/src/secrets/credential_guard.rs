//! Credential substitution for generated code
//!
//! Generated code refers to a secret through a fixed placeholder. Before the
//! code is run, the guard swaps every placeholder occurrence for the escaped
//! credential cached for the code's origin. When no credential is cached the
//! guard parks the code in a single pending slot and tells its listener, so the
//! caller can prompt the user and hand the value back through `resolve`.
//!
//! The cache lives in memory for the lifetime of the guard and is never
//! written anywhere.

use crate::error::{EngineError, EngineResult};
use crate::secrets::escaping::escape_for_literal;
use crate::secrets::origin::extract_origin;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_PLACEHOLDER: &str = "YOUR_API_KEY";

/// Code waiting for a credential the guard could not supply itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCredentialRequest {
    pub code: String,
    pub origin: String,
}

/// Outcome of [`CredentialGuard::substitute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    /// Code is ready to run, with any placeholder already replaced.
    Ready(String),
    /// A credential for `origin` must be obtained out of band.
    NeedsInput { origin: String },
}

/// Notified whenever the guard parks code waiting for a credential.
pub trait CredentialListener: Send + Sync {
    fn credential_needed(&self, request: &PendingCredentialRequest);
}

impl CredentialListener for mpsc::UnboundedSender<PendingCredentialRequest> {
    fn credential_needed(&self, request: &PendingCredentialRequest) {
        if self.send(request.clone()).is_err() {
            log::debug!(
                "credential listener channel closed; request for {} not delivered",
                request.origin
            );
        }
    }
}

pub struct CredentialGuard {
    placeholder: String,
    cache: HashMap<String, String>,
    pending: Option<PendingCredentialRequest>,
    listener: Option<Arc<dyn CredentialListener>>,
}

impl Default for CredentialGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialGuard {
    pub fn new() -> Self {
        Self::with_placeholder(DEFAULT_PLACEHOLDER)
    }

    pub fn with_placeholder(placeholder: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
            cache: HashMap::new(),
            pending: None,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn CredentialListener>) {
        self.listener = Some(listener);
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Prepare `code` for execution.
    ///
    /// Code without the placeholder comes back unchanged. Code whose origin
    /// has a cached credential comes back substituted. Otherwise the code is
    /// parked and `NeedsInput` names the origin; if another request is already
    /// parked, the call is rejected and the existing request is kept.
    pub fn substitute(&mut self, code: &str) -> EngineResult<Substitution> {
        if self.placeholder.is_empty() || !code.contains(&self.placeholder) {
            return Ok(Substitution::Ready(code.to_string()));
        }

        let origin = extract_origin(code);
        if let Some(secret) = self.cache.get(&origin) {
            log::debug!("substituting cached credential for {}", origin);
            return Ok(Substitution::Ready(self.inject(code, secret)));
        }

        if let Some(pending) = &self.pending {
            log::warn!(
                "credential for {} requested while {} is still pending",
                origin,
                pending.origin
            );
            return Err(EngineError::CredentialPending {
                origin: pending.origin.clone(),
            });
        }

        let request = PendingCredentialRequest {
            code: code.to_string(),
            origin: origin.clone(),
        };
        log::info!("credential needed for {}", origin);
        if let Some(listener) = &self.listener {
            listener.credential_needed(&request);
        }
        self.pending = Some(request);
        Ok(Substitution::NeedsInput { origin })
    }

    /// Complete the pending request with `value`.
    ///
    /// Returns None, changing nothing, when no request is pending or `value`
    /// is empty. Otherwise caches `value` under the pending origin, clears the
    /// slot and returns the substituted code.
    pub fn resolve(&mut self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let request = self.pending.take()?;
        let code = self.inject(&request.code, value);
        log::info!("caching credential for {}", request.origin);
        self.cache.insert(request.origin, value.to_string());
        Some(code)
    }

    /// Drop the pending request without caching anything.
    pub fn dismiss(&mut self) -> Option<PendingCredentialRequest> {
        let dismissed = self.pending.take();
        if let Some(request) = &dismissed {
            log::info!("credential request for {} dismissed", request.origin);
        }
        dismissed
    }

    pub fn pending(&self) -> Option<&PendingCredentialRequest> {
        self.pending.as_ref()
    }

    pub fn has_credential(&self, origin: &str) -> bool {
        self.cache.contains_key(origin)
    }

    pub fn cached_origins(&self) -> Vec<&str> {
        self.cache.keys().map(|s| s.as_str()).collect()
    }

    fn inject(&self, code: &str, secret: &str) -> String {
        code.replace(&self.placeholder, &escape_for_literal(secret))
    }
}

impl fmt::Debug for CredentialGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialGuard")
            .field("placeholder", &self.placeholder)
            .field("cached_origins", &self.cached_origins())
            .field("pending", &self.pending.as_ref().map(|p| &p.origin))
            .finish_non_exhaustive()
    }
}
