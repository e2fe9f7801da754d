//! Credential placeholder resolution and injection-safe escaping

pub mod credential_guard;
pub mod escaping;
pub mod origin;

pub use credential_guard::{
    CredentialGuard, CredentialListener, PendingCredentialRequest, Substitution,
    DEFAULT_PLACEHOLDER,
};
pub use escaping::escape_for_literal;
pub use origin::{extract_origin, UNKNOWN_ORIGIN};
