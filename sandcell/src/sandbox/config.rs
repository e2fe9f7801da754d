use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Env var that runs contexts without bubblewrap (when user namespaces are
/// unavailable). Contexts then share the host filesystem view; use only in
/// constrained environments.
pub const SANDCELL_NO_SANDBOX: &str = "SANDCELL_NO_SANDBOX";

pub fn no_sandbox_requested() -> bool {
    std::env::var(SANDCELL_NO_SANDBOX)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v == "yes")
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxRuntimeType {
    Bubblewrap,
    Unjailed,
}

/// Restriction profile applied to every context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub runtime_type: SandboxRuntimeType,
    /// Interpreter running the bootstrap kernel; bare names are looked up on PATH.
    pub interpreter: PathBuf,
    pub network_enabled: bool,
    /// Extra host paths bound read-only into the context.
    pub extra_ro_binds: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_type: SandboxRuntimeType::Bubblewrap,
            interpreter: PathBuf::from("node"),
            network_enabled: true,
            extra_ro_binds: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Runtime after applying the `SANDCELL_NO_SANDBOX` override.
    pub fn effective_runtime(&self) -> SandboxRuntimeType {
        if no_sandbox_requested() {
            SandboxRuntimeType::Unjailed
        } else {
            self.runtime_type
        }
    }
}
