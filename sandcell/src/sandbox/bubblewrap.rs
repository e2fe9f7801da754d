//! Bubblewrap execution contexts
//!
//! Each context is one interpreter process running the embedded bootstrap
//! kernel inside `bwrap`. The process sees read-only system directories, TLS
//! certificate stores, a private `/tmp` and an empty per-context `/workspace`;
//! the host's home directory, environment and caller files are not mounted.
//! When networking is enabled the network namespace is shared so the guest can
//! make outbound calls. Guest code runs in a `node:vm` realm whose only network
//! API is a `fetch` that refuses non-https targets; `process`, `require` and
//! string code generation are out of its reach. With networking disabled the
//! kernel drops `fetch` as well, which is the only network restriction the
//! unjailed runtime has.
//!
//! The handshake runs over the child's stdin/stdout as newline-delimited JSON.

use crate::error::{EngineError, EngineResult};
use crate::protocol::{GuestMessage, HostMessage, Signal};
use crate::sandbox::config::{SandboxConfig, SandboxRuntimeType};
use crate::sandbox::{ContextHost, ContextId, ContextLauncher, SignalSender};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const KERNEL_SOURCE: &str = include_str!("kernel.js");
const GUEST_KERNEL_PATH: &str = "/sandcell/kernel.js";
const GUEST_WORKSPACE: &str = "/workspace";
const GUEST_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const STDERR_TAIL_LINE_LIMIT: usize = 20;
const STDERR_TAIL_LINE_MAX_BYTES: usize = 512;
const STDERR_TAIL_SEPARATOR: &str = " | ";
const STDERR_SETTLE: Duration = Duration::from_millis(50);
const STDOUT_LINE_MAX_BYTES: usize = 8 * 1024 * 1024;
/// Keeps guest code from compiling strings in the kernel's own realm.
const INTERPRETER_FLAGS: &[&str] = &["--disallow-code-generation-from-strings"];
const KERNEL_OFFLINE_FLAG: &str = "--offline";

const SYSTEM_RO_DIRS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin"];
const TLS_RO_PATHS: &[&str] = &[
    "/etc/ssl/certs",
    "/etc/ssl/openssl.cnf",
    "/etc/pki",
    "/etc/ca-certificates",
    "/usr/share/ca-certificates",
];
const NETWORK_RO_PATHS: &[&str] = &["/etc/resolv.conf", "/etc/hosts", "/etc/nsswitch.conf"];

const BWRAP_NAMESPACE_HINT: &str = "bwrap failed to create a user namespace. \
    Run 'sudo sysctl -w user.max_user_namespaces=15000', or set SANDCELL_NO_SANDBOX=1 \
    to run contexts without bubblewrap (less secure).";

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Launches process contexts, jailed by bubblewrap unless the configuration
/// (or `SANDCELL_NO_SANDBOX`) asks for the unjailed runtime.
#[derive(Debug, Clone, Default)]
pub struct BubblewrapSandbox;

impl BubblewrapSandbox {
    pub fn new() -> Self {
        Self
    }

    pub fn is_bwrap_available() -> bool {
        find_in_path("bwrap").is_some()
    }

    fn build_command(
        runtime: SandboxRuntimeType,
        config: &SandboxConfig,
        interpreter: &Path,
        work_dir: &Path,
    ) -> EngineResult<Command> {
        let workspace = work_dir.join("workspace");
        let kernel = work_dir.join("kernel.js");

        let mut cmd = match runtime {
            SandboxRuntimeType::Unjailed => {
                let mut cmd = Command::new(interpreter);
                cmd.args(INTERPRETER_FLAGS).arg(&kernel);
                if !config.network_enabled {
                    cmd.arg(KERNEL_OFFLINE_FLAG);
                }
                cmd.current_dir(&workspace);
                cmd.env_clear();
                cmd.env("HOME", &workspace);
                cmd.env("PATH", GUEST_PATH);
                cmd
            }
            SandboxRuntimeType::Bubblewrap => {
                let bwrap = find_in_path("bwrap").ok_or_else(|| {
                    EngineError::Launch(
                        "bubblewrap not found. Install with: sudo apt install bubblewrap"
                            .to_string(),
                    )
                })?;
                let mut cmd = Command::new(bwrap);
                cmd.env_clear();

                cmd.arg("--unshare-all");
                if config.network_enabled {
                    cmd.arg("--share-net");
                }
                cmd.arg("--die-with-parent");
                cmd.arg("--new-session");

                for dir in SYSTEM_RO_DIRS {
                    ro_bind_if_exists(&mut cmd, Path::new(dir));
                }
                for path in TLS_RO_PATHS {
                    ro_bind_if_exists(&mut cmd, Path::new(path));
                }
                if config.network_enabled {
                    for path in NETWORK_RO_PATHS {
                        ro_bind_if_exists(&mut cmd, Path::new(path));
                    }
                }
                if let Some(root) = install_root(interpreter) {
                    ro_bind_if_exists(&mut cmd, &root);
                }
                for path in &config.extra_ro_binds {
                    ro_bind_if_exists(&mut cmd, path);
                }

                cmd.arg("--proc").arg("/proc");
                cmd.arg("--dev").arg("/dev");
                cmd.arg("--tmpfs").arg("/tmp");
                cmd.arg("--bind").arg(&workspace).arg(GUEST_WORKSPACE);
                cmd.arg("--ro-bind").arg(&kernel).arg(GUEST_KERNEL_PATH);
                cmd.arg("--chdir").arg(GUEST_WORKSPACE);
                cmd.arg("--setenv").arg("HOME").arg(GUEST_WORKSPACE);
                cmd.arg("--setenv").arg("PATH").arg(GUEST_PATH);

                cmd.arg("--")
                    .arg(interpreter)
                    .args(INTERPRETER_FLAGS)
                    .arg(GUEST_KERNEL_PATH);
                if !config.network_enabled {
                    cmd.arg(KERNEL_OFFLINE_FLAG);
                }
                cmd
            }
        };

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl ContextLauncher for BubblewrapSandbox {
    fn name(&self) -> &str {
        "bubblewrap"
    }

    async fn launch(
        &self,
        id: ContextId,
        config: &SandboxConfig,
        signals: SignalSender,
    ) -> EngineResult<Box<dyn ContextHost>> {
        let runtime = config.effective_runtime();
        if runtime == SandboxRuntimeType::Unjailed {
            warn!(
                context_id = %id,
                "running context without bubblewrap (less secure)"
            );
            if !config.network_enabled {
                warn!(
                    context_id = %id,
                    "network disabled by the kernel only; the process itself keeps host network access"
                );
            }
        }

        let interpreter = resolve_interpreter(&config.interpreter)?;
        let work_dir = tempfile::Builder::new()
            .prefix("sandcell-")
            .tempdir()
            .map_err(|e| EngineError::Launch(format!("failed to create context dir: {}", e)))?;
        tokio::fs::create_dir_all(work_dir.path().join("workspace"))
            .await
            .map_err(|e| EngineError::Launch(format!("failed to create workspace dir: {}", e)))?;
        tokio::fs::write(work_dir.path().join("kernel.js"), KERNEL_SOURCE)
            .await
            .map_err(|e| EngineError::Launch(format!("failed to write kernel: {}", e)))?;

        let mut cmd = Self::build_command(runtime, config, &interpreter, work_dir.path())?;
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Launch(format!("failed to spawn {}: {}", interpreter.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Launch("context missing stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("context missing stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Launch("context missing stderr".to_string()))?;

        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINE_LIMIT,
        )));
        let readers = vec![
            tokio::spawn(read_stderr(id, stderr, Arc::clone(&tail))),
            tokio::spawn(read_stdout(id, stdout, signals, tail)),
        ];

        info!(
            context_id = %id,
            pid = ?child.id(),
            runtime = ?runtime,
            network = config.network_enabled,
            "context process started"
        );

        Ok(Box::new(ProcessContext {
            id,
            child,
            stdin: Some(stdin),
            readers,
            work_dir: Some(work_dir),
            terminated: false,
        }))
    }
}

struct ProcessContext {
    id: ContextId,
    child: Child,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    work_dir: Option<TempDir>,
    terminated: bool,
}

#[async_trait]
impl ContextHost for ProcessContext {
    async fn deliver(&mut self, message: &HostMessage) -> EngineResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::Channel(format!("context {} stdin closed", self.id)))?;
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.stdin.take();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(context_id = %self.id, ?status, "context process already exited");
            }
            Ok(None) | Err(_) => {
                if let Err(err) = self.child.start_kill() {
                    warn!(
                        context_id = %self.id,
                        error = %err,
                        "failed to send kill signal to context process"
                    );
                }
            }
        }

        if let Some(dir) = self.work_dir.take() {
            if let Err(err) = dir.close() {
                debug!(context_id = %self.id, error = %err, "failed to remove context dir");
            }
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn read_stdout<R>(id: ContextId, stdout: R, signals: SignalSender, tail: StderrTail)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    loop {
        match read_bounded_line(&mut reader, STDOUT_LINE_MAX_BYTES).await {
            Ok(Some(StdoutLine::Complete(bytes))) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<GuestMessage>(line) {
                    Ok(message) => {
                        if signals.send(Signal::message(id, message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        trace!(context_id = %id, error = %err, "ignoring non-protocol stdout line");
                    }
                }
            }
            Ok(Some(StdoutLine::Oversized)) => {
                warn!(
                    context_id = %id,
                    max_bytes = STDOUT_LINE_MAX_BYTES,
                    "dropping oversized stdout line"
                );
            }
            Ok(None) => break,
            Err(err) => {
                warn!(context_id = %id, error = %err, "failed reading context stdout");
                break;
            }
        }
    }

    // stdout closes as the process exits; give stderr a moment to drain.
    tokio::time::sleep(STDERR_SETTLE).await;
    let detail = stderr_detail(&tail);
    debug!(context_id = %id, "context output closed");
    let _ = signals.send(Signal::closed(id, detail));
}

#[derive(Debug, PartialEq, Eq)]
enum StdoutLine {
    Complete(Vec<u8>),
    /// Longer than the cap; its bytes were discarded.
    Oversized,
}

/// Next newline-terminated line, holding at most `max_bytes` of it in memory.
/// A final line without a newline is returned at EOF.
async fn read_bounded_line<R>(reader: &mut R, max_bytes: usize) -> std::io::Result<Option<StdoutLine>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (oversized, line.is_empty()) {
                (true, _) => Some(StdoutLine::Oversized),
                (false, true) => None,
                (false, false) => Some(StdoutLine::Complete(line)),
            });
        }

        let (chunk, used, finished) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };
        if !oversized {
            if line.len() + chunk.len() > max_bytes {
                oversized = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if finished {
            return Ok(Some(if oversized {
                StdoutLine::Oversized
            } else {
                StdoutLine::Complete(line)
            }));
        }
    }
}

async fn read_stderr(id: ContextId, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(context_id = %id, "stderr: {}", line);
        let mut buffer = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() == STDERR_TAIL_LINE_LIMIT {
            buffer.pop_front();
        }
        buffer.push_back(truncate_line(&line, STDERR_TAIL_LINE_MAX_BYTES));
    }
}

fn stderr_detail(tail: &StderrTail) -> String {
    let tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
    let mut detail = tail
        .iter()
        .map(|line| line.as_str())
        .collect::<Vec<_>>()
        .join(STDERR_TAIL_SEPARATOR);
    if detail.contains("Creating new namespace failed")
        || detail.contains("No permissions to create new namespace")
    {
        detail.push_str(STDERR_TAIL_SEPARATOR);
        detail.push_str(BWRAP_NAMESPACE_HINT);
    }
    detail
}

fn truncate_line(line: &str, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line.to_string();
    }
    let mut end = max_bytes;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

fn ro_bind_if_exists(cmd: &mut Command, path: &Path) {
    if path.exists() {
        cmd.arg("--ro-bind").arg(path).arg(path);
    }
}

/// Install prefix to mount for an interpreter living outside the system dirs,
/// e.g. `/opt/node` for `/opt/node/bin/node`.
fn install_root(interpreter: &Path) -> Option<PathBuf> {
    if SYSTEM_RO_DIRS
        .iter()
        .any(|dir| interpreter.starts_with(dir))
    {
        return None;
    }
    let bin_dir = interpreter.parent()?;
    let root = match bin_dir.file_name() {
        Some(name) if name == "bin" => bin_dir.parent()?,
        _ => bin_dir,
    };
    if root == Path::new("/") {
        return None;
    }
    Some(root.to_path_buf())
}

fn find_in_path(executable: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
}

fn resolve_interpreter(interpreter: &Path) -> EngineResult<PathBuf> {
    if interpreter.components().count() > 1 {
        if interpreter.is_file() {
            return Ok(interpreter.to_path_buf());
        }
        return Err(EngineError::Launch(format!(
            "interpreter {} does not exist",
            interpreter.display()
        )));
    }
    let name = interpreter.to_string_lossy();
    find_in_path(&name)
        .ok_or_else(|| EngineError::Launch(format!("interpreter `{}` not found on PATH", name)))
}
