//! sandcell: run one piece of generated code in a disposable context
//!
//! Usage:
//!   sandcell run script.js
//!   echo "return 1 + 1" | sandcell run -
//!   sandcell check

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sandcell::sandbox::{BubblewrapSandbox, SandboxRuntimeType};
use sandcell::{Engine, EngineConfig, ExecutionResult, Submission};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sandcell")]
#[command(about = "Run model-generated code in an isolated, disposable context")]
struct Args {
    /// Path to engine configuration file (TOML format)
    #[arg(long, global = true, env = "SANDCELL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute code read from FILE, or from stdin when FILE is "-"
    Run {
        file: String,

        /// Override the run timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Run the interpreter without bubblewrap
        #[arg(long)]
        no_sandbox: bool,

        /// Disable outbound network inside the context
        #[arg(long)]
        offline: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Report which runtime would be used
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sandcell=warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match args.command {
        Command::Check => {
            check(&config);
            Ok(())
        }
        Command::Run {
            file,
            timeout_ms,
            no_sandbox,
            offline,
            json,
        } => {
            if let Some(timeout_ms) = timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            if no_sandbox {
                config.sandbox.runtime_type = SandboxRuntimeType::Unjailed;
            }
            if offline {
                config.sandbox.network_enabled = false;
            }
            let code = read_code(&file).await?;
            let engine = Arc::new(Engine::new(&config)?);
            let interrupts = forward_interrupts();
            let Some(result) = execute(engine, code, interrupts).await? else {
                eprintln!("interrupted");
                std::process::exit(130);
            };
            print_result(&result, json)?;
            if !result.ok {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn check(config: &EngineConfig) {
    let runtime = config.sandbox.effective_runtime();
    println!("runtime:     {:?}", runtime);
    println!("interpreter: {}", config.sandbox.interpreter.display());
    println!("network:     {}", config.sandbox.network_enabled);
    println!("bwrap:       {}", BubblewrapSandbox::is_bwrap_available());
    println!("timeout:     {} ms", config.timeout_ms);
}

async fn read_code(file: &str) -> Result<String> {
    if file == "-" {
        let mut code = String::new();
        tokio::io::stdin()
            .read_to_string(&mut code)
            .await
            .context("reading code from stdin")?;
        return Ok(code);
    }
    let path = Path::new(file);
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

/// Submit `code`, cancelling the active run on each interrupt. Returns None
/// when an interrupt arrives while nothing is running, e.g. at the prompt.
async fn execute(
    engine: Arc<Engine>,
    code: String,
    mut interrupts: mpsc::UnboundedReceiver<()>,
) -> Result<Option<ExecutionResult>> {
    let work = submit(&engine, &code);
    tokio::pin!(work);
    loop {
        tokio::select! {
            result = &mut work => return result.map(Some),
            Some(()) = interrupts.recv() => {
                if !engine.cancel() {
                    return Ok(None);
                }
                warn!("interrupt received, cancelling run");
            }
        }
    }
}

fn forward_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

async fn submit(engine: &Engine, code: &str) -> Result<ExecutionResult> {
    let origin = match engine.submit(code).await? {
        Submission::Completed(result) => return Ok(result),
        Submission::NeedsCredential { origin } => origin,
    };

    let secret = prompt_credential(&origin).await?;
    let Some(code) = engine.resolve(&secret) else {
        engine.dismiss_credential();
        bail!("no credential supplied for {}", origin);
    };
    Ok(engine.run(code).await?)
}

async fn prompt_credential(origin: &str) -> Result<String> {
    info!(origin, "prompting for credential");
    let prompt = format!("API key for {} (input hidden)", origin);
    let secret = tokio::task::spawn_blocking(move || {
        dialoguer::Password::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
    })
    .await
    .context("credential prompt task failed")?
    .context("reading credential")?;
    Ok(secret)
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
    } else if result.ok {
        println!("{}", result.value);
    } else {
        eprintln!("error: {}", result.value);
    }
    Ok(())
}
