// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WASMGO CLI - Run Go-toolchain WebAssembly modules from the command line
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use serde::Deserialize;
use wasmgo_runtime::Runtime;

#[derive(Parser)]
#[command(name = "wasmgo")]
#[command(about = "Run a WebAssembly module built with the Go toolchain", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the .wasm module
    module: PathBuf,

    /// Arguments passed to the guest (argv[1..])
    args: Vec<String>,

    /// Environment entry for the guest, KEY=VALUE (repeatable)
    #[arg(short = 'E', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// TOML run configuration: `args = [...]` plus an `[env]` table.
    /// Command-line arguments and -E entries take precedence.
    #[arg(short, long, env = "WASMGO_CONFIG")]
    config: Option<PathBuf>,

    /// Print a machine-readable run report to stderr after the guest exits
    #[arg(long)]
    report_json: bool,
}

/// Optional run configuration file.
#[derive(Debug, Default, Deserialize)]
struct RunConfig {
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn load_config(path: &Path) -> Result<RunConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn parse_env_entry(entry: &str) -> Result<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("invalid environment entry {:?}, expected KEY=VALUE", entry),
    }
}

/// argv[0] the guest observes: the module's file stem.
fn guest_argv0(module: &Path) -> String {
    module
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "js".to_string())
}

async fn execute(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RunConfig::default(),
    };

    let mut env_vars = config.env;
    for entry in &cli.env {
        let (key, value) = parse_env_entry(entry)?;
        env_vars.insert(key, value);
    }

    let mut argv = vec![guest_argv0(&cli.module)];
    if cli.args.is_empty() {
        argv.extend(config.args);
    } else {
        argv.extend(cli.args.iter().cloned());
    }

    let wasm = std::fs::read(&cli.module)
        .with_context(|| format!("reading module {}", cli.module.display()))?;

    let mut runtime = Runtime::new();
    runtime
        .load_module(&wasm)
        .with_context(|| format!("loading module {}", cli.module.display()))?;
    info!("module loaded: {}", cli.module.display());

    let started = Instant::now();
    let code = runtime
        .run(&argv, &env_vars)
        .await
        .context("running module")?;

    if cli.report_json {
        let report = serde_json::json!({
            "module": cli.module.display().to_string(),
            "exit_code": code,
            "elapsed_ms": started.elapsed().as_millis() as u64,
        });
        eprintln!("{}", report);
    }

    Ok(code)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("wasmgo: {:#}", e);
            std::process::exit(1);
        }
    }
}
