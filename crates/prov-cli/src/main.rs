use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prov", version = "0.1.0", about = "Reproducible run provenance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Create {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long = "source")]
        sources: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Load {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Show {
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Verify {
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Bundle {
        run_dir: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Create { tag, sources, json } => {
            let mut ctx = prov_core::ProvenanceContext::from_env()?;
            for source in sources {
                ctx.register_source(source);
            }
            let run = ctx.create(tag.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "create",
                    "run": {
                        "name": run.name(),
                        "path": run.path().display().to_string(),
                    }
                })));
            }
            println!("run: {}", run.name());
            println!("path: {}", run.path().display());
        }
        Commands::Load { path, json } => {
            let mut ctx = prov_core::ProvenanceContext::from_env()?;
            let run = ctx.load(&path)?;
            let summary = prov_core::summarize_run_directory(run.path())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "load",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Show { run_dir, json } => {
            let summary = prov_core::summarize_run_directory(&run_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Verify { run_dir, json } => {
            let report = prov_core::verify_run_directory(&run_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "verify",
                    "valid": report.is_ok(),
                    "checked": report.checked,
                    "violations": report.violations,
                })));
            }
            if report.is_ok() {
                println!("ok ({} paths checked)", report.checked);
            } else {
                for violation in &report.violations {
                    eprintln!("violation: {}", violation);
                }
                std::process::exit(1);
            }
        }
        Commands::Bundle { run_dir, out, json } => {
            let name = run_dir
                .file_name()
                .and_then(|v| v.to_str())
                .unwrap_or("run")
                .to_string();
            let out_path = out.unwrap_or_else(|| PathBuf::from(format!("{name}.zip")));
            prov_core::bundle_run_directory(&run_dir, &out_path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "bundle",
                    "bundle": out_path.display().to_string(),
                    "run_dir": run_dir.display().to_string(),
                })));
            }
            println!("bundle: {}", out_path.display());
        }
        Commands::Init { force } => {
            let config_path = PathBuf::from(prov_core::CONFIG_FILE);
            if !force && config_path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    config_path.display()
                )));
            }

            let config_yaml = "\
# provlab configuration. The RESULTSROOT and CODEROOT environment
# variables take precedence over this file.
results_root: results
code_root: ''                        # REQUIRED before `prov create`
";
            std::fs::write(&config_path, config_yaml)?;
            println!("wrote: {}", config_path.display());
            println!(
                "next: edit {} \u{2014} set code_root to the top directory containing your code",
                config_path.display()
            );
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Create { json, .. }
        | Commands::Load { json, .. }
        | Commands::Show { json, .. }
        | Commands::Verify { json, .. }
        | Commands::Bundle { json, .. } => *json,
        _ => false,
    }
}

fn summary_to_json(summary: &prov_core::RunSummary) -> Value {
    json!({
        "run": summary.name,
        "path": summary.path.display().to_string(),
        "command": summary.command,
        "dependencies": summary.dependency_count,
        "snapshot_files": summary.snapshot_file_count,
        "loaded_results": summary.loaded_results,
        "protected": summary.protected,
    })
}

fn print_summary(summary: &prov_core::RunSummary) {
    println!("run: {}", summary.name);
    println!("path: {}", summary.path.display());
    println!("command: {}", summary.command);
    println!("dependencies: {}", summary.dependency_count);
    println!("snapshot_files: {}", summary.snapshot_file_count);
    if !summary.loaded_results.is_empty() {
        println!("loaded_results: {}", summary.loaded_results.join(", "));
    }
    println!("protected: {}", summary.protected);
}
