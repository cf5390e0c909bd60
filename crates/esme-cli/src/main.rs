use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use esme_core::EsmeError;
use esme_provenance::{GitCli, Outcome};
use esme_runner::{
    reserved, Controller, CreateReport, Experiment, ExperimentSummary, LocalFs, PopulateReport,
    Settings, SetupReport,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HOME_ENV: &str = "ESME_HOME";
const DEFAULT_FILTER: &str = "esme=info,esme_runner=info,esme_provenance=info,esme_core=info";
const VERBOSE_FILTER: &str = "esme=debug,esme_runner=debug,esme_provenance=debug,esme_core=debug";
const BLOCKED_EXIT: i32 = 2;

#[derive(Parser)]
#[command(name = "esme", version, about = "Earth system model experiment manager")]
struct Cli {
    /// Install home holding settings.yaml and experiment_specifications/.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an experiment from a specification and pin its code.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        template: String,
        /// Site to configure for; guessed from the hostname when omitted.
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Setup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        json: bool,
    },
    Build {
        #[arg(long)]
        name: String,
        #[arg(long)]
        json: bool,
    },
    Run {
        #[arg(long)]
        name: String,
        #[arg(long)]
        step: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        name: String,
        #[arg(long)]
        json: bool,
    },
    Clone {
        #[arg(long)]
        name: String,
        #[arg(long)]
        parent: String,
    },
    #[command(name = "list_run_steps")]
    ListRunSteps {
        #[arg(long)]
        name: String,
    },
    Verify {
        #[arg(long)]
        name: String,
    },
    Freeze {
        #[arg(long)]
        name: String,
        #[arg(long)]
        step: Option<String>,
    },
    Publish {
        #[arg(long)]
        name: String,
    },
}

/// What a command produced; `Blocked` maps to its own exit status.
enum Reply {
    Done(Option<Value>),
    Blocked(Option<Value>, String),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.home, cli.command) {
        Ok(Reply::Done(payload)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            Ok(())
        }
        Ok(Reply::Blocked(payload, reason)) => {
            match payload {
                Some(payload) => emit_json(&payload),
                None => eprintln!("create blocked: {}", reason),
            }
            std::process::exit(BLOCKED_EXIT);
        }
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<EsmeError>()
                    .map(EsmeError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let directives = if verbose {
        VERBOSE_FILTER.to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(directives))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_home(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(home) = flag {
        return Ok(home);
    }
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let exe = std::env::current_exe().context("cannot locate the esme executable")?;
    exe.parent()
        .map(|p| p.to_path_buf())
        .with_context(|| format!("{} has no parent directory", exe.display()))
}

fn controller(home: Option<PathBuf>) -> Result<Controller<GitCli, LocalFs>> {
    let home = resolve_home(home)?;
    tracing::debug!(home = %home.display(), "install home");
    let settings = Settings::load(&home)?;
    Ok(Controller::new(settings, GitCli::default(), LocalFs))
}

fn run_command(home: Option<PathBuf>, command: Commands) -> Result<Reply> {
    match command {
        Commands::Create {
            name,
            template,
            machine,
            json,
        } => {
            let ctl = controller(home)?;
            let exp = Experiment::new(&name)?;
            let report = ctl.create(&exp, &template, machine.as_deref())?;
            let payload = json.then(|| create_to_json(&report)).transpose()?;
            match &report.outcome {
                Outcome::Blocked(reason) => return Ok(Reply::Blocked(payload, reason.clone())),
                Outcome::Bound(record) if !json => {
                    println!("created: {}", exp.path().display());
                    println!("machine: {}", report.machine_name);
                    println!("commit: {}", record.head);
                }
                Outcome::AlreadyBound(record) if !json => {
                    println!("already bound: {} at {}", exp.path().display(), record.head);
                }
                _ => {}
            }
            Ok(Reply::Done(payload))
        }
        Commands::Setup { name, json } => {
            let ctl = controller(home)?;
            let exp = Experiment::new(&name)?;
            let report = ctl.setup(&exp)?;
            if json {
                return Ok(Reply::Done(Some(setup_to_json(&report))));
            }
            print_populate("input", &report.input);
            if let Some(build) = &report.build {
                print_populate("build", build);
            }
            for path in &report.installed {
                println!("installed: {}", path.display());
            }
            Ok(Reply::Done(None))
        }
        Commands::Build { name, json } => {
            let ctl = controller(home)?;
            let exp = Experiment::new(&name)?;
            ctl.build(&exp)?;
            Ok(Reply::Done(stage_done("build", &exp, json)))
        }
        Commands::Run { name, step, json } => {
            let ctl = controller(home)?;
            let exp = Experiment::new(&name)?;
            ctl.run(&exp, step.as_deref())?;
            Ok(Reply::Done(stage_done("run", &exp, json)))
        }
        Commands::Describe { name, json } => {
            let ctl = controller(home)?;
            let exp = Experiment::new(&name)?;
            let summary = ctl.describe(&exp)?;
            if json {
                return Ok(Reply::Done(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)?
                }))));
            }
            print_summary(&summary);
            Ok(Reply::Done(None))
        }
        Commands::Clone { .. } => reserved_command("clone"),
        Commands::ListRunSteps { .. } => reserved_command("list_run_steps"),
        Commands::Verify { .. } => reserved_command("verify"),
        Commands::Freeze { .. } => reserved_command("freeze"),
        Commands::Publish { .. } => reserved_command("publish"),
    }
}

fn reserved_command(command: &str) -> Result<Reply> {
    reserved(command)?;
    Ok(Reply::Done(None))
}

fn stage_done(stage: &str, exp: &Experiment, json: bool) -> Option<Value> {
    if json {
        Some(json!({
            "ok": true,
            "command": stage,
            "experiment": exp.name(),
            "path": exp.path().display().to_string()
        }))
    } else {
        println!("{} complete: {}", stage, exp.path().display());
        None
    }
}

fn create_to_json(report: &CreateReport) -> Result<Value> {
    let (status, record) = match &report.outcome {
        Outcome::Bound(r) => ("bound", r),
        Outcome::AlreadyBound(r) => ("already_bound", r),
        Outcome::Blocked(reason) => {
            return Ok(json!({
                "ok": false,
                "command": "create",
                "error": {
                    "code": "provenance_blocked",
                    "message": reason,
                    "details": { "config": report.config_path.display().to_string() }
                }
            }))
        }
    };
    let binding = serde_json::to_value(record).context("serializing binding record")?;
    Ok(json!({
        "ok": true,
        "command": "create",
        "status": status,
        "machine_name": report.machine_name,
        "config": report.config_path.display().to_string(),
        "binding": binding
    }))
}

fn populate_to_json(report: &PopulateReport) -> Value {
    json!({
        "extracted": report.extracted,
        "linked": report.linked,
        "already_linked": report.already_linked,
        "left_in_place": report.left_in_place
    })
}

fn setup_to_json(report: &SetupReport) -> Value {
    json!({
        "ok": true,
        "command": "setup",
        "input": populate_to_json(&report.input),
        "build": report.build.as_ref().map(populate_to_json),
        "installed": report
            .installed
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
    })
}

fn summary_to_json(summary: &ExperimentSummary) -> Result<Value> {
    let config = serde_json::to_value(&summary.config).context("serializing config.yaml")?;
    let binding = serde_json::to_value(&summary.binding).context("serializing binding record")?;
    Ok(json!({
        "name": summary.name,
        "path": summary.path.display().to_string(),
        "config": config,
        "binding": binding,
        "head": summary.head,
        "scripts": summary
            .scripts
            .iter()
            .map(|(key, path, installed)| json!({
                "key": key,
                "path": path.display().to_string(),
                "installed": installed
            }))
            .collect::<Vec<_>>()
    }))
}

fn print_populate(label: &str, report: &PopulateReport) {
    println!(
        "{}: extracted={} linked={} already_linked={} left_in_place={}",
        label, report.extracted, report.linked, report.already_linked, report.left_in_place
    );
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.name);
    println!("path: {}", summary.path.display());
    match &summary.config {
        Some(cfg) => {
            println!("code_repository_url: {}", cfg.code_repository_url);
            println!("code_commit_hash: {}", cfg.code_commit_hash);
            if let Some(site) = &cfg.site {
                println!("machine: {}", site.machine_name);
                println!("bucket_url: {}", site.bucket_url);
            }
        }
        None => println!("config: (none)"),
    }
    match &summary.binding {
        Some(b) => println!("bound: {} at {}", b.head, b.bound_at.to_rfc3339()),
        None => println!("bound: no"),
    }
    if let Some(head) = &summary.head {
        println!("head: {}", head);
    }
    for (key, path, installed) in &summary.scripts {
        let state = if *installed { "installed" } else { "missing" };
        println!("{}: {} ({})", key, path.display(), state);
    }
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

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<EsmeError>() {
        Some(EsmeError::ExternalScriptFailure { script, status }) => json!({
            "script": script.display().to_string(),
            "status": status
        }),
        Some(EsmeError::ProvenanceFailure { step, .. }) => json!({ "step": step }),
        Some(EsmeError::Io { path, .. }) | Some(EsmeError::Yaml { path, .. }) => {
            json!({ "path": path.display().to_string() })
        }
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Create { json, .. }
        | Commands::Setup { json, .. }
        | Commands::Build { json, .. }
        | Commands::Run { json, .. }
        | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}
