use std::path::PathBuf;
use std::process::ExitCode;

use arm_provision_core::{
    ActionReport, ConfigError, ProvisionEngine, ProvisionError, ProvisionMode, ProvisionReport,
    Settings, VmAction, connect,
};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "arm-provision")]
#[command(about = "Provision and manage a fixed Azure VM, SQL and storage environment", long_about = None)]
struct Cli {
    /// Action to perform on the VM; omit to provision every resource
    #[arg(value_enum)]
    action: Option<ActionArg>,
    /// JSON file overriding location, resource names and polling
    #[arg(long)]
    config: Option<PathBuf>,
    /// Look resources up without creating or changing anything
    #[arg(long)]
    dry_run: bool,
    /// Print the report as JSON instead of text
    #[arg(long)]
    json: bool,
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ActionArg {
    Startvm,
    Stopvm,
    Deletevm,
}

impl From<ActionArg> for VmAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Startvm => VmAction::Start,
            ActionArg::Stopvm => VmAction::Stop,
            ActionArg::Deletevm => VmAction::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = Settings::load(cli.config.as_deref())?;
    let mode = if cli.dry_run {
        ProvisionMode::DryRun
    } else {
        ProvisionMode::Apply
    };

    info!("Authenticating with Azure...");
    let client = connect(&settings).map_err(ProvisionError::from)?;
    debug!(endpoint = client.endpoint(), "management client ready");
    let engine = ProvisionEngine::new(client, settings);

    match cli.action {
        None => {
            let report = engine.run(mode).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_provision_report(&report);
            }
        }
        Some(action) => {
            let report = engine.run_vm_action(action.into(), mode).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_action_report(&report);
            }
        }
    }

    Ok(())
}

fn print_provision_report(report: &ProvisionReport) {
    let heading = match report.mode {
        ProvisionMode::Apply => "Provisioning completed",
        ProvisionMode::DryRun => "Dry-run completed",
    };
    println!(
        "{heading}: {} resources, {} changed.",
        report.steps.len(),
        report.changed_count()
    );
    for step in &report.steps {
        println!("  {} '{}': {}", step.kind, step.name, step.outcome.describe());
    }
}

fn print_action_report(report: &ActionReport) {
    if report.performed {
        println!("VM {} {}.", report.vm_name, report.action.past_tense());
    } else {
        println!(
            "Dry-run: VM {} exists and would be {}.",
            report.vm_name,
            report.action.past_tense()
        );
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),
}
