//! Interactive CLI for the provisioning orchestrator.
//!
//! Prompts for the instance name and elevation credential, then either
//! runs the step pipeline from an operator-selected point or (with
//! `--recover`) runs only the daemon recovery procedure.

use std::path::{Path, PathBuf};

use clap::Parser;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Password, Select};

use vmprov::classify::FaultClassifier;
use vmprov::context::{ProvisioningContext, Secret};
use vmprov::errors::{ProvisionError, ProvisionResult};
use vmprov::exec::Executor;
use vmprov::pipeline::steps::step_table;
use vmprov::pipeline::{Pipeline, StartPoint, StepEnv, menu_labels};
use vmprov::logging;
use vmprov::recovery::RecoveryTuning;

#[derive(Parser)]
#[command(name = "vmprov", about = "Resumable VM provisioning orchestrator", version)]
struct Cli {
    /// Run only the daemon recovery procedure; the pipeline is untouched.
    #[arg(long)]
    recover: bool,

    /// Path to the persisted configuration store.
    #[arg(long, default_value = "values.json")]
    store: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match logging::init(Path::new("logs")) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "setup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ProvisionResult<()> {
    let theme = ColorfulTheme::default();

    let instance: String = Input::with_theme(&theme)
        .with_prompt("Please enter the instance name")
        .validate_with(|input: &String| {
            if input.trim().is_empty() {
                Err("instance name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()
        .map_err(input_error)?;

    // Captured once, reused for every elevated call in this run.
    let credential = loop {
        let entered = Password::with_theme(&theme)
            .with_prompt("Please enter your sudo password (used throughout the setup)")
            .interact()
            .map_err(input_error)?;
        if entered.trim().is_empty() {
            eprintln!("Password cannot be empty.");
            continue;
        }
        break Secret::new(entered);
    };

    let ctx = ProvisioningContext::new(instance.trim(), credential)?.with_store_path(cli.store);
    let env = StepEnv::new(ctx, Executor::host(), RecoveryTuning::default());

    if cli.recover {
        return run_recovery(&env).await;
    }

    let pipeline = Pipeline::new(step_table(), FaultClassifier::default());
    let labels = menu_labels(pipeline.steps());
    let choice = Select::with_theme(&theme)
        .with_prompt("Where do you want to start the setup?")
        .items(&labels)
        .default(0)
        .interact()
        .map_err(input_error)?;
    let start = StartPoint::from_menu_choice(choice, pipeline.steps().len())?;

    tracing::info!(instance = env.ctx.instance(), "starting provisioning run");
    pipeline.run(&env, start).await?;
    tracing::info!("server setup completed successfully");
    Ok(())
}

/// Operator-requested recovery, independent of the pipeline.
async fn run_recovery(env: &StepEnv) -> ProvisionResult<()> {
    let outcomes = env.recovery.run(&env.ctx).await;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => tracing::info!(action = outcome.action, "ok"),
            Err(err) => tracing::warn!(action = outcome.action, error = %err, "failed"),
        }
    }
    if env.recovery.is_responsive().await {
        tracing::info!("daemon is responsive; try running the setup again");
        Ok(())
    } else {
        Err(ProvisionError::DaemonUnresponsive(
            "daemon still unresponsive after manual recovery".into(),
        ))
    }
}

fn input_error(err: dialoguer::Error) -> ProvisionError {
    ProvisionError::Input(err.to_string())
}
