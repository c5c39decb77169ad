/*
 * 5D Labs Agent Platform - Rollout Executor CLI
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! deploy-executor - run one rollout described by a deploy plan
//!
//! Exit codes: 0 when the rollout succeeded, 1 when it failed or could not
//! start, 130 when it was cancelled.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use deployer::kubernetes::KubeconfigConnector;
use deployer::output::StdoutSink;
use deployer::reporter::TracingReporter;
use deployer::{DeployExecutor, DeployOutcome, DeployPlan, DeployerConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Roll out a release onto Kubernetes and wait for it to stabilize.
#[derive(Parser)]
#[command(name = "deploy-executor")]
#[command(about = "Deploy a multi-role release and supervise it to completion")]
#[command(version)]
struct Cli {
    /// Deploy plan (YAML)
    #[arg(long, env = "DEPLOY_PLAN")]
    plan: PathBuf,

    /// Rollout tunables (YAML); defaults apply when omitted
    #[arg(long, env = "DEPLOYER_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig to read cluster contexts from (defaults to KUBECONFIG / ~/.kube/config)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<DeployerConfig> {
    let config = match path {
        Some(path) => DeployerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DeployerConfig::default(),
    }
    .with_env_overrides();
    config.validate().context("Invalid rollout configuration")?;
    Ok(config)
}

/// Cancel the rollout on Ctrl+C or SIGTERM
fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, cancelling rollout"),
            () = terminate => info!("Received SIGTERM, cancelling rollout"),
        }
        cancel.cancel();
    });
}

async fn run(cli: Cli) -> Result<DeployOutcome> {
    let config = load_config(cli.config.as_deref())?;
    let plan = DeployPlan::from_file(&cli.plan)
        .with_context(|| format!("Failed to load deploy plan {}", cli.plan.display()))?;

    info!(
        project = %plan.project,
        git_ref = %plan.git_ref,
        deploy_groups = plan.deploy_groups.len(),
        "Starting rollout"
    );

    let executor = DeployExecutor::new(
        config.clone(),
        Arc::new(KubeconfigConnector::new(cli.kubeconfig, config.transient_retries)),
        plan.release_store(),
        Arc::new(plan.config_source()),
        Arc::new(plan.build_resolver()),
    )
    .with_output(Arc::new(StdoutSink))
    .with_reporter(Arc::new(TracingReporter));

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let outcome = executor
        .execute(&plan.request(), plan.options(), &cancel)
        .await
        .context("Rollout aborted")?;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting deploy-executor v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(DeployOutcome::Succeeded) => {
            println!("{}", "Deploy succeeded".green().bold());
            ExitCode::SUCCESS
        }
        Ok(DeployOutcome::Failed) => {
            println!("{}", "Deploy failed".red().bold());
            ExitCode::from(1)
        }
        Ok(DeployOutcome::Cancelled) => {
            println!("{}", "Deploy cancelled".yellow().bold());
            ExitCode::from(130)
        }
        Err(e) => {
            error!(error = ?e, "Rollout could not complete");
            eprintln!("{} {e:#}", "Error:".red().bold());
            ExitCode::from(1)
        }
    }
}
