//! stackset - reconcile a CloudFormation StackSet with account-parameters.json
//!
//! ## Usage
//!
//! ```bash
//! # Create missing stack instances
//! stackset deploy --template template.yaml
//!
//! # Also roll out template and parameter changes
//! stackset deploy --update --template template.yaml
//!
//! # Re-push merged parameters only, one account
//! stackset deploy --parameters-only --account 111111111111
//!
//! # What would deploy do?
//! stackset plan --update
//!
//! # Deployed vs remaining
//! stackset status
//!
//! # Remove an account's instances
//! stackset remove --account 111111111111 --retain-stacks
//! ```
//!
//! Ctrl+C stops after the current target. Operations already started keep
//! running in CloudFormation; the next run observes them.

use clap::{Args, Parser, Subcommand};
use stackset_orchestrator::{
    config::{DEFAULT_CONFIG_PATH, DEFAULT_STACK_SET_NAME},
    poller::{DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_TIMEOUT_SECS},
    ActionKind, CancelFlag, ClientConfig, CloudFormationClient, DeployOptions, DeploymentConfig,
    DeploymentService, JsonLinesReporter, ObservedStatus, PlanMode, ProgressReporter, Reconciler,
    ReconcilerConfig, ReconciliationPlan, RunSummary, SystemClock, TargetOutcome, TracingReporter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reconcile a CloudFormation StackSet across accounts and regions
#[derive(Parser)]
#[command(name = "stackset")]
#[command(about = "Multi-account StackSet deployment", long_about = None)]
struct Cli {
    /// AWS profile to use
    #[arg(long, global = true)]
    profile: Option<String>,

    /// AWS region the StackSet is administered from
    #[arg(long, global = true)]
    region: Option<String>,

    /// Desired-state file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// StackSet name (overrides the config file; default: StackSet-Name)
    #[arg(long, global = true)]
    stack_set_name: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Print progress events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Observe, plan and apply
    Deploy {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Operation status polling interval (seconds)
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
        poll_interval: u64,

        /// Per-operation wait budget (seconds)
        #[arg(long, default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
        timeout: u64,
    },

    /// Show what deploy would do
    Plan {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Show deployed and remaining instances
    Status,

    /// Delete stack instances of one account
    Remove {
        /// Account ID
        #[arg(long)]
        account: String,

        /// Only this region (default: every region the account is deployed to)
        #[arg(long)]
        region: Option<String>,

        /// Keep the stacks, only detach them from the StackSet
        #[arg(long)]
        retain_stacks: bool,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct SelectionArgs {
    /// Update drifted instances (template, status or parameters)
    #[arg(long, conflicts_with = "parameters_only")]
    update: bool,

    /// Re-push merged parameters only, never touching the template
    #[arg(long)]
    parameters_only: bool,

    /// Only this account
    #[arg(long)]
    account: Option<String>,

    /// Template file, used to create the StackSet or roll out with --update
    #[arg(long)]
    template: Option<PathBuf>,
}

impl SelectionArgs {
    fn into_options(self) -> anyhow::Result<DeployOptions> {
        let mode = if self.update {
            PlanMode::Update
        } else if self.parameters_only {
            PlanMode::ParametersOnly
        } else {
            PlanMode::CreateOnly
        };

        let mut options = DeployOptions::new(mode);
        if let Some(account) = self.account {
            options = options.with_account_filter(account);
        }
        if let Some(path) = self.template {
            let body = std::fs::read_to_string(&path).map_err(|e| {
                anyhow::anyhow!("failed to read template {}: {}", path.display(), e)
            })?;
            options = options.with_template(body);
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let reporter: Arc<dyn ProgressReporter> = if cli.json {
        Arc::new(JsonLinesReporter)
    } else {
        Arc::new(TracingReporter)
    };

    let client_config = ClientConfig {
        profile: cli.profile.clone(),
        region: cli.region.clone(),
    };

    match cli.command {
        Commands::Deploy {
            selection,
            poll_interval,
            timeout,
        } => {
            let desired = DeploymentConfig::load(&cli.config)?;
            let options = selection.into_options()?;
            let config = ReconcilerConfig::new(stack_set_name(&cli.stack_set_name, Some(&desired)))
                .with_poll_interval(Duration::from_secs(poll_interval))
                .with_poll_timeout(Duration::from_secs(timeout));

            let cancel = install_ctrl_c_handler();
            let reconciler = build_reconciler(client_config, reporter, config)
                .await
                .with_cancel_flag(cancel);

            info!(
                "🚀 Deploying StackSet {} ({} targets)",
                reconciler.config().stack_set_name,
                desired.targets.len()
            );
            let summary = reconciler.reconcile(&desired, &options).await?;

            if !cli.json {
                print_summary(&summary, &desired);
            }
            if !summary.is_success() {
                anyhow::bail!(
                    "{} failed, {} timed out, {} not started",
                    summary.failed,
                    summary.timed_out,
                    summary.cancelled
                );
            }
            Ok(())
        }

        Commands::Plan { selection } => {
            let desired = DeploymentConfig::load(&cli.config)?;
            let options = selection.into_options()?;
            let config = ReconcilerConfig::new(stack_set_name(&cli.stack_set_name, Some(&desired)));
            let reconciler = build_reconciler(client_config, reporter, config).await;

            let plan = reconciler.preview(&desired, &options).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&plan)?);
            } else {
                print_plan(&plan, &desired);
            }
            Ok(())
        }

        Commands::Status => {
            let desired = DeploymentConfig::load(&cli.config)?;
            let config = ReconcilerConfig::new(stack_set_name(&cli.stack_set_name, Some(&desired)));
            let reconciler = build_reconciler(client_config, reporter, config).await;

            let status = reconciler.status(&desired).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&status)?);
                return Ok(());
            }

            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            info!(
                "📊 StackSet: {} | ✅ Deployed: {} | ⏳ Remaining: {}",
                status.stack_set_name,
                status.deployed.len(),
                status.remaining.len()
            );
            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            if !status.deployed.is_empty() {
                info!("{:<14} {:<20} {:<16} {:<10}", "Account", "Name", "Region", "Status");
                info!("{:-<14} {:-<20} {:-<16} {:-<10}", "", "", "", "");
                for target in &status.deployed {
                    let icon = match target.status {
                        ObservedStatus::Deployed => "🟢",
                        ObservedStatus::Drifted => "🟡",
                        ObservedStatus::Failing => "🔴",
                        ObservedStatus::Absent => "⚪",
                    };
                    info!(
                        "{:<14} {:<20} {:<16} {} {}",
                        target.account(),
                        desired.account_name(target.account()).unwrap_or("-"),
                        target.region(),
                        icon,
                        target.status
                    );
                    if let Some(reason) = &target.status_reason {
                        info!("               └─ {}", reason);
                    }
                }
            }

            if !status.remaining.is_empty() {
                info!("");
                info!("⏳ Remaining:");
                for id in &status.remaining {
                    info!(
                        "   {} {} ({})",
                        id.account,
                        id.region,
                        desired.account_name(&id.account).unwrap_or("-")
                    );
                }
            }

            if !status.unmanaged.is_empty() {
                warn!("⚠️  {} instance(s) not in {}:", status.unmanaged.len(), cli.config.display());
                for id in &status.unmanaged {
                    warn!("   {}", id);
                }
            }

            if let Some(operation) = &status.active_operation {
                info!("");
                info!(
                    "🔄 Operation {} is {}{}",
                    operation.operation_id,
                    operation.status,
                    operation
                        .kind
                        .map(|k| format!(" ({})", k))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }

        Commands::Remove {
            account,
            region,
            retain_stacks,
            force,
        } => {
            let desired = if cli.config.exists() {
                Some(DeploymentConfig::load(&cli.config)?)
            } else {
                None
            };
            let config = ReconcilerConfig::new(stack_set_name(&cli.stack_set_name, desired.as_ref()));
            let cancel = install_ctrl_c_handler();
            let reconciler = build_reconciler(client_config, reporter, config)
                .await
                .with_cancel_flag(cancel);

            let targets = reconciler
                .existing_targets(&account, region.as_deref())
                .await?;
            if targets.is_empty() {
                info!("No stack instances for account {}", account);
                return Ok(());
            }

            if !force {
                println!(
                    "⚠️  This will delete {} stack instance(s) of account {} from {}{}",
                    targets.len(),
                    account,
                    reconciler.config().stack_set_name,
                    if retain_stacks { " (stacks retained)" } else { "" }
                );
                for target in &targets {
                    println!("   {}", target);
                }
                print!("Continue? [y/N]: ");
                use std::io::Write;
                std::io::stdout().flush()?;
                let mut input = String::new();
                std::io::stdin().read_line(&mut input)?;
                if !input.trim().to_lowercase().starts_with('y') {
                    info!("Aborted");
                    return Ok(());
                }
            }

            let summary = reconciler.remove(&targets, retain_stacks).await;
            if !summary.is_success() {
                anyhow::bail!(
                    "{} removal(s) failed, {} timed out, {} not started",
                    summary.failed,
                    summary.timed_out,
                    summary.cancelled
                );
            }
            info!("✅ Removed {} stack instance(s)", summary.succeeded);
            Ok(())
        }
    }
}

/// Console logs go to stderr so `--json` output on stdout stays clean
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file must name a file"))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stackset=info,stackset_orchestrator=info,info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn stack_set_name(flag: &Option<String>, desired: Option<&DeploymentConfig>) -> String {
    flag.clone()
        .or_else(|| desired.and_then(|d| d.stack_set_name.clone()))
        .unwrap_or_else(|| DEFAULT_STACK_SET_NAME.to_string())
}

async fn build_reconciler(
    client_config: ClientConfig,
    reporter: Arc<dyn ProgressReporter>,
    config: ReconcilerConfig,
) -> Reconciler {
    let service: Arc<dyn DeploymentService> =
        Arc::new(CloudFormationClient::from_client_config(client_config).await);
    Reconciler::new(service, Arc::new(SystemClock), reporter, config)
}

/// First Ctrl+C finishes the current target; a second one exits immediately
fn install_ctrl_c_handler() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("⏹  Stopping after the current target (Ctrl+C again to exit now)");
        flag.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Exiting; operations already started keep running in CloudFormation");
            std::process::exit(130);
        }
    });
    cancel
}

fn print_plan(plan: &ReconciliationPlan, desired: &DeploymentConfig) {
    if plan.is_empty() {
        info!("✅ Nothing to do: {} target(s) conformant", plan.skipped.len());
        return;
    }

    info!("{:<24} {:<14} {:<20} {:<16} {}", "Action", "Account", "Name", "Region", "Changed");
    info!("{:-<24} {:-<14} {:-<20} {:-<16} {:-<10}", "", "", "", "", "");
    for action in &plan.actions {
        let changed = match action.kind {
            ActionKind::Create => "-".to_string(),
            _ if action.template_body.is_some() => {
                let mut parts = vec!["template".to_string()];
                parts.extend(action.changed_keys.iter().cloned());
                parts.join(", ")
            }
            _ if action.changed_keys.is_empty() => "-".to_string(),
            _ => action.changed_keys.join(", "),
        };
        info!(
            "{:<24} {:<14} {:<20} {:<16} {}",
            action.kind.to_string(),
            action.target.account,
            desired.account_name(&action.target.account).unwrap_or("-"),
            action.target.region,
            changed
        );
    }
    info!("");
    info!(
        "📋 {} action(s), {} conformant",
        plan.len(),
        plan.skipped.len()
    );
}

fn print_summary(summary: &RunSummary, desired: &DeploymentConfig) {
    let attention: Vec<_> = summary
        .reports
        .iter()
        .filter(|r| {
            matches!(
                r.outcome,
                TargetOutcome::Failed { .. } | TargetOutcome::TimedOut { .. }
            )
        })
        .collect();
    if attention.is_empty() {
        return;
    }

    info!("");
    info!("Targets needing attention:");
    for report in attention {
        let name = desired.account_name(&report.target.account).unwrap_or("-");
        match &report.outcome {
            TargetOutcome::Failed { reason } => {
                warn!("   ❌ {} ({}): {}", report.target, name, reason)
            }
            TargetOutcome::TimedOut { operation_id } => warn!(
                "   ⌛ {} ({}): operation {} still running, re-run to observe it",
                report.target, name, operation_id
            ),
            _ => {}
        }
    }
}
