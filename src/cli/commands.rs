//! CLI command definitions for infra-orchestrator.
//!
//! Every command builds an [`Orchestrator`] from the `ORCH_*` environment
//! (see [`OrchestratorConfig::from_env`]) and drives one operation against the
//! dispatch service and the configured store.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{OrchestratorConfig, StoreBackend};
use crate::dispatch::types::AccountScope;
use crate::error::Phase;
use crate::infra::lifecycle::{CleanupReport, InitInfraRequest};
use crate::infra::types::StepSpec;
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::Orchestrator;
use crate::router::Delivery;
use crate::step::async_step::AsyncStep;
use crate::step::controller::{StepExecutionRequest, StepProgress};
use crate::step::outcome::TaskResponse;
use crate::step::timeout::parse_timeout;
use crate::store::types::StageScope;
use crate::store::PostgresStore;

/// Default Init/step timeout.
const DEFAULT_TIMEOUT: &str = "10m";

/// Remote-execution orchestrator for containerized pipeline steps.
#[derive(Parser)]
#[command(name = "infra-orchestrator")]
#[command(about = "Provision delegate infrastructure, dispatch steps and route their callbacks")]
#[command(version)]
#[command(
    long_about = "infra-orchestrator drives per-stage execution infrastructure through remote delegates.\n\nConfiguration is read from ORCH_* environment variables plus REDIS_URL / DATABASE_URL.\n\nExample usage:\n  infra-orchestrator init --file steps.yaml --account acct --org org --project proj --stage stage-1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Print results as JSON.
    #[arg(short, long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply the Postgres schema migrations.
    Migrate,

    /// Request infrastructure for a stage.
    Init(InitArgs),

    /// Dispatch one step against the stage's infrastructure.
    #[command(alias = "exec")]
    Execute(ExecuteArgs),

    /// Show the execution stage of a remote task.
    Progress(TaskArgs),

    /// Cancel a remote task.
    Cancel(TaskArgs),

    /// Release the stage's infrastructure, if any was provisioned.
    Cleanup(StageArgs),

    /// Abort a running step and release the stage's infrastructure.
    Abort(AbortArgs),

    /// Deliver a task callback.
    Deliver(DeliverArgs),

    /// Register the callback URL with the dispatch service.
    #[command(name = "register-callback")]
    RegisterCallback,

    /// Print Prometheus metrics in text format.
    Metrics,
}

/// Identifies one stage execution.
#[derive(clap::Args, Debug, Clone)]
pub struct StageArgs {
    #[arg(long, env = "ORCH_ACCOUNT_ID")]
    pub account: String,

    #[arg(long, env = "ORCH_ORG_ID")]
    pub org: String,

    #[arg(long, env = "ORCH_PROJECT_ID")]
    pub project: String,

    /// Stage execution id.
    #[arg(long)]
    pub stage: String,
}

impl StageArgs {
    fn scope(&self) -> StageScope {
        StageScope::new(
            AccountScope::new(&self.account, &self.org, &self.project),
            &self.stage,
        )
    }
}

/// Arguments for `infra-orchestrator init`.
#[derive(Parser, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// YAML or JSON file with a top-level `steps` list.
    #[arg(short, long)]
    pub file: String,

    /// Execution id of the init step (generated when omitted).
    #[arg(long)]
    pub owner_execution_id: Option<String>,

    /// Log key prefix (defaults to the stage's storage key).
    #[arg(long)]
    pub log_prefix: Option<String>,

    /// Init timeout, e.g. 10m or 1h30m.
    #[arg(short, long, default_value = DEFAULT_TIMEOUT)]
    pub timeout: String,

    /// Delegate selector; repeatable.
    #[arg(short, long = "selector")]
    pub selectors: Vec<String>,
}

/// Arguments for `infra-orchestrator execute`.
#[derive(Parser, Debug)]
pub struct ExecuteArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// YAML or JSON file with a top-level `steps` list.
    #[arg(short, long)]
    pub file: String,

    /// Id of the step to run from the file.
    #[arg(long)]
    pub step: String,

    /// Execution id of the step (generated when omitted).
    #[arg(long)]
    pub step_execution_id: Option<String>,

    /// Declared step timeout, e.g. 10m or 1h30m.
    #[arg(short, long, default_value = DEFAULT_TIMEOUT)]
    pub timeout: String,

    /// When the step group started (RFC 3339).
    #[arg(long)]
    pub group_started_at: Option<DateTime<Utc>>,

    /// Log key prefix (defaults to the stage's storage key).
    #[arg(long)]
    pub log_prefix: Option<String>,

    /// Delegate selector; repeatable.
    #[arg(short, long = "selector")]
    pub selectors: Vec<String>,

    /// Release the stage's infrastructure once this step finishes.
    #[arg(long)]
    pub release_infra: bool,
}

/// Arguments addressing one remote task.
#[derive(Parser, Debug)]
pub struct TaskArgs {
    #[arg(long, env = "ORCH_ACCOUNT_ID")]
    pub account: String,

    pub task_id: String,
}

/// Arguments for `infra-orchestrator abort`.
#[derive(Parser, Debug)]
pub struct AbortArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// Callback ids issued for the step.
    #[arg(required = true)]
    pub callback_ids: Vec<String>,
}

/// Arguments for `infra-orchestrator deliver`.
#[derive(Parser, Debug)]
pub struct DeliverArgs {
    pub callback_id: String,

    /// Response file: YAML/JSON task response, or a codec envelope with `--encoded`.
    #[arg(short, long)]
    pub file: String,

    /// The file holds a binary codec envelope.
    #[arg(short, long)]
    pub encoded: bool,
}

#[derive(Debug, Deserialize)]
struct StepFile {
    steps: Vec<StepSpec>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let json = cli.json;
    match cli.command {
        Commands::Migrate => run_migrate_command(json).await,
        Commands::Init(args) => run_init_command(args, json).await,
        Commands::Execute(args) => run_execute_command(args, json).await,
        Commands::Progress(args) => run_progress_command(args, json).await,
        Commands::Cancel(args) => run_cancel_command(args, json).await,
        Commands::Cleanup(args) => run_cleanup_command(args, json).await,
        Commands::Abort(args) => run_abort_command(args, json).await,
        Commands::Deliver(args) => run_deliver_command(args, json).await,
        Commands::RegisterCallback => run_register_callback_command(json).await,
        Commands::Metrics => {
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

async fn connect() -> anyhow::Result<Orchestrator> {
    let config = OrchestratorConfig::from_env().context("Invalid orchestrator configuration")?;
    Ok(Orchestrator::connect(config).await?)
}

fn load_step_specs(path: &Path) -> anyhow::Result<Vec<StepSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read step file {}", path.display()))?;
    let file: StepFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse step file {}", path.display()))?;
    Ok(file.steps)
}

fn load_response(path: &Path) -> anyhow::Result<TaskResponse> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read response file {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse response file {}", path.display()))
}

fn print_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_migrate_command(json: bool) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("Invalid orchestrator configuration")?;
    if config.store_backend != StoreBackend::Postgres {
        warn!("Migrations only apply to the postgres backend");
        if json {
            print_json(serde_json::json!({"status": "skipped", "applied": []}))?;
        } else {
            println!("Nothing to migrate for the {:?} backend.", config.store_backend);
        }
        return Ok(());
    }

    let store = PostgresStore::connect(&config.database_url).await?;
    let applied = store.run_migrations().await?;

    if json {
        print_json(serde_json::json!({"status": "success", "applied": applied}))?;
    } else if applied.is_empty() {
        println!("Schema is up to date.");
    } else {
        for version in &applied {
            println!("Applied {}", version);
        }
    }
    Ok(())
}

async fn run_init_command(args: InitArgs, json: bool) -> anyhow::Result<()> {
    let stage = args.stage.scope();
    let request = InitInfraRequest {
        owner_execution_id: args
            .owner_execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        step_specs: load_step_specs(Path::new(&args.file))?,
        log_prefix: args.log_prefix.unwrap_or_else(|| stage.storage_key()),
        timeout: parse_timeout(&args.timeout)?,
        selectors: args.selectors,
        stage,
    };

    let orchestrator = connect().await?;
    let step = orchestrator.init_infra_step(request.clone());
    step.validate()?;
    let response = step.execute_async().await?;

    info!(callback_ids = ?response.callback_ids, "Init dispatched");
    if json {
        print_json(serde_json::json!({
            "status": "dispatched",
            "owner_execution_id": request.owner_execution_id,
            "callback_ids": response.callback_ids,
            "log_keys": response.log_keys,
        }))?;
    } else {
        println!("Init dispatched for stage {}", request.stage.stage_execution_id);
        for id in &response.callback_ids {
            println!("  callback: {}", id);
        }
    }
    Ok(())
}

async fn run_execute_command(args: ExecuteArgs, json: bool) -> anyhow::Result<()> {
    let stage = args.stage.scope();
    let spec = load_step_specs(Path::new(&args.file))?
        .into_iter()
        .find(|spec| spec.step_id == args.step)
        .with_context(|| format!("Step {} not found in {}", args.step, args.file))?;

    let request = StepExecutionRequest {
        step_execution_id: args
            .step_execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        spec,
        declared_timeout: parse_timeout(&args.timeout)?,
        group_started_at: args.group_started_at,
        log_prefix: args.log_prefix.unwrap_or_else(|| stage.storage_key()),
        selectors: args.selectors,
        stage,
        release_infra: args.release_infra,
    };

    let orchestrator = connect().await?;
    let step = orchestrator.container_step(request.clone(), args.release_infra);
    step.validate()?;
    let response = step.execute_async().await?;

    if json {
        print_json(serde_json::json!({
            "status": "dispatched",
            "step_execution_id": request.step_execution_id,
            "callback_ids": response.callback_ids,
            "log_keys": response.log_keys,
        }))?;
    } else {
        println!(
            "Step {} dispatched ({})",
            request.spec.step_id, request.step_execution_id
        );
        for id in &response.callback_ids {
            println!("  callback: {}", id);
        }
    }
    Ok(())
}

async fn run_progress_command(args: TaskArgs, json: bool) -> anyhow::Result<()> {
    let orchestrator = connect().await?;
    let stage = orchestrator
        .dispatcher()
        .progress(&args.account, &args.task_id)
        .await?;

    if json {
        print_json(serde_json::json!({"task_id": args.task_id, "stage": stage, "final": stage.is_final()}))?;
    } else {
        println!("{}: {:?}", args.task_id, stage);
    }
    Ok(())
}

async fn run_cancel_command(args: TaskArgs, json: bool) -> anyhow::Result<()> {
    let orchestrator = connect().await?;
    let stage = orchestrator
        .dispatcher()
        .cancel(Phase::Execute, &args.account, &args.task_id)
        .await?;

    if json {
        print_json(serde_json::json!({"task_id": args.task_id, "stage": stage}))?;
    } else {
        println!("Cancelled {} (now {:?})", args.task_id, stage);
    }
    Ok(())
}

async fn run_cleanup_command(args: StageArgs, json: bool) -> anyhow::Result<()> {
    let orchestrator = connect().await?;
    let report = orchestrator.infra().request_cleanup(&args.scope()).await;
    print_cleanup(&report, json)
}

fn print_cleanup(report: &CleanupReport, json: bool) -> anyhow::Result<()> {
    if json {
        let value = match report {
            CleanupReport::NotRequired => serde_json::json!({"status": "not_required"}),
            CleanupReport::Issued {
                infra_ref_id,
                task_id,
            } => serde_json::json!({"status": "issued", "infra_ref_id": infra_ref_id, "task_id": task_id}),
            CleanupReport::Failed {
                infra_ref_id,
                reason,
            } => serde_json::json!({"status": "failed", "infra_ref_id": infra_ref_id, "reason": reason}),
        };
        return print_json(value);
    }

    match report {
        CleanupReport::NotRequired => println!("No infrastructure to clean up."),
        CleanupReport::Issued {
            infra_ref_id,
            task_id,
        } => println!("Cleanup of {} issued as task {}", infra_ref_id, task_id),
        CleanupReport::Failed {
            infra_ref_id,
            reason,
        } => println!(
            "Cleanup of {} failed: {}",
            infra_ref_id.as_deref().unwrap_or("<unknown>"),
            reason
        ),
    }
    Ok(())
}

async fn run_abort_command(args: AbortArgs, json: bool) -> anyhow::Result<()> {
    let orchestrator = connect().await?;
    let report = orchestrator
        .abort()
        .abort_step(&args.stage.scope(), &args.callback_ids)
        .await?;

    // The process exits afterwards, so wait for the detached cleanup here
    let cleanup = report.cleanup.await.context("Cleanup task panicked")?;

    if json {
        print_json(serde_json::json!({
            "cancelled": report.cancelled,
            "outcome": report.outcome,
        }))?;
    } else {
        println!("Cancelled {} handle(s)", report.cancelled.len());
        if let Some(outcome) = &report.outcome {
            println!("Outcome: {}", outcome.status);
            if let Err(err) = outcome.clone().into_result() {
                println!("  {}", err);
            }
        }
    }
    print_cleanup(&cleanup, json)
}

async fn run_deliver_command(args: DeliverArgs, json: bool) -> anyhow::Result<()> {
    let path = Path::new(&args.file);
    let orchestrator = connect().await?;
    let delivery = if args.encoded {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read response file {}", path.display()))?;
        orchestrator
            .router()
            .deliver_encoded(&args.callback_id, &bytes)
            .await?
    } else {
        let response = load_response(path)?;
        orchestrator.router().deliver(&args.callback_id, response).await?
    };

    if json {
        return print_json(delivery_json(&delivery));
    }

    match &delivery {
        Delivery::InfraReady(scope) => println!(
            "Infrastructure ready: {}",
            scope.infra_ref_id.as_deref().unwrap_or_default()
        ),
        Delivery::InfraFailed { message, .. } => println!("Init failed: {}", message),
        Delivery::Step(StepProgress::Pending { outstanding }) => {
            println!("Waiting on {} more task(s)", outstanding)
        }
        Delivery::Step(StepProgress::Completed(outcome)) => {
            println!("Step {} {}", outcome.step_id, outcome.status);
            if let Err(err) = outcome.clone().into_result() {
                println!("  {}", err);
            }
        }
        Delivery::Step(StepProgress::Ignored(reason)) => println!("Ignored ({:?})", reason),
        Delivery::CleanupAcknowledged { infra_ref_id } => {
            println!("Cleanup of {} acknowledged", infra_ref_id)
        }
        Delivery::Unknown { callback_id } => println!("Unknown callback id {}", callback_id),
    }
    Ok(())
}

fn delivery_json(delivery: &Delivery) -> serde_json::Value {
    match delivery {
        Delivery::InfraReady(scope) => serde_json::json!({"delivery": "infra_ready", "scope": scope}),
        Delivery::InfraFailed {
            task_id,
            infra_ref_id,
            message,
        } => serde_json::json!({
            "delivery": "infra_failed",
            "task_id": task_id,
            "infra_ref_id": infra_ref_id,
            "message": message,
        }),
        Delivery::Step(StepProgress::Pending { outstanding }) => {
            serde_json::json!({"delivery": "pending", "outstanding": outstanding})
        }
        Delivery::Step(StepProgress::Completed(outcome)) => {
            serde_json::json!({"delivery": "completed", "outcome": outcome})
        }
        Delivery::Step(StepProgress::Ignored(reason)) => {
            serde_json::json!({"delivery": "ignored", "reason": format!("{:?}", reason)})
        }
        Delivery::CleanupAcknowledged { infra_ref_id } => {
            serde_json::json!({"delivery": "cleanup_acknowledged", "infra_ref_id": infra_ref_id})
        }
        Delivery::Unknown { callback_id } => {
            serde_json::json!({"delivery": "unknown", "callback_id": callback_id})
        }
    }
}

async fn run_register_callback_command(json: bool) -> anyhow::Result<()> {
    let orchestrator = connect().await?;
    let token = orchestrator.dispatcher().callback_token().await?;

    if json {
        print_json(serde_json::json!({
            "url": orchestrator.config().callback_url,
            "token": token,
        }))?;
    } else {
        println!("Registered {} ({})", orchestrator.config().callback_url, token);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::infra::types::StepKind;
    use crate::step::outcome::{CommandExecutionStatus, InitInfraResult};
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_init_command_defaults() {
        let args = vec![
            "infra-orchestrator",
            "init",
            "--file",
            "steps.yaml",
            "--account",
            "acct",
            "--org",
            "org",
            "--project",
            "proj",
            "--stage",
            "stage-1",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert!(!cli.json);
        match cli.command {
            Commands::Init(args) => {
                assert_eq!(args.file, "steps.yaml");
                assert_eq!(args.timeout, DEFAULT_TIMEOUT);
                assert!(args.owner_execution_id.is_none());
                assert!(args.selectors.is_empty());
                assert_eq!(args.stage.scope().storage_key(), "acct/org/proj/stage-1");
            }
            _ => panic!("Expected Init command"),
        }
    }

    #[test]
    fn test_execute_command_with_all_options() {
        let args = vec![
            "infra-orchestrator",
            "exec",
            "-f",
            "steps.yaml",
            "--step",
            "build",
            "--step-execution-id",
            "exec-1",
            "-t",
            "1h30m",
            "--group-started-at",
            "2026-01-01T00:00:00Z",
            "-s",
            "k8s",
            "-s",
            "linux",
            "--release-infra",
            "--account",
            "acct",
            "--org",
            "org",
            "--project",
            "proj",
            "--stage",
            "stage-1",
            "--json",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert!(cli.json);
        match cli.command {
            Commands::Execute(args) => {
                assert_eq!(args.step, "build");
                assert_eq!(args.step_execution_id.as_deref(), Some("exec-1"));
                assert_eq!(args.timeout, "1h30m");
                assert!(args.group_started_at.is_some());
                assert_eq!(args.selectors, vec!["k8s".to_string(), "linux".to_string()]);
                assert!(args.release_infra);
            }
            _ => panic!("Expected Execute command"),
        }
    }

    #[test]
    fn test_abort_requires_callback_ids() {
        let args = vec![
            "infra-orchestrator",
            "abort",
            "--account",
            "acct",
            "--org",
            "org",
            "--project",
            "proj",
            "--stage",
            "stage-1",
        ];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_deliver_and_simple_commands() {
        let cli = Cli::try_parse_from(vec![
            "infra-orchestrator",
            "deliver",
            "task-1",
            "--file",
            "reply.bin",
            "--encoded",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Deliver(args) => {
                assert_eq!(args.callback_id, "task-1");
                assert!(args.encoded);
            }
            _ => panic!("Expected Deliver command"),
        }

        let cli = Cli::try_parse_from(vec!["infra-orchestrator", "register-callback"])
            .expect("should parse");
        assert!(matches!(cli.command, Commands::RegisterCallback));

        let cli = Cli::try_parse_from(vec!["infra-orchestrator", "-l", "debug", "metrics"])
            .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Metrics));
    }

    #[test]
    fn test_load_step_specs_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
steps:
  - step_id: build
    image: rust:1.80
    kind:
      run:
        shell: BASH
        command: cargo build --release
    resources:
      cpu: "2"
      memory: 4Gi
    output_variables: [VERSION]
  - step_id: notify
    image: plugins/slack
    kind:
      plugin:
        settings:
          channel: builds
        entrypoint: null
"#
        )
        .unwrap();

        let specs = load_step_specs(file.path()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].resources.memory.as_deref(), Some("4Gi"));
        assert_eq!(specs[0].output_variables, vec!["VERSION".to_string()]);
        assert!(matches!(specs[1].kind, StepKind::Plugin { .. }));
        assert!(specs.iter().all(|spec| spec.validate().is_ok()));
    }

    #[test]
    fn test_load_response_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let response = TaskResponse::InitInfra(InitInfraResult::success("infra-1"));
        write!(file, "{}", serde_json::to_string(&response).unwrap()).unwrap();

        assert_eq!(load_response(file.path()).unwrap(), response);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "EngineStatus:\n  status: FAILURE\n  error_message: pod unschedulable\n"
        )
        .unwrap();
        assert_eq!(
            load_response(file.path()).unwrap(),
            TaskResponse::EngineStatus {
                status: CommandExecutionStatus::Failure,
                error_message: Some("pod unschedulable".to_string()),
            }
        );
    }

    #[test]
    fn test_load_step_specs_missing_file() {
        let err = load_step_specs(Path::new("/nonexistent/steps.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read step file"));
    }
}
