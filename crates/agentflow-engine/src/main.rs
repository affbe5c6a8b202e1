//! agentflowd - workflow engine daemon entry point.
//!
//! Wires together the workflow loader, configuration, and scheduler for a
//! single run and maps the outcome to a process exit code.

use std::path::PathBuf;
use std::time::Duration;

use agentflow_core::config::Config;
use agentflow_core::gates::GateEvaluator;
use agentflow_core::notify::{LogSink, NotificationDispatcher};
use agentflow_core::report::ValidatorConfig;
use agentflow_core::types::Id;
use agentflow_core::workflow::load_workflow;
use agentflow_engine::{AppResult, RunLayout, Scheduler, SchedulerOptions, StepRunner};
use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Run a single agentflow workflow to completion.
#[derive(Parser, Debug)]
#[command(name = "agentflowd")]
struct Args {
    /// Path to the workflow definition JSON document.
    #[arg(long)]
    workflow: PathBuf,

    /// Repository directory the run operates against.
    #[arg(long, default_value = ".")]
    repo_dir: PathBuf,

    /// Run identifier; generated if omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// Optional config file (key=value), see the configuration component.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding packaged prompts, before repo-local overrides.
    #[arg(long, default_value = ".agents/packaged_prompts")]
    prompt_root: PathBuf,

    /// Wrapper command to invoke for each step, e.g. `codex exec`.
    #[arg(long, default_value = "codex")]
    wrapper: String,

    /// Extra wrapper argv entries, in order, before the prompt path.
    #[arg(long)]
    wrapper_arg: Vec<String>,

    /// Resume hint: reset this step and its dependents to PENDING.
    #[arg(long)]
    start_at_step: Option<String>,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(run(args));
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(err) => {
                error!(error = %err, "failed to load configuration");
                return 1;
            }
        },
        None => Config::default(),
    };

    let workflow = match load_workflow(&args.workflow) {
        Ok(w) => w,
        Err(err) => {
            error!(error = %err, "workflow-definition-error");
            return 1;
        }
    };

    let run_id = args.run_id.unwrap_or_else(|| Id::new().to_string());
    let layout = RunLayout::new(&args.repo_dir, run_id.clone());

    let mut wrapper_argv = vec![args.wrapper.clone()];
    wrapper_argv.extend(args.wrapper_arg.clone());
    if let Err(err) = validate_wrapper_argv(&wrapper_argv) {
        error!(error = %err, "invalid wrapper command");
        return 1;
    }
    let step_runner = StepRunner::new(layout.clone(), args.prompt_root.clone(), wrapper_argv);

    let gates = match &config.gate_state_path {
        Some(path) => GateEvaluator::from_path(path.as_str()),
        None => GateEvaluator::always_open(),
    };

    let dispatcher = NotificationDispatcher::new(Box::new(LogSink));

    let report_config = ValidatorConfig {
        placeholder_blacklist: config.placeholder_blacklist.clone(),
        ..ValidatorConfig::default()
    };

    let options = SchedulerOptions {
        poll_interval: config.poll_interval,
        max_attempts: config.max_attempts,
        max_iterations: config.max_iterations,
        pause_for_human_input: config.pause_for_human_input,
        start_at_step: args.start_at_step.or(config.start_at_step.clone()),
        cancellation_grace_period: config.cancellation_grace_period,
        env_overrides: config.env_overrides.clone(),
    };

    let mut scheduler = match Scheduler::new(
        workflow,
        step_runner,
        gates,
        dispatcher,
        report_config,
        options,
        run_id,
        args.repo_dir.clone(),
        layout.reports_dir(),
        layout.manual_inputs_dir(),
        layout.run_state_path(),
    ) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "failed to construct scheduler");
            return 1;
        }
    };

    let result = tokio::select! {
        result = scheduler.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, cancelling run");
            scheduler.request_cancellation();
            let grace = scheduler_grace_fallback();
            tokio::time::timeout(grace, scheduler.run()).await.unwrap_or(Ok(agentflow_engine::RunOutcome::Failure))
        }
    };

    match result {
        Ok(agentflow_engine::RunOutcome::Success) => 0,
        Ok(agentflow_engine::RunOutcome::Failure) => 1,
        Err(err) => {
            error!(error = %err, "scheduler error");
            1
        }
    }
}

fn scheduler_grace_fallback() -> Duration {
    Duration::from_secs(60)
}

/// Reject an empty or blank-program wrapper argv before it ever reaches
/// `StepRunner::launch`, where a missing program name would otherwise surface
/// as an opaque spawn error on the first admitted step.
fn validate_wrapper_argv(argv: &[String]) -> AppResult<()> {
    let program = argv.first();
    eyre::ensure!(
        program.is_some_and(|p| !p.trim().is_empty()),
        "wrapper command must name a program, got {argv:?}"
    );
    Ok(())
}
