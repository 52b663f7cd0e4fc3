//! Workflow orchestration CLI.
//!
//! Reads the plan at `.conductor/plan.json`, drives its units through parallel
//! worktree lanes, and exposes the escalation inbox to human operators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;

use conductor::core::export::export_graph;
use conductor::core::graph::GraphError;
use conductor::core::types::{DecisionKind, DecisionValue, EscalationStatus};
use conductor::exit_codes;
use conductor::gate::{DecisionGate, EscalationFilter};
use conductor::hooks::HookRegistry;
use conductor::io::config::{ConductorConfig, load_config};
use conductor::io::init::{ConductorPaths, InitOptions, init_conductor};
use conductor::io::knowledge::load_knowledge;
use conductor::io::plan_store::load_graph;
use conductor::io::reasoner::reasoner_from_config;
use conductor::io::store::StateStore;
use conductor::io::worktree::{GitBackend, WorktreeCoordinator};
use conductor::lane::CommandLaneRunner;
use conductor::logging;
use conductor::scheduler::{RunOutcome, RunReport, Scheduler, SchedulerOptions};
use conductor::workflow::{Services, load_workflows};

/// Store key of the most recent plan export.
const PLAN_EXPORT_KEY: &str = "plan";

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Dependency-ordered workflow orchestration over git worktrees"
)]
struct Cli {
    /// Project root containing `.conductor/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` with a sample plan, config and knowledge base.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check plan against schema and invariants, and reject cycles.
    Validate,
    /// Print the execution plan and persist the graph export.
    Plan {
        /// Print the versioned JSON export instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Run every unit that is not yet complete.
    Run {
        /// Override `max_parallel` from config.
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show the persisted lifecycle state of every workflow.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Inspect and answer human escalations.
    Escalations {
        #[command(subcommand)]
        command: EscalationCommand,
    },
}

#[derive(Subcommand)]
enum EscalationCommand {
    /// List escalations, oldest first.
    List {
        #[arg(long, value_enum)]
        status: Option<EscalationStatus>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Answer a pending escalation.
    Resolve {
        id: String,
        value: String,
        /// Expected kind; defaults to the kind the escalation asked for.
        #[arg(long, value_enum)]
        kind: Option<DecisionKind>,
    },
    /// Abandon a pending escalation; its workflow is rolled back on the next run.
    Cancel { id: String },
    /// Print escalation counts and resolution times as JSON.
    Metrics,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if let Some(graph_err) = err.downcast_ref::<GraphError>() {
                eprintln!("invalid plan: {graph_err}");
            } else {
                eprintln!("{err:#}");
            }
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("resolve project root {}", cli.root.display()))?;
    let paths = ConductorPaths::new(&root);
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => cmd_validate(&paths),
        Command::Plan { json } => cmd_plan(&paths, json),
        Command::Run { max_parallel, json } => cmd_run(&paths, max_parallel, json),
        Command::Status { json } => cmd_status(&paths, json),
        Command::Escalations { command } => cmd_escalations(&paths, command),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_conductor(root, &InitOptions { force })?;
    println!("initialized {}", paths.conductor_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(paths: &ConductorPaths) -> Result<i32> {
    load_config(&paths.config_path)?;
    let graph = load_graph(&paths.plan_path)?;
    println!("ok: {} units", graph.len());
    Ok(exit_codes::OK)
}

fn cmd_plan(paths: &ConductorPaths, json: bool) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let graph = load_graph(&paths.plan_path)?;
    let store = StateStore::new(&paths.state_dir);
    let statuses: BTreeMap<_, _> = load_workflows(&store)?
        .into_iter()
        .map(|state| (state.id, state.current_state))
        .collect();
    let export = export_graph(&graph, &statuses, cfg.bottleneck_threshold);
    store
        .persist(PLAN_EXPORT_KEY, &export)
        .context("persist plan export")?;

    if json {
        print_json(&export)?;
        return Ok(exit_codes::OK);
    }
    for (index, group) in export.parallel_groups.iter().enumerate() {
        println!("group {index}: {}", group.join(", "));
    }
    println!(
        "critical path ({}): {}",
        export.critical_path_length,
        export.critical_path.join(" -> ")
    );
    if !export.bottlenecks.is_empty() {
        println!("bottlenecks: {}", export.bottlenecks.join(", "));
    }
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &ConductorPaths, max_parallel: Option<usize>, json: bool) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let graph = load_graph(&paths.plan_path)?;
    let store = StateStore::new(&paths.state_dir);
    let gate = open_gate(paths, &cfg, store.clone())?;
    let worktrees = WorktreeCoordinator::new(
        store.clone(),
        Arc::new(GitBackend::from_config(&paths.root, &cfg.git)),
        cfg.worktree_dir(&paths.root),
        cfg.git.branch_prefix.clone(),
    );
    let hooks = HookRegistry::with_tracing();
    let runner = CommandLaneRunner::from_config(&cfg.lane)?;

    let services = Services {
        store: &store,
        gate: &gate,
        worktrees: &worktrees,
        hooks: &hooks,
    };
    let plan = Scheduler::plan(&graph, max_parallel.unwrap_or(cfg.max_parallel));
    let report = Scheduler::new(services, SchedulerOptions::from_config(&cfg))
        .run(&plan, &runner)
        .context("run plan")?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(match report.outcome {
        RunOutcome::Completed => exit_codes::OK,
        RunOutcome::Stalled => exit_codes::ESCALATED,
        RunOutcome::Failed => exit_codes::FAILED,
    })
}

fn print_report(report: &RunReport) {
    println!("outcome: {:?}", report.outcome);
    if !report.completed.is_empty() {
        println!("completed: {}", report.completed.join(", "));
    }
    if !report.skipped.is_empty() {
        println!("already complete: {}", report.skipped.join(", "));
    }
    for failure in &report.failed {
        println!(
            "failed: {} after {} attempt(s): {}",
            failure.unit, failure.attempts, failure.reason
        );
    }
    for parked in &report.parked {
        println!(
            "waiting on escalation: {} ({})",
            parked.unit,
            parked.escalations.join(", ")
        );
    }
    if !report.blocked.is_empty() {
        println!("blocked: {}", report.blocked.join(", "));
    }
}

fn cmd_status(paths: &ConductorPaths, json: bool) -> Result<i32> {
    let store = StateStore::new(&paths.state_dir);
    let workflows = load_workflows(&store)?;
    if json {
        print_json(&workflows)?;
        return Ok(exit_codes::OK);
    }
    for state in &workflows {
        println!(
            "{}\t{}\tstep {}\tattempts {}",
            state.id, state.current_state, state.step_pointer, state.attempts
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_escalations(paths: &ConductorPaths, command: EscalationCommand) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let gate = open_gate(paths, &cfg, StateStore::new(&paths.state_dir))?;
    match command {
        EscalationCommand::List {
            status,
            owner,
            json,
        } => {
            let escalations = gate.list(&EscalationFilter { status, owner })?;
            if json {
                print_json(&escalations)?;
            } else {
                for e in &escalations {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        e.id, e.status, e.owner_workflow_id, e.kind, e.question
                    );
                }
            }
        }
        EscalationCommand::Resolve { id, value, kind } => {
            let kind = match kind {
                Some(kind) => kind,
                None => gate.get(&id)?.kind,
            };
            let value = DecisionValue::parse(kind, &value).map_err(|err| anyhow!(err))?;
            let escalation = gate.resolve(&id, value)?;
            println!(
                "resolved {} for {}",
                escalation.id, escalation.owner_workflow_id
            );
        }
        EscalationCommand::Cancel { id } => {
            let escalation = gate.cancel(&id)?;
            println!(
                "cancelled {} for {}",
                escalation.id, escalation.owner_workflow_id
            );
        }
        EscalationCommand::Metrics => print_json(&gate.metrics()?)?,
    }
    Ok(exit_codes::OK)
}

fn open_gate(
    paths: &ConductorPaths,
    cfg: &ConductorConfig,
    store: StateStore,
) -> Result<DecisionGate> {
    let knowledge = load_knowledge(&paths.knowledge_path)?;
    let reasoner = reasoner_from_config(&cfg.reasoner)?;
    Ok(DecisionGate::from_config(
        store,
        cfg,
        knowledge,
        Arc::from(reasoner),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
