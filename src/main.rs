use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use autopack::approval::ApprovalGateway;
use autopack::baseline::{CommandTestRunner, NullTestRunner, TestRunner};
use autopack::builder::{install_signal_handlers, kill_all_children, CliAgentRunner};
use autopack::config::{self, AutopackConfig};
use autopack::drain::{run_drain, DrainLimits, DrainSession};
use autopack::error::ApError;
use autopack::executor::ExecutorEnv;
use autopack::layout::RuntimeLayout;
use autopack::log::parse_log_level;
use autopack::memory::NullMemory;
use autopack::pending::PendingMovesQueue;
use autopack::preflight::{run_preflight, PreflightSeverity};
use autopack::router::StaticQuota;
use autopack::store::RunStore;
use autopack::supervisor::{supervise_run, LocalControlPlane, NoopCallbacks};
use autopack::telemetry::{EventKind, TelemetrySink};
use autopack::types::{
    parse_category, parse_complexity, PhaseRecord, PhaseScope, RunRecord, RunState,
    SymbolRequirement, DEFAULT_MAX_ATTEMPTS,
};
use autopack::{log_error, log_info};

#[derive(Parser)]
#[command(name = "autopack", about = "Autonomous code-build orchestrator")]
struct Cli {
    /// Workspace root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/autopack.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run's phases under supervision
    Run {
        /// Run to execute (must exist in the store unless --plan is given)
        #[arg(long)]
        run_id: Option<String>,
        /// Plan file to load (run + phases) before executing
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Replay failed phases under session budgets
    Drain {
        #[arg(long)]
        batch_size: Option<u32>,
        /// Per-phase timeout in seconds
        #[arg(long)]
        phase_timeout: Option<u64>,
        #[arg(long)]
        max_total_minutes: Option<u64>,
        #[arg(long)]
        max_timeouts_per_run: Option<u32>,
        #[arg(long)]
        max_attempts_per_phase: Option<u32>,
        #[arg(long)]
        max_fingerprint_repeats: Option<u32>,
        #[arg(long)]
        max_consecutive_zero_yield: Option<u32>,
        /// Resume an existing session by id
        #[arg(long)]
        resume: Option<String>,
    },
    /// Validate config, store, scopes, queue, and locks
    VerifyWorkspace,
    /// Consolidate loose artifacts into archive buckets and the SOT ledger
    Tidy {
        /// Perform the moves (default is a dry run)
        #[arg(long, conflicts_with = "dry_run")]
        execute: bool,
        /// Report what would move without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a deterministic set of telemetry events for dashboard checks
    SeedTelemetry,
}

/// Test runner dispatch: configured command or the always-green null runner.
enum WorkspaceTestRunner {
    Command(CommandTestRunner),
    Null(NullTestRunner),
}

impl TestRunner for WorkspaceTestRunner {
    async fn run_tests(&self) -> Result<BTreeSet<String>, String> {
        match self {
            WorkspaceTestRunner::Command(runner) => runner.run_tests().await,
            WorkspaceTestRunner::Null(runner) => runner.run_tests().await,
        }
    }
}

// --- Plan file ---

#[derive(Deserialize)]
struct PlanFile {
    run: PlanRun,
    phases: Vec<PlanPhase>,
}

#[derive(Deserialize)]
struct PlanRun {
    run_id: String,
    project_id: String,
    #[serde(default = "default_token_budget")]
    token_budget: u64,
}

fn default_token_budget() -> u64 {
    1_000_000
}

#[derive(Deserialize)]
struct PlanPhase {
    phase_id: String,
    phase_index: u32,
    goal: String,
    category: String,
    complexity: String,
    #[serde(default)]
    deliverables: Vec<String>,
    scope: PhaseScope,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    symbol_manifest: Vec<SymbolRequirement>,
}

fn load_plan(store: &mut RunStore, path: &Path) -> Result<String, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read plan {}: {}", path.display(), e))?;
    let plan: PlanFile = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse plan {}: {}", path.display(), e))?;

    let run_id = plan.run.run_id.clone();
    if store.get_run(&run_id).is_err() {
        store.insert_run(RunRecord {
            run_id: run_id.clone(),
            project_id: plan.run.project_id,
            state: RunState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            token_budget: plan.run.token_budget,
            tokens_used: 0,
        })?;
    }

    for phase in plan.phases {
        if store.get_phase(&phase.phase_id).is_ok() {
            continue;
        }
        store.insert_phase(PhaseRecord {
            phase_id: phase.phase_id,
            run_id: run_id.clone(),
            phase_index: phase.phase_index,
            goal: phase.goal,
            category: parse_category(&phase.category)?,
            complexity: parse_complexity(&phase.complexity)?,
            deliverables: phase.deliverables,
            scope: phase.scope,
            state: Default::default(),
            attempts_used: 0,
            max_attempts: phase.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_failure_reason: None,
            last_fingerprint: None,
            symbol_manifest: phase.symbol_manifest,
        })?;
    }

    Ok(run_id)
}

// --- Entry ---

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => autopack::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }

    if let Err(e) = install_signal_handlers() {
        log_error!("Error: {}", e);
        std::process::exit(1);
    }

    let root = cli.root.clone();
    let config = match config::load_config_from(cli.config.as_deref(), &root) {
        Ok(config) => config,
        Err(e) => {
            log_error!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let exit_code = match cli.command {
        Commands::Run { run_id, plan } => handle_run(&root, &config, run_id, plan).await,
        Commands::Drain {
            batch_size,
            phase_timeout,
            max_total_minutes,
            max_timeouts_per_run,
            max_attempts_per_phase,
            max_fingerprint_repeats,
            max_consecutive_zero_yield,
            resume,
        } => {
            let mut limits = DrainLimits::from_config(&config.drain);
            if let Some(v) = phase_timeout {
                limits.phase_timeout_seconds = v;
            }
            if let Some(v) = max_total_minutes {
                limits.max_total_minutes = v;
            }
            if let Some(v) = max_timeouts_per_run {
                limits.max_timeouts_per_run = v;
            }
            if let Some(v) = max_attempts_per_phase {
                limits.max_attempts_per_phase = v;
            }
            if let Some(v) = max_fingerprint_repeats {
                limits.max_fingerprint_repeats = v;
            }
            if let Some(v) = max_consecutive_zero_yield {
                limits.max_consecutive_zero_yield = v;
            }
            handle_drain(
                &root,
                &config,
                batch_size.unwrap_or(config.drain.batch_size),
                limits,
                resume,
            )
            .await
        }
        Commands::VerifyWorkspace => handle_verify(&root, &config),
        Commands::Tidy { execute, dry_run: _ } => handle_tidy(&root, &config, execute),
        Commands::SeedTelemetry => handle_seed_telemetry(&root),
    };

    kill_all_children();
    std::process::exit(exit_code);
}

fn open_store(root: &Path) -> Result<RunStore, ApError> {
    let runtime = RuntimeLayout::new(root);
    RunStore::open(&runtime.state_file())
}

async fn handle_run(
    root: &Path,
    config: &AutopackConfig,
    run_id: Option<String>,
    plan: Option<PathBuf>,
) -> i32 {
    let runtime = RuntimeLayout::new(root);
    let mut store = match open_store(root) {
        Ok(store) => store,
        Err(e) => {
            log_error!("Error: {}", e);
            return e.exit_code();
        }
    };

    let run_id = match (plan, run_id) {
        (Some(plan_path), maybe_id) => match load_plan(&mut store, &plan_path) {
            Ok(loaded) => maybe_id.unwrap_or(loaded),
            Err(e) => {
                log_error!("Error: {}", e);
                return 2;
            }
        },
        (None, Some(id)) => id,
        (None, None) => {
            log_error!("Error: provide --run-id or --plan");
            return 2;
        }
    };

    let agent = CliAgentRunner::new(config.agent.cli.clone());
    if let Err(e) = agent.verify_cli_available() {
        log_error!("Error: {}", e);
        return 2;
    }

    let tests = if config.tests.command.is_empty() {
        WorkspaceTestRunner::Null(NullTestRunner)
    } else {
        WorkspaceTestRunner::Command(CommandTestRunner {
            command: config.tests.command.clone(),
            workspace_root: root.to_path_buf(),
            timeout: Duration::from_secs(config.tests.timeout_seconds),
        })
    };

    let memory = NullMemory;
    let quota = StaticQuota::new();
    let telemetry = TelemetrySink::new(runtime.telemetry_file());
    let cancel = CancellationToken::new();

    let env = ExecutorEnv {
        config,
        agent: &agent,
        tests: &tests,
        memory: &memory,
        quota: &quota,
        telemetry: &telemetry,
        runtime: &runtime,
        workspace_root: root,
        cancel: &cancel,
    };

    let mut gateway = ApprovalGateway::new(
        config.execution.approval_timeout_seconds,
        config.execution.auto_approve,
        Some(runtime.runtime_dir().join("approvals_audit.jsonl")),
    );

    match supervise_run(
        &env,
        &mut store,
        &mut gateway,
        &LocalControlPlane,
        &NoopCallbacks,
        &run_id,
    )
    .await
    {
        Ok(summary) => {
            log_info!(
                "Run {}: {} executed, {} completed, {} failed, {} tokens ({:?})",
                run_id,
                summary.phases_executed,
                summary.phases_completed.len(),
                summary.phases_failed.len(),
                summary.tokens_used,
                summary.halt_reason
            );
            if summary.phases_failed.is_empty() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            log_error!("Error: {}", e);
            e.exit_code()
        }
    }
}

async fn handle_drain(
    root: &Path,
    config: &AutopackConfig,
    batch_size: u32,
    limits: DrainLimits,
    resume: Option<String>,
) -> i32 {
    let runtime = RuntimeLayout::new(root);
    let mut store = match open_store(root) {
        Ok(store) => store,
        Err(e) => {
            log_error!("Error: {}", e);
            return e.exit_code();
        }
    };

    let (mut session, session_path) = match resume {
        Some(session_id) => {
            let path = runtime.drain_session_file(&session_id);
            match DrainSession::load(&path) {
                Ok(session) => (session, path),
                Err(e) => {
                    log_error!("Error: {}", e);
                    return 2;
                }
            }
        }
        None => {
            let session_id = format!("drain-{}", Utc::now().format("%Y%m%d-%H%M%S"));
            let path = runtime.drain_session_file(&session_id);
            (DrainSession::new(&session_id, batch_size, limits), path)
        }
    };

    let agent = CliAgentRunner::new(config.agent.cli.clone());
    let tests = if config.tests.command.is_empty() {
        WorkspaceTestRunner::Null(NullTestRunner)
    } else {
        WorkspaceTestRunner::Command(CommandTestRunner {
            command: config.tests.command.clone(),
            workspace_root: root.to_path_buf(),
            timeout: Duration::from_secs(config.tests.timeout_seconds),
        })
    };
    let memory = NullMemory;
    let quota = StaticQuota::new();
    let telemetry = TelemetrySink::new(runtime.telemetry_file());
    let cancel = CancellationToken::new();

    let env = ExecutorEnv {
        config,
        agent: &agent,
        tests: &tests,
        memory: &memory,
        quota: &quota,
        telemetry: &telemetry,
        runtime: &runtime,
        workspace_root: root,
        cancel: &cancel,
    };

    let mut gateway = ApprovalGateway::new(
        config.execution.approval_timeout_seconds,
        config.execution.auto_approve,
        Some(runtime.runtime_dir().join("approvals_audit.jsonl")),
    );

    match run_drain(&env, &mut store, &mut gateway, &mut session, &session_path).await {
        Ok(halt) => {
            let completed = session
                .results
                .iter()
                .filter(|r| r.final_state == autopack::types::PhaseState::Complete)
                .count();
            log_info!(
                "Drain session {}: {} results, {} completed, halt {:?}",
                session.session_id,
                session.results.len(),
                completed,
                halt
            );
            0
        }
        Err(e) => {
            log_error!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn handle_verify(root: &Path, config: &AutopackConfig) -> i32 {
    match run_preflight(config, root) {
        Ok(()) => {
            log_info!("Workspace verification passed");
            0
        }
        Err((severity, errors)) => {
            for error in &errors {
                log_error!("{}", error);
            }
            log_error!("Workspace verification failed with {} error(s)", errors.len());
            match severity {
                PreflightSeverity::Config => 2,
                PreflightSeverity::Workspace => 4,
            }
        }
    }
}

fn handle_tidy(root: &Path, config: &AutopackConfig, execute: bool) -> i32 {
    let runtime = RuntimeLayout::new(root);
    let queue = PendingMovesQueue::new(runtime.pending_moves_file());

    // Drain due retries first; the queue is the source of truth for moves
    // that previously hit locks.
    match queue.drain(Utc::now()) {
        Ok((succeeded, pending, abandoned)) => {
            if succeeded + pending + abandoned > 0 {
                log_info!(
                    "Pending moves: {} succeeded, {} still pending, {} abandoned",
                    succeeded,
                    pending,
                    abandoned
                );
            }
        }
        Err(e) => {
            log_error!("Error: {}", e);
            return 1;
        }
    }

    match autopack::tidy::tidy(root, &config.protection, &queue, execute) {
        Ok(report) => {
            let mode = if report.dry_run { "dry-run" } else { "execute" };
            log_info!(
                "Tidy ({}): {} moved, {} duplicate, {} protected, {} queued locked, {} to misc",
                mode,
                report.moved.len(),
                report.skipped_duplicate,
                report.skipped_protected,
                report.queued_locked,
                report.routed_to_misc
            );
            for (src, dest) in &report.moved {
                log_info!("  {} -> {}", src, dest);
            }
            0
        }
        Err(e) => {
            log_error!("Error: {}", e);
            1
        }
    }
}

fn handle_seed_telemetry(root: &Path) -> i32 {
    let runtime = RuntimeLayout::new(root);
    let sink = TelemetrySink::new(runtime.telemetry_file());

    let seeds = [
        (EventKind::RoutingDecision, serde_json::json!({"model": "sonnet", "budget": 12000})),
        (EventKind::TokenUsage, serde_json::json!({"tokens": 2048})),
        (EventKind::GovernanceDecision, serde_json::json!({"risk": "LOW", "ruling": "AutoApprove"})),
        (EventKind::PhaseOutcome, serde_json::json!({"outcome": "COMPLETE", "attempt": 1})),
        (EventKind::Approval, serde_json::json!({"approval_id": "apr-seed-1", "decision": "APPROVED"})),
        (EventKind::DrainResult, serde_json::json!({"final_state": "Complete", "duration_s": 4.2})),
    ];

    for (kind, payload) in seeds {
        if let Err(e) = sink.emit("seed-run", Some("seed-phase"), None, kind, payload) {
            log_error!("Error: {}", e);
            return 1;
        }
    }
    log_info!("Seeded {} telemetry events at {}", 6, sink.path().display());
    0
}
