use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::config::CliTool;
use crate::types::{PatchProposal, StopReason};
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install SIGTERM/SIGINT handlers that set the shutdown flag.
/// Call once at program startup; repeat calls re-register harmlessly.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process registry ---

fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// SIGTERM every registered child process group, wait the grace period,
/// then SIGKILL survivors.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);
    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Agent reply contract ---

/// Auditor verdict over a post-apply diff.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditVerdict {
    Approve,
    Block,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditReport {
    pub verdict: AuditVerdict,
    #[serde(default)]
    pub findings: Vec<String>,
}

/// What a Builder/Auditor subprocess writes to its reply file.
///
/// `stop_reason = max_tokens` marks a truncated reply; the executor enters
/// continuation recovery. A reply file whose JSON is cut off at the byte
/// boundary is classified the same way.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AgentReply {
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<PatchProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditReport>,
}

/// Trait for running Builder/Auditor agents. Enables mocking in executor
/// and supervisor tests.
pub trait AgentRunner: Send + Sync {
    fn run_agent(
        &self,
        prompt: &str,
        model_id: &str,
        reply_path: &Path,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<AgentReply, String>> + Send;
}

/// Real implementation that spawns a CLI agent as a subprocess.
pub struct CliAgentRunner {
    pub tool: CliTool,
}

impl CliAgentRunner {
    pub fn new(tool: CliTool) -> Self {
        Self { tool }
    }

    /// Verify that the configured CLI tool is available on PATH.
    pub fn verify_cli_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(self.tool.binary_name())
            .args(self.tool.version_args())
            .output()
            .map_err(|e| {
                format!(
                    "{} not found on PATH ({})",
                    self.tool.display_name(),
                    e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "{} found but `{} {}` failed",
                self.tool.display_name(),
                self.tool.binary_name(),
                self.tool.version_args().join(" ")
            ));
        }
        Ok(())
    }
}

impl AgentRunner for CliAgentRunner {
    async fn run_agent(
        &self,
        prompt: &str,
        model_id: &str,
        reply_path: &Path,
        timeout: Duration,
    ) -> Result<AgentReply, String> {
        let mut cmd = tokio::process::Command::new(self.tool.binary_name());
        cmd.args(self.tool.build_args(prompt, model_id));
        run_subprocess_agent(cmd, reply_path, timeout).await
    }
}

/// Spawn a subprocess agent, enforce the timeout, read the reply file.
///
/// The caller configures the `Command` (program, args, env); this handles
/// process-group isolation, timeout kill, shutdown-flag checks, and reply
/// parsing with truncation classification.
pub async fn run_subprocess_agent(
    mut cmd: tokio::process::Command,
    reply_path: &Path,
    timeout: Duration,
) -> Result<AgentReply, String> {
    // Delete a stale reply unconditionally to avoid TOCTOU on the check.
    match tokio::fs::remove_file(reply_path).await {
        Ok(()) => log_warn!(
            "Warning: Stale reply file found at {}, deleted",
            reply_path.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(format!(
                "Failed to remove stale reply file {}: {}",
                reply_path.display(),
                e
            ))
        }
    }

    // stdin MUST be null: with setpgid the child is in a background process
    // group and a terminal read would raise SIGTTIN (silent stop).
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe calls are permitted. setpgid qualifies per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[agent] Spawning subprocess...");
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn subprocess: {}", e))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    register_child(pgid);

    log_debug!("[agent] Waiting (timeout={}s)...", timeout.as_secs());
    let wait_result = tokio::time::timeout(timeout, child.wait()).await;

    match wait_result {
        Err(_) => {
            log_debug!(
                "[agent] TIMEOUT after {}s — killing process group",
                timeout.as_secs()
            );
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            Err(format!(
                "Agent timed out after {} seconds",
                timeout.as_secs()
            ))
        }
        Ok(wait_result) => {
            let exit_status =
                wait_result.map_err(|e| format!("Error waiting for subprocess: {}", e))?;
            unregister_child(pgid);

            if is_shutdown_requested() {
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                return Err("Shutdown requested".to_string());
            }

            let reply = read_reply_file(reply_path).await;

            match (exit_status.success(), reply) {
                (true, Ok(reply)) => {
                    cleanup_reply_file(reply_path).await;
                    Ok(reply)
                }
                (false, Ok(reply)) => {
                    log_warn!(
                        "Warning: Agent exited with non-zero status but produced a valid reply"
                    );
                    cleanup_reply_file(reply_path).await;
                    Ok(reply)
                }
                (_, Err(e)) => {
                    let exit_info = if exit_status.success() {
                        "zero exit".to_string()
                    } else {
                        format!("exit code {:?}", exit_status.code())
                    };
                    Err(format!("Agent failed ({}): {}", exit_info, e))
                }
            }
        }
    }
}

/// Kill a process group: SIGTERM, poll for exit, then SIGKILL.
/// Runs on the blocking pool so the poll loop never stalls a worker.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);
        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);
        while std::time::Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Read and parse an agent reply file. JSON cut off at the end of the file
/// is classified as a truncated reply, not a parse failure.
pub async fn read_reply_file(path: &Path) -> Result<AgentReply, String> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!("Reply file not found: {}", path.display())
        } else {
            format!("Failed to read reply file {}: {}", path.display(), e)
        }
    })?;

    match serde_json::from_str::<AgentReply>(&contents) {
        Ok(reply) => Ok(reply),
        Err(e) if e.is_eof() => Ok(AgentReply {
            stop_reason: StopReason::MaxTokens,
            ..AgentReply::default()
        }),
        Err(e) => Err(format!(
            "Failed to parse reply JSON from {}: {}",
            path.display(),
            e
        )),
    }
}

async fn cleanup_reply_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log_warn!(
            "Warning: Failed to clean up reply file {}: {}",
            path.display(),
            e
        );
    }
}

/// Mock agent runner for executor and supervisor tests: returns scripted
/// replies in sequence and records the prompts it received.
pub struct MockAgentRunner {
    replies: tokio::sync::Mutex<Vec<Result<AgentReply, String>>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

impl MockAgentRunner {
    pub fn new(replies: Vec<Result<AgentReply, String>>) -> Self {
        let mut reversed = replies;
        reversed.reverse();
        MockAgentRunner {
            replies: tokio::sync::Mutex::new(reversed),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl AgentRunner for MockAgentRunner {
    async fn run_agent(
        &self,
        prompt: &str,
        _model_id: &str,
        _reply_path: &Path,
        _timeout: Duration,
    ) -> Result<AgentReply, String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let mut replies = self.replies.lock().await;
        replies
            .pop()
            .unwrap_or_else(|| Err("MockAgentRunner: no more replies in sequence".to_string()))
    }
}
