use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::types::{Category, Complexity, RiskLevel};

// --- Root config ---

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AutopackConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub agent: AgentConfig,
    pub routing: RoutingConfig,
    pub budgets: BudgetConfig,
    pub protection: ProtectionPolicy,
    pub finalizer: FinalizerConfig,
    pub drain: DrainConfig,
    pub memory: MemoryConfig,
    pub tests: TestConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Run family segment in `runs/<family>/<run_id>/`.
    pub family: String,
    pub project_id: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            family: "default".to_string(),
            project_id: "default".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub phase_timeout_seconds: u64,
    pub max_attempts_per_phase: u32,
    pub approval_timeout_seconds: u64,
    /// Test-only shortcut: approvals resolve immediately as APPROVED.
    pub auto_approve: bool,
    pub environment: Environment,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            phase_timeout_seconds: 900,
            max_attempts_per_phase: 5,
            approval_timeout_seconds: 3600,
            auto_approve: false,
            environment: Environment::Development,
        }
    }
}

#[derive(Default, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliTool {
    #[default]
    Claude,
    OpenCode,
}

impl CliTool {
    pub fn binary_name(&self) -> &str {
        match self {
            CliTool::Claude => "claude",
            CliTool::OpenCode => "opencode",
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            CliTool::Claude => "Claude CLI",
            CliTool::OpenCode => "OpenCode CLI",
        }
    }

    pub fn build_args(&self, prompt: &str, model: &str) -> Vec<String> {
        match self {
            CliTool::Claude => vec![
                "--dangerously-skip-permissions".to_string(),
                "--model".to_string(),
                model.to_string(),
                "-p".to_string(),
                prompt.to_string(),
            ],
            CliTool::OpenCode => vec![
                "run".to_string(),
                "--model".to_string(),
                model.to_string(),
                "--quiet".to_string(),
                prompt.to_string(),
            ],
        }
    }

    pub fn version_args(&self) -> Vec<&str> {
        vec!["--version"]
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub cli: CliTool,
}

// --- Routing policy (C1 contract: GetRoutingPolicy) ---

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    BestFirst,
    Progressive,
    CheapFirst,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingStrategy::BestFirst => write!(f, "best_first"),
            RoutingStrategy::Progressive => write!(f, "progressive"),
            RoutingStrategy::CheapFirst => write!(f, "cheap_first"),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EscalationTarget {
    pub builder: String,
    pub auditor: String,
    /// 1-based boundary: attempts with `attempt_index >= after_attempts`
    /// route to the escalation target.
    pub after_attempts: u32,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RoutingPolicy {
    pub strategy: RoutingStrategy,
    pub builder_primary: String,
    pub auditor_primary: String,
    #[serde(default)]
    pub secondary_auditor: Option<String>,
    #[serde(default)]
    pub dual_audit: bool,
    #[serde(default)]
    pub escalate_to: Option<EscalationTarget>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// When true, best-first categories raise QuotaBlocked instead of
    /// substituting a weaker model. Never disable in production.
    pub enforce: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { enforce: true }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    pub quota: QuotaConfig,
    pub categories: HashMap<String, RoutingPolicy>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            categories: default_routing_categories(),
        }
    }
}

impl RoutingConfig {
    /// Unknown categories fall back to `other` (progressive).
    pub fn policy_for(&self, category: Category) -> &RoutingPolicy {
        self.categories
            .get(&category.to_string())
            .or_else(|| self.categories.get("other"))
            .expect("routing config always carries an 'other' policy after validation")
    }
}

fn best_first(model: &str) -> RoutingPolicy {
    RoutingPolicy {
        strategy: RoutingStrategy::BestFirst,
        builder_primary: model.to_string(),
        auditor_primary: model.to_string(),
        secondary_auditor: None,
        dual_audit: true,
        escalate_to: None,
    }
}

fn progressive(primary: &str, escalated: &str, after: u32) -> RoutingPolicy {
    RoutingPolicy {
        strategy: RoutingStrategy::Progressive,
        builder_primary: primary.to_string(),
        auditor_primary: primary.to_string(),
        secondary_auditor: None,
        dual_audit: false,
        escalate_to: Some(EscalationTarget {
            builder: escalated.to_string(),
            auditor: escalated.to_string(),
            after_attempts: after,
        }),
    }
}

fn cheap_first(primary: &str, escalated: &str, after: u32) -> RoutingPolicy {
    RoutingPolicy {
        strategy: RoutingStrategy::CheapFirst,
        builder_primary: primary.to_string(),
        auditor_primary: primary.to_string(),
        secondary_auditor: None,
        dual_audit: false,
        escalate_to: Some(EscalationTarget {
            builder: escalated.to_string(),
            auditor: escalated.to_string(),
            after_attempts: after,
        }),
    }
}

pub fn default_routing_categories() -> HashMap<String, RoutingPolicy> {
    let mut categories = HashMap::new();
    categories.insert("security_auth_change".to_string(), best_first("opus"));
    categories.insert("schema_contract_change".to_string(), best_first("opus"));
    categories.insert("external_feature_reuse".to_string(), best_first("opus"));
    categories.insert(
        "core_backend_high".to_string(),
        progressive("sonnet", "opus", 2),
    );
    categories.insert("docs".to_string(), cheap_first("haiku", "sonnet", 2));
    categories.insert("tests".to_string(), cheap_first("haiku", "sonnet", 2));
    categories.insert("other".to_string(), progressive("sonnet", "opus", 2));
    categories
}

// --- Token budgets (complexity-coupled escalation ladder) ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub low: Vec<u64>,
    pub medium: Vec<u64>,
    pub high: Vec<u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            low: vec![8_000, 12_000, 16_000],
            medium: vec![12_000, 16_000, 24_000],
            high: vec![16_000, 24_000, 32_000],
        }
    }
}

impl BudgetConfig {
    /// Token budget for a given complexity and 1-based attempt index.
    /// Attempts beyond the ladder stay at the top rung.
    pub fn budget_for(&self, complexity: Complexity, attempt_index: u32) -> u64 {
        let ladder = match complexity {
            Complexity::Low => &self.low,
            Complexity::Medium => &self.medium,
            Complexity::High => &self.high,
        };
        let idx = (attempt_index.max(1) as usize - 1).min(ladder.len().saturating_sub(1));
        ladder.get(idx).copied().unwrap_or(8_000)
    }
}

// --- Protection policy (single source of truth for protected paths) ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProtectedGroup {
    pub name: String,
    pub patterns: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetentionWindows {
    pub short_term_days: u32,
    pub medium_term_days: u32,
    pub long_term_days: u32,
}

impl Default for RetentionWindows {
    fn default() -> Self {
        Self {
            short_term_days: 30,
            medium_term_days: 90,
            long_term_days: 180,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SubsystemOverrides {
    /// Tidy never moves or deletes protected paths.
    pub tidy_skips_protected: bool,
    /// Storage optimizer may scan protected paths but never delete them.
    pub optimizer_may_scan: bool,
}

impl Default for SubsystemOverrides {
    fn default() -> Self {
        Self {
            tidy_skips_protected: true,
            optimizer_may_scan: true,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProtectionPolicy {
    pub groups: Vec<ProtectedGroup>,
    pub retention: RetentionWindows,
    pub overrides: SubsystemOverrides,
    /// Paths that can never be auto-approved, even at LOW risk.
    pub never_auto_approve: Vec<String>,
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        let group = |name: &str, patterns: &[&str]| ProtectedGroup {
            name: name.to_string(),
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            groups: vec![
                group("vcs", &[".git/**", ".git"]),
                group("sot_docs", &["PROJECT_HISTORY.md", "DEBUG_LOG.md", "DECISIONS.md", "LEARNED_RULES.md"]),
                group("databases", &["autopack.db", "*.db-wal", "*.db-shm"]),
                group("engine_config", &["autopack.toml", ".autopack/state.json"]),
                group("audit_trails", &["runs/*/*/handoff/approvals.jsonl"]),
                group("active_state", &[".autopack/*.lock", ".autopack/*.pid"]),
                group("ci_config", &[".github/**", ".gitlab-ci.yml"]),
            ],
            retention: RetentionWindows::default(),
            overrides: SubsystemOverrides::default(),
            never_auto_approve: vec![
                ".env".to_string(),
                "**/secrets/**".to_string(),
                "**/*.pem".to_string(),
            ],
        }
    }
}

impl ProtectionPolicy {
    /// Whether a workspace-relative path matches any protected pattern.
    pub fn is_protected(&self, path: &str) -> bool {
        self.groups.iter().any(|g| {
            g.patterns
                .iter()
                .any(|p| crate::governance::glob_match(p, path))
        })
    }

    pub fn is_never_auto_approve(&self, path: &str) -> bool {
        self.never_auto_approve
            .iter()
            .any(|p| crate::governance::glob_match(p, path))
    }
}

// --- Finalizer knobs ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FinalizerConfig {
    /// When false (default), a missing coverage baseline is treated as a
    /// zero delta and does not block Gate 1.
    pub require_coverage_baseline: bool,
    /// Risk above this level blocks Gate 1 unless approved.
    pub max_unapproved_risk: RiskLevel,
    /// Roll the workspace back to the save point on BLOCKED/FAILED.
    pub rollback_on_block: bool,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            require_coverage_baseline: false,
            max_unapproved_risk: RiskLevel::High,
            rollback_on_block: true,
        }
    }
}

// --- Drain defaults ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DrainConfig {
    pub batch_size: u32,
    pub phase_timeout_seconds: u64,
    pub max_total_minutes: u64,
    pub max_timeouts_per_run: u32,
    pub max_attempts_per_phase: u32,
    pub max_fingerprint_repeats: u32,
    pub max_consecutive_zero_yield: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            phase_timeout_seconds: 900,
            max_total_minutes: 120,
            max_timeouts_per_run: 3,
            max_attempts_per_phase: 2,
            max_fingerprint_repeats: 3,
            max_consecutive_zero_yield: 3,
        }
    }
}

// --- Memory / retrieval flags ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub enable_memory: bool,
    pub use_qdrant: bool,
    pub sot_retrieval_enabled: bool,
    pub sot_retrieval_max_chars: usize,
    pub enable_consolidated_metrics: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable_memory: false,
            use_qdrant: false,
            sot_retrieval_enabled: true,
            sot_retrieval_max_chars: 8_000,
            enable_consolidated_metrics: false,
        }
    }
}

// --- Test runner ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    /// Command that runs the project's test suite and prints one failing
    /// test id per line prefixed with `FAIL ` on stdout.
    pub command: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: vec![],
            timeout_seconds: 600,
        }
    }
}

// --- Validation ---

pub fn validate(config: &AutopackConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.max_attempts_per_phase < 1 {
        errors.push("execution.max_attempts_per_phase must be >= 1".to_string());
    }

    if config.execution.phase_timeout_seconds == 0 {
        errors.push("execution.phase_timeout_seconds must be > 0".to_string());
    }

    if config.execution.auto_approve && config.execution.environment == Environment::Production {
        errors.push("execution.auto_approve is test-only and forbidden in production".to_string());
    }

    if !config.routing.categories.contains_key("other") {
        errors.push("routing.categories must define the 'other' fallback".to_string());
    }

    for (name, policy) in &config.routing.categories {
        if crate::types::parse_category(name).is_err() {
            errors.push(format!(
                "routing.categories.{}: unknown category name",
                name
            ));
        }

        if policy.builder_primary.trim().is_empty() {
            errors.push(format!(
                "routing.categories.{}: builder_primary must not be empty",
                name
            ));
        }

        match policy.strategy {
            RoutingStrategy::BestFirst => {
                // best_first must declare quota-block behavior and never
                // carries an escalation ladder
                if policy.escalate_to.is_some() {
                    errors.push(format!(
                        "routing.categories.{}: best_first does not escalate; remove escalate_to",
                        name
                    ));
                }
                if !config.routing.quota.enforce {
                    errors.push(format!(
                        "routing.categories.{}: best_first requires routing.quota.enforce = true",
                        name
                    ));
                }
            }
            RoutingStrategy::Progressive => {
                match &policy.escalate_to {
                    None => errors.push(format!(
                        "routing.categories.{}: progressive requires escalate_to",
                        name
                    )),
                    Some(esc) if esc.after_attempts < 1 => errors.push(format!(
                        "routing.categories.{}: escalate_to.after_attempts must be >= 1",
                        name
                    )),
                    Some(_) => {}
                }
            }
            RoutingStrategy::CheapFirst => {
                if let Some(esc) = &policy.escalate_to {
                    if esc.after_attempts < 1 {
                        errors.push(format!(
                            "routing.categories.{}: escalate_to.after_attempts must be >= 1",
                            name
                        ));
                    }
                }
            }
        }
    }

    for (label, ladder) in [
        ("budgets.low", &config.budgets.low),
        ("budgets.medium", &config.budgets.medium),
        ("budgets.high", &config.budgets.high),
    ] {
        if ladder.is_empty() {
            errors.push(format!("{}: must list at least one budget rung", label));
        }
        if ladder.windows(2).any(|w| w[0] > w[1]) {
            errors.push(format!("{}: budget rungs must be non-decreasing", label));
        }
    }

    for group in &config.protection.groups {
        if group.patterns.is_empty() {
            errors.push(format!(
                "protection.groups.{}: must list at least one pattern",
                group.name
            ));
        }
        for pattern in &group.patterns {
            if glob::Pattern::new(pattern).is_err() {
                errors.push(format!(
                    "protection.groups.{}: invalid glob pattern '{}'",
                    group.name, pattern
                ));
            }
        }
    }

    if config.drain.batch_size < 1 {
        errors.push("drain.batch_size must be >= 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// --- Env overrides ---

/// Apply recognized environment variables over the loaded file config.
/// Unparseable values are reported as errors rather than ignored.
pub fn apply_env_overrides(
    config: &mut AutopackConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), String> {
    fn parse_bool(name: &str, raw: &str) -> Result<bool, String> {
        match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(format!("{}: expected a boolean, got '{}'", name, raw)),
        }
    }

    if let Some(raw) = lookup("PHASE_TIMEOUT_SECONDS") {
        config.execution.phase_timeout_seconds = raw
            .parse()
            .map_err(|_| format!("PHASE_TIMEOUT_SECONDS: expected an integer, got '{}'", raw))?;
    }
    if let Some(raw) = lookup("MAX_ATTEMPTS_PER_PHASE") {
        config.execution.max_attempts_per_phase = raw
            .parse()
            .map_err(|_| format!("MAX_ATTEMPTS_PER_PHASE: expected an integer, got '{}'", raw))?;
    }
    if let Some(raw) = lookup("AUTO_APPROVE") {
        config.execution.auto_approve = parse_bool("AUTO_APPROVE", &raw)?;
    }
    if let Some(raw) = lookup("ENABLE_MEMORY") {
        config.memory.enable_memory = parse_bool("ENABLE_MEMORY", &raw)?;
    }
    if let Some(raw) = lookup("USE_QDRANT") {
        config.memory.use_qdrant = parse_bool("USE_QDRANT", &raw)?;
    }
    if let Some(raw) = lookup("SOT_RETRIEVAL_ENABLED") {
        config.memory.sot_retrieval_enabled = parse_bool("SOT_RETRIEVAL_ENABLED", &raw)?;
    }
    if let Some(raw) = lookup("SOT_RETRIEVAL_MAX_CHARS") {
        config.memory.sot_retrieval_max_chars = raw.parse().map_err(|_| {
            format!("SOT_RETRIEVAL_MAX_CHARS: expected an integer, got '{}'", raw)
        })?;
    }
    if let Some(raw) = lookup("ENABLE_CONSOLIDATED_METRICS") {
        config.memory.enable_consolidated_metrics =
            parse_bool("ENABLE_CONSOLIDATED_METRICS", &raw)?;
    }
    if let Some(raw) = lookup("ENV") {
        config.execution.environment = match raw.to_lowercase().as_str() {
            "development" => Environment::Development,
            "production" => Environment::Production,
            _ => return Err(format!("ENV: expected development or production, got '{}'", raw)),
        };
    }

    Ok(())
}

// --- Loading ---

/// Load config from an explicit path (if provided) or fall back to
/// `{workspace_root}/autopack.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None`, a
/// missing file yields the built-in defaults.
pub fn load_config_from(
    config_path: Option<&Path>,
    workspace_root: &Path,
) -> Result<AutopackConfig, String> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            load_config_at(path)
        }
        None => {
            let path = workspace_root.join("autopack.toml");
            if !path.exists() {
                let mut config = AutopackConfig::default();
                finish_load(&mut config)?;
                return Ok(config);
            }
            load_config_at(&path)
        }
    }
}

fn load_config_at(path: &Path) -> Result<AutopackConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: AutopackConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    populate_default_routing(&mut config);
    finish_load(&mut config)?;
    Ok(config)
}

fn finish_load(config: &mut AutopackConfig) -> Result<(), String> {
    apply_env_overrides(config, |name| std::env::var(name).ok())?;

    validate(config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })
}

fn populate_default_routing(config: &mut AutopackConfig) {
    if config.routing.categories.is_empty() {
        config.routing.categories = default_routing_categories();
    } else if !config.routing.categories.contains_key("other") {
        if let Some(policy) = default_routing_categories().remove("other") {
            config
                .routing
                .categories
                .insert("other".to_string(), policy);
        }
    }
}
