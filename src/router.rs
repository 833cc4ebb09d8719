use crate::config::{BudgetConfig, RoutingConfig, RoutingStrategy};
use crate::error::ApError;
use crate::types::{Category, Complexity, Role};

/// Quota visibility for the router. The production ledger is fed from
/// provider responses; tests script it directly.
pub trait QuotaLedger: Send + Sync {
    fn is_exhausted(&self, model_id: &str) -> bool;
}

/// Ledger with a fixed set of exhausted models.
#[derive(Default)]
pub struct StaticQuota {
    exhausted: std::collections::HashSet<String>,
}

impl StaticQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exhausted<I: IntoIterator<Item = S>, S: Into<String>>(models: I) -> Self {
        StaticQuota {
            exhausted: models.into_iter().map(Into::into).collect(),
        }
    }

    pub fn mark_exhausted(&mut self, model_id: &str) {
        self.exhausted.insert(model_id.to_string());
    }
}

impl QuotaLedger for StaticQuota {
    fn is_exhausted(&self, model_id: &str) -> bool {
        self.exhausted.contains(model_id)
    }
}

/// The routing outcome for one attempt: which model, and how many tokens it
/// may spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub model_id: String,
    pub token_budget: u64,
    pub escalated: bool,
}

pub struct ModelRouter<'a> {
    routing: &'a RoutingConfig,
    budgets: &'a BudgetConfig,
    quota: &'a dyn QuotaLedger,
}

impl<'a> ModelRouter<'a> {
    pub fn new(
        routing: &'a RoutingConfig,
        budgets: &'a BudgetConfig,
        quota: &'a dyn QuotaLedger,
    ) -> Self {
        ModelRouter {
            routing,
            budgets,
            quota,
        }
    }

    /// Select the model and token budget for `(category, attempt, role)`.
    ///
    /// Strategy semantics:
    /// - `best_first`: always the declared primary; exhausted quota raises
    ///   `QuotaBlocked`, never a weaker substitute.
    /// - `progressive`: primary while `attempt_index < after_attempts`, then
    ///   the escalation target. An exhausted primary escalates early (never
    ///   downward); an exhausted escalation target raises `QuotaBlocked`.
    /// - `cheap_first`: same ladder, but an exhausted escalation target may
    ///   fall back to the primary (downgrade is permitted here).
    pub fn select(
        &self,
        category: Category,
        complexity: Complexity,
        attempt_index: u32,
        role: Role,
    ) -> Result<RouteDecision, ApError> {
        let policy = self.routing.policy_for(category);
        let primary = match role {
            Role::Builder => policy.builder_primary.as_str(),
            Role::Auditor => policy.auditor_primary.as_str(),
        };
        let token_budget = self.budgets.budget_for(complexity, attempt_index);

        match policy.strategy {
            RoutingStrategy::BestFirst => {
                if self.routing.quota.enforce && self.quota.is_exhausted(primary) {
                    return Err(ApError::QuotaBlocked {
                        model: primary.to_string(),
                        strategy: policy.strategy.to_string(),
                    });
                }
                Ok(RouteDecision {
                    model_id: primary.to_string(),
                    token_budget,
                    escalated: false,
                })
            }
            RoutingStrategy::Progressive => {
                let escalation = policy.escalate_to.as_ref();
                let past_threshold = escalation
                    .map(|esc| attempt_index >= esc.after_attempts)
                    .unwrap_or(false);
                let primary_exhausted = self.quota.is_exhausted(primary);

                if past_threshold || primary_exhausted {
                    let esc = escalation.ok_or_else(|| {
                        ApError::Config(format!(
                            "progressive policy for {} is missing escalate_to",
                            category
                        ))
                    })?;
                    let target = match role {
                        Role::Builder => esc.builder.as_str(),
                        Role::Auditor => esc.auditor.as_str(),
                    };
                    if self.routing.quota.enforce && self.quota.is_exhausted(target) {
                        return Err(ApError::QuotaBlocked {
                            model: target.to_string(),
                            strategy: policy.strategy.to_string(),
                        });
                    }
                    return Ok(RouteDecision {
                        model_id: target.to_string(),
                        token_budget,
                        escalated: true,
                    });
                }

                Ok(RouteDecision {
                    model_id: primary.to_string(),
                    token_budget,
                    escalated: false,
                })
            }
            RoutingStrategy::CheapFirst => {
                let escalation = policy.escalate_to.as_ref();
                let past_threshold = escalation
                    .map(|esc| attempt_index >= esc.after_attempts)
                    .unwrap_or(false);

                if past_threshold {
                    let esc = escalation.expect("checked above");
                    let target = match role {
                        Role::Builder => esc.builder.as_str(),
                        Role::Auditor => esc.auditor.as_str(),
                    };
                    if !self.quota.is_exhausted(target) {
                        return Ok(RouteDecision {
                            model_id: target.to_string(),
                            token_budget,
                            escalated: true,
                        });
                    }
                    // Downgrade permitted: fall through to the primary.
                }

                if self.routing.quota.enforce && self.quota.is_exhausted(primary) {
                    return Err(ApError::QuotaBlocked {
                        model: primary.to_string(),
                        strategy: policy.strategy.to_string(),
                    });
                }
                Ok(RouteDecision {
                    model_id: primary.to_string(),
                    token_budget,
                    escalated: false,
                })
            }
        }
    }
}
