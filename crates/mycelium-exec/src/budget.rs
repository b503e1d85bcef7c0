//! Budget enforcement over aggregated usage.
//!
//! Usage snapshots arrive from the worker's `turn.complete` events, already
//! folded into per-task and run totals by the batch engine. After a batch's
//! tasks are finalized the engine asks for breaches; `block` mode turns the
//! first breach into a run-stopping reason, `warn` only logs.

use mycelium_core::config::BudgetConfig;
use mycelium_core::events::BudgetPayload;
use mycelium_core::types::{EnforcementMode, RunState, StopReason};
use tracing::warn;

/// A threshold that was exceeded.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetBreach {
    /// `task:<id>` or `run`.
    pub scope: String,
    /// `tokens` or `cost`.
    pub metric: String,
    pub observed: f64,
    pub limit: f64,
}

impl BudgetBreach {
    pub fn to_payload(&self) -> BudgetPayload {
        BudgetPayload {
            scope: self.scope.clone(),
            metric: self.metric.clone(),
            observed: self.observed,
            limit: self.limit,
        }
    }
}

/// Result of evaluating budgets after a batch.
#[derive(Debug, Clone, Default)]
pub struct BudgetVerdict {
    pub breaches: Vec<BudgetBreach>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    pub fn mode(&self) -> EnforcementMode {
        self.config.mode
    }

    /// Evaluate all configured thresholds against the current state.
    ///
    /// In `block` mode any breach yields `StopReason::BudgetBlock`; in
    /// `warn` mode breaches are returned for logging only; `off` returns
    /// nothing at all.
    pub fn evaluate_breaches(&self, state: &RunState) -> BudgetVerdict {
        if self.config.mode == EnforcementMode::Off {
            return BudgetVerdict::default();
        }

        let mut breaches = Vec::new();

        for (task_id, task) in &state.tasks {
            if let Some(limit) = self.config.max_tokens_per_task {
                let observed = task.usage.total_tokens();
                if observed > limit {
                    breaches.push(BudgetBreach {
                        scope: format!("task:{task_id}"),
                        metric: "tokens".to_string(),
                        observed: observed as f64,
                        limit: limit as f64,
                    });
                }
            }
            if let Some(limit) = self.config.max_cost_per_task {
                if task.usage.estimated_cost > limit {
                    breaches.push(BudgetBreach {
                        scope: format!("task:{task_id}"),
                        metric: "cost".to_string(),
                        observed: task.usage.estimated_cost,
                        limit,
                    });
                }
            }
        }

        if let Some(limit) = self.config.max_tokens_per_run {
            let observed = state.usage.total_tokens();
            if observed > limit {
                breaches.push(BudgetBreach {
                    scope: "run".to_string(),
                    metric: "tokens".to_string(),
                    observed: observed as f64,
                    limit: limit as f64,
                });
            }
        }
        if let Some(limit) = self.config.max_cost_per_run {
            if state.usage.estimated_cost > limit {
                breaches.push(BudgetBreach {
                    scope: "run".to_string(),
                    metric: "cost".to_string(),
                    observed: state.usage.estimated_cost,
                    limit,
                });
            }
        }

        for breach in &breaches {
            warn!(
                scope = %breach.scope,
                metric = %breach.metric,
                observed = breach.observed,
                limit = breach.limit,
                "budget threshold exceeded"
            );
        }

        let stop_reason = if self.config.mode == EnforcementMode::Block && !breaches.is_empty() {
            Some(StopReason::BudgetBlock)
        } else {
            None
        };

        BudgetVerdict {
            breaches,
            stop_reason,
        }
    }
}
