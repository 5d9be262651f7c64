//! Budget ledger and admission control.
//!
//! The ledger is the single writer of cost records and the single source of
//! truth for spend figures. Budget state is derived from the ledger on every
//! read, never cached, so every component sees the same numbers.

use std::sync::Arc;

use spendwatch_core::{
    AdmissionDecision, BudgetAlertLevel, BudgetState, CostRecord, CostRepository, DenialReason,
    Result, SpendWatchError, DANGER_THRESHOLD_PCT,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Admission gate and spend accountant.
pub struct BudgetLedger {
    costs: Arc<dyn CostRepository>,
    /// Runtime-adjustable total budget in USD.
    total_budget_usd: RwLock<f64>,
}

impl BudgetLedger {
    /// Create a ledger with the given total budget.
    pub fn new(costs: Arc<dyn CostRepository>, total_budget_usd: f64) -> Result<Self> {
        validate_budget(total_budget_usd)?;
        Ok(Self {
            costs,
            total_budget_usd: RwLock::new(total_budget_usd),
        })
    }

    /// Append a cost record to the ledger and return the resulting state.
    pub async fn record(&self, record: CostRecord) -> Result<BudgetState> {
        if !record.amount_usd.is_finite() || record.amount_usd < 0.0 {
            return Err(SpendWatchError::Validation(format!(
                "cost amount must be a non-negative number, got {}",
                record.amount_usd
            )));
        }

        self.costs.append(&record).await?;

        let state = self.status().await?;
        info!(
            category = %record.category,
            amount_usd = record.amount_usd,
            total_spend_usd = state.current_spend_usd,
            percentage_used = state.percentage_used,
            "Cost recorded"
        );
        if state.alert_level >= BudgetAlertLevel::Warning {
            warn!(
                alert_level = %state.alert_level,
                percentage_used = state.percentage_used,
                "Budget threshold crossed"
            );
        }
        Ok(state)
    }

    /// Derived budget state, recomputed from the ledger.
    ///
    /// A failing ledger read degrades to zero spend rather than failing the
    /// caller; the degradation is logged.
    pub async fn status(&self) -> Result<BudgetState> {
        let total = *self.total_budget_usd.read().await;
        let spend = match self.costs.sum_all().await {
            Ok(spend) => spend,
            Err(e) => {
                warn!(error = %e, "Ledger read failed, treating spend as zero");
                0.0
            }
        };

        let percentage = if total > 0.0 {
            (spend / total) * 100.0
        } else {
            0.0
        };
        let alert_level = BudgetAlertLevel::from_percentage(percentage);

        Ok(BudgetState {
            total_budget_usd: total,
            current_spend_usd: spend,
            remaining_usd: total - spend,
            percentage_used: percentage,
            alert_level,
            can_proceed: percentage < DANGER_THRESHOLD_PCT,
        })
    }

    /// Probe the underlying cost repository.
    pub async fn health_check(&self) -> Result<()> {
        self.costs.health_check().await
    }

    /// Whether a cost record correlated to `job_id` already exists.
    ///
    /// Used to make terminal job-cost recording idempotent across restarts.
    pub async fn has_record_for_job(&self, job_id: uuid::Uuid) -> Result<bool> {
        self.costs.exists_for_job(job_id).await
    }

    /// Decide whether a paid operation with `estimated_cost_usd` may start.
    ///
    /// Checks run strictest first so the caller always sees the most
    /// fundamental reason for a denial.
    pub async fn can_proceed(&self, estimated_cost_usd: f64) -> Result<AdmissionDecision> {
        if !estimated_cost_usd.is_finite() || estimated_cost_usd < 0.0 {
            return Err(SpendWatchError::Validation(format!(
                "cost estimate must be a non-negative number, got {estimated_cost_usd}"
            )));
        }

        let state = self.status().await?;

        if state.alert_level >= BudgetAlertLevel::Exceeded {
            return Ok(AdmissionDecision::denied(DenialReason::BudgetExceeded));
        }
        if !state.can_proceed {
            return Ok(AdmissionDecision::denied(DenialReason::DangerThreshold));
        }
        if estimated_cost_usd > state.remaining_usd {
            return Ok(AdmissionDecision::denied(DenialReason::InsufficientRemaining));
        }
        Ok(AdmissionDecision::allowed())
    }

    /// Replace the total budget at runtime. Spend is never rewritten, so the
    /// derived state shifts immediately.
    pub async fn set_budget(&self, total_budget_usd: f64) -> Result<BudgetState> {
        validate_budget(total_budget_usd)?;
        {
            let mut budget = self.total_budget_usd.write().await;
            *budget = total_budget_usd;
        }
        let state = self.status().await?;
        info!(
            total_budget_usd,
            percentage_used = state.percentage_used,
            alert_level = %state.alert_level,
            "Budget updated"
        );
        Ok(state)
    }
}

fn validate_budget(amount: f64) -> Result<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(SpendWatchError::Validation(format!(
            "budget must be a positive number, got {amount}"
        )));
    }
    Ok(())
}
