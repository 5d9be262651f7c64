//! Cost anomaly and trend analysis.
//!
//! Spike detection runs event-driven on every new cost record against a
//! per-category sliding window of recent amounts. Trend detection runs on a
//! timer and compares the projected daily burn rate against the budget.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use spendwatch_core::{
    AlertSeverity, AnomalyConfig, BudgetState, CostAlert, CostAlertKind, CostCategory,
    CostProjection, CostRecord, CostRepository, Result,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed-capacity window over recent values, oldest evicted first.
#[derive(Debug, Clone)]
struct SlidingWindow {
    values: Vec<f64>,
    capacity: usize,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.remove(0);
        }
        self.values.push(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation.
    fn std_dev(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }
}

/// Detects spend spikes and budget-threatening trends.
pub struct AnomalyAnalyzer {
    costs: Arc<dyn CostRepository>,
    config: AnomalyConfig,
    windows: Mutex<HashMap<CostCategory, SlidingWindow>>,
    alerts: RwLock<Vec<CostAlert>>,
}

impl AnomalyAnalyzer {
    pub fn new(costs: Arc<dyn CostRepository>, config: AnomalyConfig) -> Self {
        Self {
            costs,
            config,
            windows: Mutex::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
        }
    }

    /// Seed the per-category windows from the ledger so detection does not
    /// start cold after a restart.
    pub async fn warm_up(&self) -> Result<()> {
        let categories = [
            CostCategory::ImageGeneration,
            CostCategory::VideoGeneration,
            CostCategory::TextGeneration,
            CostCategory::Embedding,
            CostCategory::Storage,
            CostCategory::Other,
        ];
        let mut windows = self.windows.lock().await;
        for category in categories {
            let recent = self
                .costs
                .list_by_category(category, self.config.window_size)
                .await?;
            if recent.is_empty() {
                continue;
            }
            let window = windows
                .entry(category)
                .or_insert_with(|| SlidingWindow::new(self.config.window_size));
            for record in recent {
                window.push(record.amount_usd);
            }
        }
        Ok(())
    }

    /// Evaluate a new cost record against its category's recent history.
    ///
    /// The record is compared against the window *before* joining it, so a
    /// spike does not dilute the baseline it is judged against. With fewer
    /// than `min_samples` historical points no judgment is made.
    pub async fn observe(&self, record: &CostRecord) -> Option<CostAlert> {
        if !self.config.enabled {
            return None;
        }

        let spike = {
            let mut windows = self.windows.lock().await;
            let window = windows
                .entry(record.category)
                .or_insert_with(|| SlidingWindow::new(self.config.window_size));

            let spike = if window.len() >= self.config.min_samples {
                let mean = window.mean();
                let std_dev = window.std_dev();
                let amount = record.amount_usd;
                if amount > mean + 2.0 * std_dev && amount > 2.0 * mean {
                    let severity = if amount > 3.0 * mean {
                        AlertSeverity::High
                    } else {
                        AlertSeverity::Medium
                    };
                    Some((mean, std_dev, severity))
                } else {
                    None
                }
            } else {
                debug!(
                    category = %record.category,
                    samples = window.len(),
                    "Insufficient history for spike detection"
                );
                None
            };

            window.push(record.amount_usd);
            spike
        };

        let (mean, std_dev, severity) = spike?;
        let alert = CostAlert::new(
            CostAlertKind::Anomaly,
            severity,
            record.amount_usd,
            mean + 2.0 * std_dev,
            format!(
                "{} cost ${:.4} is anomalous (category mean ${:.4}, sigma ${:.4})",
                record.category, record.amount_usd, mean, std_dev
            ),
        );
        warn!(
            category = %record.category,
            amount_usd = record.amount_usd,
            mean_usd = mean,
            severity = %severity,
            "Cost spike detected"
        );
        self.alerts.write().await.push(alert.clone());
        Some(alert)
    }

    /// Timer-driven sweep: project the trailing hour's spend to a daily rate
    /// and alert when it threatens the budget.
    pub async fn trend_sweep(&self, budget: &BudgetState) -> Result<Option<CostAlert>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let hour_ago = Utc::now() - Duration::hours(1);
        let hourly_spend: f64 = self
            .costs
            .list_since(hour_ago)
            .await?
            .iter()
            .map(|r| r.amount_usd)
            .sum();
        let projected_daily = hourly_spend * 24.0;

        let severity = if projected_daily > budget.total_budget_usd * 0.20 {
            AlertSeverity::Critical
        } else if projected_daily > budget.total_budget_usd * 0.10 {
            AlertSeverity::High
        } else {
            debug!(
                hourly_spend_usd = hourly_spend,
                projected_daily_usd = projected_daily,
                "Trend sweep: burn rate nominal"
            );
            return Ok(None);
        };

        let threshold_pct = if severity == AlertSeverity::Critical {
            20.0
        } else {
            10.0
        };
        let alert = CostAlert::new(
            CostAlertKind::Projection,
            severity,
            projected_daily,
            budget.total_budget_usd * threshold_pct / 100.0,
            format!(
                "projected daily spend ${:.2} exceeds {:.0}% of the ${:.2} budget",
                projected_daily, threshold_pct, budget.total_budget_usd
            ),
        );
        info!(
            projected_daily_usd = projected_daily,
            severity = %severity,
            "Rapid spend increase detected"
        );
        self.alerts.write().await.push(alert.clone());
        Ok(Some(alert))
    }

    /// Total ledger spend recorded at or after `since`.
    pub async fn spend_since(&self, since: DateTime<Utc>) -> Result<f64> {
        Ok(self
            .costs
            .list_since(since)
            .await?
            .iter()
            .map(|r| r.amount_usd)
            .sum())
    }

    /// Project spend forward from the trailing 24 hours of records.
    pub async fn projection(&self, remaining_usd: f64) -> Result<CostProjection> {
        let day_ago = Utc::now() - Duration::hours(24);
        let records = self.costs.list_since(day_ago).await?;
        let projected_daily: f64 = records.iter().map(|r| r.amount_usd).sum();
        let hourly_rate = projected_daily / 24.0;

        let hours_to_limit = if hourly_rate > 0.0 {
            Some((remaining_usd / hourly_rate).max(0.0))
        } else {
            None
        };

        Ok(CostProjection {
            projected_daily_usd: projected_daily,
            projected_monthly_usd: projected_daily * 30.0,
            hours_to_limit,
            confidence_pct: (records.len() as f64 / 10.0 * 100.0).min(100.0),
            data_points: records.len(),
        })
    }

    /// Count of unresolved cost alerts (the `anomaly_count` metric).
    pub async fn unresolved_count(&self) -> usize {
        self.alerts.read().await.iter().filter(|a| !a.resolved).count()
    }

    /// Snapshot of all unresolved cost alerts.
    pub async fn unresolved_alerts(&self) -> Vec<CostAlert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Mark a cost alert resolved. Returns whether it was found.
    pub async fn resolve(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Drop resolved cost alerts older than `max_age_hours`.
    pub async fn prune_resolved(&self, max_age_hours: u64) {
        let cutoff = Utc::now() - Duration::hours(max_age_hours as i64);
        let mut alerts = self.alerts.write().await;
        alerts.retain(|a| !a.resolved || a.created_at >= cutoff);
    }
}
