//! Alert rule engine.
//!
//! Rules are evaluated on a fixed tick against metric resolvers. Each rule
//! has at most one active alert at a time; creation is further bounded by a
//! per-rule cooldown, a per-rule hourly rate limit, and a global cap on
//! active alerts.
//!
//! Cooldown and rate-limit windows use the monotonic clock so wall-clock
//! adjustments cannot double-fire a rule.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use spendwatch_core::{
    default_rules, Alert, AlertEvent, AlertRepository, AlertRule, AlertStatus, AlertingConfig,
    JobRepository, JobStatus, MetricSource, NotificationChannel, Result, SpendWatchError,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anomaly::AnomalyAnalyzer;
use crate::ledger::BudgetLedger;

// ---------------------------------------------------------------------------
// Metric resolution
// ---------------------------------------------------------------------------

/// Resolves a [`MetricSource`] to its current value.
///
/// Resolution is best-effort: a failing or unknown source yields `None`,
/// which the engine treats as "skip this tick" rather than a zero value.
pub struct MetricResolver {
    ledger: Arc<BudgetLedger>,
    jobs: Arc<dyn JobRepository>,
    analyzer: Arc<AnomalyAnalyzer>,
    gauges: DashMap<String, f64>,
}

impl MetricResolver {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        jobs: Arc<dyn JobRepository>,
        analyzer: Arc<AnomalyAnalyzer>,
    ) -> Self {
        Self {
            ledger,
            jobs,
            analyzer,
            gauges: DashMap::new(),
        }
    }

    /// Publish an external gauge value for `external:<name>` sources.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    /// Current value for a source, or `None` when unavailable.
    pub async fn resolve(&self, source: &MetricSource) -> Option<f64> {
        let value = match source {
            MetricSource::BudgetPercentage => {
                self.ledger.status().await.ok().map(|s| s.percentage_used)
            }
            MetricSource::BudgetSpend => {
                self.ledger.status().await.ok().map(|s| s.current_spend_usd)
            }
            MetricSource::HourlySpend => {
                // Hourly spend comes from the analyzer's projection input
                // path; resolve it directly from the ledger-backed window.
                let hour_ago = Utc::now() - ChronoDuration::hours(1);
                match self.analyzer.spend_since(hour_ago).await {
                    Ok(spend) => Some(spend),
                    Err(e) => {
                        warn!(error = %e, "Failed to resolve hourly spend");
                        None
                    }
                }
            }
            MetricSource::ActiveJobs => {
                let pending = self.jobs.list_by_status(JobStatus::Pending).await;
                let processing = self.jobs.list_by_status(JobStatus::Processing).await;
                match (pending, processing) {
                    (Ok(p), Ok(r)) => Some((p.len() + r.len()) as f64),
                    _ => None,
                }
            }
            MetricSource::FailedJobsLastHour => {
                let hour_ago = Utc::now() - ChronoDuration::hours(1);
                match self.jobs.list_terminal_since(hour_ago).await {
                    Ok(jobs) => Some(
                        jobs.iter().filter(|j| j.status == JobStatus::Failed).count() as f64,
                    ),
                    Err(e) => {
                        warn!(error = %e, "Failed to resolve failed-job count");
                        None
                    }
                }
            }
            MetricSource::AnomalyCount => Some(self.analyzer.unresolved_count().await as f64),
            MetricSource::External(name) => self.gauges.get(name).map(|v| *v),
        };

        if value.is_none() {
            debug!(source = %source, "Metric source unavailable, skipping");
        }
        value
    }
}

// ---------------------------------------------------------------------------
// Alert engine
// ---------------------------------------------------------------------------

/// Rule registry, evaluation loop body, and alert lifecycle management.
pub struct AlertEngine {
    repo: Arc<dyn AlertRepository>,
    resolver: Arc<MetricResolver>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    config: AlertingConfig,
    rules: RwLock<Vec<AlertRule>>,
    /// Last alert-creation instant per rule (monotonic).
    cooldowns: DashMap<Uuid, Instant>,
    /// Alert-creation instants per rule, pruned to the trailing hour.
    fired: DashMap<Uuid, Vec<Instant>>,
}

impl AlertEngine {
    /// Build the engine with the built-in rules plus any configured extras.
    pub fn new(
        repo: Arc<dyn AlertRepository>,
        resolver: Arc<MetricResolver>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        config: AlertingConfig,
    ) -> Self {
        let mut rules = default_rules();
        rules.extend(config.rules.iter().cloned());
        Self {
            repo,
            resolver,
            channels,
            config,
            rules: RwLock::new(rules),
            cooldowns: DashMap::new(),
            fired: DashMap::new(),
        }
    }

    /// Register an additional rule at runtime.
    pub async fn add_rule(&self, rule: AlertRule) {
        info!(rule = %rule.name, source = %rule.source, "Alert rule registered");
        self.rules.write().await.push(rule);
    }

    /// Snapshot of the rule registry.
    pub async fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.clone()
    }

    /// One evaluation tick over every enabled rule.
    pub async fn evaluate_rules(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let rules = self.rules.read().await.clone();
        for rule in rules.iter().filter(|r| r.enabled) {
            if let Err(e) = self.evaluate_rule(rule).await {
                warn!(rule = %rule.name, error = %e, "Rule evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_rule(&self, rule: &AlertRule) -> Result<()> {
        if self.hourly_count(rule.id) >= rule.max_alerts_per_hour {
            debug!(rule = %rule.name, "Hourly alert limit reached, skipping");
            return Ok(());
        }

        let Some(current_value) = self.resolver.resolve(&rule.source).await else {
            return Ok(());
        };

        let breached = rule.operator.evaluate(current_value, rule.threshold);
        let active = self.repo.active_for_rule(rule.id).await?;

        match (breached, active) {
            (true, Some(mut alert)) => {
                // Condition still true: refresh the observed value only.
                alert.current_value = current_value;
                self.repo.update(&alert).await?;
            }
            (true, None) => {
                if self.in_cooldown(rule).await? {
                    debug!(rule = %rule.name, "Rule in cooldown, skipping");
                    return Ok(());
                }
                let active_count = self.repo.list_active().await?.len();
                if active_count >= self.config.max_active_alerts {
                    warn!(
                        rule = %rule.name,
                        active_count,
                        "Active alert cap reached, suppressing new alert"
                    );
                    return Ok(());
                }
                self.create_alert(rule, current_value).await?;
            }
            (false, Some(alert)) => {
                if rule.auto_resolve
                    && alert_age_secs(&alert) >= rule.auto_resolve_after_secs
                {
                    self.resolve(&alert).await?;
                }
            }
            (false, None) => {}
        }
        Ok(())
    }

    async fn create_alert(&self, rule: &AlertRule, current_value: f64) -> Result<()> {
        let mut alert = Alert::new(rule, current_value);
        self.repo.insert(&alert).await?;
        self.cooldowns.insert(rule.id, Instant::now());
        self.fired.entry(rule.id).or_default().push(Instant::now());

        info!(
            alert_id = %alert.id,
            rule = %rule.name,
            severity = %rule.severity,
            current_value,
            threshold = rule.threshold,
            "Alert created"
        );

        self.dispatch(&mut alert, AlertEvent::Triggered).await;
        self.repo.update(&alert).await?;
        Ok(())
    }

    /// Deliver an event to every channel the alert names. Per-channel
    /// failures are logged and never block the remaining channels.
    async fn dispatch(&self, alert: &mut Alert, event: AlertEvent) {
        for name in alert.channels.clone() {
            let Some(channel) = self.channels.iter().find(|c| c.name() == name) else {
                warn!(alert_id = %alert.id, channel = %name, "Unknown notification channel");
                continue;
            };
            match channel.send(alert, event).await {
                Ok(()) => {
                    if event == AlertEvent::Triggered {
                        alert.notifications_sent += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        alert_id = %alert.id,
                        channel = %name,
                        error = %e,
                        "Notification delivery failed"
                    );
                }
            }
        }
    }

    async fn resolve(&self, alert: &Alert) -> Result<()> {
        let mut resolved = alert.clone();
        resolved.status = AlertStatus::Resolved;
        resolved.resolved_at = Some(Utc::now());
        self.repo.update(&resolved).await?;
        info!(alert_id = %alert.id, rule = %alert.rule_name, "Alert resolved");
        self.dispatch(&mut resolved, AlertEvent::Resolved).await;
        Ok(())
    }

    /// Resolve an alert by id (operator action).
    pub async fn resolve_alert(&self, id: Uuid) -> Result<()> {
        let alert = self
            .repo
            .get(id)
            .await?
            .ok_or(SpendWatchError::NotFound { kind: "alert", id })?;
        if alert.status != AlertStatus::Active {
            return Ok(());
        }
        self.resolve(&alert).await
    }

    /// Suppress an alert by id without resolving the condition.
    pub async fn suppress_alert(&self, id: Uuid) -> Result<()> {
        let mut alert = self
            .repo
            .get(id)
            .await?
            .ok_or(SpendWatchError::NotFound { kind: "alert", id })?;
        if alert.status != AlertStatus::Active {
            return Ok(());
        }
        alert.status = AlertStatus::Suppressed;
        alert.resolved_at = Some(Utc::now());
        self.repo.update(&alert).await?;
        info!(alert_id = %id, "Alert suppressed");
        Ok(())
    }

    /// All currently active alerts.
    pub async fn active_alerts(&self) -> Result<Vec<Alert>> {
        self.repo.list_active().await
    }

    /// Probe the underlying alert repository.
    pub async fn health_check(&self) -> Result<()> {
        self.repo.health_check().await
    }

    /// Periodic cleanup: reap stale active alerts, delete old resolved
    /// ones, and prune rate-limit bookkeeping.
    pub async fn cleanup(&self) -> Result<()> {
        let rules = self.rules.read().await.clone();
        for alert in self.repo.list_active().await? {
            let Some(rule) = rules.iter().find(|r| r.id == alert.rule_id) else {
                continue;
            };
            if rule.auto_resolve && alert_age_secs(&alert) >= rule.auto_resolve_after_secs {
                info!(alert_id = %alert.id, "Reaping stale active alert");
                self.resolve(&alert).await?;
            }
        }

        let retention = ChronoDuration::hours(self.config.resolved_retention_hours as i64);
        let deleted = self
            .repo
            .delete_resolved_before(Utc::now() - retention)
            .await?;
        if deleted > 0 {
            info!(deleted, "Deleted expired resolved alerts");
        }

        for mut entry in self.fired.iter_mut() {
            entry
                .value_mut()
                .retain(|t| t.elapsed().as_secs() < 3600);
        }
        Ok(())
    }

    /// Whether the rule's last alert is younger than its cooldown.
    ///
    /// The in-process map uses monotonic time. After a restart it is empty,
    /// so the latest stored alert's wall-clock age is the fallback.
    async fn in_cooldown(&self, rule: &AlertRule) -> Result<bool> {
        if let Some(last) = self.cooldowns.get(&rule.id) {
            return Ok(last.elapsed().as_secs() < rule.cooldown_secs);
        }
        Ok(self
            .repo
            .latest_for_rule(rule.id)
            .await?
            .map(|alert| alert_age_secs(&alert) < rule.cooldown_secs)
            .unwrap_or(false))
    }

    fn hourly_count(&self, rule_id: Uuid) -> u32 {
        self.fired
            .get(&rule_id)
            .map(|times| {
                times
                    .iter()
                    .filter(|t| t.elapsed().as_secs() < 3600)
                    .count() as u32
            })
            .unwrap_or(0)
    }
}

fn alert_age_secs(alert: &Alert) -> u64 {
    (Utc::now() - alert.triggered_at).num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ConsoleChannel;
    use spendwatch_core::{
        AlertSeverity, AnomalyConfig, BudgetConfig, CompareOp, CostCategory, CostRecord,
        CostRepository,
    };
    use spendwatch_storage::{
        InMemoryAlertRepository, InMemoryCostRepository, InMemoryJobRepository,
    };

    struct Harness {
        engine: AlertEngine,
        resolver: Arc<MetricResolver>,
        repo: Arc<InMemoryAlertRepository>,
        costs: Arc<InMemoryCostRepository>,
    }

    fn harness(config: AlertingConfig) -> Harness {
        let costs = Arc::new(InMemoryCostRepository::new());
        let ledger = Arc::new(
            BudgetLedger::new(
                costs.clone() as Arc<dyn CostRepository>,
                BudgetConfig::default().total_budget_usd,
            )
            .unwrap(),
        );
        let analyzer = Arc::new(AnomalyAnalyzer::new(
            costs.clone() as Arc<dyn CostRepository>,
            AnomalyConfig::default(),
        ));
        let resolver = Arc::new(MetricResolver::new(
            ledger,
            Arc::new(InMemoryJobRepository::new()),
            analyzer,
        ));
        let repo = Arc::new(InMemoryAlertRepository::new());
        let engine = AlertEngine::new(
            repo.clone(),
            resolver.clone(),
            vec![Arc::new(ConsoleChannel::new("console"))],
            config,
        );
        Harness {
            engine,
            resolver,
            repo,
            costs,
        }
    }

    fn gauge_rule(name: &str, threshold: f64) -> AlertRule {
        AlertRule::new(
            name,
            MetricSource::External("load".to_string()),
            CompareOp::Gte,
            threshold,
            AlertSeverity::High,
        )
    }

    #[tokio::test]
    async fn test_breached_rule_creates_one_alert() {
        let h = harness(AlertingConfig::default());
        h.engine.add_rule(gauge_rule("load_high", 5.0)).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        let active = h.engine.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "load_high");
        assert_eq!(active[0].notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_duplicate_active_alert_suppressed() {
        let h = harness(AlertingConfig::default());
        h.engine.add_rule(gauge_rule("load_high", 5.0)).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        h.resolver.set_gauge("load", 12.0);
        h.engine.evaluate_rules().await.unwrap();

        let active = h.engine.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
        // The observed value refreshes; no second alert, no re-notification.
        assert!((active[0].current_value - 12.0).abs() < f64::EPSILON);
        assert_eq!(active[0].notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_new_alert_after_resolution() {
        let h = harness(AlertingConfig::default());
        let rule = gauge_rule("load_high", 5.0); // cooldown 600s default
        let rule_id = rule.id;
        h.engine.add_rule(rule).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        let alert_id = h.engine.active_alerts().await.unwrap()[0].id;
        h.engine.resolve_alert(alert_id).await.unwrap();

        // Condition still true, but the rule fired moments ago.
        h.engine.evaluate_rules().await.unwrap();
        assert!(h.engine.active_alerts().await.unwrap().is_empty());
        assert!(h.repo.active_for_rule(rule_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_survives_restart_via_stored_alerts() {
        let h = harness(AlertingConfig::default());
        let rule = gauge_rule("load_high", 5.0); // cooldown 600s default
        h.engine.add_rule(rule.clone()).await;
        h.resolver.set_gauge("load", 9.0);

        // A resolved alert from a previous process run, fired moments ago.
        // The engine's in-process cooldown map knows nothing about it.
        let mut prior = Alert::new(&rule, 8.0);
        prior.status = AlertStatus::Resolved;
        prior.resolved_at = Some(Utc::now());
        h.repo.insert(&prior).await.unwrap();

        h.engine.evaluate_rules().await.unwrap();
        assert!(h.engine.active_alerts().await.unwrap().is_empty());

        // Aged past the cooldown, the stored alert no longer blocks.
        let mut old = h.repo.get(prior.id).await.unwrap().unwrap();
        old.triggered_at = Utc::now() - ChronoDuration::seconds(601);
        h.repo.update(&old).await.unwrap();

        h.engine.evaluate_rules().await.unwrap();
        assert_eq!(h.engine.active_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hourly_rate_limit() {
        let h = harness(AlertingConfig::default());
        let mut rule = gauge_rule("load_high", 5.0);
        rule.cooldown_secs = 0;
        rule.max_alerts_per_hour = 1;
        h.engine.add_rule(rule).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        let alert_id = h.engine.active_alerts().await.unwrap()[0].id;
        h.engine.resolve_alert(alert_id).await.unwrap();

        // No cooldown, but the rule already created its one alert this hour.
        h.engine.evaluate_rules().await.unwrap();
        assert!(h.engine.active_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_resolve_waits_for_minimum_age() {
        let h = harness(AlertingConfig::default());
        let mut rule = gauge_rule("load_high", 5.0);
        rule.auto_resolve_after_secs = 3600;
        h.engine.add_rule(rule).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        assert_eq!(h.engine.active_alerts().await.unwrap().len(), 1);

        // Condition clears immediately, but the alert is younger than the
        // auto-resolve delay: it stays active.
        h.resolver.set_gauge("load", 1.0);
        h.engine.evaluate_rules().await.unwrap();
        assert_eq!(h.engine.active_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_resolve_fires_once_old_enough() {
        let h = harness(AlertingConfig::default());
        let mut rule = gauge_rule("load_high", 5.0);
        rule.auto_resolve_after_secs = 0;
        h.engine.add_rule(rule).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        h.resolver.set_gauge("load", 1.0);
        h.engine.evaluate_rules().await.unwrap();

        assert!(h.engine.active_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_auto_resolve_when_disabled() {
        let h = harness(AlertingConfig::default());
        let mut rule = gauge_rule("load_high", 5.0);
        rule.auto_resolve = false;
        rule.auto_resolve_after_secs = 0;
        h.engine.add_rule(rule).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        h.resolver.set_gauge("load", 1.0);
        h.engine.evaluate_rules().await.unwrap();
        h.engine.cleanup().await.unwrap();

        // Requires explicit resolution.
        assert_eq!(h.engine.active_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_source_skips_tick() {
        let h = harness(AlertingConfig::default());
        h.engine.add_rule(gauge_rule("load_high", 5.0)).await;
        // Gauge never published: no false alert from a missing value.
        h.engine.evaluate_rules().await.unwrap();
        assert!(h.engine.active_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_global_active_alert_cap() {
        let config = AlertingConfig {
            max_active_alerts: 1,
            ..AlertingConfig::default()
        };
        let h = harness(config);
        h.engine.add_rule(gauge_rule("first", 5.0)).await;
        h.engine.add_rule(gauge_rule("second", 5.0)).await;
        h.resolver.set_gauge("load", 9.0);

        h.engine.evaluate_rules().await.unwrap();
        assert_eq!(h.engine.active_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_percentage_rule_end_to_end() {
        let h = harness(AlertingConfig::default());
        // Built-in budget_warning rule triggers at >= 75%.
        h.costs
            .append(&CostRecord::new(
                CostCategory::ImageGeneration,
                80.0,
                "big spend".to_string(),
            ))
            .await
            .unwrap();

        h.engine.evaluate_rules().await.unwrap();
        let active = h.engine.active_alerts().await.unwrap();
        assert!(active.iter().any(|a| a.rule_name == "budget_warning"));
        assert!(!active.iter().any(|a| a.rule_name == "budget_danger"));
    }

    #[tokio::test]
    async fn test_suppress_alert() {
        let h = harness(AlertingConfig::default());
        h.engine.add_rule(gauge_rule("load_high", 5.0)).await;
        h.resolver.set_gauge("load", 9.0);
        h.engine.evaluate_rules().await.unwrap();

        let alert_id = h.engine.active_alerts().await.unwrap()[0].id;
        h.engine.suppress_alert(alert_id).await.unwrap();
        assert!(h.engine.active_alerts().await.unwrap().is_empty());

        let stored = h.repo.get(alert_id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Suppressed);
    }

    #[tokio::test]
    async fn test_resolve_unknown_alert_is_not_found() {
        let h = harness(AlertingConfig::default());
        let err = h.engine.resolve_alert(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            SpendWatchError::NotFound { kind: "alert", .. }
        ));
    }

    #[tokio::test]
    async fn test_cleanup_reaps_stale_active_alerts() {
        let h = harness(AlertingConfig::default());
        let mut rule = gauge_rule("load_high", 5.0);
        rule.auto_resolve_after_secs = 0;
        h.engine.add_rule(rule).await;
        h.resolver.set_gauge("load", 9.0);
        h.engine.evaluate_rules().await.unwrap();

        // Cleanup reaps it even though no evaluation tick saw it clear.
        h.engine.cleanup().await.unwrap();
        assert!(h.engine.active_alerts().await.unwrap().is_empty());
    }
}
