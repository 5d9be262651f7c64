//! In-memory storage backends.
//!
//! Stores all data in memory behind `tokio::sync::RwLock`. Data is lost
//! when the struct is dropped; all queries are `O(n)` linear scans.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spendwatch_core::{
    Alert, AlertRepository, AlertStatus, CostCategory, CostRecord, CostRepository, Job,
    JobRepository, JobStatus, Result, SpendWatchError,
};
use tokio::sync::RwLock;
use uuid::Uuid;

// ===========================================================================
// InMemoryCostRepository
// ===========================================================================

/// In-memory, append-only cost ledger.
pub struct InMemoryCostRepository {
    records: RwLock<Vec<CostRecord>>,
}

impl InMemoryCostRepository {
    /// Create a new, empty ledger.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryCostRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CostRepository for InMemoryCostRepository {
    async fn append(&self, record: &CostRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.push(record.clone());
        Ok(())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<CostRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.recorded_at >= since)
            .cloned()
            .collect())
    }

    async fn list_by_category(
        &self,
        category: CostCategory,
        limit: usize,
    ) -> Result<Vec<CostRecord>> {
        let records = self.records.read().await;
        let matching: Vec<&CostRecord> =
            records.iter().filter(|r| r.category == category).collect();
        let start = matching.len().saturating_sub(limit);
        Ok(matching[start..].iter().map(|r| (*r).clone()).collect())
    }

    async fn sum_all(&self) -> Result<f64> {
        let records = self.records.read().await;
        Ok(records.iter().map(|r| r.amount_usd).sum())
    }

    async fn exists_for_job(&self, job_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;
        Ok(records.iter().any(|r| r.job_id == Some(job_id)))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ===========================================================================
// InMemoryJobRepository
// ===========================================================================

/// In-memory job store.
pub struct InMemoryJobRepository {
    jobs: RwLock<Vec<Job>>,
}

impl InMemoryJobRepository {
    /// Create a new, empty job store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(SpendWatchError::Persistence(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.push(job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(SpendWatchError::NotFound {
                kind: "job",
                id: job.id,
            }),
        }
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().filter(|j| j.status == status).cloned().collect())
    }

    async fn list_terminal_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .iter()
            .filter(|j| j.status.is_terminal() && j.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ===========================================================================
// InMemoryAlertRepository
// ===========================================================================

/// In-memory alert store.
pub struct InMemoryAlertRepository {
    alerts: RwLock<Vec<Alert>>,
}

impl InMemoryAlertRepository {
    /// Create a new, empty alert store.
    pub fn new() -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAlertRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn insert(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        alerts.push(alert.clone());
        Ok(())
    }

    async fn update(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == alert.id) {
            Some(existing) => {
                *existing = alert.clone();
                Ok(())
            }
            None => Err(SpendWatchError::NotFound {
                kind: "alert",
                id: alert.id,
            }),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn active_for_rule(&self, rule_id: Uuid) -> Result<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .find(|a| a.rule_id == rule_id && a.status == AlertStatus::Active)
            .cloned())
    }

    async fn latest_for_rule(&self, rule_id: Uuid) -> Result<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .max_by_key(|a| a.triggered_at)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Active)
            .cloned()
            .collect())
    }

    async fn delete_resolved_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut alerts = self.alerts.write().await;
        let initial = alerts.len();
        alerts.retain(|a| {
            a.status != AlertStatus::Resolved
                || a.resolved_at.map(|t| t >= before).unwrap_or(true)
        });
        Ok((initial - alerts.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use spendwatch_core::{AlertRule, AlertSeverity, CompareOp, MetricSource};

    fn sample_record(category: CostCategory, amount: f64) -> CostRecord {
        CostRecord::new(category, amount, "test".to_string())
    }

    fn sample_rule(name: &str) -> AlertRule {
        AlertRule::new(
            name,
            MetricSource::BudgetPercentage,
            CompareOp::Gte,
            75.0,
            AlertSeverity::Medium,
        )
    }

    // -- cost repository ---------------------------------------------------

    #[tokio::test]
    async fn test_append_and_sum() {
        let repo = InMemoryCostRepository::new();
        repo.append(&sample_record(CostCategory::ImageGeneration, 0.5))
            .await
            .unwrap();
        repo.append(&sample_record(CostCategory::TextGeneration, 1.5))
            .await
            .unwrap();
        let total = repo.sum_all().await.unwrap();
        assert!((total - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_list_by_category_respects_limit() {
        let repo = InMemoryCostRepository::new();
        for i in 0..5 {
            repo.append(&sample_record(CostCategory::Embedding, i as f64))
                .await
                .unwrap();
        }
        repo.append(&sample_record(CostCategory::Storage, 99.0))
            .await
            .unwrap();

        let recent = repo
            .list_by_category(CostCategory::Embedding, 3)
            .await
            .unwrap();
        assert_eq!(recent.len(), 3);
        // Most recent three, oldest first.
        assert!((recent[0].amount_usd - 2.0).abs() < f64::EPSILON);
        assert!((recent[2].amount_usd - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_exists_for_job() {
        let repo = InMemoryCostRepository::new();
        let job_id = Uuid::new_v4();
        assert!(!repo.exists_for_job(job_id).await.unwrap());

        repo.append(&sample_record(CostCategory::VideoGeneration, 2.0).with_job(job_id))
            .await
            .unwrap();
        assert!(repo.exists_for_job(job_id).await.unwrap());
        assert!(!repo.exists_for_job(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_since_filters_old_records() {
        let repo = InMemoryCostRepository::new();
        let mut old = sample_record(CostCategory::Other, 1.0);
        old.recorded_at = Utc::now() - Duration::hours(2);
        repo.append(&old).await.unwrap();
        repo.append(&sample_record(CostCategory::Other, 2.0))
            .await
            .unwrap();

        let recent = repo
            .list_since(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert!((recent[0].amount_usd - 2.0).abs() < f64::EPSILON);
    }

    // -- job repository ----------------------------------------------------

    #[tokio::test]
    async fn test_job_create_get_update() {
        let repo = InMemoryJobRepository::new();
        let mut job = Job::new("ext-1".to_string(), CostCategory::Other, 1.0);
        repo.create(&job).await.unwrap();

        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);

        job.status = JobStatus::Processing;
        job.progress = 40;
        repo.update(&job).await.unwrap();

        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Processing);
        assert_eq!(fetched.progress, 40);
    }

    #[tokio::test]
    async fn test_job_duplicate_create_rejected() {
        let repo = InMemoryJobRepository::new();
        let job = Job::new("ext-1".to_string(), CostCategory::Other, 1.0);
        repo.create(&job).await.unwrap();
        assert!(repo.create(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_job_update_unknown_is_not_found() {
        let repo = InMemoryJobRepository::new();
        let job = Job::new("ext-1".to_string(), CostCategory::Other, 1.0);
        let err = repo.update(&job).await.unwrap_err();
        assert!(matches!(err, SpendWatchError::NotFound { kind: "job", .. }));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let repo = InMemoryJobRepository::new();
        let mut a = Job::new("a".to_string(), CostCategory::Other, 1.0);
        let b = Job::new("b".to_string(), CostCategory::Other, 1.0);
        a.status = JobStatus::Completed;
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        let pending = repo.list_by_status(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_ref, "b");
    }

    #[tokio::test]
    async fn test_list_terminal_since() {
        let repo = InMemoryJobRepository::new();
        let mut done = Job::new("done".to_string(), CostCategory::Other, 1.0);
        done.status = JobStatus::Failed;
        let mut stale = Job::new("stale".to_string(), CostCategory::Other, 1.0);
        stale.status = JobStatus::Failed;
        stale.updated_at = Utc::now() - Duration::hours(3);
        let running = Job::new("running".to_string(), CostCategory::Other, 1.0);
        repo.create(&done).await.unwrap();
        repo.create(&stale).await.unwrap();
        repo.create(&running).await.unwrap();

        let recent = repo
            .list_terminal_since(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].external_ref, "done");
    }

    // -- alert repository --------------------------------------------------

    #[tokio::test]
    async fn test_active_for_rule() {
        let repo = InMemoryAlertRepository::new();
        let rule = sample_rule("r1");
        let mut alert = Alert::new(&rule, 80.0);
        repo.insert(&alert).await.unwrap();

        let active = repo.active_for_rule(rule.id).await.unwrap();
        assert!(active.is_some());

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(Utc::now());
        repo.update(&alert).await.unwrap();

        assert!(repo.active_for_rule(rule.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_for_rule() {
        let repo = InMemoryAlertRepository::new();
        let rule = sample_rule("r1");
        let mut first = Alert::new(&rule, 76.0);
        first.triggered_at = Utc::now() - Duration::minutes(30);
        first.status = AlertStatus::Resolved;
        let second = Alert::new(&rule, 91.0);
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();

        let latest = repo.latest_for_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_delete_resolved_before() {
        let repo = InMemoryAlertRepository::new();
        let rule = sample_rule("r1");

        let mut stale = Alert::new(&rule, 80.0);
        stale.status = AlertStatus::Resolved;
        stale.resolved_at = Some(Utc::now() - Duration::hours(48));
        let mut fresh = Alert::new(&rule, 80.0);
        fresh.status = AlertStatus::Resolved;
        fresh.resolved_at = Some(Utc::now());
        let active = Alert::new(&rule, 80.0);

        repo.insert(&stale).await.unwrap();
        repo.insert(&fresh).await.unwrap();
        repo.insert(&active).await.unwrap();

        let deleted = repo
            .delete_resolved_before(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get(stale.id).await.unwrap().is_none());
        assert!(repo.get(fresh.id).await.unwrap().is_some());
        assert!(repo.get(active.id).await.unwrap().is_some());
    }
}
