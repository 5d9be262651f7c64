//! Job lifecycle tracking.
//!
//! Jobs move `pending → processing → {completed | failed}` and never leave a
//! terminal state. Each admitted job gets one polling task, cancellable both
//! individually (job cancellation) and collectively (engine shutdown).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use spendwatch_core::{
    AdmissionDecision, CostRecord, Job, JobApi, JobPoll, JobProgress, JobRepository, JobRequest,
    JobStatus, Result, SpendWatchError, TrackerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anomaly::AnomalyAnalyzer;
use crate::ledger::BudgetLedger;
use crate::shutdown::ShutdownCoordinator;

/// Outcome of a job creation attempt. Denials are values, not errors, so
/// callers can surface budget feedback.
#[derive(Debug)]
pub enum JobAdmission {
    /// The job was admitted and submitted upstream.
    Admitted(Job),
    /// The ledger refused admission.
    Denied(AdmissionDecision),
}

/// Tracks admitted jobs from submission to terminal state.
pub struct JobTracker {
    ledger: Arc<BudgetLedger>,
    analyzer: Arc<AnomalyAnalyzer>,
    jobs: Arc<dyn JobRepository>,
    api: Arc<dyn JobApi>,
    config: TrackerConfig,
    coordinator: ShutdownCoordinator,
    /// One in-flight poll per job; a second concurrent poll is skipped.
    poll_guards: DashMap<Uuid, ()>,
    /// Claim map guarding terminal cost recording against racing polls.
    record_claims: DashMap<Uuid, ()>,
    /// Consecutive poll-failure counts per job.
    poll_failures: DashMap<Uuid, u32>,
    /// Per-job poller cancellation tokens (children of `shutdown`).
    pollers: DashMap<Uuid, CancellationToken>,
}

impl JobTracker {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        analyzer: Arc<AnomalyAnalyzer>,
        jobs: Arc<dyn JobRepository>,
        api: Arc<dyn JobApi>,
        config: TrackerConfig,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        Self {
            ledger,
            analyzer,
            jobs,
            api,
            config,
            coordinator,
            poll_guards: DashMap::new(),
            record_claims: DashMap::new(),
            poll_failures: DashMap::new(),
            pollers: DashMap::new(),
        }
    }

    /// Admit, submit, persist, and start polling a new job.
    pub async fn create_job(
        self: &Arc<Self>,
        session_id: Option<String>,
        request: JobRequest,
        estimated_cost_usd: f64,
    ) -> Result<JobAdmission> {
        let decision = self.ledger.can_proceed(estimated_cost_usd).await?;
        if !decision.allowed {
            info!(
                reason = %decision.reason.map(|r| r.to_string()).unwrap_or_default(),
                estimated_cost_usd,
                "Job admission denied"
            );
            return Ok(JobAdmission::Denied(decision));
        }

        let external_ref = self.api.submit(&request).await?;

        let mut job = Job::new(external_ref, request.category, estimated_cost_usd);
        if let Some(session_id) = session_id {
            job = job.with_session(session_id);
        }
        self.jobs.create(&job).await?;
        info!(
            job_id = %job.id,
            external_ref = %job.external_ref,
            category = %job.category,
            estimated_cost_usd,
            "Job admitted"
        );

        self.spawn_poller(job.id);
        Ok(JobAdmission::Admitted(job))
    }

    /// Restart pollers for jobs that were non-terminal at last shutdown.
    pub async fn resume_pollers(self: &Arc<Self>) -> Result<()> {
        let mut resumed = 0usize;
        for status in [JobStatus::Pending, JobStatus::Processing] {
            for job in self.jobs.list_by_status(status).await? {
                self.spawn_poller(job.id);
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed pollers for in-flight jobs");
        }
        Ok(())
    }

    fn spawn_poller(self: &Arc<Self>, job_id: Uuid) {
        let token = self.coordinator.token().child_token();
        self.pollers.insert(job_id, token.clone());

        let tracker = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the job has a
            // poll interval's worth of time before the first status check.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(job_id = %job_id, "Poller cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match tracker.poll_once(job_id).await {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(SpendWatchError::NotFound { .. }) => {
                                error!(job_id = %job_id, "Job record missing, poller stopping");
                                break;
                            }
                            Err(e) => {
                                // Repository and ledger errors are transient;
                                // the next tick retries the same step.
                                warn!(job_id = %job_id, error = %e, "Poll tick failed, retrying next tick");
                            }
                        }
                    }
                }
            }
            tracker.pollers.remove(&job_id);
            tracker.poll_failures.remove(&job_id);
        });
    }

    /// Run a single poll for a job. Returns whether the job is terminal.
    ///
    /// At most one poll per job is in flight; an overlapping call is skipped
    /// rather than queued.
    pub async fn poll_once(&self, job_id: Uuid) -> Result<bool> {
        if self.poll_guards.insert(job_id, ()).is_some() {
            debug!(job_id = %job_id, "Poll already in flight, skipping");
            return Ok(false);
        }
        // Counts the poll as in-flight work so shutdown drains it.
        let _work = self.coordinator.track();
        let result = self.poll_inner(job_id).await;
        self.poll_guards.remove(&job_id);
        result
    }

    async fn poll_inner(&self, job_id: Uuid) -> Result<bool> {
        let mut job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(SpendWatchError::NotFound {
                kind: "job",
                id: job_id,
            })?;
        if job.status.is_terminal() {
            // A completed job whose billing was interrupted mid-write still
            // owes the ledger a record; recording is idempotent, so retry.
            if job.status == JobStatus::Completed && !job.cost_recorded {
                self.record_terminal_cost(&mut job).await?;
            }
            return Ok(true);
        }

        let poll = match self.api.poll_status(&job.external_ref).await {
            Ok(poll) => {
                self.poll_failures.remove(&job_id);
                poll
            }
            Err(e) => {
                // One failed poll is a missed tick, not a failed job.
                let failures = {
                    let mut entry = self.poll_failures.entry(job_id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                warn!(
                    job_id = %job_id,
                    consecutive_failures = failures,
                    error = %e,
                    "Job status poll failed"
                );
                if failures >= self.config.max_consecutive_poll_failures {
                    self.fail_job(&mut job, "status polling failed repeatedly".to_string())
                        .await?;
                    return Ok(true);
                }
                return Ok(false);
            }
        };

        if !poll.done {
            if job.status.accepts(JobStatus::Processing) {
                job.status = JobStatus::Processing;
            }
            job.progress = poll.progress.min(100);
            job.updated_at = Utc::now();
            self.jobs.update(&job).await?;
            return Ok(false);
        }

        if poll.failed {
            self.fail_job(
                &mut job,
                poll.error.unwrap_or_else(|| "job failed upstream".to_string()),
            )
            .await?;
        } else {
            self.complete_job(&mut job, &poll).await?;
        }
        Ok(true)
    }

    async fn complete_job(&self, job: &mut Job, poll: &JobPoll) -> Result<()> {
        if job.status.accepts(JobStatus::Completed) {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.actual_cost_usd = Some(poll.actual_cost_usd.unwrap_or(job.estimated_cost_usd));
            job.updated_at = Utc::now();
            self.jobs.update(job).await?;
            info!(
                job_id = %job.id,
                actual_cost_usd = job.actual_cost_usd,
                "Job completed"
            );
        } else {
            warn!(job_id = %job.id, status = %job.status, "Ignoring transition on terminal job");
        }
        self.record_terminal_cost(job).await
    }

    /// Record a completed job's actual cost into the ledger exactly once.
    ///
    /// Three layers guard the invariant: the persisted `cost_recorded` flag,
    /// an in-process claim map against racing polls, and a ledger-level
    /// lookup by job id that makes recording idempotent across restarts.
    async fn record_terminal_cost(&self, job: &mut Job) -> Result<()> {
        if job.cost_recorded {
            return Ok(());
        }
        if self.record_claims.insert(job.id, ()).is_some() {
            debug!(job_id = %job.id, "Cost recording already in progress");
            return Ok(());
        }

        let result = async {
            if self.ledger.has_record_for_job(job.id).await? {
                debug!(job_id = %job.id, "Cost already in ledger, marking recorded");
            } else {
                let amount = job.actual_cost_usd.unwrap_or(job.estimated_cost_usd);
                let mut record = CostRecord::new(
                    job.category,
                    amount,
                    format!("job {} completed", job.external_ref),
                )
                .with_job(job.id);
                if let Some(session_id) = &job.session_id {
                    record = record.with_session(session_id.clone());
                }
                self.ledger.record(record.clone()).await?;
                let _ = self.analyzer.observe(&record).await;
            }
            job.cost_recorded = true;
            job.updated_at = Utc::now();
            self.jobs.update(job).await
        }
        .await;

        self.record_claims.remove(&job.id);
        result
    }

    async fn fail_job(&self, job: &mut Job, reason: String) -> Result<()> {
        if !job.status.accepts(JobStatus::Failed) {
            warn!(job_id = %job.id, status = %job.status, "Ignoring transition on terminal job");
            return Ok(());
        }
        job.status = JobStatus::Failed;
        job.error = Some(reason);
        job.updated_at = Utc::now();
        self.jobs.update(job).await?;
        warn!(job_id = %job.id, error = ?job.error, "Job failed");
        self.stop_poller(job.id);
        Ok(())
    }

    /// Cancel a job: best-effort upstream cancellation, then a forced local
    /// transition to `failed`. Cancelling a terminal job is a no-op.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let mut job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(SpendWatchError::NotFound {
                kind: "job",
                id: job_id,
            })?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, "Cancel on terminal job is a no-op");
            return Ok(job);
        }

        match self.api.cancel(&job.external_ref).await {
            Ok(accepted) => {
                debug!(job_id = %job_id, accepted, "Upstream cancellation requested")
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Upstream cancellation failed"),
        }

        self.fail_job(&mut job, "cancelled".to_string()).await?;
        Ok(job)
    }

    /// Progress snapshot with a linearly extrapolated time-to-completion.
    pub async fn job_progress(&self, job_id: Uuid) -> Result<JobProgress> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(SpendWatchError::NotFound {
                kind: "job",
                id: job_id,
            })?;

        let message = match job.status {
            JobStatus::Pending => "waiting for the job to start".to_string(),
            JobStatus::Processing => format!("processing, {}% complete", job.progress),
            JobStatus::Completed => "completed".to_string(),
            JobStatus::Failed => job
                .error
                .clone()
                .map(|e| format!("failed: {e}"))
                .unwrap_or_else(|| "failed".to_string()),
        };

        let eta_secs = if job.status.is_terminal() {
            None
        } else if job.progress == 0 {
            Some(self.config.default_eta_secs)
        } else {
            let elapsed = (Utc::now() - job.created_at).num_seconds().max(0) as f64;
            let total = elapsed / (f64::from(job.progress) / 100.0);
            Some((total - elapsed).max(0.0) as u64)
        };

        Ok(JobProgress {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            message,
            eta_secs,
        })
    }

    /// Probe the underlying job repository.
    pub async fn health_check(&self) -> Result<()> {
        self.jobs.health_check().await
    }

    /// Stop one job's poller without touching the shutdown token.
    fn stop_poller(&self, job_id: Uuid) {
        if let Some((_, token)) = self.pollers.remove(&job_id) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spendwatch_core::{AnomalyConfig, CostCategory, CostRepository, DenialReason};
    use spendwatch_storage::{InMemoryCostRepository, InMemoryJobRepository};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted fake for the external job API.
    struct ScriptedApi {
        submits: AtomicUsize,
        cancels: AtomicUsize,
        polls: Mutex<VecDeque<Result<JobPoll>>>,
    }

    impl ScriptedApi {
        fn new(polls: Vec<Result<JobPoll>>) -> Self {
            Self {
                submits: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                polls: Mutex::new(polls.into()),
            }
        }

        fn running(progress: u8) -> Result<JobPoll> {
            Ok(JobPoll {
                done: false,
                progress,
                failed: false,
                actual_cost_usd: None,
                error: None,
            })
        }

        fn completed(cost: f64) -> Result<JobPoll> {
            Ok(JobPoll {
                done: true,
                progress: 100,
                failed: false,
                actual_cost_usd: Some(cost),
                error: None,
            })
        }

        fn failed(message: &str) -> Result<JobPoll> {
            Ok(JobPoll {
                done: true,
                progress: 0,
                failed: true,
                actual_cost_usd: None,
                error: Some(message.to_string()),
            })
        }

        fn transport_error() -> Result<JobPoll> {
            Err(SpendWatchError::ExternalService("timeout".to_string()))
        }
    }

    #[async_trait]
    impl JobApi for ScriptedApi {
        async fn submit(&self, _request: &JobRequest) -> Result<String> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(format!("ext-{n}"))
        }

        async fn poll_status(&self, _external_ref: &str) -> Result<JobPoll> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(Self::transport_error)
        }

        async fn cancel(&self, _external_ref: &str) -> Result<bool> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    struct Harness {
        tracker: Arc<JobTracker>,
        costs: Arc<InMemoryCostRepository>,
        jobs: Arc<InMemoryJobRepository>,
        api: Arc<ScriptedApi>,
        ledger: Arc<BudgetLedger>,
    }

    fn harness(budget: f64, polls: Vec<Result<JobPoll>>) -> Harness {
        let api = Arc::new(ScriptedApi::new(polls));
        let costs = Arc::new(InMemoryCostRepository::new());
        let ledger = Arc::new(
            BudgetLedger::new(costs.clone() as Arc<dyn CostRepository>, budget).unwrap(),
        );
        let analyzer = Arc::new(AnomalyAnalyzer::new(
            costs.clone() as Arc<dyn CostRepository>,
            AnomalyConfig::default(),
        ));
        let jobs = Arc::new(InMemoryJobRepository::new());
        let coordinator = ShutdownCoordinator::new(5);
        let tracker = Arc::new(JobTracker::new(
            ledger.clone(),
            analyzer,
            jobs.clone(),
            api.clone(),
            TrackerConfig::default(),
            coordinator.clone(),
        ));
        Harness {
            tracker,
            costs,
            jobs,
            api,
            ledger,
        }
    }

    fn request() -> JobRequest {
        JobRequest {
            category: CostCategory::ImageGeneration,
            payload: serde_json::json!({"prompt": "a lighthouse"}),
        }
    }

    async fn admitted_job(h: &Harness, estimate: f64) -> Job {
        match h
            .tracker
            .create_job(Some("sess-1".to_string()), request(), estimate)
            .await
            .unwrap()
        {
            JobAdmission::Admitted(job) => job,
            JobAdmission::Denied(d) => panic!("unexpected denial: {d:?}"),
        }
    }

    // -- admission ---------------------------------------------------------

    #[tokio::test]
    async fn test_admitted_job_is_persisted_pending() {
        let h = harness(100.0, vec![]);
        let job = admitted_job(&h, 5.0).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.external_ref, "ext-0");
        assert!(!job.cost_recorded);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_denied_job_is_never_submitted() {
        let h = harness(100.0, vec![]);
        h.ledger
            .record(CostRecord::new(
                CostCategory::Other,
                95.0,
                "prior spend".to_string(),
            ))
            .await
            .unwrap();

        let admission = h.tracker.create_job(None, request(), 1.0).await.unwrap();
        match admission {
            JobAdmission::Denied(decision) => {
                assert_eq!(decision.reason, Some(DenialReason::DangerThreshold));
            }
            JobAdmission::Admitted(_) => panic!("expected denial"),
        }
        assert_eq!(h.api.submits.load(Ordering::SeqCst), 0);
    }

    // -- polling -----------------------------------------------------------

    #[tokio::test]
    async fn test_poll_moves_pending_to_processing() {
        let h = harness(100.0, vec![ScriptedApi::running(40)]);
        let job = admitted_job(&h, 5.0).await;

        let terminal = h.tracker.poll_once(job.id).await.unwrap();
        assert!(!terminal);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.progress, 40);
    }

    #[tokio::test]
    async fn test_completion_records_actual_cost() {
        let h = harness(100.0, vec![ScriptedApi::completed(3.5)]);
        let job = admitted_job(&h, 5.0).await;

        let terminal = h.tracker.poll_once(job.id).await.unwrap();
        assert!(terminal);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.actual_cost_usd, Some(3.5));
        assert!(stored.cost_recorded);

        // Actual cost, not the estimate, lands in the ledger.
        let spend = h.costs.sum_all().await.unwrap();
        assert!((spend - 3.5).abs() < f64::EPSILON);
        assert!(h.costs.exists_for_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cost_recorded_exactly_once_across_polls() {
        let h = harness(
            100.0,
            vec![ScriptedApi::completed(2.0), ScriptedApi::completed(2.0)],
        );
        let job = admitted_job(&h, 5.0).await;

        h.tracker.poll_once(job.id).await.unwrap();
        h.tracker.poll_once(job.id).await.unwrap();

        let spend = h.costs.sum_all().await.unwrap();
        assert!((spend - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_concurrent_terminal_polls_record_once() {
        let h = harness(
            100.0,
            vec![ScriptedApi::completed(2.0), ScriptedApi::completed(2.0)],
        );
        let job = admitted_job(&h, 5.0).await;

        let (a, b) = tokio::join!(
            h.tracker.poll_once(job.id),
            h.tracker.poll_once(job.id)
        );
        a.unwrap();
        b.unwrap();
        // Give the second poll path a chance if it was merely skipped.
        h.tracker.poll_once(job.id).await.unwrap();

        let spend = h.costs.sum_all().await.unwrap();
        assert!((spend - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_actual_cost_falls_back_to_estimate() {
        let h = harness(
            100.0,
            vec![Ok(JobPoll {
                done: true,
                progress: 100,
                failed: false,
                actual_cost_usd: None,
                error: None,
            })],
        );
        let job = admitted_job(&h, 5.0).await;
        h.tracker.poll_once(job.id).await.unwrap();

        let spend = h.costs.sum_all().await.unwrap();
        assert!((spend - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_upstream_failure_marks_job_failed_without_cost() {
        let h = harness(100.0, vec![ScriptedApi::failed("GPU on fire")]);
        let job = admitted_job(&h, 5.0).await;
        h.tracker.poll_once(job.id).await.unwrap();

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("GPU on fire"));
        assert!((h.costs.sum_all().await.unwrap()).abs() < f64::EPSILON);
    }

    // -- poll fault tolerance ----------------------------------------------

    #[tokio::test]
    async fn test_single_transport_failure_is_a_missed_tick() {
        let h = harness(
            100.0,
            vec![ScriptedApi::transport_error(), ScriptedApi::running(10)],
        );
        let job = admitted_job(&h, 5.0).await;

        assert!(!h.tracker.poll_once(job.id).await.unwrap());
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);

        // The next successful poll resumes normally.
        assert!(!h.tracker.poll_once(job.id).await.unwrap());
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_consecutive_transport_failures_fail_the_job() {
        let h = harness(
            100.0,
            vec![
                ScriptedApi::transport_error(),
                ScriptedApi::transport_error(),
                ScriptedApi::transport_error(),
            ],
        );
        let job = admitted_job(&h, 5.0).await;

        assert!(!h.tracker.poll_once(job.id).await.unwrap());
        assert!(!h.tracker.poll_once(job.id).await.unwrap());
        // Third consecutive failure crosses the default tolerance of 3.
        assert!(h.tracker.poll_once(job.id).await.unwrap());

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let h = harness(
            100.0,
            vec![
                ScriptedApi::transport_error(),
                ScriptedApi::transport_error(),
                ScriptedApi::running(10),
                ScriptedApi::transport_error(),
                ScriptedApi::transport_error(),
            ],
        );
        let job = admitted_job(&h, 5.0).await;

        for _ in 0..5 {
            h.tracker.poll_once(job.id).await.unwrap();
        }
        // Never three in a row, so the job is still alive.
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    // -- cancellation ------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_forces_failed_state() {
        let h = harness(100.0, vec![]);
        let job = admitted_job(&h, 5.0).await;

        let cancelled = h.tracker.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
        assert_eq!(h.api.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_noop() {
        let h = harness(100.0, vec![ScriptedApi::completed(1.0)]);
        let job = admitted_job(&h, 5.0).await;
        h.tracker.poll_once(job.id).await.unwrap();

        let result = h.tracker.cancel_job(job.id).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        // No upstream cancel call for a job that already finished.
        assert_eq!(h.api.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let h = harness(100.0, vec![]);
        let err = h.tracker.cancel_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SpendWatchError::NotFound { kind: "job", .. }));
    }

    // -- progress ----------------------------------------------------------

    #[tokio::test]
    async fn test_progress_zero_uses_default_eta() {
        let h = harness(100.0, vec![]);
        let job = admitted_job(&h, 5.0).await;

        let progress = h.tracker.job_progress(job.id).await.unwrap();
        assert_eq!(progress.progress, 0);
        assert_eq!(progress.eta_secs, Some(TrackerConfig::default().default_eta_secs));
    }

    #[tokio::test]
    async fn test_progress_eta_extrapolates_linearly() {
        let h = harness(100.0, vec![]);
        let job = admitted_job(&h, 5.0).await;

        let mut stored = h.jobs.get(job.id).await.unwrap().unwrap();
        stored.status = JobStatus::Processing;
        stored.progress = 50;
        stored.created_at = Utc::now() - chrono::Duration::seconds(60);
        h.jobs.update(&stored).await.unwrap();

        let progress = h.tracker.job_progress(job.id).await.unwrap();
        // 60s elapsed at 50% projects roughly 60s remaining.
        let eta = progress.eta_secs.unwrap();
        assert!((55..=65).contains(&eta), "eta was {eta}");
    }

    #[tokio::test]
    async fn test_progress_terminal_has_no_eta() {
        let h = harness(100.0, vec![ScriptedApi::completed(1.0)]);
        let job = admitted_job(&h, 5.0).await;
        h.tracker.poll_once(job.id).await.unwrap();

        let progress = h.tracker.job_progress(job.id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert!(progress.eta_secs.is_none());
        assert_eq!(progress.message, "completed");
    }

    // -- billing recovery --------------------------------------------------

    /// Cost repository whose first `failures_left` appends error out.
    struct FlakyCosts {
        inner: InMemoryCostRepository,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl CostRepository for FlakyCosts {
        async fn append(&self, record: &CostRecord) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SpendWatchError::Persistence(
                    "ledger write lost".to_string(),
                ));
            }
            self.inner.append(record).await
        }

        async fn list_since(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> Result<Vec<CostRecord>> {
            self.inner.list_since(since).await
        }

        async fn list_by_category(
            &self,
            category: CostCategory,
            limit: usize,
        ) -> Result<Vec<CostRecord>> {
            self.inner.list_by_category(category, limit).await
        }

        async fn sum_all(&self) -> Result<f64> {
            self.inner.sum_all().await
        }

        async fn exists_for_job(&self, job_id: Uuid) -> Result<bool> {
            self.inner.exists_for_job(job_id).await
        }

        async fn health_check(&self) -> Result<()> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn test_billing_retries_after_transient_ledger_failure() {
        let costs = Arc::new(FlakyCosts {
            inner: InMemoryCostRepository::new(),
            failures_left: AtomicUsize::new(1),
        });
        let ledger = Arc::new(
            BudgetLedger::new(costs.clone() as Arc<dyn CostRepository>, 100.0).unwrap(),
        );
        let analyzer = Arc::new(AnomalyAnalyzer::new(
            costs.clone() as Arc<dyn CostRepository>,
            AnomalyConfig::default(),
        ));
        let jobs = Arc::new(InMemoryJobRepository::new());
        let api = Arc::new(ScriptedApi::new(vec![ScriptedApi::completed(2.0)]));
        let tracker = Arc::new(JobTracker::new(
            ledger,
            analyzer,
            jobs.clone(),
            api,
            TrackerConfig::default(),
            ShutdownCoordinator::new(5),
        ));
        let job = match tracker.create_job(None, request(), 2.0).await.unwrap() {
            JobAdmission::Admitted(job) => job,
            JobAdmission::Denied(d) => panic!("unexpected denial: {d:?}"),
        };

        // The terminal poll persists completion but the ledger write fails.
        let err = tracker.poll_once(job.id).await.unwrap_err();
        assert!(matches!(err, SpendWatchError::Persistence(_)));
        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(!stored.cost_recorded);

        // The next poll retries recording even though the job is terminal.
        assert!(tracker.poll_once(job.id).await.unwrap());
        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert!(stored.cost_recorded);
        assert!(costs.exists_for_job(job.id).await.unwrap());
        let spend = costs.sum_all().await.unwrap();
        assert!((spend - 2.0).abs() < f64::EPSILON);
    }

    // -- shutdown drain ----------------------------------------------------

    /// API whose status polls take a while to come back.
    struct SlowApi {
        delay: Duration,
    }

    #[async_trait]
    impl JobApi for SlowApi {
        async fn submit(&self, _request: &JobRequest) -> Result<String> {
            Ok("slow-1".to_string())
        }

        async fn poll_status(&self, _external_ref: &str) -> Result<JobPoll> {
            tokio::time::sleep(self.delay).await;
            Ok(JobPoll {
                done: false,
                progress: 10,
                failed: false,
                actual_cost_usd: None,
                error: None,
            })
        }

        async fn cancel(&self, _external_ref: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_poll() {
        let costs = Arc::new(InMemoryCostRepository::new());
        let ledger = Arc::new(
            BudgetLedger::new(costs.clone() as Arc<dyn CostRepository>, 100.0).unwrap(),
        );
        let analyzer = Arc::new(AnomalyAnalyzer::new(
            costs as Arc<dyn CostRepository>,
            AnomalyConfig::default(),
        ));
        let jobs = Arc::new(InMemoryJobRepository::new());
        let coordinator = ShutdownCoordinator::new(5);
        let tracker = Arc::new(JobTracker::new(
            ledger,
            analyzer,
            jobs,
            Arc::new(SlowApi {
                delay: Duration::from_millis(200),
            }),
            TrackerConfig::default(),
            coordinator.clone(),
        ));
        let job = match tracker.create_job(None, request(), 1.0).await.unwrap() {
            JobAdmission::Admitted(job) => job,
            JobAdmission::Denied(d) => panic!("unexpected denial: {d:?}"),
        };

        let poller = Arc::clone(&tracker);
        let handle = tokio::spawn(async move { poller.poll_once(job.id).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.in_flight(), 1);

        coordinator.trigger();
        assert!(coordinator.drain().await);
        assert_eq!(coordinator.in_flight(), 0);
        handle.await.unwrap().unwrap();
    }
}
