//! Core types, traits, and errors for spendwatch
//!
//! This crate contains the foundational types shared across all spendwatch
//! components: the cost ledger data model, job lifecycle states, alert rules
//! and alerts, configuration structs, and the repository/collaborator traits
//! that the storage and engine crates implement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Cost categories & records
// ---------------------------------------------------------------------------

/// Source category for a cost record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    /// Image generation requests.
    ImageGeneration,
    /// Video generation requests.
    VideoGeneration,
    /// Text / LLM generation requests.
    TextGeneration,
    /// Embedding computation.
    Embedding,
    /// Storage and bandwidth costs.
    Storage,
    /// Anything that does not fit the above.
    Other,
}

impl std::fmt::Display for CostCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImageGeneration => write!(f, "image_generation"),
            Self::VideoGeneration => write!(f, "video_generation"),
            Self::TextGeneration => write!(f, "text_generation"),
            Self::Embedding => write!(f, "embedding"),
            Self::Storage => write!(f, "storage"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for CostCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "image_generation" => Ok(Self::ImageGeneration),
            "video_generation" => Ok(Self::VideoGeneration),
            "text_generation" => Ok(Self::TextGeneration),
            "embedding" => Ok(Self::Embedding),
            "storage" => Ok(Self::Storage),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown cost category: {s}")),
        }
    }
}

/// An immutable, append-only entry in the spend ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// Unique identifier for this record.
    pub id: Uuid,
    /// Cost source category.
    pub category: CostCategory,
    /// Amount in USD (always >= 0).
    pub amount_usd: f64,
    /// ISO currency code (informational; amounts are normalised to USD).
    pub currency: String,
    /// Human-readable description of what was paid for.
    pub description: String,
    /// Correlated user session, if any.
    pub session_id: Option<String>,
    /// Correlated job, if this record is a job's terminal cost.
    pub job_id: Option<Uuid>,
    /// When the record was appended to the ledger.
    pub recorded_at: DateTime<Utc>,
}

impl CostRecord {
    /// Create a new cost record timestamped now.
    pub fn new(category: CostCategory, amount_usd: f64, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            amount_usd,
            currency: "USD".to_string(),
            description,
            session_id: None,
            job_id: None,
            recorded_at: Utc::now(),
        }
    }

    /// Correlate this record with a session.
    pub fn with_session(mut self, session_id: String) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Correlate this record with a job.
    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

// ---------------------------------------------------------------------------
// Budget state
// ---------------------------------------------------------------------------

/// Budget utilisation at or above this percentage is a warning.
pub const WARNING_THRESHOLD_PCT: f64 = 75.0;
/// Budget utilisation at or above this percentage trips the circuit breaker.
pub const DANGER_THRESHOLD_PCT: f64 = 90.0;
/// Budget utilisation at or above this percentage is exceeded.
pub const EXCEEDED_THRESHOLD_PCT: f64 = 100.0;

/// Alert level derived from budget utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetAlertLevel {
    /// Below 75 % of budget.
    Safe,
    /// At or above 75 % of budget.
    Warning,
    /// At or above 90 % — no new paid operations admitted.
    Danger,
    /// At or above 100 %.
    Exceeded,
}

impl BudgetAlertLevel {
    /// Derive the alert level from a utilisation percentage.
    #[must_use]
    pub fn from_percentage(pct: f64) -> Self {
        if pct >= EXCEEDED_THRESHOLD_PCT {
            Self::Exceeded
        } else if pct >= DANGER_THRESHOLD_PCT {
            Self::Danger
        } else if pct >= WARNING_THRESHOLD_PCT {
            Self::Warning
        } else {
            Self::Safe
        }
    }
}

impl std::fmt::Display for BudgetAlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Warning => write!(f, "warning"),
            Self::Danger => write!(f, "danger"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Derived budget state. Never stored — recomputed from the ledger on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    /// Configured total budget in USD.
    pub total_budget_usd: f64,
    /// Sum of all recorded spend in USD.
    pub current_spend_usd: f64,
    /// Remaining budget in USD (may be negative when exceeded).
    pub remaining_usd: f64,
    /// Percentage of budget consumed.
    pub percentage_used: f64,
    /// Alert level for the current utilisation.
    pub alert_level: BudgetAlertLevel,
    /// Whether new paid operations may be admitted at all.
    pub can_proceed: bool,
}

/// Why a paid operation was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Budget fully consumed.
    BudgetExceeded,
    /// Circuit breaker: utilisation is at or above the danger threshold.
    DangerThreshold,
    /// The estimate does not fit in the remaining budget.
    InsufficientRemaining,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::DangerThreshold => write!(f, "danger_threshold"),
            Self::InsufficientRemaining => write!(f, "insufficient_remaining"),
        }
    }
}

/// Admission decision for a new paid operation.
///
/// Returned as a value (never an error) so callers can branch on it and
/// surface budget feedback to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    /// Whether the operation may start.
    pub allowed: bool,
    /// Denial reason when `allowed` is false.
    pub reason: Option<DenialReason>,
}

impl AdmissionDecision {
    /// An allowed decision.
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denied decision with the given reason.
    #[must_use]
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle state of an external compute job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted and submitted, not yet observed running.
    Pending,
    /// Observed running upstream.
    Processing,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: failed or cancelled.
    Failed,
}

impl JobStatus {
    /// Whether this is a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Monotonic rank: transitions may only increase rank, and terminal
    /// states never transition at all.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn accepts(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A tracked external compute job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,
    /// Reference assigned by the external job API.
    pub external_ref: String,
    /// Cost category this job is billed under.
    pub category: CostCategory,
    /// Current lifecycle state (monotonic).
    pub status: JobStatus,
    /// Progress percentage, 0–100.
    pub progress: u8,
    /// Cost estimate used for admission.
    pub estimated_cost_usd: f64,
    /// Actual cost, set exactly once at the transition into `completed`.
    pub actual_cost_usd: Option<f64>,
    /// Terminal error message, if the job failed.
    pub error: Option<String>,
    /// Guard flag: whether the terminal cost has been recorded in the ledger.
    pub cost_recorded: bool,
    /// Correlated user session.
    pub session_id: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(external_ref: String, category: CostCategory, estimated_cost_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_ref,
            category,
            status: JobStatus::Pending,
            progress: 0,
            estimated_cost_usd,
            actual_cost_usd: None,
            error: None,
            cost_recorded: false,
            session_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Correlate this job with a session.
    pub fn with_session(mut self, session_id: String) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Request payload submitted to the external job API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Cost category this job will be billed under.
    pub category: CostCategory,
    /// Provider-specific request payload (opaque to the tracker).
    pub payload: serde_json::Value,
}

/// One status observation from the external job API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPoll {
    /// Whether the job has reached a terminal state upstream.
    pub done: bool,
    /// Reported progress percentage, 0–100.
    pub progress: u8,
    /// Whether the terminal state is a failure.
    pub failed: bool,
    /// Actual cost reported on successful completion.
    pub actual_cost_usd: Option<f64>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// Human-facing progress snapshot for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    /// The job this describes.
    pub job_id: Uuid,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Progress percentage, 0–100.
    pub progress: u8,
    /// Human-readable status message.
    pub message: String,
    /// Estimated seconds remaining (`None` once terminal).
    pub eta_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Alert severity & rule operators
// ---------------------------------------------------------------------------

/// Severity level for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational — no immediate action needed.
    Info,
    /// Low severity — minor issue.
    Low,
    /// Medium severity — should be addressed.
    Medium,
    /// High severity — prompt attention needed.
    High,
    /// Most severe — immediate attention required.
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Comparison operator for rule conditions.
///
/// Deliberately a fixed small set — rule conditions are not a scripting
/// language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Equal (within epsilon).
    Eq,
}

impl CompareOp {
    /// Evaluate `current <op> threshold`.
    #[must_use]
    pub fn evaluate(self, current: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => current > threshold,
            Self::Gte => current >= threshold,
            Self::Lt => current < threshold,
            Self::Lte => current <= threshold,
            Self::Eq => (current - threshold).abs() < 1e-9,
        }
    }
}

/// The metric a rule is bound to.
///
/// A resolver may be unable to produce a value (source unavailable); the
/// rule engine skips that evaluation tick rather than raising a false alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// Ledger utilisation percentage (0–100+).
    BudgetPercentage,
    /// Ledger total spend in USD.
    BudgetSpend,
    /// Spend over the trailing hour in USD.
    HourlySpend,
    /// Number of non-terminal jobs.
    ActiveJobs,
    /// Jobs that failed in the trailing hour.
    FailedJobsLastHour,
    /// Count of unresolved cost anomalies.
    AnomalyCount,
    /// An externally published signal, looked up by name.
    External(String),
}

impl std::fmt::Display for MetricSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetPercentage => write!(f, "budget_percentage"),
            Self::BudgetSpend => write!(f, "budget_spend"),
            Self::HourlySpend => write!(f, "hourly_spend"),
            Self::ActiveJobs => write!(f, "active_jobs"),
            Self::FailedJobsLastHour => write!(f, "failed_jobs_last_hour"),
            Self::AnomalyCount => write!(f, "anomaly_count"),
            Self::External(name) => write!(f, "external:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

/// A configurable alert rule evaluated on every engine tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier (generated when omitted from configuration).
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// The metric this rule watches.
    pub source: MetricSource,
    /// Threshold the metric is compared against.
    pub threshold: f64,
    /// Comparison operator.
    pub operator: CompareOp,
    /// Severity of alerts created by this rule.
    pub severity: AlertSeverity,
    /// Notification channel names to dispatch to.
    pub channels: Vec<String>,
    /// Aggregation window for windowed sources, in seconds.
    #[serde(default = "default_aggregation_window_secs")]
    pub aggregation_window_secs: u64,
    /// Minimum seconds between successive alert creations for this rule.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Maximum alerts this rule may create in a rolling hour.
    #[serde(default = "default_max_alerts_per_hour")]
    pub max_alerts_per_hour: u32,
    /// Whether the engine may resolve this rule's alerts automatically.
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    /// Minimum age in seconds before auto-resolution.
    #[serde(default = "default_auto_resolve_after_secs")]
    pub auto_resolve_after_secs: u64,
    /// Whether this rule is evaluated at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_aggregation_window_secs() -> u64 {
    3600
}

fn default_cooldown_secs() -> u64 {
    600
}

fn default_max_alerts_per_hour() -> u32 {
    5
}

fn default_auto_resolve_after_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl AlertRule {
    /// Create a rule with the field defaults applied.
    pub fn new(
        name: &str,
        source: MetricSource,
        operator: CompareOp,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            source,
            threshold,
            operator,
            severity,
            channels: vec!["console".to_string()],
            aggregation_window_secs: default_aggregation_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_alerts_per_hour: default_max_alerts_per_hour(),
            auto_resolve: true,
            auto_resolve_after_secs: default_auto_resolve_after_secs(),
            enabled: true,
        }
    }
}

/// The built-in rule set loaded at startup, before any config-defined rules.
#[must_use]
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "budget_warning",
            MetricSource::BudgetPercentage,
            CompareOp::Gte,
            WARNING_THRESHOLD_PCT,
            AlertSeverity::Medium,
        ),
        AlertRule::new(
            "budget_danger",
            MetricSource::BudgetPercentage,
            CompareOp::Gte,
            DANGER_THRESHOLD_PCT,
            AlertSeverity::Critical,
        ),
        AlertRule::new(
            "job_failure_burst",
            MetricSource::FailedJobsLastHour,
            CompareOp::Gte,
            5.0,
            AlertSeverity::High,
        ),
        AlertRule::new(
            "cost_anomalies_present",
            MetricSource::AnomalyCount,
            CompareOp::Gte,
            3.0,
            AlertSeverity::High,
        ),
    ]
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Lifecycle state of an alert. Strictly `active → {resolved | suppressed}`;
/// an alert is never reopened — a new trigger creates a new alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The triggering condition is (or was last seen) true.
    Active,
    /// Resolved by auto-resolution, timeout, or an operator.
    Resolved,
    /// Suppressed by an operator without resolution.
    Suppressed,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Resolved => write!(f, "resolved"),
            Self::Suppressed => write!(f, "suppressed"),
        }
    }
}

/// An alert created by the rule engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier.
    pub id: Uuid,
    /// The rule that created this alert.
    pub rule_id: Uuid,
    /// Rule name at creation time (denormalised for display).
    pub rule_name: String,
    /// Current lifecycle state.
    pub status: AlertStatus,
    /// Severity inherited from the rule.
    pub severity: AlertSeverity,
    /// Most recently observed metric value.
    pub current_value: f64,
    /// The rule threshold at creation time.
    pub threshold: f64,
    /// When the alert was created.
    pub triggered_at: DateTime<Utc>,
    /// When the alert was resolved or suppressed.
    pub resolved_at: Option<DateTime<Utc>>,
    /// How many notifications have been dispatched for this alert.
    pub notifications_sent: u32,
    /// Channel names notifications were dispatched to.
    pub channels: Vec<String>,
}

impl Alert {
    /// Create a new active alert for a rule.
    pub fn new(rule: &AlertRule, current_value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            status: AlertStatus::Active,
            severity: rule.severity,
            current_value,
            threshold: rule.threshold,
            triggered_at: Utc::now(),
            resolved_at: None,
            notifications_sent: 0,
            channels: rule.channels.clone(),
        }
    }
}

/// The lifecycle event a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEvent {
    /// The alert was just created.
    Triggered,
    /// The alert was resolved.
    Resolved,
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Triggered => write!(f, "triggered"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cost alerts (anomaly / projection)
// ---------------------------------------------------------------------------

/// What kind of condition a [`CostAlert`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostAlertKind {
    /// A statistically anomalous single spend entry.
    Anomaly,
    /// Projected spend rate threatens the budget.
    Projection,
    /// A fixed threshold was crossed.
    Threshold,
}

impl std::fmt::Display for CostAlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anomaly => write!(f, "anomaly"),
            Self::Projection => write!(f, "projection"),
            Self::Threshold => write!(f, "threshold"),
        }
    }
}

/// A narrower alert kind produced by the anomaly/trend analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAlert {
    /// Unique identifier.
    pub id: Uuid,
    /// Condition kind.
    pub kind: CostAlertKind,
    /// Severity of the condition.
    pub severity: AlertSeverity,
    /// Spend value that triggered the alert.
    pub current_spend_usd: f64,
    /// The threshold that was crossed.
    pub threshold_usd: f64,
    /// Human-readable description.
    pub message: String,
    /// Whether the condition has cleared.
    pub resolved: bool,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
}

impl CostAlert {
    /// Create a new unresolved cost alert.
    pub fn new(
        kind: CostAlertKind,
        severity: AlertSeverity,
        current_spend_usd: f64,
        threshold_usd: f64,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            current_spend_usd,
            threshold_usd,
            message,
            resolved: false,
            created_at: Utc::now(),
        }
    }
}

/// Spend projection computed from the trailing 24 hours of records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostProjection {
    /// Projected spend per day in USD.
    pub projected_daily_usd: f64,
    /// Projected spend per month in USD (daily × 30).
    pub projected_monthly_usd: f64,
    /// Hours until the remaining budget is consumed at the current rate.
    /// `None` when the hourly rate is zero (unbounded).
    pub hours_to_limit: Option<f64>,
    /// Sample-count-based confidence, 0–100. Low trust with sparse data.
    pub confidence_pct: f64,
    /// Number of records the projection was computed from.
    pub data_points: usize,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Top-level engine configuration, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Address the operational HTTP API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Admin token required for mutating endpoints (`None` disables them).
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Budget ledger settings.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Job lifecycle tracker settings.
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Anomaly / trend analyzer settings.
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    /// Alert rule engine settings.
    #[serde(default)]
    pub alerting: AlertingConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8088".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_token: None,
            budget: BudgetConfig::default(),
            tracker: TrackerConfig::default(),
            anomaly: AnomalyConfig::default(),
            alerting: AlertingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Budget ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total budget in USD.
    #[serde(default = "default_total_budget_usd")]
    pub total_budget_usd: f64,
}

fn default_total_budget_usd() -> f64 {
    100.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_budget_usd: default_total_budget_usd(),
        }
    }
}

/// Job lifecycle tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base URL of the external job API.
    #[serde(default = "default_job_api_url")]
    pub job_api_url: String,
    /// Seconds between status polls for a job.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive poll failures before a job is marked failed.
    #[serde(default = "default_max_consecutive_poll_failures")]
    pub max_consecutive_poll_failures: u32,
    /// ETA reported while progress is still zero, in seconds.
    #[serde(default = "default_zero_progress_eta_secs")]
    pub default_eta_secs: u64,
    /// Timeout for external job API calls, in milliseconds.
    #[serde(default = "default_job_api_timeout_ms")]
    pub job_api_timeout_ms: u64,
}

fn default_job_api_url() -> String {
    "http://127.0.0.1:9800".to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_consecutive_poll_failures() -> u32 {
    3
}

fn default_zero_progress_eta_secs() -> u64 {
    120
}

fn default_job_api_timeout_ms() -> u64 {
    10_000
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            job_api_url: default_job_api_url(),
            poll_interval_secs: default_poll_interval_secs(),
            max_consecutive_poll_failures: default_max_consecutive_poll_failures(),
            default_eta_secs: default_zero_progress_eta_secs(),
            job_api_timeout_ms: default_job_api_timeout_ms(),
        }
    }
}

/// Anomaly / trend analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Whether the analyzer runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-category history window size.
    #[serde(default = "default_anomaly_window_size")]
    pub window_size: usize,
    /// Minimum samples before spike detection activates.
    #[serde(default = "default_anomaly_min_samples")]
    pub min_samples: usize,
    /// Seconds between trend sweeps.
    #[serde(default = "default_trend_sweep_interval_secs")]
    pub trend_sweep_interval_secs: u64,
}

fn default_anomaly_window_size() -> usize {
    10
}

fn default_anomaly_min_samples() -> usize {
    3
}

fn default_trend_sweep_interval_secs() -> u64 {
    300
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: default_anomaly_window_size(),
            min_samples: default_anomaly_min_samples(),
            trend_sweep_interval_secs: default_trend_sweep_interval_secs(),
        }
    }
}

/// Alert rule engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Whether the evaluation loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between rule evaluation ticks.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    /// Seconds between cleanup sweeps.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Global cap on concurrently active alerts.
    #[serde(default = "default_max_active_alerts")]
    pub max_active_alerts: usize,
    /// Hours a resolved alert is retained before cleanup deletes it.
    #[serde(default = "default_resolved_retention_hours")]
    pub resolved_retention_hours: u64,
    /// Additional rules loaded on top of the built-in defaults.
    #[serde(default)]
    pub rules: Vec<AlertRule>,
    /// Notification channels.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_evaluation_interval_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_max_active_alerts() -> usize {
    100
}

fn default_resolved_retention_hours() -> u64 {
    24
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_secs: default_evaluation_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_active_alerts: default_max_active_alerts(),
            resolved_retention_hours: default_resolved_retention_hours(),
            rules: Vec::new(),
            channels: Vec::new(),
        }
    }
}

/// Configuration for one notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name referenced by rules.
    pub name: String,
    /// Channel kind: `console` or `webhook`.
    pub kind: String,
    /// Webhook URL (for `webhook` channels).
    #[serde(default)]
    pub webhook_url: String,
    /// Whether the channel is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum SpendWatchError {
    /// Invalid input (negative cost, non-positive budget, …).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown job / alert / rule id.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        kind: &'static str,
        /// The id that was not found.
        id: Uuid,
    },

    /// External job API or notification channel failure.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Backing store unavailable or corrupt.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `std::result::Result<T, SpendWatchError>`.
pub type Result<T> = std::result::Result<T, SpendWatchError>;

// ---------------------------------------------------------------------------
// Repository traits (storage layer abstraction)
// ---------------------------------------------------------------------------

/// Append-only repository for ledger cost records.
///
/// The ledger is the only writer; records are totally ordered by append.
#[async_trait::async_trait]
pub trait CostRepository: Send + Sync {
    /// Append a record to the ledger.
    async fn append(&self, record: &CostRecord) -> Result<()>;

    /// All records with `recorded_at >= since`, oldest first.
    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<CostRecord>>;

    /// The most recent `limit` records for a category, oldest first.
    async fn list_by_category(
        &self,
        category: CostCategory,
        limit: usize,
    ) -> Result<Vec<CostRecord>>;

    /// Sum of all recorded amounts.
    async fn sum_all(&self) -> Result<f64>;

    /// Whether a record correlated to `job_id` already exists.
    async fn exists_for_job(&self, job_id: Uuid) -> Result<bool>;

    /// Health check for the repository.
    async fn health_check(&self) -> Result<()>;
}

/// Repository for job records.
#[async_trait::async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new job.
    async fn create(&self, job: &Job) -> Result<()>;

    /// Fetch a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Overwrite an existing job.
    async fn update(&self, job: &Job) -> Result<()>;

    /// All jobs currently in `status`.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Jobs that entered a terminal state at or after `since`.
    async fn list_terminal_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Health check for the repository.
    async fn health_check(&self) -> Result<()>;
}

/// Repository for alert records.
#[async_trait::async_trait]
pub trait AlertRepository: Send + Sync {
    /// Persist a new alert.
    async fn insert(&self, alert: &Alert) -> Result<()>;

    /// Overwrite an existing alert.
    async fn update(&self, alert: &Alert) -> Result<()>;

    /// Fetch an alert by id.
    async fn get(&self, id: Uuid) -> Result<Option<Alert>>;

    /// The active alert for a rule, if one exists.
    ///
    /// Invariant: at most one active alert per rule at any time.
    async fn active_for_rule(&self, rule_id: Uuid) -> Result<Option<Alert>>;

    /// The most recently triggered alert for a rule, of any status.
    async fn latest_for_rule(&self, rule_id: Uuid) -> Result<Option<Alert>>;

    /// All currently active alerts.
    async fn list_active(&self) -> Result<Vec<Alert>>;

    /// Delete resolved alerts that resolved before `before`. Returns count.
    async fn delete_resolved_before(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Health check for the repository.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// External collaborator traits
// ---------------------------------------------------------------------------

/// The external compute API that actually runs jobs.
#[async_trait::async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a job; returns the provider's external reference.
    async fn submit(&self, request: &JobRequest) -> Result<String>;

    /// Poll the current status of a submitted job.
    async fn poll_status(&self, external_ref: &str) -> Result<JobPoll>;

    /// Best-effort cancellation. Returns whether the provider accepted it.
    async fn cancel(&self, external_ref: &str) -> Result<bool>;
}

/// A pluggable notification delivery channel.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name referenced by rule configuration.
    fn name(&self) -> &str;

    /// Deliver a notification for an alert lifecycle event.
    async fn send(&self, alert: &Alert, event: AlertEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
