//! Budget-gated job lifecycle and alerting engine.
//!
//! Components:
//!
//! * [`ledger`] — append-only spend ledger, derived budget state, and the
//!   admission circuit breaker.
//! * [`tracker`] — job lifecycle state machine with per-job polling tasks
//!   and exactly-once terminal cost recording.
//! * [`anomaly`] — per-category spike detection and trend projection.
//! * [`alerts`] — rule registry, evaluation loop, and alert lifecycle.
//! * [`notify`] — pluggable notification channels (console, webhook).
//! * [`api`] — the operational HTTP surface.
//! * [`job_api`] — HTTP client for the external compute provider.
//! * [`config`] / [`shutdown`] — configuration loading and graceful
//!   shutdown coordination.

pub mod alerts;
pub mod anomaly;
pub mod api;
pub mod config;
pub mod job_api;
pub mod ledger;
pub mod notify;
pub mod shutdown;
pub mod tracker;
