//! Store trait definition
//!
//! The dispatcher, the notifier and the control CLI all talk to the shared
//! store through [`Store`]. Implementations scope every call to a single
//! pooled connection or transaction, so handles are never shared between
//! sessions and conflicting writes are serialized by the backend itself.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::model::{AlertRule, MeasurementSample, MetricName, NewAlertRule, NodeRole, UrlTarget};

/// Health status of the store
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ========================================================================
    // URL targets
    // ========================================================================

    /// Insert `url` with one follower, or add a follower to the existing row
    async fn follow_url(&self, url: &str) -> StorageResult<UrlTarget>;

    /// Drop one follower and the owner's rules for that URL
    ///
    /// The reference count never goes below zero and the row is kept.
    /// Returns `None` if the target does not exist.
    async fn unfollow_url(&self, owner: i64, url_id: i64) -> StorageResult<Option<UrlTarget>>;

    /// Returns `false` if the target does not exist
    async fn set_force_inactive(&self, url_id: i64, inactive: bool) -> StorageResult<bool>;

    async fn get_target(&self, url_id: i64) -> StorageResult<Option<UrlTarget>>;

    async fn list_targets(&self) -> StorageResult<Vec<UrlTarget>>;

    /// Claim the unclaimed eligible target with the oldest `last_checked`
    /// (ties: lowest id) until `claimed_until`
    ///
    /// Selection and claim happen in one step, so two sessions never get
    /// the same target. A claim older than `now` has expired and no longer
    /// hides the target.
    async fn claim_next_target(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
    ) -> StorageResult<Option<UrlTarget>>;

    /// Hand a claimed target back without marking it checked
    async fn release_claim(&self, url_id: i64) -> StorageResult<()>;

    /// Record a finished cycle and release the claim
    async fn mark_checked(&self, url_id: i64, at: DateTime<Utc>) -> StorageResult<()>;

    // ========================================================================
    // Samples
    // ========================================================================

    /// Append samples in one transaction
    async fn insert_samples(&self, samples: Vec<MeasurementSample>) -> StorageResult<()>;

    /// Samples for `url` taken at or after `since`, newest first
    async fn recent_samples(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<MeasurementSample>>;

    /// Average of the present values of `metric` since `since`
    ///
    /// `None` when no value exists in the window or the metric is not numeric.
    async fn metric_average(
        &self,
        url: &str,
        metric: MetricName,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<f64>>;

    // ========================================================================
    // Alert rules
    // ========================================================================

    /// Validate and persist a new, active rule
    async fn add_rule(&self, rule: NewAlertRule) -> StorageResult<AlertRule>;

    async fn list_rules(&self, owner: Option<i64>) -> StorageResult<Vec<AlertRule>>;

    async fn active_rules(&self) -> StorageResult<Vec<AlertRule>>;

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> StorageResult<bool>;

    async fn remove_rule(&self, rule_id: i64) -> StorageResult<bool>;

    async fn record_notified(&self, rule_id: i64, at: DateTime<Utc>) -> StorageResult<()>;

    async fn record_last_value(&self, rule_id: i64, value: f64) -> StorageResult<()>;

    // ========================================================================
    // Node roles
    // ========================================================================

    /// Insert or replace the role row of `role.node_id`
    async fn upsert_node_role(&self, role: &NodeRole) -> StorageResult<()>;

    async fn node_role(&self, node_id: &str) -> StorageResult<Option<NodeRole>>;

    async fn count_active_servers(&self) -> StorageResult<usize>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
