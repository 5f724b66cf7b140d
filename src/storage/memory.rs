//! In-memory store (no persistence)
//!
//! Useful for:
//! - Testing without database files
//! - Short local runs where history does not matter
//!
//! ## Limitations
//!
//! - **No persistence**: all data is lost on restart
//! - **Single process**: probes, server and notifier cannot share it

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::backend::{HealthStatus, Store};
use super::error::{StorageError, StorageResult};
use crate::model::{
    AlertRule, MeasurementSample, MetricName, NewAlertRule, NodeRole, Role, UrlTarget,
};

#[derive(Default)]
struct Tables {
    targets: Vec<UrlTarget>,
    samples: Vec<MeasurementSample>,
    rules: Vec<AlertRule>,
    roles: HashMap<String, NodeRole>,
    /// Target id to the end of its session claim
    claims: HashMap<i64, DateTime<Utc>>,
    next_target_id: i64,
    next_rule_id: i64,
}

/// [`Store`] kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::BackendError("in-memory store poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn follow_url(&self, url: &str) -> StorageResult<UrlTarget> {
        if url.trim().is_empty() {
            return Err(StorageError::InvalidConfig("url must not be empty".to_string()));
        }

        let mut tables = self.lock()?;

        if let Some(target) = tables.targets.iter_mut().find(|t| t.url == url) {
            target.reference_count += 1;
            return Ok(target.clone());
        }

        tables.next_target_id += 1;
        let target = UrlTarget {
            id: tables.next_target_id,
            url: url.to_string(),
            last_checked: DateTime::UNIX_EPOCH,
            reference_count: 1,
            force_inactive: false,
        };
        tables.targets.push(target.clone());
        Ok(target)
    }

    async fn unfollow_url(&self, owner: i64, url_id: i64) -> StorageResult<Option<UrlTarget>> {
        let mut tables = self.lock()?;

        tables
            .rules
            .retain(|rule| !(rule.owner == owner && rule.url_id == url_id));

        Ok(tables
            .targets
            .iter_mut()
            .find(|t| t.id == url_id)
            .map(|target| {
                target.reference_count = (target.reference_count - 1).max(0);
                target.clone()
            }))
    }

    async fn set_force_inactive(&self, url_id: i64, inactive: bool) -> StorageResult<bool> {
        let mut tables = self.lock()?;
        Ok(match tables.targets.iter_mut().find(|t| t.id == url_id) {
            Some(target) => {
                target.force_inactive = inactive;
                true
            }
            None => false,
        })
    }

    async fn get_target(&self, url_id: i64) -> StorageResult<Option<UrlTarget>> {
        Ok(self.lock()?.targets.iter().find(|t| t.id == url_id).cloned())
    }

    async fn list_targets(&self) -> StorageResult<Vec<UrlTarget>> {
        Ok(self.lock()?.targets.clone())
    }

    async fn claim_next_target(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
    ) -> StorageResult<Option<UrlTarget>> {
        let mut tables = self.lock()?;
        let claims = &tables.claims;

        let next = tables
            .targets
            .iter()
            .filter(|t| t.is_eligible())
            .filter(|t| claims.get(&t.id).is_none_or(|until| *until <= now))
            .min_by_key(|t| (t.last_checked, t.id))
            .cloned();

        if let Some(target) = &next {
            tables.claims.insert(target.id, claimed_until);
        }
        Ok(next)
    }

    async fn release_claim(&self, url_id: i64) -> StorageResult<()> {
        self.lock()?.claims.remove(&url_id);
        Ok(())
    }

    async fn mark_checked(&self, url_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.claims.remove(&url_id);
        if let Some(target) = tables.targets.iter_mut().find(|t| t.id == url_id) {
            target.last_checked = at;
        }
        Ok(())
    }

    async fn insert_samples(&self, samples: Vec<MeasurementSample>) -> StorageResult<()> {
        debug!("in-memory store: inserting {} samples", samples.len());
        self.lock()?.samples.extend(samples);
        Ok(())
    }

    async fn recent_samples(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<MeasurementSample>> {
        let tables = self.lock()?;

        // insertion order breaks timestamp ties, newest insert first
        let mut samples: Vec<(usize, &MeasurementSample)> = tables
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.url == url && s.timestamp >= since)
            .collect();
        samples.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));

        Ok(samples.into_iter().map(|(_, s)| s.clone()).collect())
    }

    async fn metric_average(
        &self,
        url: &str,
        metric: MetricName,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<f64>> {
        if metric.numeric_column().is_none() {
            return Ok(None);
        }

        let tables = self.lock()?;
        let values: Vec<f64> = tables
            .samples
            .iter()
            .filter(|s| s.url == url && s.timestamp >= since)
            .filter_map(|s| s.metric(metric))
            .collect();

        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    async fn add_rule(&self, rule: NewAlertRule) -> StorageResult<AlertRule> {
        rule.validate().map_err(StorageError::InvalidConfig)?;

        let mut tables = self.lock()?;
        if !tables.targets.iter().any(|t| t.id == rule.url_id) {
            return Err(StorageError::QueryFailed(format!(
                "url target {} does not exist",
                rule.url_id
            )));
        }

        tables.next_rule_id += 1;
        let created = AlertRule {
            id: tables.next_rule_id,
            owner: rule.owner,
            url_id: rule.url_id,
            metric: rule.metric,
            kind: rule.kind,
            threshold: rule.threshold,
            last_value: None,
            last_notified: None,
            destination: rule.destination,
            active: true,
        };
        tables.rules.push(created.clone());
        Ok(created)
    }

    async fn list_rules(&self, owner: Option<i64>) -> StorageResult<Vec<AlertRule>> {
        Ok(self
            .lock()?
            .rules
            .iter()
            .filter(|r| owner.is_none_or(|o| r.owner == o))
            .cloned()
            .collect())
    }

    async fn active_rules(&self) -> StorageResult<Vec<AlertRule>> {
        Ok(self
            .lock()?
            .rules
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> StorageResult<bool> {
        let mut tables = self.lock()?;
        Ok(match tables.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.active = active;
                true
            }
            None => false,
        })
    }

    async fn remove_rule(&self, rule_id: i64) -> StorageResult<bool> {
        let mut tables = self.lock()?;
        let before = tables.rules.len();
        tables.rules.retain(|r| r.id != rule_id);
        Ok(tables.rules.len() != before)
    }

    async fn record_notified(&self, rule_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        let mut tables = self.lock()?;
        if let Some(rule) = tables.rules.iter_mut().find(|r| r.id == rule_id) {
            rule.last_notified = Some(at);
        }
        Ok(())
    }

    async fn record_last_value(&self, rule_id: i64, value: f64) -> StorageResult<()> {
        let mut tables = self.lock()?;
        if let Some(rule) = tables.rules.iter_mut().find(|r| r.id == rule_id) {
            rule.last_value = Some(value);
        }
        Ok(())
    }

    async fn upsert_node_role(&self, role: &NodeRole) -> StorageResult<()> {
        self.lock()?.roles.insert(role.node_id.clone(), role.clone());
        Ok(())
    }

    async fn node_role(&self, node_id: &str) -> StorageResult<Option<NodeRole>> {
        Ok(self.lock()?.roles.get(node_id).cloned())
    }

    async fn count_active_servers(&self) -> StorageResult<usize> {
        Ok(self
            .lock()?
            .roles
            .values()
            .filter(|r| r.role == Role::Server && r.active)
            .count())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.lock()?;

        let mut metadata = HashMap::new();
        metadata.insert("backend".to_string(), "memory".to_string());
        metadata.insert("targets".to_string(), tables.targets.len().to_string());
        metadata.insert("samples".to_string(), tables.samples.len().to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "in-memory store operational".to_string(),
            metadata,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
