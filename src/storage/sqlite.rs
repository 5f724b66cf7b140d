//! SQLite store implementation
//!
//! - **WAL mode**: readers (notifier, CLI) never block the dispatcher's writes
//! - **Connection pooling**: each trait call checks out its own connection
//! - **Migrations**: schema is versioned with `sqlx::migrate!`

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, Store};
use super::error::{StorageError, StorageResult};
use super::schema::{
    RULE_COLUMNS, SAMPLE_COLUMNS, TARGET_COLUMNS, encode_list, node_role_from_row, rule_from_row,
    sample_from_row, target_from_row, timestamp_to_millis,
};
use crate::model::{AlertRule, MeasurementSample, MetricName, NewAlertRule, NodeRole, UrlTarget};

/// SQLite-backed [`Store`]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("opening SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("SQLite store ready");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self))]
    async fn follow_url(&self, url: &str) -> StorageResult<UrlTarget> {
        if url.trim().is_empty() {
            return Err(StorageError::InvalidConfig("url must not be empty".to_string()));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO url_targets (url, reference_count) VALUES (?, 1)
            ON CONFLICT (url) DO UPDATE SET reference_count = reference_count + 1
            RETURNING {TARGET_COLUMNS}
            "#
        ))
        .bind(url)
        .fetch_one(&self.pool)
        .await?;

        target_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn unfollow_url(&self, owner: i64, url_id: i64) -> StorageResult<Option<UrlTarget>> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM alert_rules WHERE owner = ? AND url_id = ?")
            .bind(owner)
            .bind(url_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let row = sqlx::query(&format!(
            r#"
            UPDATE url_targets SET reference_count = MAX(reference_count - 1, 0)
            WHERE id = ?
            RETURNING {TARGET_COLUMNS}
            "#
        ))
        .bind(url_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("unfollowed target {url_id}, removed {removed} rules of owner {owner}");
        row.as_ref().map(target_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn set_force_inactive(&self, url_id: i64, inactive: bool) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE url_targets SET force_inactive = ? WHERE id = ?")
            .bind(inactive)
            .bind(url_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_target(&self, url_id: i64) -> StorageResult<Option<UrlTarget>> {
        let row = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM url_targets WHERE id = ?"
        ))
        .bind(url_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(target_from_row).transpose()
    }

    async fn list_targets(&self) -> StorageResult<Vec<UrlTarget>> {
        let rows = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM url_targets ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(target_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim_next_target(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
    ) -> StorageResult<Option<UrlTarget>> {
        // one statement: the write lock makes select-and-claim atomic
        let row = sqlx::query(&format!(
            r#"
            UPDATE url_targets SET claimed_until = ?
            WHERE id = (
                SELECT id FROM url_targets
                WHERE reference_count > 0 AND force_inactive = 0
                  AND (claimed_until IS NULL OR claimed_until <= ?)
                ORDER BY last_checked ASC, id ASC
                LIMIT 1
            )
            RETURNING {TARGET_COLUMNS}
            "#
        ))
        .bind(timestamp_to_millis(&claimed_until))
        .bind(timestamp_to_millis(&now))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(target_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn release_claim(&self, url_id: i64) -> StorageResult<()> {
        sqlx::query("UPDATE url_targets SET claimed_until = NULL WHERE id = ?")
            .bind(url_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_checked(&self, url_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE url_targets SET last_checked = ?, claimed_until = NULL WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(url_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn insert_samples(&self, samples: Vec<MeasurementSample>) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for sample in &samples {
            sqlx::query(&format!(
                r#"
                INSERT INTO samples ({SAMPLE_COLUMNS})
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#
            ))
            .bind(&sample.url)
            .bind(sample.load_time)
            .bind(sample.memory_usage)
            .bind(sample.cpu_time)
            .bind(sample.dom_nodes)
            .bind(sample.total_page_size)
            .bind(sample.fcp)
            .bind(sample.network_requests)
            .bind(sample.script_size)
            .bind(encode_list(&sample.broken_links)?)
            .bind(i64::from(sample.browser_id.browser_id()))
            .bind(sample.is_up)
            .bind(sample.group_id)
            .bind(encode_list(&sample.failed_metrics)?)
            .bind(timestamp_to_millis(&sample.timestamp))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!("inserted {} samples", samples.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent_samples(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<MeasurementSample>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAMPLE_COLUMNS} FROM samples
            WHERE url = ? AND timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            "#
        ))
        .bind(url)
        .bind(timestamp_to_millis(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(sample_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn metric_average(
        &self,
        url: &str,
        metric: MetricName,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<f64>> {
        let Some(column) = metric.numeric_column() else {
            return Ok(None);
        };

        // column names come from a closed enum
        let average: Option<f64> = sqlx::query_scalar(&format!(
            "SELECT AVG({column}) FROM samples WHERE url = ? AND timestamp >= ?"
        ))
        .bind(url)
        .bind(timestamp_to_millis(&since))
        .fetch_one(&self.pool)
        .await?;

        Ok(average)
    }

    #[instrument(skip(self))]
    async fn add_rule(&self, rule: NewAlertRule) -> StorageResult<AlertRule> {
        rule.validate().map_err(StorageError::InvalidConfig)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO alert_rules (owner, url_id, metric, kind, threshold, destination, active)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            RETURNING {RULE_COLUMNS}
            "#
        ))
        .bind(rule.owner)
        .bind(rule.url_id)
        .bind(rule.metric.map(|m| m.as_str()))
        .bind(rule.kind.as_str())
        .bind(rule.threshold)
        .bind(&rule.destination)
        .fetch_one(&self.pool)
        .await?;

        rule_from_row(&row)
    }

    async fn list_rules(&self, owner: Option<i64>) -> StorageResult<Vec<AlertRule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RULE_COLUMNS} FROM alert_rules
            WHERE ? IS NULL OR owner = ?
            ORDER BY id ASC
            "#
        ))
        .bind(owner)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn active_rules(&self) -> StorageResult<Vec<AlertRule>> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules WHERE active = 1 ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE alert_rules SET active = ? WHERE id = ?")
            .bind(active)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_rule(&self, rule_id: i64) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_notified(&self, rule_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE alert_rules SET last_notified = ? WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_last_value(&self, rule_id: i64, value: f64) -> StorageResult<()> {
        sqlx::query("UPDATE alert_rules SET last_value = ? WHERE id = ?")
            .bind(value)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(node_id = %role.node_id))]
    async fn upsert_node_role(&self, role: &NodeRole) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO node_roles (node_id, role, active, group_id) VALUES (?, ?, ?, ?)
            ON CONFLICT (node_id) DO UPDATE SET
                role = excluded.role,
                active = excluded.active,
                group_id = excluded.group_id
            "#,
        )
        .bind(&role.node_id)
        .bind(role.role.as_str())
        .bind(role.active)
        .bind(role.group_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn node_role(&self, node_id: &str) -> StorageResult<Option<NodeRole>> {
        let row = sqlx::query(
            "SELECT node_id, role, active, group_id FROM node_roles WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(node_role_from_row).transpose()
    }

    async fn count_active_servers(&self) -> StorageResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM node_roles WHERE role = 'server' AND active = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite store operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite store");
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertKind, BrowserProfile, Role};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, store)
    }

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[tokio::test]
    async fn test_store_creation() {
        let (_dir, store) = open_store().await;
        let health = store.health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.message.contains("operational"));
    }

    #[tokio::test]
    async fn test_follow_twice_increments_reference_count() {
        let (_dir, store) = open_store().await;

        let first = store.follow_url("https://example.com").await.unwrap();
        let second = store.follow_url("https://example.com").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.reference_count, 1);
        assert_eq!(second.reference_count, 2);
        assert_eq!(second.last_checked, DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_unfollow_never_goes_negative_and_removes_rules() {
        let (_dir, store) = open_store().await;
        let target = store.follow_url("https://example.com").await.unwrap();

        store
            .add_rule(NewAlertRule {
                owner: 7,
                url_id: target.id,
                metric: None,
                kind: AlertKind::OnDown,
                threshold: None,
                destination: "ops@example.com".to_string(),
            })
            .await
            .unwrap();

        let once = store.unfollow_url(7, target.id).await.unwrap().unwrap();
        let twice = store.unfollow_url(7, target.id).await.unwrap().unwrap();

        assert_eq!(once.reference_count, 0);
        assert_eq!(twice.reference_count, 0);
        assert!(store.list_rules(Some(7)).await.unwrap().is_empty());
        assert!(store.unfollow_url(7, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_orders_by_last_checked() {
        let (_dir, store) = open_store().await;
        let now = at(10_000);
        let lease = at(70_000);

        let a = store.follow_url("https://a.example").await.unwrap();
        let b = store.follow_url("https://b.example").await.unwrap();
        let c = store.follow_url("https://c.example").await.unwrap();
        let unfollowed = store.follow_url("https://d.example").await.unwrap();

        store.mark_checked(a.id, at(3_000)).await.unwrap();
        store.mark_checked(b.id, at(2_000)).await.unwrap();
        store.mark_checked(c.id, at(1_000)).await.unwrap();
        store.unfollow_url(1, unfollowed.id).await.unwrap();
        store.set_force_inactive(b.id, true).await.unwrap();

        assert_eq!(store.claim_next_target(now, lease).await.unwrap().unwrap().id, c.id);
        assert_eq!(store.claim_next_target(now, lease).await.unwrap().unwrap().id, a.id);
        assert!(store.claim_next_target(now, lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ties_break_on_id() {
        let (_dir, store) = open_store().await;

        let first = store.follow_url("https://a.example").await.unwrap();
        store.follow_url("https://b.example").await.unwrap();

        let claimed = store.claim_next_target(at(0), at(60_000)).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn test_claims_expire_and_are_released() {
        let (_dir, store) = open_store().await;
        let target = store.follow_url("https://a.example").await.unwrap();

        store.claim_next_target(at(0), at(60_000)).await.unwrap().unwrap();
        assert!(store.claim_next_target(at(30_000), at(90_000)).await.unwrap().is_none());

        // a lost session's claim runs out
        let reclaimed = store.claim_next_target(at(60_000), at(120_000)).await.unwrap();
        assert_eq!(reclaimed.map(|t| t.id), Some(target.id));

        store.release_claim(target.id).await.unwrap();
        assert!(store.claim_next_target(at(61_000), at(121_000)).await.unwrap().is_some());

        store.mark_checked(target.id, at(62_000)).await.unwrap();
        let checked = store.claim_next_target(at(63_000), at(123_000)).await.unwrap().unwrap();
        assert_eq!(checked.last_checked, at(62_000));
    }

    #[tokio::test]
    async fn test_samples_read_back_newest_first() {
        let (_dir, store) = open_store().await;

        let mut older = MeasurementSample::new("https://example.com", BrowserProfile::Chrome, at(10_000));
        older.load_time = Some(1.0);
        older.broken_links = vec!["https://example.com/404".to_string()];

        let mut newer = MeasurementSample::new("https://example.com", BrowserProfile::Opera, at(20_000));
        newer.load_time = None;
        newer.failed_metrics = vec![MetricName::LoadTime];
        newer.group_id = Some(3);

        store
            .insert_samples(vec![older.clone(), newer.clone()])
            .await
            .unwrap();

        let samples = store.recent_samples("https://example.com", at(0)).await.unwrap();
        assert_eq!(samples, vec![newer, older]);

        let window = store
            .recent_samples("https://example.com", at(15_000))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn test_metric_average_ignores_absent_values() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();

        let samples: Vec<MeasurementSample> = [Some(10.0), None, Some(20.0)]
            .into_iter()
            .enumerate()
            .map(|(i, load_time)| {
                let mut sample = MeasurementSample::new(
                    "https://example.com",
                    BrowserProfile::Chrome,
                    now - Duration::hours(i as i64),
                );
                sample.load_time = load_time;
                sample
            })
            .collect();
        store.insert_samples(samples).await.unwrap();

        let since = now - Duration::days(7);
        let average = store
            .metric_average("https://example.com", MetricName::LoadTime, since)
            .await
            .unwrap();
        assert_eq!(average, Some(15.0));

        let none = store
            .metric_average("https://example.com", MetricName::Fcp, since)
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn test_invalid_rule_is_refused() {
        let (_dir, store) = open_store().await;
        let target = store.follow_url("https://example.com").await.unwrap();

        let result = store
            .add_rule(NewAlertRule {
                owner: 1,
                url_id: target.id,
                metric: Some(MetricName::LoadTime),
                kind: AlertKind::HardCap,
                threshold: Some(5.0),
                destination: String::new(),
            })
            .await;

        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_rule_lifecycle() {
        let (_dir, store) = open_store().await;
        let target = store.follow_url("https://example.com").await.unwrap();

        let rule = store
            .add_rule(NewAlertRule {
                owner: 1,
                url_id: target.id,
                metric: Some(MetricName::LoadTime),
                kind: AlertKind::PercentCap,
                threshold: Some(20.0),
                destination: "ops@example.com".to_string(),
            })
            .await
            .unwrap();
        assert!(rule.active);
        assert_eq!(rule.last_notified, None);

        store.record_notified(rule.id, at(5_000)).await.unwrap();
        store.record_last_value(rule.id, 13.0).await.unwrap();

        let active = store.active_rules().await.unwrap();
        assert_eq!(active[0].last_notified, Some(at(5_000)));
        assert_eq!(active[0].last_value, Some(13.0));

        assert!(store.set_rule_active(rule.id, false).await.unwrap());
        assert!(store.active_rules().await.unwrap().is_empty());
        assert_eq!(store.list_rules(None).await.unwrap().len(), 1);

        assert!(store.remove_rule(rule.id).await.unwrap());
        assert!(!store.remove_rule(rule.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_node_roles() {
        let (_dir, store) = open_store().await;

        for node in ["alpha", "beta"] {
            store
                .upsert_node_role(&NodeRole {
                    node_id: node.to_string(),
                    role: Role::Server,
                    active: true,
                    group_id: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.count_active_servers().await.unwrap(), 2);

        store
            .upsert_node_role(&NodeRole {
                node_id: "beta".to_string(),
                role: Role::Client,
                active: true,
                group_id: Some(4),
            })
            .await
            .unwrap();

        assert_eq!(store.count_active_servers().await.unwrap(), 1);
        let beta = store.node_role("beta").await.unwrap().unwrap();
        assert_eq!(beta.role, Role::Client);
        assert_eq!(beta.group_id, Some(4));
    }
}
