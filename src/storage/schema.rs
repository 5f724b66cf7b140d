//! Column mapping between the SQLite tables and the core records
//!
//! Timestamps are stored as Unix milliseconds. List-valued sample fields
//! (`broken_links`, `failed_metrics`) are stored as JSON arrays so a sample
//! reads back exactly as it was written.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::error::{StorageError, StorageResult};
use crate::model::{
    AlertKind, AlertRule, BrowserProfile, MeasurementSample, MetricName, NodeRole, Role, UrlTarget,
};

pub const TARGET_COLUMNS: &str = "id, url, last_checked, reference_count, force_inactive";

pub const SAMPLE_COLUMNS: &str = "url, load_time, memory_usage, cpu_time, dom_nodes, \
     total_page_size, fcp, network_requests, script_size, broken_links, browser_id, is_up, \
     group_id, failed_metrics, timestamp";

pub const RULE_COLUMNS: &str =
    "id, owner, url_id, metric, kind, threshold, last_value, last_notified, destination, active";

pub fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn encode_list<T: serde::Serialize>(values: &[T]) -> StorageResult<String> {
    serde_json::to_string(values)
        .map_err(|e| StorageError::SerializationError(format!("failed to encode list: {}", e)))
}

fn decode_list<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> StorageResult<Vec<T>> {
    serde_json::from_str(raw)
        .map_err(|e| StorageError::SerializationError(format!("{column}: {e}")))
}

fn parse_column<T>(column: &str, raw: &str) -> StorageResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e: String| StorageError::SerializationError(format!("{column}: {e}")))
}

pub fn target_from_row(row: &SqliteRow) -> StorageResult<UrlTarget> {
    Ok(UrlTarget {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        last_checked: millis_to_timestamp(row.try_get("last_checked")?),
        reference_count: row.try_get("reference_count")?,
        force_inactive: row.try_get("force_inactive")?,
    })
}

pub fn sample_from_row(row: &SqliteRow) -> StorageResult<MeasurementSample> {
    let browser_id: i64 = row.try_get("browser_id")?;
    let browser_id = u8::try_from(browser_id)
        .map_err(|e| e.to_string())
        .and_then(BrowserProfile::try_from)
        .map_err(|e| StorageError::SerializationError(format!("browser_id: {e}")))?;

    let broken_links: String = row.try_get("broken_links")?;
    let failed_metrics: String = row.try_get("failed_metrics")?;

    Ok(MeasurementSample {
        url: row.try_get("url")?,
        load_time: row.try_get("load_time")?,
        memory_usage: row.try_get("memory_usage")?,
        cpu_time: row.try_get("cpu_time")?,
        dom_nodes: row.try_get("dom_nodes")?,
        total_page_size: row.try_get("total_page_size")?,
        fcp: row.try_get("fcp")?,
        network_requests: row.try_get("network_requests")?,
        script_size: row.try_get("script_size")?,
        broken_links: decode_list("broken_links", &broken_links)?,
        browser_id,
        is_up: row.try_get("is_up")?,
        group_id: row.try_get("group_id")?,
        failed_metrics: decode_list::<MetricName>("failed_metrics", &failed_metrics)?,
        timestamp: millis_to_timestamp(row.try_get("timestamp")?),
    })
}

pub fn rule_from_row(row: &SqliteRow) -> StorageResult<AlertRule> {
    let metric: Option<String> = row.try_get("metric")?;
    let kind: String = row.try_get("kind")?;
    let last_notified: Option<i64> = row.try_get("last_notified")?;

    Ok(AlertRule {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        url_id: row.try_get("url_id")?,
        metric: metric
            .map(|m| parse_column::<MetricName>("metric", &m))
            .transpose()?,
        kind: parse_column::<AlertKind>("kind", &kind)?,
        threshold: row.try_get("threshold")?,
        last_value: row.try_get("last_value")?,
        last_notified: last_notified.map(millis_to_timestamp),
        destination: row.try_get("destination")?,
        active: row.try_get("active")?,
    })
}

pub fn node_role_from_row(row: &SqliteRow) -> StorageResult<NodeRole> {
    let role: String = row.try_get("role")?;

    Ok(NodeRole {
        node_id: row.try_get("node_id")?,
        role: parse_column::<Role>("role", &role)?,
        active: row.try_get("active")?,
        group_id: row.try_get("group_id")?,
    })
}
