//! Notifier sweeps over a populated store

use std::sync::Arc;

use chrono::{Duration, Utc};
use pageprobe::{
    config::NotifierSettings,
    model::{AlertKind, BrowserProfile, MeasurementSample, MetricName},
    notifier::{NotificationEngine, SweepReport},
    storage::Store,
};
use pretty_assertions::assert_eq;

use super::helpers::{RecordingMailer, add_rule, load_sample, memory_store};

const URL: &str = "https://example.com/";

fn engine(store: &Arc<dyn Store>, mailer: &Arc<RecordingMailer>) -> NotificationEngine {
    NotificationEngine::new(store.clone(), mailer.clone(), &NotifierSettings::default())
}

#[tokio::test]
async fn test_hard_cap_fires_once_within_debounce() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    let rule = add_rule(&store, target.id, AlertKind::HardCap, Some(MetricName::LoadTime), Some(5.0)).await;

    let now = Utc::now();
    store
        .insert_samples(vec![load_sample(URL, 7.2, now - Duration::minutes(1))])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let engine = engine(&store, &mailer);

    let report = engine.sweep(now).await.unwrap();
    assert_eq!(report.sent, 1);

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].rule_id, rule.id);
    assert_eq!(sent[0].value, Some(7.2));
    assert_eq!(sent[0].threshold, Some(5.0));
    assert_eq!(sent[0].destination, "ops@example.com");

    // five minutes later the rule is still debounced
    let later = engine.sweep(now + Duration::minutes(5)).await.unwrap();
    assert_eq!(later.debounced, 1);
    assert_eq!(mailer.sent().len(), 1);

    let rules = store.list_rules(None).await.unwrap();
    assert_eq!(rules[0].last_notified.map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));
}

#[tokio::test]
async fn test_hard_cap_at_threshold_stays_quiet() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    add_rule(&store, target.id, AlertKind::HardCap, Some(MetricName::LoadTime), Some(5.0)).await;

    let now = Utc::now();
    store
        .insert_samples(vec![load_sample(URL, 5.0, now - Duration::minutes(1))])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let report = engine(&store, &mailer).sweep(now).await.unwrap();

    assert_eq!(report.evaluated, 1);
    assert_eq!(report.sent, 0);
    assert!(mailer.sent().is_empty());
}

#[tokio::test]
async fn test_percent_cap_against_trailing_average() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    add_rule(&store, target.id, AlertKind::PercentCap, Some(MetricName::LoadTime), Some(15.0)).await;

    let now = Utc::now();
    store
        .insert_samples(vec![
            load_sample(URL, 10.0, now - Duration::days(2)),
            load_sample(URL, 10.0, now - Duration::days(1)),
            load_sample(URL, 13.0, now - Duration::minutes(1)),
        ])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let report = engine(&store, &mailer).sweep(now).await.unwrap();

    // average 11.0, latest 13.0: about 18% above
    assert_eq!(report.sent, 1);
    let rules = store.list_rules(None).await.unwrap();
    assert_eq!(rules[0].last_value, Some(13.0));
}

#[tokio::test]
async fn test_percent_cap_skips_zero_average() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    add_rule(&store, target.id, AlertKind::PercentCap, Some(MetricName::LoadTime), Some(10.0)).await;

    let now = Utc::now();
    store
        .insert_samples(vec![
            load_sample(URL, 0.0, now - Duration::days(1)),
            load_sample(URL, 0.0, now - Duration::minutes(1)),
        ])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let report = engine(&store, &mailer).sweep(now).await.unwrap();

    assert_eq!(report.sent, 0);
    assert!(mailer.sent().is_empty());
    let rules = store.list_rules(None).await.unwrap();
    assert_eq!(rules[0].last_value, None);
}

#[tokio::test]
async fn test_down_and_broken_link_rules() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    add_rule(&store, target.id, AlertKind::OnDown, None, None).await;
    add_rule(&store, target.id, AlertKind::OnBrokenLink, None, None).await;

    let now = Utc::now();
    let mut down = MeasurementSample::down(URL, BrowserProfile::Edge, now - Duration::minutes(1));
    down.broken_links = vec!["https://example.com/missing".to_string()];
    store.insert_samples(vec![down]).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let report = engine(&store, &mailer).sweep(now).await.unwrap();
    assert_eq!(report.sent, 2);

    let sent = mailer.sent();
    let broken = sent
        .iter()
        .find(|alert| alert.kind == AlertKind::OnBrokenLink)
        .unwrap();
    assert_eq!(broken.broken_links, vec!["https://example.com/missing".to_string()]);
    assert!(sent.iter().any(|alert| alert.kind == AlertKind::OnDown));
}

#[tokio::test]
async fn test_stale_samples_are_ignored() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    add_rule(&store, target.id, AlertKind::HardCap, Some(MetricName::LoadTime), Some(1.0)).await;

    let now = Utc::now();
    store
        .insert_samples(vec![load_sample(URL, 9.0, now - Duration::hours(1))])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let report = engine(&store, &mailer).sweep(now).await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            without_data: 1,
            ..SweepReport::default()
        }
    );
}

#[tokio::test]
async fn test_inactive_rules_are_not_evaluated() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    let rule = add_rule(&store, target.id, AlertKind::OnDown, None, None).await;
    store.set_rule_active(rule.id, false).await.unwrap();

    let now = Utc::now();
    store
        .insert_samples(vec![MeasurementSample::down(URL, BrowserProfile::Chrome, now)])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let report = engine(&store, &mailer).sweep(now).await.unwrap();

    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn test_undelivered_alert_is_retried() {
    let store = memory_store();
    let target = store.follow_url(URL).await.unwrap();
    add_rule(&store, target.id, AlertKind::OnDown, None, None).await;

    let now = Utc::now();
    store
        .insert_samples(vec![MeasurementSample::down(URL, BrowserProfile::Opera, now)])
        .await
        .unwrap();

    let failing = Arc::new(RecordingMailer::rejecting());
    let report = engine(&store, &failing).sweep(now).await.unwrap();
    assert_eq!(report.failed, 1);

    let rules = store.list_rules(None).await.unwrap();
    assert_eq!(rules[0].last_notified, None);

    // the next sweep is not debounced
    let working = Arc::new(RecordingMailer::default());
    let retry = engine(&store, &working).sweep(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(retry.sent, 1);
}
