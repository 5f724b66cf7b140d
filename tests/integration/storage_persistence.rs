//! State that must survive a restart of the server

use chrono::{DateTime, TimeZone, Utc};
use pageprobe::{
    config::StorageConfig,
    model::{AlertKind, MetricName, NewAlertRule, NodeRole, Role},
    storage,
};

use super::helpers::load_sample;

fn config(dir: &tempfile::TempDir) -> StorageConfig {
    StorageConfig::Sqlite {
        path: dir.path().join("pageprobe.db"),
    }
}

#[tokio::test]
async fn test_targets_rules_and_samples_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let checked = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();

    let (target_id, rule_id) = {
        let store = storage::open(&config(&dir)).await.unwrap();
        let target = store.follow_url("https://example.com/").await.unwrap();
        store.follow_url("https://example.com/").await.unwrap();
        store.mark_checked(target.id, checked).await.unwrap();

        let rule = store
            .add_rule(NewAlertRule {
                owner: 9,
                url_id: target.id,
                metric: Some(MetricName::Fcp),
                kind: AlertKind::HardCap,
                threshold: Some(2.5),
                destination: "ops@example.com".to_string(),
            })
            .await
            .unwrap();

        store
            .insert_samples(vec![load_sample("https://example.com/", 1.25, checked)])
            .await
            .unwrap();
        store
            .upsert_node_role(&NodeRole {
                node_id: "probe-1".to_string(),
                role: Role::Client,
                active: true,
                group_id: Some(3),
            })
            .await
            .unwrap();

        store.close().await.unwrap();
        (target.id, rule.id)
    };

    let store = storage::open(&config(&dir)).await.unwrap();

    let target = store.get_target(target_id).await.unwrap().unwrap();
    assert_eq!(target.reference_count, 2);
    assert_eq!(target.last_checked, checked);

    let rules = store.list_rules(Some(9)).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, rule_id);
    assert_eq!(rules[0].metric, Some(MetricName::Fcp));

    let samples = store
        .recent_samples("https://example.com/", DateTime::UNIX_EPOCH)
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].load_time, Some(1.25));

    let role = store.node_role("probe-1").await.unwrap().unwrap();
    assert_eq!(role.group_id, Some(3));

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_unfollow_drops_only_the_owners_rules() {
    let dir = tempfile::tempdir().unwrap();
    let store = storage::open(&config(&dir)).await.unwrap();

    let target = store.follow_url("https://example.org/").await.unwrap();
    store.follow_url("https://example.org/").await.unwrap();

    for owner in [1, 2] {
        store
            .add_rule(NewAlertRule {
                owner,
                url_id: target.id,
                metric: None,
                kind: AlertKind::OnDown,
                threshold: None,
                destination: format!("owner{owner}@example.com"),
            })
            .await
            .unwrap();
    }

    let after = store.unfollow_url(1, target.id).await.unwrap().unwrap();
    assert_eq!(after.reference_count, 1);
    assert!(after.is_eligible());

    let remaining = store.list_rules(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].owner, 2);

    let last = store.unfollow_url(2, target.id).await.unwrap().unwrap();
    assert_eq!(last.reference_count, 0);
    let now = Utc::now();
    assert_eq!(store.claim_next_target(now, now).await.unwrap(), None);

    // the count stays at zero
    let again = store.unfollow_url(2, target.id).await.unwrap().unwrap();
    assert_eq!(again.reference_count, 0);

    store.close().await.unwrap();
}
