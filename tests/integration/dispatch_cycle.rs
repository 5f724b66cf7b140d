//! Probe and server talking over real sockets

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use pageprobe::{
    broker::ConnectionBroker,
    model::BrowserProfile,
    probe::{self, WorkerPool},
    storage::Store,
};
use tokio_util::sync::CancellationToken;

use super::helpers::{FakeUnit, loopback_settings, memory_store};

fn fleet(passes: usize) -> WorkerPool {
    WorkerPool::start(
        BrowserProfile::ALL
            .into_iter()
            .map(|profile| FakeUnit::boxed(profile, passes))
            .collect(),
    )
}

async fn wait_for_samples(store: &Arc<dyn Store>, url: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let samples = store.recent_samples(url, DateTime::UNIX_EPOCH).await.unwrap();
        if !samples.is_empty() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "no samples for {url}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_probe_is_released_when_nothing_is_followed() {
    let store = memory_store();
    let broker = ConnectionBroker::bind(&loopback_settings(), store.clone())
        .await
        .unwrap();
    let port = broker.local_addr().unwrap().port();

    let cancel = CancellationToken::new();
    let server = tokio::spawn(broker.run(cancel.clone()));

    let pool = fleet(2);
    let session = probe::connect("127.0.0.1", port).await.unwrap();
    let summary = probe::run_session(session, &pool, None).await.unwrap();
    assert_eq!(summary.assignments, 0);
    assert_eq!(summary.samples, 0);

    pool.shutdown().await;
    cancel.cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn test_samples_from_every_profile_are_persisted() {
    let store = memory_store();
    let first = store.follow_url("https://example.com/").await.unwrap();
    let second = store.follow_url("https://example.org/").await.unwrap();

    let broker = ConnectionBroker::bind(&loopback_settings(), store.clone())
        .await
        .unwrap();
    let port = broker.local_addr().unwrap().port();

    let cancel = CancellationToken::new();
    let server = tokio::spawn(broker.run(cancel.clone()));

    let probe = tokio::spawn(async move {
        let pool = fleet(2);
        let session = probe::connect("127.0.0.1", port).await.unwrap();
        let summary = probe::run_session(session, &pool, Some(4)).await.unwrap();
        pool.shutdown().await;
        summary
    });

    // both targets get their turn before the session is stopped
    wait_for_samples(&store, &first.url).await;
    wait_for_samples(&store, &second.url).await;
    cancel.cancel();

    let summary = probe.await.unwrap();
    server.await.unwrap();

    assert!(summary.assignments >= 2);
    assert_eq!(summary.samples, summary.assignments * BrowserProfile::ALL.len() * 2);

    let mut persisted = 0;
    for target in [&first, &second] {
        let samples = store
            .recent_samples(&target.url, DateTime::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(samples.len() % 6, 0);
        for profile in BrowserProfile::ALL {
            assert!(samples.iter().any(|s| s.browser_id == profile));
        }
        assert!(samples.iter().all(|s| s.group_id == Some(4)));
        persisted += samples.len();

        let checked = store.get_target(target.id).await.unwrap().unwrap();
        assert!(checked.last_checked > DateTime::UNIX_EPOCH);
    }
    assert_eq!(persisted, summary.samples);
}

#[tokio::test]
async fn test_deactivated_target_is_never_assigned() {
    let store = memory_store();
    let active = store.follow_url("https://example.com/").await.unwrap();
    let paused = store.follow_url("https://example.net/").await.unwrap();
    store.set_force_inactive(paused.id, true).await.unwrap();

    let broker = ConnectionBroker::bind(&loopback_settings(), store.clone())
        .await
        .unwrap();
    let port = broker.local_addr().unwrap().port();

    let cancel = CancellationToken::new();
    let server = tokio::spawn(broker.run(cancel.clone()));

    let probe = tokio::spawn(async move {
        let pool = fleet(1);
        let session = probe::connect("127.0.0.1", port).await.unwrap();
        let summary = probe::run_session(session, &pool, None).await.unwrap();
        pool.shutdown().await;
        summary
    });

    wait_for_samples(&store, &active.url).await;
    cancel.cancel();
    probe.await.unwrap();
    server.await.unwrap();

    let skipped = store
        .recent_samples(&paused.url, DateTime::UNIX_EPOCH)
        .await
        .unwrap();
    assert!(skipped.is_empty());
}

#[tokio::test]
async fn test_two_probes_share_one_server() {
    let store = memory_store();
    let target = store.follow_url("https://example.com/").await.unwrap();

    let broker = ConnectionBroker::bind(&loopback_settings(), store.clone())
        .await
        .unwrap();
    let port = broker.local_addr().unwrap().port();

    let cancel = CancellationToken::new();
    let server = tokio::spawn(broker.run(cancel.clone()));

    let probes: Vec<_> = [1, 2]
        .into_iter()
        .map(|group| {
            tokio::spawn(async move {
                let pool = fleet(1);
                let session = probe::connect("127.0.0.1", port).await.unwrap();
                let summary = probe::run_session(session, &pool, Some(group)).await.unwrap();
                pool.shutdown().await;
                summary
            })
        })
        .collect();

    wait_for_samples(&store, &target.url).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let mut total = 0;
    for probe in probes {
        total += probe.await.unwrap().samples;
    }
    server.await.unwrap();

    let samples = store
        .recent_samples(&target.url, DateTime::UNIX_EPOCH)
        .await
        .unwrap();
    assert_eq!(samples.len(), total);
}
