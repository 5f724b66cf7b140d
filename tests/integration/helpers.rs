//! Shared fixtures for the integration tests

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pageprobe::{
    config::ServerSettings,
    model::{AlertKind, AlertRule, BrowserProfile, MeasurementSample, MetricName, NewAlertRule},
    notifier::{Alert, MailError, Mailer},
    probe::{MeasurementUnit, UnitError},
    storage::{MemoryStore, Store},
};

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

/// Loopback listener on an ephemeral port that notices shutdown quickly
pub fn loopback_settings() -> ServerSettings {
    ServerSettings {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        handshake_port: 0,
        accept_poll_ms: 50,
        session_accept_timeout: 5,
        claim_lease: 60,
        claim_retry_ms: 20,
    }
}

/// A sample with only `load_time` filled in
pub fn load_sample(url: &str, load_time: f64, at: DateTime<Utc>) -> MeasurementSample {
    let mut sample = MeasurementSample::new(url, BrowserProfile::Chrome, at);
    sample.load_time = Some(load_time);
    sample
}

pub async fn add_rule(
    store: &Arc<dyn Store>,
    url_id: i64,
    kind: AlertKind,
    metric: Option<MetricName>,
    threshold: Option<f64>,
) -> AlertRule {
    store
        .add_rule(NewAlertRule {
            owner: 1,
            url_id,
            metric,
            kind,
            threshold,
            destination: "ops@example.com".to_string(),
        })
        .await
        .unwrap()
}

/// Unit that answers every URL with `passes` samples after a short delay
pub struct FakeUnit {
    pub profile: BrowserProfile,
    pub passes: usize,
    pub delay: Duration,
}

impl FakeUnit {
    pub fn boxed(profile: BrowserProfile, passes: usize) -> Box<dyn MeasurementUnit> {
        Box::new(Self {
            profile,
            passes,
            delay: Duration::from_millis(10),
        })
    }
}

#[async_trait]
impl MeasurementUnit for FakeUnit {
    fn profile(&self) -> BrowserProfile {
        self.profile
    }

    async fn measure(&mut self, url: &str) -> Result<Vec<MeasurementSample>, UnitError> {
        tokio::time::sleep(self.delay).await;
        Ok((0..self.passes)
            .map(|pass| {
                let mut sample = MeasurementSample::new(url, self.profile, Utc::now());
                sample.load_time = Some(1.0 + pass as f64);
                sample
            })
            .collect())
    }

    async fn shutdown(self: Box<Self>) -> Result<(), UnitError> {
        Ok(())
    }
}

/// Mailer that keeps every alert instead of sending it
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Alert>>,
    pub reject: bool,
}

impl RecordingMailer {
    pub fn rejecting() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, alert: &Alert) -> Result<(), MailError> {
        if self.reject {
            return Err(MailError::Transport("relay refused connection".to_string()));
        }
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
