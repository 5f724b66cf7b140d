use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::mailer::Mailer;
use super::rules::{evaluate, is_debounced};
use crate::config::NotifierSettings;
use crate::model::{AlertKind, AlertRule};
use crate::storage::{StorageResult, Store};

/// Counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub debounced: usize,
    pub without_data: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Periodic evaluation of every active alert rule
///
/// Only reads samples and only writes `last_notified`/`last_value`, so it
/// runs alongside the dispatcher without coordination.
pub struct NotificationEngine {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    debounce: Duration,
    recency: Duration,
    baseline: Duration,
    interval: std::time::Duration,
}

impl NotificationEngine {
    pub fn new(store: Arc<dyn Store>, mailer: Arc<dyn Mailer>, settings: &NotifierSettings) -> Self {
        Self {
            store,
            mailer,
            debounce: Duration::seconds(settings.debounce as i64),
            recency: Duration::seconds(settings.recency as i64),
            baseline: Duration::days(settings.baseline_days),
            interval: settings.interval(),
        }
    }

    /// Sweep on every tick until `cancel` fires
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("notifier stopping");
                    break;
                }
                _ = ticker.tick() => match self.sweep(Utc::now()).await {
                    Ok(report) => debug!("sweep finished: {report:?}"),
                    Err(e) => error!("sweep failed: {e}"),
                },
            }
        }
    }

    /// Evaluate every active rule once as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> StorageResult<SweepReport> {
        let rules = self.store.active_rules().await?;
        let mut report = SweepReport::default();

        for rule in &rules {
            if let Err(e) = self.check_rule(rule, now, &mut report).await {
                warn!(rule = rule.id, "failed to evaluate rule: {e}");
            }
        }

        if report.sent > 0 || report.failed > 0 {
            info!(sent = report.sent, failed = report.failed, "alerts dispatched");
        }
        Ok(report)
    }

    async fn check_rule(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> StorageResult<()> {
        if is_debounced(rule, now, self.debounce) {
            report.debounced += 1;
            return Ok(());
        }

        let Some(target) = self.store.get_target(rule.url_id).await? else {
            report.without_data += 1;
            return Ok(());
        };

        let recent = self.store.recent_samples(&target.url, now - self.recency).await?;
        let Some(latest) = recent.first() else {
            report.without_data += 1;
            return Ok(());
        };

        let average = match (rule.kind, rule.metric) {
            (AlertKind::PercentCap, Some(metric)) => {
                self.store
                    .metric_average(&target.url, metric, now - self.baseline)
                    .await?
            }
            _ => None,
        };

        report.evaluated += 1;
        let evaluation = evaluate(rule, &target.url, latest, average);

        if let Some(alert) = evaluation.alert {
            match self.mailer.send(&alert).await {
                Ok(()) => {
                    self.store.record_notified(rule.id, now).await?;
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(rule = rule.id, "alert not delivered: {e}");
                    report.failed += 1;
                }
            }
        }

        if let Some(value) = evaluation.last_value {
            self.store.record_last_value(rule.id, value).await?;
        }

        Ok(())
    }
}
