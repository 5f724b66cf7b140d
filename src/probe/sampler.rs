//! One sampling pass of one URL in one browser
//!
//! Navigation comes first; if it fails the pass yields a down sample and
//! nothing else is collected. Every metric after that is collected on its
//! own: a failure leaves the field absent and records the metric name in
//! `failed_metrics`.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::driver::{DriverError, MeasurementDriver, PerfEvent};
use super::links::{LinkChecker, candidate_links};
use crate::config::ProbeSettings;
use crate::model::{BrowserProfile, MeasurementSample, MetricName};

const MIB: f64 = 1024.0 * 1024.0;

const FCP_POLL_ATTEMPTS: usize = 20;
const FCP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) const LOAD_TIME_SCRIPT: &str = "const t = window.performance.timing; \
     return t.loadEventEnd - t.navigationStart;";

pub(crate) const DOM_NODES_SCRIPT: &str = "return document.getElementsByTagName('*').length;";

pub(crate) const FCP_SCRIPT: &str = "if (window.fcpTime != null) return window.fcpTime; \
     const e = performance.getEntriesByType('paint').find(p => p.name === 'first-contentful-paint'); \
     return e ? e.startTime : null;";

pub(crate) const SCRIPTS_SCRIPT: &str = "return Array.from(document.scripts).map(s => \
     s.src ? { src: s.src } : { inline: (s.innerText || '').length });";

pub(crate) const ANCHORS_SCRIPT: &str = "return Array.from(document.getElementsByTagName('a')) \
     .map(a => a.getAttribute('href')).filter(h => h);";

const FCP_OBSERVER: &str = r#"
window.fcpTime = null;
try {
    const observer = new PerformanceObserver((list) => {
        for (const entry of list.getEntries()) {
            if (entry.name === 'first-contentful-paint') {
                window.fcpTime = entry.startTime;
                observer.disconnect();
            }
        }
    });
    observer.observe({ type: 'paint', buffered: true });
} catch (e) {}
"#;

pub struct Sampler {
    profile: BrowserProfile,
    links: LinkChecker,
    http: Client,
}

impl Sampler {
    pub fn new(profile: BrowserProfile, settings: &ProbeSettings) -> reqwest::Result<Self> {
        Ok(Self {
            profile,
            links: LinkChecker::new(settings.link_concurrency, settings.fetch_timeout())?,
            http: Client::builder().timeout(settings.fetch_timeout()).build()?,
        })
    }

    #[instrument(skip(self, driver), fields(profile = %self.profile))]
    pub async fn sample_pass(&self, driver: &mut dyn MeasurementDriver, url: &str) -> MeasurementSample {
        self.prepare(driver).await;

        let started = Utc::now();
        if let Err(e) = driver.navigate(url).await {
            warn!("navigation failed: {e}");
            return MeasurementSample::down(url, self.profile, started);
        }

        let mut sample = MeasurementSample::new(url, self.profile, started);
        let mut failed = Vec::new();

        sample.load_time = settle(MetricName::LoadTime, load_time(driver).await, &mut failed);

        let metrics = driver.performance_metrics().await;
        sample.memory_usage = settle(
            MetricName::MemoryUsage,
            devtools_metric(&metrics, "JSHeapUsedSize").map(|v| v.map(|bytes| bytes / MIB)),
            &mut failed,
        );
        sample.cpu_time = settle(
            MetricName::CpuTime,
            devtools_metric(&metrics, "TaskDuration"),
            &mut failed,
        );

        sample.dom_nodes = settle(MetricName::DomNodes, dom_nodes(driver).await, &mut failed);

        // read once, the log is drained by the driver
        let log = driver.performance_log().await.map_err(|e| e.to_string());
        sample.total_page_size = settle(
            MetricName::TotalPageSize,
            log.as_ref().map(|events| Some(page_size(events))),
            &mut failed,
        );
        sample.network_requests = settle(
            MetricName::NetworkRequests,
            log.as_ref().map(|events| Some(response_count(events))),
            &mut failed,
        );

        sample.fcp = settle(MetricName::Fcp, self.fcp(driver).await, &mut failed);
        sample.script_size = settle(
            MetricName::ScriptSize,
            self.script_size(driver).await,
            &mut failed,
        );

        match self.broken_links(driver).await {
            Ok(broken) => sample.broken_links = broken,
            Err(e) => {
                warn!("failed to collect broken_links: {e}");
                failed.push(MetricName::BrokenLinks);
            }
        }

        if !failed.is_empty() {
            debug!("pass finished with failed metrics: {failed:?}");
        }
        sample.failed_metrics = failed;
        sample
    }

    /// DevTools setup; a browser without it still gets sampled
    async fn prepare(&self, driver: &mut dyn MeasurementDriver) {
        let commands = [
            ("Performance.disable", json!({})),
            ("Performance.setTimeDomain", json!({ "timeDomain": "threadTicks" })),
            ("Performance.enable", json!({})),
            ("Network.enable", json!({})),
            (
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": FCP_OBSERVER }),
            ),
        ];

        for (command, params) in commands {
            if let Err(e) = driver.execute_cdp(command, params).await {
                debug!("{command} failed: {e}");
            }
        }
    }

    async fn fcp(&self, driver: &mut dyn MeasurementDriver) -> Result<Option<f64>, DriverError> {
        if self.profile == BrowserProfile::Opera {
            return Ok(None);
        }

        let mut last_error = None;
        for attempt in 0..FCP_POLL_ATTEMPTS {
            match driver.execute_script(FCP_SCRIPT).await {
                Ok(value) => {
                    if let Some(start) = value.as_f64() {
                        return Ok(Some(start / 1000.0));
                    }
                    last_error = None;
                }
                Err(e) => last_error = Some(e),
            }
            if attempt + 1 < FCP_POLL_ATTEMPTS {
                tokio::time::sleep(FCP_POLL_INTERVAL).await;
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn script_size(&self, driver: &mut dyn MeasurementDriver) -> Result<Option<f64>, DriverError> {
        let scripts = driver.execute_script(SCRIPTS_SCRIPT).await?;
        let scripts = scripts
            .as_array()
            .ok_or_else(|| DriverError::Decode(format!("script list expected, got {scripts}")))?;

        let mut total = 0u64;
        for script in scripts {
            if let Some(src) = script.get("src").and_then(Value::as_str) {
                match self.fetch_len(src).await {
                    Ok(len) => total += len,
                    Err(e) => debug!("skipping script {src}: {e}"),
                }
            } else if let Some(len) = script.get("inline").and_then(Value::as_u64) {
                total += len;
            }
        }

        Ok(Some(total as f64 / MIB))
    }

    async fn fetch_len(&self, src: &str) -> reqwest::Result<u64> {
        let body = self.http.get(src).send().await?.bytes().await?;
        Ok(body.len() as u64)
    }

    async fn broken_links(&self, driver: &mut dyn MeasurementDriver) -> Result<Vec<String>, DriverError> {
        let hrefs = driver.execute_script(ANCHORS_SCRIPT).await?;
        let hrefs: Vec<String> = serde_json::from_value(hrefs)
            .map_err(|e| DriverError::Decode(format!("anchor list: {e}")))?;
        let page = driver.current_url().await?;

        Ok(self.links.broken_links(candidate_links(&page, &hrefs)).await)
    }
}

/// Unwrap one metric result, recording a failure
fn settle<T, E: Display>(
    metric: MetricName,
    result: Result<Option<T>, E>,
    failed: &mut Vec<MetricName>,
) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("failed to collect {metric}: {e}");
            failed.push(metric);
            None
        }
    }
}

async fn load_time(driver: &mut dyn MeasurementDriver) -> Result<Option<f64>, DriverError> {
    let value = driver.execute_script(LOAD_TIME_SCRIPT).await?;
    value
        .as_f64()
        .map(|millis| Some(millis / 1000.0))
        .ok_or_else(|| DriverError::Decode(format!("load time is not a number: {value}")))
}

async fn dom_nodes(driver: &mut dyn MeasurementDriver) -> Result<Option<i64>, DriverError> {
    let value = driver.execute_script(DOM_NODES_SCRIPT).await?;
    value
        .as_i64()
        .map(Some)
        .ok_or_else(|| DriverError::Decode(format!("node count is not an integer: {value}")))
}

fn devtools_metric(
    metrics: &Result<HashMap<String, f64>, DriverError>,
    name: &str,
) -> Result<Option<f64>, String> {
    match metrics {
        Ok(metrics) => Ok(metrics.get(name).copied()),
        Err(e) => Err(e.to_string()),
    }
}

fn page_size(events: &[PerfEvent]) -> f64 {
    let bytes: f64 = events
        .iter()
        .filter(|event| event.method == "Network.loadingFinished")
        .filter_map(|event| event.params.get("encodedDataLength").and_then(Value::as_f64))
        .sum();
    bytes / MIB
}

fn response_count(events: &[PerfEvent]) -> i64 {
    events
        .iter()
        .filter(|event| event.method == "Network.responseReceived")
        .count() as i64
}
