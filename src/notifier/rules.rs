//! Pure rule evaluation
//!
//! Nothing here touches the store; the engine fetches the inputs and
//! applies the outcome.

use chrono::{DateTime, Duration, Utc};

use crate::model::{AlertKind, AlertRule, MeasurementSample, MetricName};

/// What to send when a rule fires
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub rule_id: i64,
    pub kind: AlertKind,
    pub url: String,
    pub destination: String,
    pub metric: Option<MetricName>,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub broken_links: Vec<String>,
}

/// Result of evaluating one rule against the newest sample
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    pub alert: Option<Alert>,

    /// Value to cache in the rule's `last_value`
    pub last_value: Option<f64>,
}

pub fn is_debounced(rule: &AlertRule, now: DateTime<Utc>, window: Duration) -> bool {
    rule.last_notified
        .is_some_and(|notified| now.signed_duration_since(notified) < window)
}

/// Percent change of `latest` over `average`; `None` for a zero average
pub fn percent_change(latest: f64, average: f64) -> Option<f64> {
    if average == 0.0 {
        return None;
    }
    Some((latest - average) / average * 100.0)
}

/// Evaluate `rule` against `latest`
///
/// `average` is the trailing baseline of the rule's metric and is only
/// consulted by percent rules.
pub fn evaluate(
    rule: &AlertRule,
    url: &str,
    latest: &MeasurementSample,
    average: Option<f64>,
) -> Evaluation {
    let value = rule.metric.and_then(|metric| latest.metric(metric));

    let (triggered, last_value) = match rule.kind {
        AlertKind::HardCap => match (value, rule.threshold) {
            (Some(value), Some(threshold)) => (value > threshold, None),
            _ => (false, None),
        },
        AlertKind::PercentCap => {
            let change = value.zip(average).and_then(|(v, avg)| percent_change(v, avg));
            match (change, rule.threshold) {
                (Some(change), Some(threshold)) => (change >= threshold, value),
                _ => (false, None),
            }
        }
        AlertKind::OnDown => (!latest.is_up, None),
        AlertKind::OnBrokenLink => (!latest.broken_links.is_empty(), None),
    };

    let alert = triggered.then(|| Alert {
        rule_id: rule.id,
        kind: rule.kind,
        url: url.to_string(),
        destination: rule.destination.clone(),
        metric: rule.metric,
        value,
        threshold: rule.threshold,
        broken_links: latest.broken_links.clone(),
    });

    Evaluation { alert, last_value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BrowserProfile;

    fn rule(kind: AlertKind, metric: Option<MetricName>, threshold: Option<f64>) -> AlertRule {
        AlertRule {
            id: 1,
            owner: 1,
            url_id: 1,
            metric,
            kind,
            threshold,
            last_value: None,
            last_notified: None,
            destination: "ops@example.com".to_string(),
            active: true,
        }
    }

    fn latest(load_time: Option<f64>) -> MeasurementSample {
        let mut sample = MeasurementSample::new("https://example.com", BrowserProfile::Chrome, Utc::now());
        sample.load_time = load_time;
        sample
    }

    #[test]
    fn test_hard_cap_is_strictly_greater() {
        let cap = rule(AlertKind::HardCap, Some(MetricName::LoadTime), Some(5.0));

        assert!(evaluate(&cap, "u", &latest(Some(7.2)), None).alert.is_some());
        assert!(evaluate(&cap, "u", &latest(Some(5.0)), None).alert.is_none());
        assert!(evaluate(&cap, "u", &latest(None), None).alert.is_none());
    }

    #[test]
    fn test_percent_cap_compares_with_average() {
        let cap = rule(AlertKind::PercentCap, Some(MetricName::LoadTime), Some(20.0));

        let fired = evaluate(&cap, "u", &latest(Some(13.0)), Some(10.0));
        assert_eq!(fired.alert.as_ref().and_then(|a| a.value), Some(13.0));
        assert_eq!(fired.last_value, Some(13.0));

        let quiet = evaluate(&cap, "u", &latest(Some(11.0)), Some(10.0));
        assert!(quiet.alert.is_none());
        assert_eq!(quiet.last_value, Some(11.0));
    }

    #[test]
    fn test_percent_cap_skips_zero_average() {
        let cap = rule(AlertKind::PercentCap, Some(MetricName::LoadTime), Some(20.0));

        assert_eq!(
            evaluate(&cap, "u", &latest(Some(13.0)), Some(0.0)),
            Evaluation::default()
        );
        assert_eq!(evaluate(&cap, "u", &latest(Some(13.0)), None), Evaluation::default());
    }

    #[test]
    fn test_on_down_ignores_metrics() {
        let down = rule(AlertKind::OnDown, None, None);
        let sample = MeasurementSample::down("https://example.com", BrowserProfile::Edge, Utc::now());

        let alert = evaluate(&down, "https://example.com", &sample, None).alert.unwrap();
        assert_eq!(alert.kind, AlertKind::OnDown);
        assert!(evaluate(&down, "u", &latest(Some(99.0)), None).alert.is_none());
    }

    #[test]
    fn test_on_broken_link() {
        let broken = rule(AlertKind::OnBrokenLink, None, None);
        let mut sample = latest(None);
        assert!(evaluate(&broken, "u", &sample, None).alert.is_none());

        sample.broken_links = vec!["https://example.com/404".to_string()];
        let alert = evaluate(&broken, "u", &sample, None).alert.unwrap();
        assert_eq!(alert.broken_links.len(), 1);
    }

    #[test]
    fn test_debounce_window() {
        let now = Utc::now();
        let mut cap = rule(AlertKind::OnDown, None, None);
        let window = Duration::minutes(15);

        assert!(!is_debounced(&cap, now, window));

        cap.last_notified = Some(now - Duration::minutes(5));
        assert!(is_debounced(&cap, now, window));

        cap.last_notified = Some(now - Duration::minutes(15));
        assert!(!is_debounced(&cap, now, window));
    }
}
