//! Core records shared by the server, the probes and the notifier
//!
//! Every optional measurement is modelled as `Option<_>`: `None` means the
//! value is absent. Whether it is absent because collection failed is a
//! separate fact recorded in [`MeasurementSample::failed_metrics`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A followed URL as tracked by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlTarget {
    pub id: i64,

    /// Canonical URL, unique across all targets
    pub url: String,

    /// When a probe last completed a full cycle for this URL
    pub last_checked: DateTime<Utc>,

    /// Number of followers; never negative
    pub reference_count: i64,

    /// Administrative switch that removes the target from dispatch
    pub force_inactive: bool,
}

impl UrlTarget {
    /// Eligible targets are the only ones handed to probes.
    pub fn is_eligible(&self) -> bool {
        self.reference_count > 0 && !self.force_inactive
    }
}

/// Browser identity used by one measurement unit
///
/// Travels over the wire as its numeric `browser_id` (1, 2 or 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u8")]
pub enum BrowserProfile {
    Chrome,
    Edge,
    Opera,
}

impl BrowserProfile {
    pub const ALL: [BrowserProfile; 3] = [
        BrowserProfile::Chrome,
        BrowserProfile::Edge,
        BrowserProfile::Opera,
    ];

    pub fn browser_id(self) -> u8 {
        match self {
            BrowserProfile::Chrome => 1,
            BrowserProfile::Edge => 2,
            BrowserProfile::Opera => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BrowserProfile::Chrome => "chrome",
            BrowserProfile::Edge => "edge",
            BrowserProfile::Opera => "opera",
        }
    }
}

impl From<BrowserProfile> for u8 {
    fn from(profile: BrowserProfile) -> Self {
        profile.browser_id()
    }
}

impl TryFrom<u8> for BrowserProfile {
    type Error = String;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(BrowserProfile::Chrome),
            2 => Ok(BrowserProfile::Edge),
            3 => Ok(BrowserProfile::Opera),
            other => Err(format!("unknown browser id {other}")),
        }
    }
}

impl FromStr for BrowserProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" | "1" => Ok(BrowserProfile::Chrome),
            "edge" | "microsoftedge" | "2" => Ok(BrowserProfile::Edge),
            "opera" | "3" => Ok(BrowserProfile::Opera),
            other => Err(format!("unknown browser profile '{other}'")),
        }
    }
}

impl fmt::Display for BrowserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Accepts the numeric id (wire format) or the profile name (config files).
impl<'de> Deserialize<'de> for BrowserProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Id(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Id(id) => BrowserProfile::try_from(id).map_err(serde::de::Error::custom),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Names of the collected metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    LoadTime,
    MemoryUsage,
    CpuTime,
    DomNodes,
    TotalPageSize,
    Fcp,
    NetworkRequests,
    ScriptSize,
    BrokenLinks,
}

impl MetricName {
    pub const ALL: [MetricName; 9] = [
        MetricName::LoadTime,
        MetricName::MemoryUsage,
        MetricName::CpuTime,
        MetricName::DomNodes,
        MetricName::TotalPageSize,
        MetricName::Fcp,
        MetricName::NetworkRequests,
        MetricName::ScriptSize,
        MetricName::BrokenLinks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::LoadTime => "load_time",
            MetricName::MemoryUsage => "memory_usage",
            MetricName::CpuTime => "cpu_time",
            MetricName::DomNodes => "dom_nodes",
            MetricName::TotalPageSize => "total_page_size",
            MetricName::Fcp => "fcp",
            MetricName::NetworkRequests => "network_requests",
            MetricName::ScriptSize => "script_size",
            MetricName::BrokenLinks => "broken_links",
        }
    }

    /// Column holding the numeric value, `None` for list-valued metrics
    pub fn numeric_column(self) -> Option<&'static str> {
        match self {
            MetricName::BrokenLinks => None,
            other => Some(other.as_str()),
        }
    }
}

impl FromStr for MetricName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| format!("unknown metric '{s}'"))
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sampling pass of one URL by one browser profile
///
/// Samples are append-only: created by a measurement unit, persisted by the
/// dispatcher and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub url: String,

    // === Numeric metrics (absent when not collected) ===
    /// Seconds from navigation start to the load event
    pub load_time: Option<f64>,
    /// Used JS heap (MiB)
    pub memory_usage: Option<f64>,
    /// Main thread task duration (seconds)
    pub cpu_time: Option<f64>,
    pub dom_nodes: Option<i64>,
    /// Encoded bytes transferred (MiB)
    pub total_page_size: Option<f64>,
    /// First contentful paint (seconds)
    pub fcp: Option<f64>,
    pub network_requests: Option<i64>,
    /// External plus inline script bytes (MiB)
    pub script_size: Option<f64>,

    #[serde(default)]
    pub broken_links: Vec<String>,

    pub browser_id: BrowserProfile,

    #[serde(with = "flag")]
    pub is_up: bool,

    #[serde(default)]
    pub group_id: Option<i64>,

    /// Metrics whose collection failed during this pass
    #[serde(default)]
    pub failed_metrics: Vec<MetricName>,

    pub timestamp: DateTime<Utc>,
}

impl MeasurementSample {
    /// A reachable sample with no metrics filled in yet
    pub fn new(url: impl Into<String>, profile: BrowserProfile, timestamp: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            load_time: None,
            memory_usage: None,
            cpu_time: None,
            dom_nodes: None,
            total_page_size: None,
            fcp: None,
            network_requests: None,
            script_size: None,
            broken_links: Vec::new(),
            browser_id: profile,
            is_up: true,
            group_id: None,
            failed_metrics: Vec::new(),
            timestamp,
        }
    }

    /// A sample for a URL that could not be navigated to
    pub fn down(url: impl Into<String>, profile: BrowserProfile, timestamp: DateTime<Utc>) -> Self {
        Self {
            is_up: false,
            ..Self::new(url, profile, timestamp)
        }
    }

    /// Numeric value of a metric, if present
    pub fn metric(&self, name: MetricName) -> Option<f64> {
        match name {
            MetricName::LoadTime => self.load_time,
            MetricName::MemoryUsage => self.memory_usage,
            MetricName::CpuTime => self.cpu_time,
            MetricName::DomNodes => self.dom_nodes.map(|v| v as f64),
            MetricName::TotalPageSize => self.total_page_size,
            MetricName::Fcp => self.fcp,
            MetricName::NetworkRequests => self.network_requests.map(|v| v as f64),
            MetricName::ScriptSize => self.script_size,
            MetricName::BrokenLinks => None,
        }
    }

    pub fn collection_failed(&self, name: MetricName) -> bool {
        self.failed_metrics.contains(&name)
    }
}

/// `is_up` travels as 0/1
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(serde::de::Error::custom(format!(
                "expected 0 or 1, got {other}"
            ))),
        }
    }
}

/// Condition an alert rule watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Latest value strictly above the threshold
    HardCap,
    /// Latest value at least `threshold` percent above the trailing average
    PercentCap,
    OnDown,
    OnBrokenLink,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::HardCap => "hard_cap",
            AlertKind::PercentCap => "percent_cap",
            AlertKind::OnDown => "on_down",
            AlertKind::OnBrokenLink => "on_broken_link",
        }
    }

    /// Cap rules compare a metric against a threshold
    pub fn needs_metric(self) -> bool {
        matches!(self, AlertKind::HardCap | AlertKind::PercentCap)
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard_cap" => Ok(AlertKind::HardCap),
            "percent_cap" => Ok(AlertKind::PercentCap),
            "on_down" => Ok(AlertKind::OnDown),
            "on_broken_link" => Ok(AlertKind::OnBrokenLink),
            other => Err(format!("unknown alert type '{other}'")),
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted alert rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub owner: i64,
    pub url_id: i64,
    pub metric: Option<MetricName>,
    pub kind: AlertKind,
    pub threshold: Option<f64>,

    /// Latest value seen by the notifier (percent rules)
    pub last_value: Option<f64>,

    /// When the last alert for this rule was delivered
    pub last_notified: Option<DateTime<Utc>>,

    /// Mail address alerts are sent to
    pub destination: String,
    pub active: bool,
}

/// Fields supplied when creating a rule
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlertRule {
    pub owner: i64,
    pub url_id: i64,
    pub metric: Option<MetricName>,
    pub kind: AlertKind,
    pub threshold: Option<f64>,
    pub destination: String,
}

impl NewAlertRule {
    /// Reject rules the notifier could never evaluate or deliver.
    pub fn validate(&self) -> Result<(), String> {
        if self.destination.trim().is_empty() {
            return Err("alert destination must not be empty".to_string());
        }

        if self.kind.needs_metric() {
            let Some(metric) = self.metric else {
                return Err(format!("{} rules need a metric", self.kind));
            };
            if metric.numeric_column().is_none() {
                return Err(format!("{} rules need a numeric metric, got {metric}", self.kind));
            }
            if self.threshold.is_none() {
                return Err(format!("{} rules need a threshold", self.kind));
            }
        }

        Ok(())
    }
}

/// Role a machine plays in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
    Notifier,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
            Role::Notifier => "notifier",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            "notifier" => Ok(Role::Notifier),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role registered for one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRole {
    pub node_id: String,
    pub role: Role,
    pub active: bool,
    pub group_id: Option<i64>,
}
