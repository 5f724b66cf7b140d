use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::dispatcher::ClaimPolicy;
use crate::model::BrowserProfile;

/// Store configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory store (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database shared by every role on the host
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./pageprobe.db")
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub notifier: NotifierSettings,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Rendezvous port probes connect to first
    #[serde(default = "crate::util::get_handshake_port")]
    pub handshake_port: u16,

    /// How long one accept waits before the shutdown signal is checked again
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,

    /// How long a session port waits for the probe's second connection
    #[serde(default = "default_session_accept_timeout")]
    pub session_accept_timeout: u64,

    /// Seconds a session may hold a target before other sessions may take it
    #[serde(default = "default_claim_lease")]
    pub claim_lease: u64,

    /// How often a session without a free target looks again (milliseconds)
    #[serde(default = "default_claim_retry_ms")]
    pub claim_retry_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            handshake_port: crate::util::get_handshake_port(),
            accept_poll_ms: default_accept_poll_ms(),
            session_accept_timeout: default_session_accept_timeout(),
            claim_lease: default_claim_lease(),
            claim_retry_ms: default_claim_retry_ms(),
        }
    }
}

impl ServerSettings {
    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn session_accept_timeout(&self) -> Duration {
        Duration::from_secs(self.session_accept_timeout)
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            lease: Duration::from_secs(self.claim_lease),
            retry: Duration::from_millis(self.claim_retry_ms),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_accept_poll_ms() -> u64 {
    500
}

fn default_session_accept_timeout() -> u64 {
    30
}

fn default_claim_lease() -> u64 {
    600
}

fn default_claim_retry_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProbeSettings {
    /// Host running the server
    #[serde(default = "crate::util::get_server_ip")]
    pub server: String,

    #[serde(default = "crate::util::get_handshake_port")]
    pub handshake_port: u16,

    /// Sampling passes per unit and URL
    #[serde(default = "default_passes")]
    pub passes: u32,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Tag written into every sample, unless the node role carries one
    pub group_id: Option<i64>,

    #[serde(default = "default_units")]
    pub units: Vec<UnitConfig>,

    #[serde(default = "default_link_concurrency")]
    pub link_concurrency: usize,

    /// Timeout for link checks and external script downloads (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            server: crate::util::get_server_ip(),
            handshake_port: crate::util::get_handshake_port(),
            passes: default_passes(),
            lock_file: default_lock_file(),
            group_id: None,
            units: default_units(),
            link_concurrency: default_link_concurrency(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

impl ProbeSettings {
    pub fn unit(&self, profile: BrowserProfile) -> Option<&UnitConfig> {
        self.units.iter().find(|unit| unit.profile == profile)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

/// One measurement unit: a browser profile and the WebDriver serving it
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct UnitConfig {
    pub profile: BrowserProfile,

    /// Base URL of the WebDriver endpoint, e.g. `http://127.0.0.1:9515`
    pub webdriver: String,

    /// Browser binary, needed for browsers driven through another vendor's driver
    pub binary: Option<PathBuf>,

    #[serde(default = "default_headless")]
    pub headless: bool,
}

fn default_passes() -> u32 {
    2
}

fn default_lock_file() -> PathBuf {
    PathBuf::from(".probe.lock")
}

fn default_units() -> Vec<UnitConfig> {
    [
        (BrowserProfile::Chrome, 9515),
        (BrowserProfile::Edge, 9516),
        (BrowserProfile::Opera, 9517),
    ]
    .into_iter()
    .map(|(profile, port)| UnitConfig {
        profile,
        webdriver: format!("http://127.0.0.1:{port}"),
        binary: None,
        headless: default_headless(),
    })
    .collect()
}

fn default_headless() -> bool {
    true
}

fn default_link_concurrency() -> usize {
    10
}

fn default_fetch_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NotifierSettings {
    /// Seconds between two sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval: u64,

    /// Minimum seconds between two alerts of one rule
    #[serde(default = "default_debounce")]
    pub debounce: u64,

    /// Only samples this many seconds old or newer count as current
    #[serde(default = "default_recency")]
    pub recency: u64,

    /// Trailing window for percent rules (days)
    #[serde(default = "default_baseline_days")]
    pub baseline_days: i64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            interval: default_sweep_interval(),
            debounce: default_debounce(),
            recency: default_recency(),
            baseline_days: default_baseline_days(),
        }
    }
}

impl NotifierSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_debounce() -> u64 {
    15 * 60
}

fn default_recency() -> u64 {
    15 * 60
}

fn default_baseline_days() -> i64 {
    7
}

impl Config {
    /// Reject periods and sizes that must not be zero
    pub fn validate(&self) -> anyhow::Result<()> {
        let non_zero = [
            ("server.accept_poll_ms", self.server.accept_poll_ms),
            ("server.session_accept_timeout", self.server.session_accept_timeout),
            ("server.claim_lease", self.server.claim_lease),
            ("server.claim_retry_ms", self.server.claim_retry_ms),
            ("probe.passes", u64::from(self.probe.passes)),
            ("probe.link_concurrency", self.probe.link_concurrency as u64),
            ("probe.fetch_timeout", self.probe.fetch_timeout),
            ("notifier.interval", self.notifier.interval),
        ];

        match non_zero.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(anyhow::anyhow!("{field} must be greater than zero")),
            None => Ok(()),
        }
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.validate()?;

    trace!("loaded config: {config:?}");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert!(matches!(config.storage, StorageConfig::Sqlite { .. }));
        assert_eq!(config.probe.passes, 2);
        assert_eq!(config.probe.units.len(), 3);
        assert_eq!(config.probe.link_concurrency, 10);
        assert_eq!(config.notifier.interval, 60);
        assert_eq!(config.notifier.debounce, 900);
        assert_eq!(config.server.session_accept_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_units_accept_profile_names() {
        let config: Config = serde_json::from_str(
            r#"{
                "storage": { "backend": "none" },
                "probe": {
                    "server": "10.0.0.2",
                    "units": [
                        { "profile": "opera", "webdriver": "http://localhost:9517", "binary": "/usr/bin/opera" }
                    ]
                }
            }"#,
        )
        .unwrap();

        assert!(matches!(config.storage, StorageConfig::None));
        assert_eq!(config.probe.server, "10.0.0.2");

        let opera = config.probe.unit(BrowserProfile::Opera).unwrap();
        assert_eq!(opera.binary, Some(PathBuf::from("/usr/bin/opera")));
        assert!(opera.headless);
        assert!(config.probe.unit(BrowserProfile::Chrome).is_none());
    }

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "notifier": {{ "interval": 5 }} }}"#).unwrap();

        let config = read_config_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.notifier.interval(), Duration::from_secs(5));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, "not json").unwrap();
        assert!(read_config_file(broken.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_zero_periods_are_rejected() {
        for content in [
            r#"{ "notifier": { "interval": 0 } }"#,
            r#"{ "server": { "accept_poll_ms": 0 } }"#,
            r#"{ "server": { "claim_lease": 0 } }"#,
            r#"{ "probe": { "passes": 0 } }"#,
        ] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            write!(file, "{content}").unwrap();

            let err = read_config_file(file.path().to_str().unwrap()).unwrap_err();
            assert!(err.to_string().contains("must be greater than zero"), "{content}: {err}");
        }

        assert!(Config::default().validate().is_ok());
    }
}
