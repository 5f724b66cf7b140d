//! W3C WebDriver client for Chromium-based browsers
//!
//! Talks plain HTTP to chromedriver/msedgedriver. Performance logging and
//! DevTools commands go through the vendor extensions (`goog` for Chrome and
//! Opera, `ms` for Edge).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use super::{DriverError, DriverFactory, MeasurementDriver, PerfEvent};
use crate::config::UnitConfig;
use crate::model::BrowserProfile;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

pub struct WebDriverFactory {
    client: Client,
    endpoint: String,
    profile: BrowserProfile,
    binary: Option<PathBuf>,
    headless: bool,
}

impl WebDriverFactory {
    pub fn new(unit: &UnitConfig) -> Result<Self, DriverError> {
        let client = Client::builder().timeout(COMMAND_TIMEOUT).build()?;

        Ok(Self {
            client,
            endpoint: unit.webdriver.trim_end_matches('/').to_string(),
            profile: unit.profile,
            binary: unit.binary.clone(),
            headless: unit.headless,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = Vec::new();
        if self.headless {
            args.push("--headless=new");
        }

        let mut options = Map::new();
        if self.profile == BrowserProfile::Opera {
            args.extend(["--disable-blink-features=AutomationControlled", "--start-maximized"]);
            options.insert("excludeSwitches".into(), json!(["enable-automation"]));
            options.insert("useAutomationExtension".into(), json!(false));
        }
        options.insert("args".into(), json!(args));
        if let Some(binary) = &self.binary {
            options.insert("binary".into(), json!(binary));
        }

        let vendor = vendor_prefix(self.profile);
        let (browser_name, options_key) = match self.profile {
            BrowserProfile::Edge => ("MicrosoftEdge", "ms:edgeOptions"),
            BrowserProfile::Chrome | BrowserProfile::Opera => ("chrome", "goog:chromeOptions"),
        };

        let mut always_match = Map::new();
        always_match.insert("browserName".into(), json!(browser_name));
        always_match.insert(options_key.into(), Value::Object(options));
        always_match.insert(
            format!("{vendor}:loggingPrefs"),
            json!({ "performance": "ALL" }),
        );

        json!({ "capabilities": { "alwaysMatch": always_match } })
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    #[instrument(skip(self), fields(profile = %self.profile))]
    async fn launch(&self) -> Result<Box<dyn MeasurementDriver>, DriverError> {
        let response = self
            .client
            .post(format!("{}/session", self.endpoint))
            .json(&self.capabilities())
            .send()
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let value = unwrap_value(response).await.map_err(|e| match e {
            DriverError::Command { message, .. } => DriverError::Launch(message),
            other => other,
        })?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Launch("response without sessionId".to_string()))?
            .to_string();
        debug!("created browser session {session_id}");

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            session_id,
            vendor: vendor_prefix(self.profile),
        }))
    }
}

pub struct WebDriverSession {
    client: Client,
    endpoint: String,
    session_id: String,
    vendor: &'static str,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        suffix: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, suffix);
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        unwrap_value(request.send().await?).await
    }
}

#[async_trait]
impl MeasurementDriver for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn execute_script(&mut self, script: &str) -> Result<Value, DriverError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": [] })),
        )
        .await
    }

    async fn execute_cdp(&mut self, command: &str, params: Value) -> Result<Value, DriverError> {
        let suffix = format!("/{}/cdp/execute", self.vendor);
        self.command(
            Method::POST,
            &suffix,
            Some(json!({ "cmd": command, "params": params })),
        )
        .await
    }

    async fn performance_log(&mut self) -> Result<Vec<PerfEvent>, DriverError> {
        let entries = self
            .command(Method::POST, "/se/log", Some(json!({ "type": "performance" })))
            .await?;

        let entries = entries
            .as_array()
            .ok_or_else(|| DriverError::Decode("performance log is not a list".to_string()))?;

        Ok(entries.iter().filter_map(parse_perf_entry).collect())
    }

    async fn current_url(&mut self) -> Result<String, DriverError> {
        let value = self.command(Method::GET, "/url", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Decode(format!("current url is not a string: {value}")))
    }

    async fn quit(self: Box<Self>) -> Result<(), DriverError> {
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}

fn vendor_prefix(profile: BrowserProfile) -> &'static str {
    match profile {
        BrowserProfile::Edge => "ms",
        BrowserProfile::Chrome | BrowserProfile::Opera => "goog",
    }
}

/// Log entries carry the DevTools event as a JSON string in `message`
fn parse_perf_entry(entry: &Value) -> Option<PerfEvent> {
    let raw = entry.get("message")?.as_str()?;
    let parsed: Value = serde_json::from_str(raw).ok()?;
    let event = parsed.get("message")?;

    Some(PerfEvent {
        method: event.get("method")?.as_str()?.to_string(),
        params: event.get("params").cloned().unwrap_or(Value::Null),
    })
}

async fn unwrap_value(response: Response) -> Result<Value, DriverError> {
    let status = response.status();
    let body: Value = response.json().await?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
    Err(DriverError::Command {
        error: field("error").unwrap_or_else(|| status.to_string()),
        message: field("message").unwrap_or_default(),
    })
}
