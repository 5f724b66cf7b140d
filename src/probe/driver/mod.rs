//! Browser automation seam
//!
//! The sampler only talks to [`MeasurementDriver`]. A fresh driver is
//! launched through a [`DriverFactory`] for every sampling pass.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::{Value, json};

pub mod webdriver;

pub use webdriver::{WebDriverFactory, WebDriverSession};

#[derive(Debug)]
pub enum DriverError {
    /// The browser session could not be created
    Launch(String),

    /// Transport failure talking to the driver
    Http(reqwest::Error),

    /// The driver answered with a WebDriver error object
    Command { error: String, message: String },

    /// The driver answered with something we could not interpret
    Decode(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Launch(msg) => write!(f, "failed to launch browser: {}", msg),
            DriverError::Http(e) => write!(f, "driver transport error: {}", e),
            DriverError::Command { error, message } => write!(f, "{}: {}", error, message),
            DriverError::Decode(msg) => write!(f, "unexpected driver response: {}", msg),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::Http(err)
    }
}

/// One entry of the browser's performance log
#[derive(Debug, Clone, PartialEq)]
pub struct PerfEvent {
    pub method: String,
    pub params: Value,
}

#[async_trait]
pub trait MeasurementDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Run `script` synchronously in the page and return its result
    async fn execute_script(&mut self, script: &str) -> Result<Value, DriverError>;

    /// Send a DevTools protocol command
    async fn execute_cdp(&mut self, command: &str, params: Value) -> Result<Value, DriverError>;

    /// Drain the performance log collected since the last call
    async fn performance_log(&mut self) -> Result<Vec<PerfEvent>, DriverError>;

    async fn current_url(&mut self) -> Result<String, DriverError>;

    async fn quit(self: Box<Self>) -> Result<(), DriverError>;

    /// DevTools `Performance.getMetrics`, keyed by metric name
    async fn performance_metrics(&mut self) -> Result<HashMap<String, f64>, DriverError> {
        let response = self.execute_cdp("Performance.getMetrics", json!({})).await?;
        let metrics = response
            .get("metrics")
            .and_then(Value::as_array)
            .ok_or_else(|| DriverError::Decode("Performance.getMetrics without metrics".to_string()))?;

        Ok(metrics
            .iter()
            .filter_map(|m| Some((m.get("name")?.as_str()?.to_string(), m.get("value")?.as_f64()?)))
            .collect())
    }
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn MeasurementDriver>, DriverError>;
}
