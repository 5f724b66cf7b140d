//! Measurement units
//!
//! [`BrowserUnit`] does the actual sampling. In production it runs inside a
//! dedicated child process (`pageprobe-probe unit`), driven over its stdin
//! and stdout by a [`ProcessUnit`] in the probe, so a hung or crashed
//! browser only takes its own profile down.
//!
//! The pipes carry one JSON document per line:
//!
//! ```text
//! probe → unit   {"type":"measure","url":"https://example.com"}
//! unit  → probe  {"type":"samples","samples":[...]} | {"type":"failed","reason":"..."}
//! probe → unit   {"type":"exit"}
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, instrument, warn};

use super::driver::DriverFactory;
use super::pool::{MeasurementUnit, UnitError};
use super::sampler::Sampler;
use crate::model::{BrowserProfile, MeasurementSample};
use crate::protocol::MAX_FRAME_LENGTH;

const EXIT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitRequest {
    Measure { url: String },
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitReport {
    Samples { samples: Vec<MeasurementSample> },
    Failed { reason: String },
}

/// Samples a URL with a fresh browser for every pass
pub struct BrowserUnit {
    profile: BrowserProfile,
    factory: Box<dyn DriverFactory>,
    sampler: Sampler,
    passes: u32,
}

impl BrowserUnit {
    pub fn new(
        profile: BrowserProfile,
        factory: Box<dyn DriverFactory>,
        sampler: Sampler,
        passes: u32,
    ) -> Self {
        Self {
            profile,
            factory,
            sampler,
            passes,
        }
    }
}

#[async_trait]
impl MeasurementUnit for BrowserUnit {
    fn profile(&self) -> BrowserProfile {
        self.profile
    }

    /// A pass whose browser cannot be launched is skipped; the URL only
    /// fails when no pass produced a sample.
    #[instrument(skip(self), fields(profile = %self.profile))]
    async fn measure(&mut self, url: &str) -> Result<Vec<MeasurementSample>, UnitError> {
        let mut samples = Vec::with_capacity(self.passes as usize);
        let mut launch_error = None;

        for pass in 1..=self.passes {
            let mut driver = match self.factory.launch().await {
                Ok(driver) => driver,
                Err(e) => {
                    warn!("pass {pass}/{} skipped, browser did not start: {e}", self.passes);
                    launch_error = Some(e);
                    continue;
                }
            };
            debug!("pass {pass}/{}", self.passes);

            samples.push(self.sampler.sample_pass(driver.as_mut(), url).await);

            if let Err(e) = driver.quit().await {
                warn!("failed to quit browser after pass {pass}: {e}");
            }
        }

        match launch_error {
            Some(e) if samples.is_empty() => Err(e.into()),
            _ => Ok(samples),
        }
    }

    async fn shutdown(self: Box<Self>) -> Result<(), UnitError> {
        Ok(())
    }
}

/// Child side: answer requests from `input` on `output` until `exit` or EOF
pub async fn serve_unit<R, W>(
    mut unit: Box<dyn MeasurementUnit>,
    input: R,
    output: W,
) -> Result<(), UnitError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut reports = FramedWrite::new(output, LinesCodec::new());

    while let Some(line) = requests.next().await {
        let line = line.map_err(|e| UnitError::Channel(e.to_string()))?;
        let request: UnitRequest =
            serde_json::from_str(&line).map_err(|e| UnitError::Channel(e.to_string()))?;

        match request {
            UnitRequest::Measure { url } => {
                let report = match unit.measure(&url).await {
                    Ok(samples) => UnitReport::Samples { samples },
                    Err(e) => UnitReport::Failed {
                        reason: e.to_string(),
                    },
                };
                let encoded =
                    serde_json::to_string(&report).map_err(|e| UnitError::Channel(e.to_string()))?;
                reports
                    .send(encoded)
                    .await
                    .map_err(|e| UnitError::Channel(e.to_string()))?;
            }
            UnitRequest::Exit => break,
        }
    }

    unit.shutdown().await
}

/// How to start a unit process
#[derive(Debug, Clone)]
pub struct UnitCommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

struct UnitProcess {
    child: Child,
    requests: FramedWrite<ChildStdin, LinesCodec>,
    reports: FramedRead<ChildStdout, LinesCodec>,
}

/// Probe side of a unit running in its own process
///
/// The process is started lazily and restarted on the next URL if it died.
pub struct ProcessUnit {
    profile: BrowserProfile,
    command: UnitCommandLine,
    process: Option<UnitProcess>,
}

impl ProcessUnit {
    pub fn new(profile: BrowserProfile, command: UnitCommandLine) -> Self {
        Self {
            profile,
            command,
            process: None,
        }
    }

    fn spawn(&self) -> Result<UnitProcess, UnitError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(UnitError::Spawn)?;

        let stdin = child.stdin.take().ok_or(UnitError::Exited)?;
        let stdout = child.stdout.take().ok_or(UnitError::Exited)?;
        info!(profile = %self.profile, pid = child.id(), "started unit process");

        Ok(UnitProcess {
            child,
            requests: FramedWrite::new(stdin, LinesCodec::new()),
            reports: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
        })
    }

    fn ensure_running(&mut self) -> Result<&mut UnitProcess, UnitError> {
        let alive = match self.process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        };

        if !alive {
            if self.process.is_some() {
                warn!(profile = %self.profile, "unit process died, restarting");
            }
            self.process = Some(self.spawn()?);
        }

        self.process.as_mut().ok_or(UnitError::Exited)
    }

    async fn exchange(
        process: &mut UnitProcess,
        url: &str,
    ) -> Result<Vec<MeasurementSample>, UnitError> {
        let request = serde_json::to_string(&UnitRequest::Measure {
            url: url.to_string(),
        })
        .map_err(|e| UnitError::Channel(e.to_string()))?;

        process
            .requests
            .send(request)
            .await
            .map_err(|e| UnitError::Channel(e.to_string()))?;

        let line = match process.reports.next().await {
            None => return Err(UnitError::Exited),
            Some(line) => line.map_err(|e| UnitError::Channel(e.to_string()))?,
        };

        match serde_json::from_str::<UnitReport>(&line).map_err(|e| UnitError::Channel(e.to_string()))? {
            UnitReport::Samples { samples } => Ok(samples),
            UnitReport::Failed { reason } => Err(UnitError::Failed(reason)),
        }
    }
}

#[async_trait]
impl MeasurementUnit for ProcessUnit {
    fn profile(&self) -> BrowserProfile {
        self.profile
    }

    async fn measure(&mut self, url: &str) -> Result<Vec<MeasurementSample>, UnitError> {
        let process = self.ensure_running()?;
        let result = Self::exchange(process, url).await;

        // a broken pipe leaves the process in an unknown state
        if matches!(result, Err(UnitError::Exited | UnitError::Channel(_))) {
            self.process = None;
        }
        result
    }

    async fn shutdown(self: Box<Self>) -> Result<(), UnitError> {
        let ProcessUnit { profile, process, .. } = *self;
        let Some(mut process) = process else {
            return Ok(());
        };

        if let Ok(exit) = serde_json::to_string(&UnitRequest::Exit) {
            let _ = process.requests.send(exit).await;
        }

        match tokio::time::timeout(EXIT_GRACE, process.child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|e| UnitError::Channel(e.to_string()))?;
                debug!(%profile, "unit process exited with {status}");
                Ok(())
            }
            Err(_) => {
                warn!(%profile, "unit process ignored exit, killing it");
                process
                    .child
                    .kill()
                    .await
                    .map_err(|e| UnitError::Channel(e.to_string()))
            }
        }
    }
}
