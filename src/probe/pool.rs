//! Fan one URL out to every measurement unit and gather the results
//!
//! Each unit is driven by its own task fed through an mpsc queue. A dispatch
//! hands every unit the same URL with a oneshot reply and waits for all of
//! them. A unit whose task is gone, or who reports an error, is listed as
//! failed for that URL; the other units' samples are still returned.

use std::fmt;
use std::io;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::driver::DriverError;
use crate::model::{BrowserProfile, MeasurementSample};

#[derive(Debug)]
pub enum UnitError {
    /// The unit process could not be started
    Spawn(io::Error),

    /// Reading or writing the unit pipes failed
    Channel(String),

    /// The unit process is gone
    Exited,

    Driver(DriverError),

    /// The unit reported a failure for this URL
    Failed(String),
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitError::Spawn(e) => write!(f, "failed to start unit: {}", e),
            UnitError::Channel(msg) => write!(f, "unit channel error: {}", msg),
            UnitError::Exited => write!(f, "unit exited unexpectedly"),
            UnitError::Driver(e) => write!(f, "{}", e),
            UnitError::Failed(reason) => write!(f, "unit failed: {}", reason),
        }
    }
}

impl std::error::Error for UnitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnitError::Spawn(e) => Some(e),
            UnitError::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DriverError> for UnitError {
    fn from(err: DriverError) -> Self {
        UnitError::Driver(err)
    }
}

/// One isolated sampler for one browser profile
#[async_trait]
pub trait MeasurementUnit: Send {
    fn profile(&self) -> BrowserProfile;

    /// Run every sampling pass for `url`
    async fn measure(&mut self, url: &str) -> Result<Vec<MeasurementSample>, UnitError>;

    async fn shutdown(self: Box<Self>) -> Result<(), UnitError>;
}

#[derive(Debug)]
enum UnitCommand {
    Measure {
        url: String,
        reply: oneshot::Sender<Result<Vec<MeasurementSample>, UnitError>>,
    },
    Exit,
}

struct UnitHandle {
    profile: BrowserProfile,
    commands: mpsc::Sender<UnitCommand>,
    task: JoinHandle<()>,
}

/// Combined outcome of one dispatch
#[derive(Debug, Default)]
pub struct PoolReport {
    pub samples: Vec<MeasurementSample>,
    pub failed: Vec<BrowserProfile>,
}

pub struct WorkerPool {
    handles: Vec<UnitHandle>,
}

impl WorkerPool {
    pub fn start(units: Vec<Box<dyn MeasurementUnit>>) -> Self {
        let handles = units
            .into_iter()
            .map(|unit| {
                let profile = unit.profile();
                let (commands, receiver) = mpsc::channel(4);
                let task = tokio::spawn(unit_loop(unit, receiver));
                UnitHandle {
                    profile,
                    commands,
                    task,
                }
            })
            .collect();

        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Give `url` to every unit and wait until each has answered
    #[instrument(skip(self))]
    pub async fn dispatch(&self, url: &str) -> PoolReport {
        let pending = self.handles.iter().map(|handle| async move {
            let (reply, answer) = oneshot::channel();
            let command = UnitCommand::Measure {
                url: url.to_string(),
                reply,
            };

            if handle.commands.send(command).await.is_err() {
                return (handle.profile, Err(UnitError::Exited));
            }
            match answer.await {
                Ok(result) => (handle.profile, result),
                Err(_) => (handle.profile, Err(UnitError::Exited)),
            }
        });

        let mut report = PoolReport::default();
        for (profile, result) in join_all(pending).await {
            match result {
                Ok(samples) => {
                    debug!("{profile} delivered {} samples", samples.len());
                    report.samples.extend(samples);
                }
                Err(e) => {
                    warn!("{profile} failed: {e}");
                    report.failed.push(profile);
                }
            }
        }
        report
    }

    /// Send `exit` to every unit and join them
    pub async fn shutdown(self) {
        for handle in &self.handles {
            let _ = handle.commands.send(UnitCommand::Exit).await;
        }

        for handle in self.handles {
            if let Err(e) = handle.task.await {
                error!("{} unit task failed: {e}", handle.profile);
            }
        }
        info!("all units stopped");
    }
}

async fn unit_loop(mut unit: Box<dyn MeasurementUnit>, mut commands: mpsc::Receiver<UnitCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            UnitCommand::Measure { url, reply } => {
                let result = unit.measure(&url).await;
                let _ = reply.send(result);
            }
            UnitCommand::Exit => break,
        }
    }

    let profile = unit.profile();
    if let Err(e) = unit.shutdown().await {
        warn!("{profile} unit did not shut down cleanly: {e}");
    }
}
