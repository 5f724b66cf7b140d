//! Probe: worker pool, measurement units and the session client

pub mod client;
pub mod driver;
pub mod links;
pub mod lock;
pub mod pool;
pub mod sampler;
pub mod unit;

use std::path::Path;

use crate::config::ProbeSettings;
use crate::model::BrowserProfile;

pub use client::{ClientSummary, connect, run_session};
pub use lock::{InstanceLock, LockError};
pub use pool::{MeasurementUnit, PoolReport, UnitError, WorkerPool};
pub use unit::{BrowserUnit, ProcessUnit, UnitCommandLine, serve_unit};

/// One [`ProcessUnit`] per configured profile, each re-running `program`
/// with the hidden `unit` subcommand
pub fn process_units(
    settings: &ProbeSettings,
    program: &Path,
    config_file: &str,
) -> Vec<Box<dyn MeasurementUnit>> {
    settings
        .units
        .iter()
        .map(|unit| {
            let command = UnitCommandLine {
                program: program.to_path_buf(),
                args: vec![
                    "-f".to_string(),
                    config_file.to_string(),
                    "unit".to_string(),
                    "--profile".to_string(),
                    unit.profile.name().to_string(),
                ],
            };
            Box::new(ProcessUnit::new(unit.profile, command)) as Box<dyn MeasurementUnit>
        })
        .collect()
}

/// The in-process unit for `profile`, as run inside a unit process
pub fn browser_unit(settings: &ProbeSettings, profile: BrowserProfile) -> anyhow::Result<BrowserUnit> {
    let unit = settings
        .unit(profile)
        .ok_or_else(|| anyhow::anyhow!("no unit configured for profile {profile}"))?;

    let factory = driver::WebDriverFactory::new(unit)?;
    let sampler = sampler::Sampler::new(profile, settings)?;

    Ok(BrowserUnit::new(profile, Box::new(factory), sampler, settings.passes))
}
