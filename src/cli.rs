//! Command-line arguments.
//!
//! Every argument is optional on the command line so it can also come from
//! the config file or the environment. Values given here win.

use clap::{ArgAction, Parser};
use figment::{providers::Serialized, Figment};
use std::path::PathBuf;

/// Maximum power point tracking for PV devices using GPIB connected sourcemeter and optional shutter control.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mppt", version)]
pub struct Cli {
    /// Total number of seconds to MPP track for
    #[arg(short = 't', long, alias = "tracking_time_seconds")]
    pub tracking_time_seconds: Option<u64>,

    /// Device active area in cm^2
    #[arg(short = 'a', long, alias = "device_area_cm2")]
    pub device_area_cm2: Option<f64>,

    /// GPIB address number for sourcemeter
    #[arg(short = 'g', long, alias = "gpib_address")]
    pub gpib_address: Option<String>,

    /// Enable shutter control
    #[arg(short = 's', long)]
    pub shutter: bool,

    /// Run against simulated instruments
    #[arg(short = 'd', long)]
    pub dummy: bool,

    /// Note recorded with the tracking report
    #[arg(short = 'm', long)]
    pub metadata: Option<String>,

    /// Path to a TOML config file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Highest-precedence configuration layer built from the given arguments.
    ///
    /// Only values actually supplied are emitted; boolean flags only ever
    /// switch features on.
    pub fn overrides(&self) -> Figment {
        let mut figment = Figment::new();

        if let Some(seconds) = self.tracking_time_seconds {
            figment = figment.merge(Serialized::default("run.tracking_time_seconds", seconds));
        }
        if let Some(area) = self.device_area_cm2 {
            figment = figment.merge(Serialized::default("run.device_area_cm2", area));
        }
        if let Some(address) = &self.gpib_address {
            figment = figment.merge(Serialized::default("run.gpib_address", address));
        }
        if self.shutter {
            figment = figment.merge(Serialized::default("run.shutter", true));
        }
        if self.dummy {
            figment = figment.merge(Serialized::default("run.dummy", true));
        }
        if let Some(metadata) = &self.metadata {
            figment = figment.merge(Serialized::default("run.metadata", metadata));
        }
        if let Some(path) = &self.log_file {
            figment = figment.merge(Serialized::default("logging.file", path));
        }
        match self.verbose {
            0 => {}
            1 => figment = figment.merge(Serialized::default("logging.level", "debug")),
            _ => figment = figment.merge(Serialized::default("logging.level", "trace")),
        }

        figment
    }
}
