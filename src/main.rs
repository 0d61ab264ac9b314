//! `mppt`: maximum power point tracking from the command line.
//!
//! Exit status is 0 when tracking finished (deadline, Ctrl-C, or a refused
//! out-of-envelope step), 2 for configuration errors and 1 for instrument
//! communication failures.

use clap::Parser;
use mppt_daq::adapters::VisaLink;
use mppt_daq::cli::Cli;
use mppt_daq::config::Settings;
use mppt_daq::error::AppResult;
use mppt_daq::logging;
use mppt_daq::report::LogSink;
use mppt_daq::session::MeasurementSession;
use mppt_daq::shutter::{DummyShutter, LinkShutter, Shutter};
use mppt_daq::sourcemeter::{Keithley2400, PvCellModel, SimulatedSourcemeter, Sourcemeter};
use mppt_daq::tracker::{CancelFlag, Tracker, TrackingReport};
use std::process::ExitCode;
use tracing::{error, info, warn};

const EXIT_COMMUNICATION: u8 = 1;
const EXIT_CONFIGURATION: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref(), Some(cli.overrides())) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    if let Err(err) = logging::init(&settings.logging) {
        eprintln!("{}", err);
        return ExitCode::from(EXIT_CONFIGURATION);
    }

    match run(&settings).await {
        Ok(report) if report.reason.is_configuration() => {
            error!(reason = %report.reason, "Tracking stopped by a configuration error");
            ExitCode::from(EXIT_CONFIGURATION)
        }
        Ok(report) if report.reason.is_failure() => {
            error!(reason = %report.reason, "Tracking stopped by a link or I/O failure");
            ExitCode::from(EXIT_COMMUNICATION)
        }
        Ok(report) => {
            info!(reason = %report.reason, "Done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            if err.is_configuration() {
                ExitCode::from(EXIT_CONFIGURATION)
            } else {
                ExitCode::from(EXIT_COMMUNICATION)
            }
        }
    }
}

fn build_session(settings: &Settings) -> MeasurementSession {
    let limits = settings.protection_limits();
    let timing = settings.sweep_timing();

    let sourcemeter: Box<dyn Sourcemeter> = if settings.run.dummy {
        info!("Dummy mode: using simulated sourcemeter");
        Box::new(SimulatedSourcemeter::new(PvCellModel::default(), limits, timing))
    } else {
        let link = VisaLink::new(settings.sourcemeter_resource())
            .with_timeout(settings.link_timeout())
            .with_line_terminator(settings.instrument.read_termination.clone());
        Box::new(Keithley2400::new(link, limits, timing))
    };

    let session = MeasurementSession::new(sourcemeter);
    if !settings.run.shutter {
        return session;
    }

    let shutter: Box<dyn Shutter> = if settings.run.dummy {
        Box::new(DummyShutter::new())
    } else {
        let link = VisaLink::new(settings.shutter.resource.clone())
            .with_timeout(settings.link_timeout());
        Box::new(LinkShutter::with_commands(
            link,
            settings.shutter.open_command.clone(),
            settings.shutter.close_command.clone(),
        ))
    };
    session.with_shutter(shutter)
}

async fn run(settings: &Settings) -> AppResult<TrackingReport> {
    info!(
        started = %chrono::Local::now().to_rfc3339(),
        tracking_s = settings.run.tracking_time_seconds,
        area_cm2 = settings.run.device_area_cm2,
        "Starting maximum power point tracking"
    );

    let cancel = CancelFlag::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            interrupt.cancel();
        }
    });

    let sink = LogSink::new(settings.run.metadata.clone());
    let mut tracker = Tracker::new(
        settings.tracker_settings(),
        settings.run.device_area_cm2,
        sink,
    )
    .with_cancel_flag(cancel);

    build_session(settings).run(&mut tracker).await
}
