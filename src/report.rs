//! Reporting sinks for tracking data.
//!
//! The tracker never writes to a global logger or plot. It is handed a
//! [`TrackingSink`] and pushes every sample it takes, plus the final report,
//! into it. [`LogSink`] forwards to `tracing`; [`MemorySink`] keeps everything
//! for inspection in tests.

use crate::measurement::Sample;
use crate::tracker::{TrackerPhase, TrackingReport};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One sample taken while walking to or tracking the maximum power point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Phase the sample was taken in.
    pub phase: TrackerPhase,
    /// Raw reading.
    pub sample: Sample,
    /// |V·I| in W.
    pub power: f64,
    /// Power per active area in mW/cm².
    pub power_density: f64,
}

impl TrackPoint {
    /// Derive power and power density for `sample`.
    pub fn new(phase: TrackerPhase, sample: Sample, area_cm2: f64) -> Self {
        let power = sample.power();
        Self {
            phase,
            sample,
            power,
            power_density: power / area_cm2 * 1000.0,
        }
    }
}

/// Destination for tracking samples and the final report.
pub trait TrackingSink: Send {
    /// Called for every walk and tracking sample.
    fn record(&mut self, point: &TrackPoint);

    /// Called once with the final report.
    fn finished(&mut self, _report: &TrackingReport) {}
}

/// Sink that emits structured `tracing` events.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    metadata: Option<String>,
}

impl LogSink {
    /// Log sink tagging every event with the run note.
    pub fn new(metadata: Option<String>) -> Self {
        Self { metadata }
    }
}

impl TrackingSink for LogSink {
    fn record(&mut self, point: &TrackPoint) {
        info!(
            phase = ?point.phase,
            time_s = point.sample.timestamp,
            voltage = point.sample.voltage,
            current = point.sample.current,
            power_mw_cm2 = point.power_density,
            "MPP sample"
        );
    }

    fn finished(&mut self, report: &TrackingReport) {
        info!(
            reason = %report.reason,
            voc = ?report.voc,
            initial_vmpp = ?report.initial_vmpp,
            last_voltage = ?report.last_voltage,
            last_power = ?report.last_power,
            iterations = report.iterations,
            metadata = self.metadata.as_deref().unwrap_or(""),
            "Tracking report"
        );
    }
}

/// Sink that keeps every point in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    /// Every recorded point, in order.
    pub points: Vec<TrackPoint>,
    /// Final report, once the run has finished.
    pub report: Option<TrackingReport>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Points recorded during `phase`.
    pub fn phase_points(&self, phase: TrackerPhase) -> impl Iterator<Item = &TrackPoint> {
        self.points.iter().filter(move |p| p.phase == phase)
    }
}

impl TrackingSink for MemorySink {
    fn record(&mut self, point: &TrackPoint) {
        self.points.push(*point);
    }

    fn finished(&mut self, report: &TrackingReport) {
        self.report = Some(report.clone());
    }
}
