//! Maximum power point tracker.
//!
//! The tracker drives a [`Sourcemeter`] through a fixed sequence of phases:
//!
//! ```text
//! Idle -> FindingVoc -> SweepingToInitialVmpp -> WalkingToInitialVmpp -> Tracking -> Finished
//! ```
//!
//! After locating an initial operating point from a reverse JV sweep it walks
//! the bias up from 0 V in voltage-step increments and then runs
//! perturb-and-observe: keep stepping in the same direction while power rises,
//! reverse as soon as it does not. Tracking ends on the deadline (measured on
//! instrument timestamps), on cancellation, or on the first error. Whatever the
//! reason, `Finished` forces the output to 0 V in fixed mode.

use crate::error::{AppResult, MppError};
use crate::measurement::{max_power_voltage, Sample};
use crate::report::{TrackPoint, TrackingSink};
use crate::safety::{Channel, OutputCommand, SweepDirection};
use crate::session::SessionTask;
use crate::sourcemeter::{Sourcemeter, DEFAULT_VOC_HOLD};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default perturbation step in V.
pub const DEFAULT_VOLTAGE_STEP: f64 = 0.01;

/// Tracker lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerPhase {
    /// Not started.
    Idle,
    /// Measuring the open-circuit voltage.
    FindingVoc,
    /// Reverse JV sweep for the first Vmpp estimate.
    SweepingToInitialVmpp,
    /// Stepping the bias up from 0 V.
    WalkingToInitialVmpp,
    /// Perturb and observe.
    Tracking,
    /// Output parked at 0 V.
    Finished,
}

/// Perturbation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Towards higher voltage.
    Up,
    /// Towards lower voltage.
    Down,
}

impl Direction {
    /// `+1.0` or `-1.0`.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    /// The opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Perturb-and-observe rule: keep going while power strictly rises.
///
/// Equal power counts as "not better" and reverses.
pub fn next_direction(power: f64, previous_power: f64, direction: Direction) -> Direction {
    if power > previous_power {
        direction
    } else {
        direction.reversed()
    }
}

/// Mutable tracking state, created on entering `Tracking`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerState {
    /// Maximum power voltage found by the sweep.
    pub initial_vmpp: f64,
    /// Voltage to apply on the next iteration.
    pub vmpp: f64,
    /// Current perturbation direction.
    pub direction: Direction,
    /// Power at the previous operating point (W).
    pub previous_power: f64,
    /// Instrument timestamp of the sample that started tracking.
    pub start_time: f64,
}

impl TrackerState {
    /// Start at `initial_vmpp`, stepping up, with `start` as the reference point.
    pub fn new(initial_vmpp: f64, start: &Sample) -> Self {
        Self {
            initial_vmpp,
            vmpp: initial_vmpp,
            direction: Direction::Up,
            previous_power: start.power(),
            start_time: start.timestamp,
        }
    }

    /// Fold in the power measured at the current `vmpp` and move one step.
    ///
    /// Returns the next voltage to apply.
    pub fn observe(&mut self, power: f64, step: f64) -> f64 {
        self.direction = next_direction(power, self.previous_power, self.direction);
        self.previous_power = power;
        self.vmpp += self.direction.sign() * step;
        self.vmpp
    }
}

/// Tracker tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    /// Perturbation step in V.
    pub voltage_step: f64,
    /// Settling time before the open-circuit read.
    pub voc_hold_time: Duration,
    /// Tracking duration, measured on instrument time.
    pub tracking_time: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            voltage_step: DEFAULT_VOLTAGE_STEP,
            voc_hold_time: DEFAULT_VOC_HOLD,
            tracking_time: Duration::from_secs(60),
        }
    }
}

/// Cooperative stop request, polled once per tracking iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Flag that is not yet raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why tracking stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The tracking time elapsed.
    Deadline,
    /// The cancel flag was raised.
    Cancelled,
    /// The next step fell outside the protection envelope.
    OutputLimitExceeded(String),
    /// The instrument link failed or answered garbage.
    Communication(String),
    /// A setting turned out to be unusable mid-run.
    Configuration(String),
    /// Local I/O failed.
    Io(String),
}

impl FinishReason {
    /// True when the run ended because the link or local I/O failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, FinishReason::Communication(_) | FinishReason::Io(_))
    }

    /// True when the run ended on a bad setting.
    pub fn is_configuration(&self) -> bool {
        matches!(self, FinishReason::Configuration(_))
    }

    fn from_error(err: &MppError) -> Self {
        let message = err.to_string();
        match err {
            MppError::CancellationRequested => FinishReason::Cancelled,
            MppError::OutputLimitExceeded { .. } => FinishReason::OutputLimitExceeded(message),
            MppError::Communication(_) | MppError::MalformedResponse { .. } => {
                FinishReason::Communication(message)
            }
            MppError::Configuration(_) | MppError::ConfigLoad(_) => {
                FinishReason::Configuration(message)
            }
            MppError::Io(_) => FinishReason::Io(message),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Deadline => write!(f, "tracking time elapsed"),
            FinishReason::Cancelled => write!(f, "cancelled by operator"),
            FinishReason::OutputLimitExceeded(msg) => write!(f, "{}", msg),
            FinishReason::Communication(msg) => write!(f, "communication failure: {}", msg),
            FinishReason::Configuration(msg) | FinishReason::Io(msg) => write!(f, "{}", msg),
        }
    }
}

/// Outcome of a tracking run, including the last known operating point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingReport {
    /// Why the run ended.
    pub reason: FinishReason,
    /// Open-circuit voltage, once measured.
    pub voc: Option<f64>,
    /// Maximum power voltage from the sweep.
    pub initial_vmpp: Option<f64>,
    /// Voltage of the last recorded sample.
    pub last_voltage: Option<f64>,
    /// Power of the last recorded sample (W).
    pub last_power: Option<f64>,
    /// Completed perturb-and-observe iterations.
    pub iterations: usize,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end of the run.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrackingReport {
    fn empty(reason: FinishReason) -> Self {
        Self {
            reason,
            voc: None,
            initial_vmpp: None,
            last_voltage: None,
            last_power: None,
            iterations: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Perturb-and-observe tracker writing every sample to a [`TrackingSink`].
pub struct Tracker<S> {
    settings: TrackerSettings,
    area_cm2: f64,
    sink: S,
    cancel: CancelFlag,
    phase: TrackerPhase,
}

impl<S: TrackingSink> Tracker<S> {
    /// Tracker for a device of `area_cm2` reporting to `sink`.
    ///
    /// A step that is not a positive number is replaced by [`DEFAULT_VOLTAGE_STEP`].
    pub fn new(mut settings: TrackerSettings, area_cm2: f64, sink: S) -> Self {
        if !settings.voltage_step.is_finite() || settings.voltage_step <= 0.0 {
            warn!(
                requested = settings.voltage_step,
                "Voltage step must be positive. Using {} V.",
                DEFAULT_VOLTAGE_STEP
            );
            settings.voltage_step = DEFAULT_VOLTAGE_STEP;
        }
        Self {
            settings,
            area_cm2,
            sink,
            cancel: CancelFlag::new(),
            phase: TrackerPhase::Idle,
        }
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that stops this tracker when raised.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    /// Effective tunables.
    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// The reporting sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Take the sink back after the run.
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn enter(&mut self, phase: TrackerPhase) {
        info!(from = ?self.phase, to = ?phase, "Tracker phase change");
        self.phase = phase;
    }

    fn record(&mut self, sample: Sample, report: &mut TrackingReport) {
        let point = TrackPoint::new(self.phase, sample, self.area_cm2);
        report.last_voltage = Some(sample.voltage);
        report.last_power = Some(point.power);
        self.sink.record(&point);
    }

    /// Apply `voltage` in fixed mode and take one reading.
    async fn step_to(
        &mut self,
        sm: &mut dyn Sourcemeter,
        voltage: f64,
        report: &mut TrackingReport,
    ) -> Result<Sample, MppError> {
        sm.set_output(&OutputCommand::fixed(Channel::Voltage, voltage))
            .await?;
        let sample = sm.read_output().await?;
        self.record(sample, report);
        Ok(sample)
    }

    fn check_cancel(&self) -> Result<(), MppError> {
        if self.cancel.is_cancelled() {
            Err(MppError::CancellationRequested)
        } else {
            Ok(())
        }
    }

    /// Run every phase up to `Finished` and return the report.
    ///
    /// Errors never escape: they become the report's [`FinishReason`].
    pub async fn run(&mut self, sm: &mut dyn Sourcemeter) -> TrackingReport {
        let mut report = TrackingReport::empty(FinishReason::Deadline);

        let reason = match self.drive(sm, &mut report).await {
            Ok(reason) => reason,
            Err(err) => {
                match &err {
                    MppError::CancellationRequested => info!("Tracking cancelled"),
                    _ => warn!(phase = ?self.phase, error = %err, "Tracking aborted"),
                }
                FinishReason::from_error(&err)
            }
        };
        report.reason = reason;
        report.finished_at = Some(Utc::now());

        self.enter(TrackerPhase::Finished);
        if let Err(err) = sm
            .set_output(&OutputCommand::fixed(Channel::Voltage, 0.0))
            .await
        {
            warn!(error = %err, "Could not return output to 0 V");
        }

        info!(
            reason = %report.reason,
            last_voltage = ?report.last_voltage,
            last_power = ?report.last_power,
            "Tracking finished"
        );
        self.sink.finished(&report);
        report
    }

    async fn drive(
        &mut self,
        sm: &mut dyn Sourcemeter,
        report: &mut TrackingReport,
    ) -> Result<FinishReason, MppError> {
        let step = self.settings.voltage_step;

        self.enter(TrackerPhase::FindingVoc);
        let voc = sm
            .find_open_circuit_voltage(self.settings.voc_hold_time)
            .await?;
        report.voc = Some(voc);
        self.check_cancel()?;

        self.enter(TrackerPhase::SweepingToInitialVmpp);
        let sweep = sm.jv_sweep(voc, SweepDirection::Reverse).await?;
        let initial_vmpp = max_power_voltage(sweep.samples())
            .ok_or_else(|| MppError::malformed("", "JV sweep returned no points"))?;
        report.initial_vmpp = Some(initial_vmpp);
        info!(initial_vmpp, "Initial maximum power point");
        self.check_cancel()?;

        self.enter(TrackerPhase::WalkingToInitialVmpp);
        let mut voltage = 0.0;
        let mut start = self.step_to(sm, voltage, report).await?;
        while voltage < initial_vmpp {
            self.check_cancel()?;
            voltage = (voltage + step).min(initial_vmpp);
            start = self.step_to(sm, voltage, report).await?;
        }

        self.enter(TrackerPhase::Tracking);
        let mut state = TrackerState::new(initial_vmpp, &start);

        loop {
            self.check_cancel()?;
            let sample = self.step_to(sm, state.vmpp, report).await?;
            state.observe(sample.power(), step);
            report.iterations += 1;

            if sample.timestamp - state.start_time >= self.settings.tracking_time.as_secs_f64() {
                return Ok(FinishReason::Deadline);
            }
        }
    }
}

#[async_trait]
impl<S: TrackingSink> SessionTask for Tracker<S> {
    type Output = TrackingReport;

    async fn execute(&mut self, sourcemeter: &mut dyn Sourcemeter) -> AppResult<TrackingReport> {
        Ok(self.run(sourcemeter).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;
    use crate::safety::{OutputMode, ProtectionLimits};
    use crate::sourcemeter::{PvCellModel, SimOp, SimulatedSourcemeter, SweepTiming};

    fn simulator() -> SimulatedSourcemeter {
        SimulatedSourcemeter::new(
            PvCellModel::default(),
            ProtectionLimits::default(),
            SweepTiming::default(),
        )
    }

    fn settings(tracking_s: u64) -> TrackerSettings {
        TrackerSettings {
            voltage_step: 0.01,
            voc_hold_time: Duration::from_secs(1),
            tracking_time: Duration::from_secs(tracking_s),
        }
    }

    #[test]
    fn rising_then_falling_power_reverses_once() {
        let start = Sample::new(0.0, 0.5, 0.0);
        let mut state = TrackerState::new(0.5, &start);
        state.previous_power = 1.0;

        let mut flips = 0;
        let mut direction = state.direction;
        for power in [2.0, 3.0, 4.0, 5.0, 4.5] {
            state.observe(power, 0.01);
            if state.direction != direction {
                flips += 1;
                direction = state.direction;
            }
        }
        assert_eq!(flips, 1);
        assert_eq!(state.direction, Direction::Down);
        // four steps up, one back
        assert!((state.vmpp - 0.53).abs() < 1e-12);
    }

    #[test]
    fn non_positive_step_falls_back_to_default() {
        let settings = TrackerSettings {
            voltage_step: 0.0,
            ..TrackerSettings::default()
        };
        let tracker = Tracker::new(settings, 1.0, MemorySink::new());
        assert_eq!(tracker.settings().voltage_step, DEFAULT_VOLTAGE_STEP);
    }

    #[test]
    fn equal_power_reverses() {
        assert_eq!(next_direction(1.0, 1.0, Direction::Up), Direction::Down);
        assert_eq!(next_direction(1.0, 2.0, Direction::Down), Direction::Up);
        assert_eq!(next_direction(3.0, 2.0, Direction::Down), Direction::Down);
    }

    #[test]
    fn errors_keep_their_kind_as_finish_reason() {
        let reason = FinishReason::from_error(&MppError::Configuration("bad step".into()));
        assert!(matches!(reason, FinishReason::Configuration(_)));
        assert!(reason.is_configuration());
        assert!(!reason.is_failure());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let reason = FinishReason::from_error(&MppError::Io(io));
        assert!(matches!(reason, FinishReason::Io(_)));
        assert!(reason.is_failure());

        let reason = FinishReason::from_error(&MppError::malformed("x", "not a number"));
        assert!(matches!(reason, FinishReason::Communication(_)));
        assert!(!reason.is_configuration());

        assert_eq!(
            FinishReason::from_error(&MppError::CancellationRequested),
            FinishReason::Cancelled
        );
    }

    #[tokio::test]
    async fn walk_starts_at_zero_and_ends_at_initial_vmpp() {
        let mut sm = simulator();
        sm.open().await.unwrap();
        let mut tracker = Tracker::new(settings(1), 1.0, MemorySink::new());

        let report = tracker.run(&mut sm).await;
        assert_eq!(report.reason, FinishReason::Deadline);
        assert_eq!(tracker.phase(), TrackerPhase::Finished);

        let initial = report.initial_vmpp.unwrap();
        let walk: Vec<f64> = tracker
            .sink()
            .phase_points(TrackerPhase::WalkingToInitialVmpp)
            .map(|p| p.sample.voltage)
            .collect();
        assert_eq!(walk[0], 0.0);
        assert!((walk.last().copied().unwrap() - initial).abs() < 1e-12);
        assert!(walk.windows(2).all(|w| w[1] > w[0] && w[1] - w[0] <= 0.01 + 1e-12));
    }

    #[tokio::test]
    async fn tracking_stays_near_true_maximum() {
        let mut sm = simulator();
        sm.open().await.unwrap();
        let model = *sm.model();
        let mut tracker = Tracker::new(settings(5), 1.0, MemorySink::new());

        let report = tracker.run(&mut sm).await;
        assert_eq!(report.reason, FinishReason::Deadline);
        assert!(report.iterations > 10);

        let vmpp = report.last_voltage.unwrap();
        let best = (0..1000)
            .map(|k| k as f64 * model.voc() / 1000.0)
            .max_by(|a, b| {
                (a * model.current_at(*a))
                    .partial_cmp(&(b * model.current_at(*b)))
                    .unwrap()
            })
            .unwrap();
        assert!((vmpp - best).abs() < 0.05, "vmpp = {vmpp}, best = {best}");
    }

    #[tokio::test]
    async fn finished_forces_zero_volts() {
        let mut sm = simulator();
        let log = sm.operation_log();
        sm.open().await.unwrap();
        let mut tracker = Tracker::new(settings(1), 1.0, MemorySink::new());
        tracker.run(&mut sm).await;

        assert_eq!(
            log.outputs().last(),
            Some(&OutputCommand::fixed(Channel::Voltage, 0.0))
        );
    }

    #[tokio::test]
    async fn cancellation_before_start_skips_tracking() {
        let mut sm = simulator();
        let log = sm.operation_log();
        sm.open().await.unwrap();
        let mut tracker = Tracker::new(settings(60), 1.0, MemorySink::new());
        tracker.cancel_flag().cancel();

        let report = tracker.run(&mut sm).await;
        assert_eq!(report.reason, FinishReason::Cancelled);
        assert!(report.voc.is_some());
        assert_eq!(report.iterations, 0);
        let biased = log.entries().into_iter().any(|op| match op {
            SimOp::SetOutput(c) => {
                c.mode == OutputMode::Fixed && c.channel == Channel::Voltage && c.value > 0.0
            }
            _ => false,
        });
        assert!(!biased);
    }

    #[tokio::test]
    async fn link_failure_reports_last_operating_point() {
        // Voc read + sweep read + a few walk reads, then the link drops.
        let mut sm = simulator().fail_after_reads(10);
        sm.open().await.unwrap();
        let mut tracker = Tracker::new(settings(60), 1.0, MemorySink::new());

        let report = tracker.run(&mut sm).await;
        assert!(matches!(report.reason, FinishReason::Communication(_)));
        assert!(report.reason.is_failure());
        assert!(report.last_voltage.is_some());
        assert_eq!(tracker.sink().report.as_ref(), Some(&report));
    }
}
