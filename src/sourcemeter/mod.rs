//! Sourcemeter capability interface.
//!
//! [`Sourcemeter`] is implemented by every backend the tracker can drive:
//!
//! - [`Keithley2400`]: SCPI over an [`InstrumentLink`](crate::adapters::InstrumentLink)
//! - [`SimulatedSourcemeter`]: deterministic in-memory PV cell for dummy runs and tests
//!
//! Backends supply the primitives (reset, data format, bounded output, readback,
//! output off). The measurement protocols, open-circuit voltage and JV sweeps,
//! are provided methods built on those primitives so every backend runs the
//! exact same command sequence.

pub mod keithley2400;
pub mod simulated;

pub use keithley2400::Keithley2400;
pub use simulated::{PvCellModel, SimOp, SimulatedSourcemeter};

use crate::error::{AppResult, MppError};
use crate::measurement::{Sample, SweepResult};
use crate::safety::{Channel, OutputCommand, ProtectionLimits, SweepDirection};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Default per-point source delay for sweeps.
pub const DEFAULT_SETTLING_DELAY: Duration = Duration::from_millis(50);
/// Default JV sweep ramp rate (V/s).
pub const DEFAULT_SWEEP_RATE: f64 = 0.04;
/// Default open-circuit settling hold.
pub const DEFAULT_VOC_HOLD: Duration = Duration::from_secs(5);
/// Fewest points a sweep is ever programmed with.
pub const MIN_SWEEP_POINTS: usize = 2;
/// Most points a sweep is ever programmed with (Keithley 2400 reading buffer).
pub const MAX_SWEEP_POINTS: usize = 2500;

/// Sweep pacing shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTiming {
    /// Source delay before each sweep point is measured.
    pub settling_delay: Duration,
    /// Target ramp rate in V/s.
    pub sweep_rate: f64,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            settling_delay: DEFAULT_SETTLING_DELAY,
            sweep_rate: DEFAULT_SWEEP_RATE,
        }
    }
}

impl SweepTiming {
    /// Points needed to ramp to `target` at `rate` with one point per settling delay.
    ///
    /// `points = target / (settling_delay * rate)`, rounded and kept within
    /// [`MIN_SWEEP_POINTS`]..=[`MAX_SWEEP_POINTS`].
    pub fn points_for(&self, target: f64, rate: f64) -> usize {
        let raw = target.abs() / (self.settling_delay.as_secs_f64() * rate);
        if !raw.is_finite() {
            return MIN_SWEEP_POINTS;
        }
        let points = raw.round().min(MAX_SWEEP_POINTS as f64) as usize;
        points.clamp(MIN_SWEEP_POINTS, MAX_SWEEP_POINTS)
    }

    /// Time the instrument spends sourcing `points` points.
    pub fn duration_for(&self, points: usize) -> Duration {
        self.settling_delay * u32::try_from(points).unwrap_or(u32::MAX)
    }
}

/// Operations common to every sourcemeter backend.
#[async_trait]
pub trait Sourcemeter: Send {
    /// Human-readable backend name for logs.
    fn name(&self) -> String;

    /// Active protection envelope.
    fn limits(&self) -> &ProtectionLimits;

    /// Active sweep pacing.
    fn timing(&self) -> &SweepTiming;

    /// Acquire the instrument resource.
    async fn open(&mut self) -> AppResult<()>;

    /// Release the instrument resource.
    async fn close(&mut self) -> AppResult<()>;

    /// Restore defaults, clear the trace buffer and apply protection limits.
    async fn reset(&mut self) -> AppResult<()>;

    /// Select `(current, voltage, time)` readback. Idempotent.
    async fn configure_data_output(&mut self) -> AppResult<()>;

    /// Clamp and apply a new voltage protection, returning the effective value.
    async fn set_voltage_protection(&mut self, volts: f64) -> AppResult<f64>;

    /// Clamp and apply a new current compliance, returning the effective value.
    async fn set_current_compliance(&mut self, amps: f64) -> AppResult<f64>;

    /// Validate `command` against the limits, then program it and enable output.
    ///
    /// A command outside the envelope returns `OutputLimitExceeded` and no
    /// write reaches the instrument.
    async fn set_output(&mut self, command: &OutputCommand) -> AppResult<()>;

    /// Trigger a measurement and return every tuple it produced.
    async fn read_samples(&mut self) -> AppResult<Vec<Sample>>;

    /// Disable the source output.
    async fn output_off(&mut self) -> AppResult<()>;

    /// Block for `duration` on the controlling task.
    async fn hold(&mut self, duration: Duration) -> AppResult<()> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    /// Trigger a single fixed-mode measurement.
    async fn read_output(&mut self) -> AppResult<Sample> {
        let samples = self.read_samples().await?;
        samples
            .first()
            .copied()
            .ok_or_else(|| MppError::malformed("", "measurement returned no samples"))
    }

    /// Force zero current, settle, read the terminal voltage, then switch off.
    ///
    /// The order is fixed: settling before the read is what makes the reading
    /// stable. Output is switched off even when the read fails.
    async fn find_open_circuit_voltage(&mut self, hold_time: Duration) -> AppResult<f64> {
        info!(hold_s = hold_time.as_secs_f64(), "Finding open circuit voltage");
        self.set_output(&OutputCommand::fixed(Channel::Current, 0.0))
            .await?;
        let reading = match self.hold(hold_time).await {
            Ok(()) => self.read_output().await,
            Err(err) => Err(err),
        };
        let off = self.output_off().await;

        let voc = reading?.voltage;
        off?;
        info!(voc, "Open circuit voltage found");
        Ok(voc)
    }

    /// Run one or two voltage sweeps between 0 and `max_voltage`.
    ///
    /// `Both` runs forward then reverse and keeps the two curves separate.
    /// Output is switched off afterwards, including after a failed leg.
    async fn jv_sweep(
        &mut self,
        max_voltage: f64,
        direction: SweepDirection,
    ) -> AppResult<SweepResult> {
        let rate = self.timing().sweep_rate;
        let mut result = SweepResult::default();
        let mut outcome = Ok(());

        for &leg in direction.legs() {
            let command = OutputCommand::sweep(Channel::Voltage, max_voltage, leg, rate);
            let (start, stop) = command.span();
            info!(start, stop, ?leg, "Sweeping voltage");

            let samples = match self.set_output(&command).await {
                Ok(()) => self.read_samples().await,
                Err(err) => Err(err),
            };
            match samples {
                Ok(samples) => result.push(leg, samples),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if let Err(off_err) = self.output_off().await {
            if outcome.is_ok() {
                return Err(off_err);
            }
            warn!(error = %off_err, "Failed to switch output off after sweep error");
        }
        outcome.map(|()| result)
    }
}
