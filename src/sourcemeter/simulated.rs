//! Simulated sourcemeter for dummy runs and tests.
//!
//! Models a PV device with the ideal single-diode equation
//!
//! ```text
//! I(V) = Isc - I0 * (exp(V / (n * Vt * cells)) - 1)
//! ```
//!
//! and answers every primitive deterministically. Time is virtual: each
//! measured point advances the instrument clock by the settling delay and a
//! `hold` advances it without sleeping, so a full tracking run completes
//! instantly and produces the same samples every time.
//!
//! Every primitive is appended to a shared [`OperationLog`] so tests can
//! assert call ordering after the simulator has been moved into a session.

use super::{Sourcemeter, SweepTiming, MAX_SWEEP_POINTS};
use crate::error::{AppResult, MppError};
use crate::measurement::Sample;
use crate::safety::{Channel, OutputCommand, OutputMode, ProtectionLimits};
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Single-diode PV cell parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PvCellModel {
    /// Short-circuit (photo) current in A.
    pub isc: f64,
    /// Diode saturation current in A.
    pub saturation_current: f64,
    /// Diode ideality factor.
    pub ideality: f64,
    /// Thermal voltage kT/q in V.
    pub thermal_voltage: f64,
    /// Series-connected cells.
    pub cells: u32,
}

impl Default for PvCellModel {
    fn default() -> Self {
        Self {
            isc: 0.02,
            saturation_current: 1e-12,
            ideality: 1.5,
            thermal_voltage: 0.025_852,
            cells: 1,
        }
    }
}

impl PvCellModel {
    fn diode_scale(&self) -> f64 {
        self.ideality * self.thermal_voltage * f64::from(self.cells.max(1))
    }

    /// Terminal current when the terminal is forced to `voltage`.
    pub fn current_at(&self, voltage: f64) -> f64 {
        self.isc - self.saturation_current * ((voltage / self.diode_scale()).exp() - 1.0)
    }

    /// Terminal voltage when `current` is drawn from the device.
    pub fn voltage_at(&self, current: f64) -> f64 {
        let headroom = self.isc - current;
        if headroom <= 0.0 {
            return 0.0;
        }
        self.diode_scale() * (headroom / self.saturation_current + 1.0).ln()
    }

    /// Open-circuit voltage.
    pub fn voc(&self) -> f64 {
        self.voltage_at(0.0)
    }
}

/// Primitive observed by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    /// Resource acquired.
    Open,
    /// Resource released.
    Close,
    /// Instrument reset.
    Reset,
    /// Readback format selected.
    ConfigureDataOutput,
    /// Accepted output command.
    SetOutput(OutputCommand),
    /// Virtual-time wait.
    Hold(Duration),
    /// Measurement triggered.
    Read,
    /// Output disabled.
    OutputOff,
}

/// Shared, clonable record of simulator primitives.
#[derive(Debug, Clone, Default)]
pub struct OperationLog(Arc<Mutex<Vec<SimOp>>>);

impl OperationLog {
    fn push(&self, op: SimOp) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(op);
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<SimOp> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Output commands in the order they were accepted.
    pub fn outputs(&self) -> Vec<OutputCommand> {
        self.entries()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::SetOutput(command) => Some(command),
                _ => None,
            })
            .collect()
    }
}

/// Deterministic in-memory sourcemeter.
pub struct SimulatedSourcemeter {
    model: PvCellModel,
    limits: ProtectionLimits,
    timing: SweepTiming,
    open: bool,
    output_on: bool,
    source: Option<OutputCommand>,
    clock: f64,
    reads: usize,
    fail_after_reads: Option<usize>,
    log: OperationLog,
}

impl SimulatedSourcemeter {
    /// Closed simulator with output off.
    pub fn new(model: PvCellModel, limits: ProtectionLimits, timing: SweepTiming) -> Self {
        Self {
            model,
            limits,
            timing,
            open: false,
            output_on: false,
            source: None,
            clock: 0.0,
            reads: 0,
            fail_after_reads: None,
            log: OperationLog::default(),
        }
    }

    /// Make every read after the first `reads` fail like a dropped link.
    pub fn fail_after_reads(mut self, reads: usize) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    /// Handle to the operation log that survives moving the simulator.
    pub fn operation_log(&self) -> OperationLog {
        self.log.clone()
    }

    /// Device model being simulated.
    pub fn model(&self) -> &PvCellModel {
        &self.model
    }

    /// Whether the source output is enabled.
    pub fn is_output_on(&self) -> bool {
        self.output_on
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(anyhow!("Simulated sourcemeter not open").into())
        }
    }

    fn measure(&mut self, channel: Channel, value: f64) -> Sample {
        self.clock += self.timing.settling_delay.as_secs_f64();
        let compliance = self.limits.current_compliance();
        let (current, voltage) = match channel {
            Channel::Voltage => (
                self.model.current_at(value).clamp(-compliance, compliance),
                value,
            ),
            Channel::Current => (
                value,
                self.model
                    .voltage_at(value)
                    .min(self.limits.voltage_protection()),
            ),
        };
        Sample::new(current, voltage, self.clock)
    }

    fn sweep_values(&self, command: &OutputCommand) -> Vec<f64> {
        match &command.mode {
            OutputMode::Fixed => vec![command.value],
            OutputMode::Sweep { rate, .. } => {
                let (start, stop) = command.span();
                let points = self.timing.points_for(command.value, *rate);
                let step = (stop - start) / (points - 1) as f64;
                (0..points).map(|k| start + step * k as f64).collect()
            }
            OutputMode::List(points) => points.iter().copied().take(MAX_SWEEP_POINTS).collect(),
        }
    }
}

#[async_trait]
impl Sourcemeter for SimulatedSourcemeter {
    fn name(&self) -> String {
        "Simulated sourcemeter".to_string()
    }

    fn limits(&self) -> &ProtectionLimits {
        &self.limits
    }

    fn timing(&self) -> &SweepTiming {
        &self.timing
    }

    async fn open(&mut self) -> AppResult<()> {
        self.log.push(SimOp::Open);
        self.open = true;
        info!("Simulated sourcemeter acquired.");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log.push(SimOp::Close);
        self.open = false;
        info!("Released simulated sourcemeter.");
        Ok(())
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.log.push(SimOp::Reset);
        self.output_on = false;
        self.source = None;
        debug!("Simulated sourcemeter reset");
        Ok(())
    }

    async fn configure_data_output(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.log.push(SimOp::ConfigureDataOutput);
        Ok(())
    }

    async fn set_voltage_protection(&mut self, volts: f64) -> AppResult<f64> {
        Ok(self.limits.set_voltage_protection(volts))
    }

    async fn set_current_compliance(&mut self, amps: f64) -> AppResult<f64> {
        Ok(self.limits.set_current_compliance(amps))
    }

    async fn set_output(&mut self, command: &OutputCommand) -> AppResult<()> {
        self.limits.validate(command)?;
        self.ensure_open()?;
        self.log.push(SimOp::SetOutput(command.clone()));
        self.source = Some(command.clone());
        self.output_on = true;
        Ok(())
    }

    async fn read_samples(&mut self) -> AppResult<Vec<Sample>> {
        self.ensure_open()?;
        self.log.push(SimOp::Read);
        if let Some(limit) = self.fail_after_reads {
            if self.reads >= limit {
                return Err(MppError::Communication(anyhow!(
                    "Simulated link failure after {} reads",
                    limit
                )));
            }
        }
        self.reads += 1;

        let source = match (&self.source, self.output_on) {
            (Some(source), true) => source.clone(),
            // Output off: the terminals float at open circuit.
            _ => OutputCommand::fixed(Channel::Current, 0.0),
        };
        let values = self.sweep_values(&source);
        Ok(values
            .into_iter()
            .map(|value| self.measure(source.channel, value))
            .collect())
    }

    async fn output_off(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.log.push(SimOp::OutputOff);
        self.output_on = false;
        Ok(())
    }

    async fn hold(&mut self, duration: Duration) -> AppResult<()> {
        self.log.push(SimOp::Hold(duration));
        self.clock += duration.as_secs_f64();
        Ok(())
    }
}
