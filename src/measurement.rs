//! Readings returned by the sourcemeter.
//!
//! Samples are always held as `(current, voltage, time)`. Instruments may put
//! the elements on the wire in another order, so the parser takes an
//! [`ElementOrder`]. A fixed-mode read returns one tuple, a sweep returns one
//! tuple per point, flattened into a single comma-separated line.

use crate::error::{AppResult, MppError};
use crate::safety::SweepLeg;
use serde::{Deserialize, Serialize};

/// Number of values per readback tuple.
pub const ELEMENTS_PER_SAMPLE: usize = 3;

/// One `(current, voltage, time)` reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Measured or sourced current (A).
    pub current: f64,
    /// Measured or sourced voltage (V).
    pub voltage: f64,
    /// Instrument timestamp (s).
    pub timestamp: f64,
}

impl Sample {
    /// Build a sample from its `(current, voltage, time)` parts.
    pub fn new(current: f64, voltage: f64, timestamp: f64) -> Self {
        Self {
            current,
            voltage,
            timestamp,
        }
    }

    /// Output power magnitude |V·I| (W).
    pub fn power(&self) -> f64 {
        (self.voltage * self.current).abs()
    }
}

/// Samples of one sweep leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepCurve {
    /// Which way the ramp ran.
    pub direction: SweepLeg,
    /// Points in acquisition order.
    pub samples: Vec<Sample>,
}

/// Result of one `jv_sweep` call: one curve per requested leg, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Measured legs in acquisition order.
    pub curves: Vec<SweepCurve>,
}

impl SweepResult {
    /// Append the samples of one leg.
    pub fn push(&mut self, direction: SweepLeg, samples: Vec<Sample>) {
        self.curves.push(SweepCurve { direction, samples });
    }

    /// First forward curve, if one was measured.
    pub fn forward(&self) -> Option<&SweepCurve> {
        self.curves.iter().find(|c| c.direction == SweepLeg::Forward)
    }

    /// First reverse curve, if one was measured.
    pub fn reverse(&self) -> Option<&SweepCurve> {
        self.curves.iter().find(|c| c.direction == SweepLeg::Reverse)
    }

    /// All samples across curves, in acquisition order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.curves.iter().flat_map(|c| c.samples.iter())
    }

    /// True when no leg produced any sample.
    pub fn is_empty(&self) -> bool {
        self.samples().next().is_none()
    }
}

/// Voltage at which |V·I| is largest.
///
/// The first point wins on ties. Points with a NaN power are ignored.
pub fn max_power_voltage<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> Option<f64> {
    let mut best: Option<&Sample> = None;
    for sample in samples {
        let power = sample.power();
        if power.is_nan() {
            continue;
        }
        match best {
            Some(current) if current.power() >= power => {}
            _ => best = Some(sample),
        }
    }
    best.map(|s| s.voltage)
}

/// Order of the three elements within one readback tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementOrder {
    /// `current, voltage, time`
    CurrentVoltageTime,
    /// `voltage, current, time`
    VoltageCurrentTime,
}

impl ElementOrder {
    fn sample(self, chunk: &[f64]) -> Sample {
        match self {
            ElementOrder::CurrentVoltageTime => Sample::new(chunk[0], chunk[1], chunk[2]),
            ElementOrder::VoltageCurrentTime => Sample::new(chunk[1], chunk[0], chunk[2]),
        }
    }
}

/// Parse a `:READ?` response laid out as `order` into samples.
pub fn parse_readback(response: &str, order: ElementOrder) -> AppResult<Vec<Sample>> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(MppError::malformed(response, "empty response"));
    }

    let values = trimmed
        .split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|e| MppError::malformed(response, format!("'{}': {}", field.trim(), e)))
        })
        .collect::<AppResult<Vec<f64>>>()?;

    if values.len() % ELEMENTS_PER_SAMPLE != 0 {
        return Err(MppError::malformed(
            response,
            format!(
                "{} values is not a whole number of {}-element tuples",
                values.len(),
                ELEMENTS_PER_SAMPLE
            ),
        ));
    }

    Ok(values
        .chunks_exact(ELEMENTS_PER_SAMPLE)
        .map(|chunk| order.sample(chunk))
        .collect())
}
