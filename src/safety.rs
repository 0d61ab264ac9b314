//! Safety envelope for sourcemeter output.
//!
//! Two layers of protection are enforced here before anything reaches the
//! instrument:
//!
//! 1. **Absolute ceilings** per sourcemeter/fixture class. The defaults cover a
//!    5-cell test fixture (6 V, 0.288 A) and should only be raised for larger
//!    active areas or more cells.
//! 2. **User protection limits** (voltage protection and current compliance),
//!    which are clamped into `(0, ceiling]` at configuration time. An
//!    out-of-range request is never rejected; it is replaced by the nearest
//!    safe bound and a warning is logged.
//!
//! Every [`OutputCommand`] is checked by [`ProtectionLimits::validate`] before
//! a controller issues a single byte to the hardware.

use crate::error::{AppResult, MppError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Hardware ceiling for sourced/sensed voltage (V).
pub const ABSOLUTE_MAX_VOLTAGE: f64 = 6.0;
/// Hardware ceiling for sourced/sensed current (A).
pub const ABSOLUTE_MAX_CURRENT: f64 = 0.288;
/// Default voltage protection, enough for three cells at 1.2 V.
pub const DEFAULT_VOLTAGE_PROTECTION: f64 = 3.6;
/// Default current compliance, 24 mA/cm² over 2.4 cm².
pub const DEFAULT_CURRENT_COMPLIANCE: f64 = 0.058;

/// Quantity sourced by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Force current, measure voltage.
    Current,
    /// Force voltage, measure current.
    Voltage,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Current => write!(f, "current"),
            Channel::Voltage => write!(f, "voltage"),
        }
    }
}

/// Direction of a single programmed ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepLeg {
    /// 0 → target
    Forward,
    /// target → 0
    Reverse,
}

/// Direction requested for a JV sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepDirection {
    /// Single 0 → Vmax ramp.
    Forward,
    /// Single Vmax → 0 ramp.
    Reverse,
    /// Forward followed by reverse, kept as two curves.
    Both,
}

impl SweepDirection {
    /// Ramps issued for this request, in order.
    pub fn legs(self) -> &'static [SweepLeg] {
        match self {
            SweepDirection::Forward => &[SweepLeg::Forward],
            SweepDirection::Reverse => &[SweepLeg::Reverse],
            SweepDirection::Both => &[SweepLeg::Forward, SweepLeg::Reverse],
        }
    }
}

/// How the source value is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Hold a single value.
    Fixed,
    /// Linear ramp between 0 and the command value.
    Sweep {
        /// Ramp ordering.
        direction: SweepLeg,
        /// Target ramp rate in units per second.
        rate: f64,
    },
    /// Step through an explicit list of values.
    List(Vec<f64>),
}

/// One request to drive the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCommand {
    /// Sourced quantity.
    pub channel: Channel,
    /// Fixed, sweep or list.
    pub mode: OutputMode,
    /// Fixed value, sweep target, or list maximum.
    pub value: f64,
}

impl OutputCommand {
    /// Hold `value` on `channel`.
    pub fn fixed(channel: Channel, value: f64) -> Self {
        Self {
            channel,
            mode: OutputMode::Fixed,
            value,
        }
    }

    /// Ramp `channel` between 0 and `target`.
    pub fn sweep(channel: Channel, target: f64, direction: SweepLeg, rate: f64) -> Self {
        Self {
            channel,
            mode: OutputMode::Sweep { direction, rate },
            value: target,
        }
    }

    /// Step `channel` through `points`.
    pub fn list(channel: Channel, points: Vec<f64>) -> Self {
        let value = points.iter().copied().fold(0.0, f64::max);
        Self {
            channel,
            mode: OutputMode::List(points),
            value,
        }
    }

    /// Start and stop values of a sweep, ordered by its direction.
    ///
    /// Non-sweep commands return `(value, value)`.
    pub fn span(&self) -> (f64, f64) {
        match self.mode {
            OutputMode::Sweep {
                direction: SweepLeg::Forward,
                ..
            } => (0.0, self.value),
            OutputMode::Sweep {
                direction: SweepLeg::Reverse,
                ..
            } => (self.value, 0.0),
            _ => (self.value, self.value),
        }
    }

    fn values(&self) -> Vec<f64> {
        match &self.mode {
            OutputMode::List(points) => points.clone(),
            _ => vec![self.value],
        }
    }
}

/// Clamp a requested protection value into `(0, ceiling]`.
///
/// Values above the ceiling become the ceiling. Zero, negative and NaN values
/// are treated as unset and also become the ceiling. Both cases log a warning.
pub fn clamp(requested: f64, ceiling: f64) -> f64 {
    if requested > ceiling {
        warn!(
            requested,
            ceiling, "Protection limit requested above hardware ceiling; limiting to ceiling"
        );
        ceiling
    } else if requested.is_nan() || requested <= 0.0 {
        warn!(
            requested,
            ceiling, "Protection limit requested too low; defaulting to hardware ceiling"
        );
        ceiling
    } else {
        requested
    }
}

/// Absolute ceilings plus the clamped user limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionLimits {
    absolute_max_voltage: f64,
    absolute_max_current: f64,
    voltage_protection: f64,
    current_compliance: f64,
}

impl Default for ProtectionLimits {
    fn default() -> Self {
        Self::new(
            ABSOLUTE_MAX_VOLTAGE,
            ABSOLUTE_MAX_CURRENT,
            DEFAULT_VOLTAGE_PROTECTION,
            DEFAULT_CURRENT_COMPLIANCE,
        )
    }
}

impl ProtectionLimits {
    /// Build limits for a fixture class, clamping the user values.
    pub fn new(
        absolute_max_voltage: f64,
        absolute_max_current: f64,
        voltage_protection: f64,
        current_compliance: f64,
    ) -> Self {
        let mut limits = Self {
            absolute_max_voltage,
            absolute_max_current,
            voltage_protection: absolute_max_voltage,
            current_compliance: absolute_max_current,
        };
        limits.set_voltage_protection(voltage_protection);
        limits.set_current_compliance(current_compliance);
        limits
    }

    /// Limits against the default fixture ceilings.
    pub fn with_protection(voltage_protection: f64, current_compliance: f64) -> Self {
        Self::new(
            ABSOLUTE_MAX_VOLTAGE,
            ABSOLUTE_MAX_CURRENT,
            voltage_protection,
            current_compliance,
        )
    }

    /// Set voltage protection, returning the effective (clamped) value.
    pub fn set_voltage_protection(&mut self, volts: f64) -> f64 {
        self.voltage_protection = clamp(volts, self.absolute_max_voltage);
        info!(volts = self.voltage_protection, "Voltage protection set");
        self.voltage_protection
    }

    /// Set current compliance, returning the effective (clamped) value.
    pub fn set_current_compliance(&mut self, amps: f64) -> f64 {
        self.current_compliance = clamp(amps, self.absolute_max_current);
        info!(amps = self.current_compliance, "Current compliance set");
        self.current_compliance
    }

    /// Hardware ceiling for the voltage protection (V).
    pub fn absolute_max_voltage(&self) -> f64 {
        self.absolute_max_voltage
    }

    /// Hardware ceiling for the current compliance (A).
    pub fn absolute_max_current(&self) -> f64 {
        self.absolute_max_current
    }

    /// Active voltage protection (V).
    pub fn voltage_protection(&self) -> f64 {
        self.voltage_protection
    }

    /// Active current compliance (A).
    pub fn current_compliance(&self) -> f64 {
        self.current_compliance
    }

    /// Upper bound for commands on `channel`.
    pub fn limit_for(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Voltage => self.voltage_protection,
            Channel::Current => self.current_compliance,
        }
    }

    /// Reject any command whose value falls outside `[0, limit_for(channel)]`.
    pub fn validate(&self, command: &OutputCommand) -> AppResult<()> {
        let limit = self.limit_for(command.channel);
        for value in command.values() {
            if !(0.0..=limit).contains(&value) {
                return Err(MppError::OutputLimitExceeded {
                    channel: command.channel,
                    value,
                    limit,
                });
            }
        }
        Ok(())
    }
}
