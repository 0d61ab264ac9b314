//! Keithley 2400 SourceMeter driver
//!
//! Drives a Keithley 2400 over any [`InstrumentLink`] using SCPI. The driver
//! keeps the protection envelope locally and validates every output command
//! before the first byte is written.
//!
//! ## Command surface
//!
//! | Operation              | SCPI                                                       |
//! |------------------------|------------------------------------------------------------|
//! | reset                  | `*RST`, `:TRAC:CLE`, sense functions, protection, ranges   |
//! | data output            | `:FORM:ELEM CURR,VOLT,TIME`                                |
//! | fixed output           | `:SOUR:FUNC`, `:SOUR:<F>:MODE FIX`, `:SOUR:<F> <v>`        |
//! | sweep output           | `... MODE SWE`, `:SOUR:SWE:SPAC LIN`, `:SOUR:DEL`, start/stop/points |
//! | list output            | `... MODE LIST`, `:SOUR:LIST:<F> v1,v2,...`                |
//! | trigger count          | `:TRIG:COUN <n>`                                           |
//! | output                 | `:OUTP ON` / `:OUTP OFF`                                   |
//! | read                   | `:READ?` → `v,i,t[,v,i,t...]`                              |
//!
//! The 2400 always returns data elements in its own fixed order (voltage,
//! current, resistance, time, status), whatever order `:FORM:ELEM` lists them
//! in, so readings are parsed voltage first.
//!
//! A sweep answers `:READ?` only after its last point. The read is given the
//! sweep's sourcing time plus [`READ_MARGIN`] when that exceeds the link's
//! own I/O timeout.

use super::{Sourcemeter, SweepTiming, MAX_SWEEP_POINTS};
use crate::adapters::InstrumentLink;
use crate::error::AppResult;
use crate::measurement::{parse_readback, ElementOrder, Sample};
use crate::safety::{Channel, OutputCommand, OutputMode, ProtectionLimits};
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Element order of `:READ?` data on the wire.
pub const WIRE_ORDER: ElementOrder = ElementOrder::VoltageCurrentTime;

/// Slack added to a read's expected sourcing time.
pub const READ_MARGIN: Duration = Duration::from_secs(10);

fn function(channel: Channel) -> &'static str {
    match channel {
        Channel::Current => "CURR",
        Channel::Voltage => "VOLT",
    }
}

/// Keithley 2400 controller owning its instrument link.
pub struct Keithley2400<L> {
    link: L,
    limits: ProtectionLimits,
    timing: SweepTiming,
    /// Trigger count of the last programmed output.
    points: usize,
}

impl<L: InstrumentLink> Keithley2400<L> {
    /// Wrap `link`; nothing is sent until the session opens it.
    pub fn new(link: L, limits: ProtectionLimits, timing: SweepTiming) -> Self {
        Self {
            link,
            limits,
            timing,
            points: 1,
        }
    }

    /// The underlying instrument link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// I/O timeout for the next `:READ?`.
    pub fn read_timeout(&self) -> Duration {
        let needed = self.timing.duration_for(self.points) + READ_MARGIN;
        needed.max(self.link.timeout())
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        debug!(command, "Keithley write");
        self.link
            .write(command)
            .await
            .with_context(|| format!("Keithley at {} rejected `{}`", self.link.resource(), command))?;
        Ok(())
    }

    async fn send_all(&mut self, commands: &[String]) -> AppResult<()> {
        for command in commands {
            self.send(command).await?;
        }
        Ok(())
    }

    fn protection_commands(&self) -> Vec<String> {
        let volts = self.limits.voltage_protection();
        let amps = self.limits.current_compliance();
        vec![
            ":SENS:FUNC:CONC ON".to_string(),
            ":SENS:FUNC \"VOLT\",\"CURR\"".to_string(),
            format!(":SENS:VOLT:PROT {}", volts),
            format!(":SENS:VOLT:RANG {}", volts),
            format!(":SENS:CURR:PROT {}", amps),
            format!(":SENS:CURR:RANG {}", amps),
        ]
    }

    fn trigger_count(&self, command: &OutputCommand) -> usize {
        match &command.mode {
            OutputMode::Fixed => 1,
            OutputMode::Sweep { rate, .. } => self.timing.points_for(command.value, *rate),
            OutputMode::List(points) => points.len().min(MAX_SWEEP_POINTS),
        }
    }

    fn output_commands(&self, command: &OutputCommand) -> Vec<String> {
        let f = function(command.channel);
        let points = self.trigger_count(command);
        let mut commands = vec![format!(":SOUR:FUNC {}", f)];

        match &command.mode {
            OutputMode::Fixed => {
                commands.push(format!(":SOUR:{}:MODE FIX", f));
                commands.push(format!(":SOUR:{} {}", f, command.value));
                commands.push(":TRIG:COUN 1".to_string());
            }
            OutputMode::Sweep { .. } => {
                let (start, stop) = command.span();
                commands.push(format!(":SOUR:{}:MODE SWE", f));
                commands.push(":SOUR:SWE:SPAC LIN".to_string());
                commands.push(format!(
                    ":SOUR:DEL {}",
                    self.timing.settling_delay.as_secs_f64()
                ));
                commands.push(format!(":SOUR:{}:STAR {}", f, start));
                commands.push(format!(":SOUR:{}:STOP {}", f, stop));
                commands.push(format!(":SOUR:SWE:POIN {}", points));
                commands.push(format!(":TRIG:COUN {}", points));
            }
            OutputMode::List(values) => {
                let values = values
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                commands.push(format!(":SOUR:{}:MODE LIST", f));
                commands.push(format!(":SOUR:LIST:{} {}", f, values));
                commands.push(format!(
                    ":SOUR:DEL {}",
                    self.timing.settling_delay.as_secs_f64()
                ));
                commands.push(format!(":TRIG:COUN {}", points));
            }
        }

        commands.push(":OUTP ON".to_string());
        commands
    }
}

#[async_trait]
impl<L: InstrumentLink> Sourcemeter for Keithley2400<L> {
    fn name(&self) -> String {
        format!("Keithley 2400 ({})", self.link.resource())
    }

    fn limits(&self) -> &ProtectionLimits {
        &self.limits
    }

    fn timing(&self) -> &SweepTiming {
        &self.timing
    }

    async fn open(&mut self) -> AppResult<()> {
        let resource = self.link.resource().to_string();
        self.link
            .open()
            .await
            .with_context(|| format!("Keithley resource could not be acquired at address '{}'", resource))?;
        info!("Keithley acquired at address {}.", resource);
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let resource = self.link.resource().to_string();
        self.link
            .close()
            .await
            .with_context(|| format!("Failed to release Keithley at address '{}'", resource))?;
        info!("Released Keithley at address {}.", resource);
        Ok(())
    }

    async fn reset(&mut self) -> AppResult<()> {
        info!("Resetting Keithley");
        let mut commands = vec!["*RST".to_string(), ":TRAC:CLE".to_string()];
        commands.extend(self.protection_commands());
        self.send_all(&commands).await
    }

    async fn configure_data_output(&mut self) -> AppResult<()> {
        self.send(":FORM:ELEM CURR,VOLT,TIME").await?;
        info!("Sourcemeter set to output current, voltage, time.");
        Ok(())
    }

    async fn set_voltage_protection(&mut self, volts: f64) -> AppResult<f64> {
        let effective = self.limits.set_voltage_protection(volts);
        self.send_all(&[
            format!(":SENS:VOLT:PROT {}", effective),
            format!(":SENS:VOLT:RANG {}", effective),
        ])
        .await?;
        Ok(effective)
    }

    async fn set_current_compliance(&mut self, amps: f64) -> AppResult<f64> {
        let effective = self.limits.set_current_compliance(amps);
        self.send_all(&[
            format!(":SENS:CURR:PROT {}", effective),
            format!(":SENS:CURR:RANG {}", effective),
        ])
        .await?;
        Ok(effective)
    }

    async fn set_output(&mut self, command: &OutputCommand) -> AppResult<()> {
        self.limits.validate(command)?;
        let commands = self.output_commands(command);
        self.points = self.trigger_count(command);
        self.send_all(&commands).await?;
        debug!(channel = %command.channel, value = command.value, "Output set");
        Ok(())
    }

    async fn read_samples(&mut self) -> AppResult<Vec<Sample>> {
        let timeout = self.read_timeout();
        let response = self
            .link
            .query_with_timeout(":READ?", timeout)
            .await
            .with_context(|| format!("Keithley at {} failed to read", self.link.resource()))?;
        parse_readback(&response, WIRE_ORDER)
    }

    async fn output_off(&mut self) -> AppResult<()> {
        self.send(":OUTP OFF").await?;
        info!("Sourcemeter output off");
        Ok(())
    }
}
