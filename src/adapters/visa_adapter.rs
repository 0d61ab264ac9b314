//! VISA instrument link for GPIB/USB/Ethernet instruments
//!
//! Implements [`InstrumentLink`] on top of the `visa-rs` crate. VISA calls are
//! blocking, so every transaction runs on Tokio's blocking pool while the
//! caller awaits it; the link still carries one command at a time.
//!
//! The configured timeout is both the open timeout and the I/O timeout
//! (`VI_ATTR_TMO_VALUE`). It is written to the session before every
//! transaction, so a longer per-query timeout never outlives its query.
//!
//! Supports resource strings like:
//! - "GPIB0::20::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2400::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! Without the `instrument_visa` feature every operation fails with a
//! message explaining how to enable it.

use super::InstrumentLink;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

#[cfg(feature = "instrument_visa")]
struct VisaSession {
    // Dropping the resource manager closes every session it opened.
    _rm: DefaultRM,
    instrument: Instrument,
}

/// VISA link to a single instrument resource.
pub struct VisaLink {
    /// VISA resource string (e.g., "GPIB0::20::INSTR")
    pub(crate) resource_string: String,

    /// Open and I/O timeout
    pub(crate) timeout: Duration,

    /// Line terminator appended to commands
    pub(crate) line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaLink {
    /// Create a new VISA link with default settings
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(60),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    /// Set the open and I/O timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    #[cfg(feature = "instrument_visa")]
    async fn transact(
        &self,
        command: &str,
        expect_response: bool,
        timeout: Duration,
    ) -> Result<String> {
        use std::io::{BufRead, BufReader, Write};

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("VISA resource '{}' not open", self.resource_string))?
            .clone();
        let command_str = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = session
                .lock()
                .map_err(|_| anyhow!("VISA session lock poisoned"))?;
            set_io_timeout(&guard.instrument, timeout)?;
            let mut instr = &guard.instrument;

            instr
                .write_all(command_str.as_bytes())
                .with_context(|| format!("VISA write failed for: {}", command_for_log))?;

            if !expect_response {
                debug!(command = %command_for_log, "VISA write sent");
                return Ok(String::new());
            }

            let mut response = String::new();
            BufReader::new(instr)
                .read_line(&mut response)
                .with_context(|| format!("VISA read failed for: {}", command_for_log))?;
            let response = response.trim().to_string();
            debug!(command = %command_for_log, response = %response, "VISA query");
            Ok(response)
        })
        .await
        .context("VISA I/O task panicked")?
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn transact(
        &self,
        _command: &str,
        _expect_response: bool,
        _timeout: Duration,
    ) -> Result<String> {
        Err(feature_disabled())
    }
}

/// Milliseconds for `VI_ATTR_TMO_VALUE`, saturating at the attribute's range.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
pub(crate) fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(feature = "instrument_visa")]
fn set_io_timeout(instrument: &Instrument, timeout: Duration) -> Result<()> {
    let millis = timeout_millis(timeout);
    let attr = attribute::AttrTmoValue::new_checked(millis)
        .ok_or_else(|| anyhow!("VISA timeout of {}ms is out of range", millis))?;
    instrument
        .set_attr(attr)
        .with_context(|| format!("Failed to set VISA timeout to {}ms", millis))
}

#[cfg(not(feature = "instrument_visa"))]
fn feature_disabled() -> anyhow::Error {
    anyhow!("VISA support not enabled. Rebuild with --features instrument_visa")
}

#[async_trait]
impl InstrumentLink for VisaLink {
    async fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource_str = self.resource_string.clone();
            let timeout = self.timeout;

            let session = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
                let c_string = std::ffi::CString::new(resource_str.clone())
                    .context("Resource string contains a NUL byte")?;
                let visa_string = visa_rs::VisaString::from(c_string);
                let instrument = rm
                    .open(&visa_string, AccessMode::NO_LOCK, timeout)
                    .with_context(|| format!("Failed to open VISA resource: {}", resource_str))?;
                set_io_timeout(&instrument, timeout)?;
                Ok::<VisaSession, anyhow::Error>(VisaSession {
                    _rm: rm,
                    instrument,
                })
            })
            .await
            .context("VISA open task panicked")??;

            self.session = Some(Arc::new(Mutex::new(session)));
            debug!(
                resource = %self.resource_string,
                timeout_ms = timeout_millis(self.timeout),
                "VISA resource opened"
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(feature_disabled())
        }
    }

    async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.session.take().is_some() {
                debug!(resource = %self.resource_string, "VISA resource closed");
            }
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.transact(command, false, self.timeout).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.transact(command, true, self.timeout).await
    }

    async fn query_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.transact(command, true, timeout).await
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.session.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    fn resource(&self) -> &str {
        &self.resource_string
    }
}
