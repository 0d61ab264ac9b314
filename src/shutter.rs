//! Shutter actuators.
//!
//! A shutter blocks or admits light and is driven as a plain on/off line.
//! `acquire` takes the line and opens the light path; `release` closes the
//! shutter and frees the line. The resource scope calls `release`
//! unconditionally on exit, after the sourcemeter has been released.

use crate::adapters::InstrumentLink;
use crate::error::AppResult;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Default digital line command that opens the light path (line low).
pub const DEFAULT_OPEN_COMMAND: &str = ":SOUR2:TTL 0";
/// Default digital line command that closes the shutter (line high).
pub const DEFAULT_CLOSE_COMMAND: &str = ":SOUR2:TTL 1";

/// On/off light actuator with an acquire/release lifecycle.
#[async_trait]
pub trait Shutter: Send {
    /// Human-readable name for logs.
    fn name(&self) -> String;

    /// Take the output line and open the shutter.
    async fn acquire(&mut self) -> AppResult<()>;

    /// Close the shutter and release the line. Safe to call when not acquired.
    async fn release(&mut self) -> AppResult<()>;

    /// Whether the shutter is currently held open.
    fn is_acquired(&self) -> bool;
}

/// Shutter driven by a digital output line behind its own instrument link.
pub struct LinkShutter<L> {
    link: L,
    open_command: String,
    close_command: String,
    acquired: bool,
}

impl<L: InstrumentLink> LinkShutter<L> {
    /// Shutter on `link` using the default TTL commands.
    pub fn new(link: L) -> Self {
        Self::with_commands(link, DEFAULT_OPEN_COMMAND, DEFAULT_CLOSE_COMMAND)
    }

    /// Shutter on `link` with custom open and close commands.
    pub fn with_commands(
        link: L,
        open_command: impl Into<String>,
        close_command: impl Into<String>,
    ) -> Self {
        Self {
            link,
            open_command: open_command.into(),
            close_command: close_command.into(),
            acquired: false,
        }
    }
}

#[async_trait]
impl<L: InstrumentLink> Shutter for LinkShutter<L> {
    fn name(&self) -> String {
        format!("Shutter ({})", self.link.resource())
    }

    async fn acquire(&mut self) -> AppResult<()> {
        let resource = self.link.resource().to_string();
        self.link
            .open()
            .await
            .with_context(|| format!("Error communicating with shutter at channel {}", resource))?;

        if let Err(err) = self.link.write(&self.open_command).await {
            error!(channel = %resource, error = %err, "Error communicating with shutter");
            if let Err(close_err) = self.link.close().await {
                error!(error = %close_err, "Error releasing shutter control");
            }
            return Err(err
                .context(format!("Error communicating with shutter at channel {}", resource))
                .into());
        }

        self.acquired = true;
        info!("Shutter opened.");
        Ok(())
    }

    async fn release(&mut self) -> AppResult<()> {
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;
        let resource = self.link.resource().to_string();

        let closed = self.link.write(&self.close_command).await;
        let released = self.link.close().await;
        info!("Closed shutter control at {}.", resource);

        closed.context("Error closing shutter")?;
        released.context("Error releasing shutter control")?;
        Ok(())
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }
}

/// Stand-in shutter for dummy runs.
#[derive(Clone, Default)]
pub struct DummyShutter {
    acquired: Arc<AtomicBool>,
}

impl DummyShutter {
    /// Closed dummy shutter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Shutter for DummyShutter {
    fn name(&self) -> String {
        "Dummy shutter".to_string()
    }

    async fn acquire(&mut self) -> AppResult<()> {
        self.acquired.store(true, Ordering::SeqCst);
        info!("Shutter opened.");
        Ok(())
    }

    async fn release(&mut self) -> AppResult<()> {
        if self.acquired.swap(false, Ordering::SeqCst) {
            info!("Closed shutter.");
        }
        Ok(())
    }

    fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }
}
