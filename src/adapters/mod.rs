//! Instrument link implementations
//!
//! An [`InstrumentLink`] turns command strings into bytes on a physical
//! interface and reads responses back. It owns exactly one hardware resource
//! (a GPIB address, a DAQ line, ...) between `open` and `close`.
//!
//! Links speak `anyhow::Result`; controllers convert failures into
//! [`MppError::Communication`](crate::error::MppError::Communication).

pub mod mock;
pub mod visa_adapter;

pub use mock::MockLink;
pub use visa_adapter::VisaLink;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Command/response channel to one instrument resource.
#[async_trait]
pub trait InstrumentLink: Send {
    /// Acquire the underlying resource.
    async fn open(&mut self) -> Result<()>;

    /// Release the underlying resource. Closing a closed link is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Send a command without reading a response.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Send a query whose answer may take longer than the configured I/O
    /// timeout. The configured timeout applies again to later transactions.
    async fn query_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<String>;

    /// I/O timeout applied to every ordinary transaction.
    fn timeout(&self) -> Duration;

    /// True between a successful `open` and `close`.
    fn is_open(&self) -> bool;

    /// Resource identifier, e.g. `GPIB0::20::INSTR`.
    fn resource(&self) -> &str;
}

/// VISA resource string for a GPIB primary address.
pub fn gpib_resource(board: u8, address: &str) -> String {
    format!("GPIB{}::{}::INSTR", board, address)
}
