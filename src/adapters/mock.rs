//! Mock instrument link for testing
//!
//! Provides a scripted stand-in for a GPIB resource:
//! - Call logging for test verification
//! - Scripted query responses (FIFO) with an optional fallback response
//! - Controllable failure injection
//! - The I/O timeout each query was given
//!
//! Clones share state, so a test can keep a handle after moving the link into
//! a controller and inspect everything that reached the "wire".

use super::InstrumentLink;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// I/O timeout of a freshly created mock link.
pub const DEFAULT_MOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// One operation observed by the mock link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// `open` was called.
    Open,
    /// `close` was called.
    Close,
    /// A command was written.
    Write(String),
    /// A query was sent.
    Query(String),
}

#[derive(Default)]
struct Script {
    responses: VecDeque<String>,
    fallback: Option<String>,
    fail_on: Vec<String>,
}

/// Mock instrument link
///
/// # Example
///
/// ```
/// use mppt_daq::adapters::{InstrumentLink, MockLink};
///
/// # tokio_test_block(async {
/// let mut link = MockLink::new("GPIB0::20::INSTR").with_response("0.004,0.96,1.0");
/// let spy = link.clone();
/// link.open().await.unwrap();
/// assert_eq!(link.query(":READ?").await.unwrap(), "0.004,0.96,1.0");
/// assert_eq!(spy.queries(), vec![":READ?".to_string()]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct MockLink {
    resource: String,
    timeout: Duration,
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    script: Arc<Mutex<Script>>,
    call_log: Arc<Mutex<Vec<LinkCall>>>,
    query_timeouts: Arc<Mutex<Vec<(String, Duration)>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockLink {
    /// Create a closed mock link for `resource`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: DEFAULT_MOCK_TIMEOUT,
            connected: Arc::new(AtomicBool::new(false)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            script: Arc::new(Mutex::new(Script::default())),
            call_log: Arc::new(Mutex::new(Vec::new())),
            query_timeouts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the I/O timeout reported for ordinary transactions.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Queue a response for the next unanswered query.
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.push_response(response);
        self
    }

    /// Answer every query with `response` once the queue is empty.
    pub fn with_fallback_response(self, response: impl Into<String>) -> Self {
        lock(&self.script).fallback = Some(response.into());
        self
    }

    /// Queue a response after the link has been moved into a controller.
    pub fn push_response(&self, response: impl Into<String>) {
        lock(&self.script).responses.push_back(response.into());
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail every write or query whose command contains `pattern`.
    pub fn fail_on_command(&self, pattern: impl Into<String>) {
        lock(&self.script).fail_on.push(pattern.into());
    }

    /// Whether the link is currently open. Shared between clones.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<LinkCall> {
        lock(&self.call_log).clone()
    }

    /// Commands sent with `write`, in order.
    pub fn writes(&self) -> Vec<String> {
        self.call_log()
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::Write(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Commands sent with `query`, in order.
    pub fn queries(&self) -> Vec<String> {
        self.call_log()
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::Query(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Every query with the I/O timeout it was sent under, in order.
    pub fn query_timeouts(&self) -> Vec<(String, Duration)> {
        lock(&self.query_timeouts).clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
        lock(&self.query_timeouts).clear();
    }

    fn log_call(&self, call: LinkCall) {
        lock(&self.call_log).push(call);
    }

    fn check_failure(&self, command: Option<&str>) -> Result<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("Injected failure"));
        }
        if let Some(command) = command {
            let script = lock(&self.script);
            if script.fail_on.iter().any(|p| command.contains(p.as_str())) {
                return Err(anyhow!("Injected failure on '{}'", command));
            }
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(anyhow!("Not connected to '{}'", self.resource))
        }
    }
}

#[async_trait]
impl InstrumentLink for MockLink {
    async fn open(&mut self) -> Result<()> {
        self.log_call(LinkCall::Open);
        self.check_failure(None)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.log_call(LinkCall::Close);
        self.connected.store(false, Ordering::SeqCst);
        self.check_failure(None)
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.log_call(LinkCall::Write(command.to_string()));
        self.check_failure(Some(command))?;
        self.ensure_connected()
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let timeout = self.timeout;
        self.query_with_timeout(command, timeout).await
    }

    async fn query_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.log_call(LinkCall::Query(command.to_string()));
        lock(&self.query_timeouts).push((command.to_string(), timeout));
        self.check_failure(Some(command))?;
        self.ensure_connected()?;

        let mut script = lock(&self.script);
        match script.responses.pop_front() {
            Some(response) => Ok(response),
            None => script
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("No scripted response for '{}'", command)),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}
