//! Scoped ownership of the sourcemeter and shutter.
//!
//! A [`MeasurementSession`] owns both instruments and hands the sourcemeter to
//! a single [`SessionTask`]. Resources are acquired in order (sourcemeter
//! link, then shutter) and released in reverse order no matter how the task
//! ends: normal return, error, or panic.
//!
//! Exit sequence:
//!
//! 1. sourcemeter output off (failures logged, never re-raised)
//! 2. sourcemeter link closed
//! 3. shutter closed and released
//!
//! The session is consumed by [`MeasurementSession::run`], so no instrument
//! handle outlives the scope.

use crate::error::AppResult;
use crate::shutter::Shutter;
use crate::sourcemeter::Sourcemeter;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, info};

/// Work performed while the session holds its instruments.
#[async_trait]
pub trait SessionTask: Send {
    /// Value handed back by [`MeasurementSession::run`].
    type Output: Send;

    /// Use the prepared sourcemeter. Cleanup is not this method's job.
    async fn execute(&mut self, sourcemeter: &mut dyn Sourcemeter) -> AppResult<Self::Output>;
}

/// Sourcemeter plus optional shutter with guaranteed release.
pub struct MeasurementSession {
    sourcemeter: Box<dyn Sourcemeter>,
    shutter: Option<Box<dyn Shutter>>,
}

impl MeasurementSession {
    /// Session without a shutter.
    pub fn new(sourcemeter: Box<dyn Sourcemeter>) -> Self {
        Self {
            sourcemeter,
            shutter: None,
        }
    }

    /// Also acquire `shutter` after the sourcemeter.
    pub fn with_shutter(mut self, shutter: Box<dyn Shutter>) -> Self {
        self.shutter = Some(shutter);
        self
    }

    /// Whether a shutter will be driven.
    pub fn has_shutter(&self) -> bool {
        self.shutter.is_some()
    }

    /// Acquire instruments, prepare the sourcemeter, run `task`, then release.
    ///
    /// Preparation is `reset` followed by `configure_data_output`. Errors from
    /// the task or preparation are returned after cleanup; a panic is resumed
    /// after cleanup.
    pub async fn run<T: SessionTask>(mut self, task: &mut T) -> AppResult<T::Output> {
        self.sourcemeter.open().await?;

        match self.shutter.as_mut() {
            Some(shutter) => {
                if let Err(err) = shutter.acquire().await {
                    error!(error = %err, "Shutter could not be acquired");
                    self.release_sourcemeter().await;
                    return Err(err);
                }
            }
            None => info!("Shutter control is disabled."),
        }

        let sourcemeter = self.sourcemeter.as_mut();
        let outcome = AssertUnwindSafe(async move {
            sourcemeter.reset().await?;
            sourcemeter.configure_data_output().await?;
            task.execute(sourcemeter).await
        })
        .catch_unwind()
        .await;

        self.release_sourcemeter().await;
        self.release_shutter().await;

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    async fn release_sourcemeter(&mut self) {
        if let Err(err) = self.sourcemeter.output_off().await {
            error!(error = %err, "Failed to switch sourcemeter output off");
        }
        if let Err(err) = self.sourcemeter.close().await {
            error!(error = %err, "Failed to release {}", self.sourcemeter.name());
        }
    }

    async fn release_shutter(&mut self) {
        if let Some(shutter) = self.shutter.as_mut() {
            if let Err(err) = shutter.release().await {
                error!(error = %err, "Failed to release {}", shutter.name());
            }
        }
    }
}
